use std::fmt;
use std::time::SystemTime;

use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::codec_munger::{self, CodecMunger, CodecMungerState};
use crate::error::{Error, Result};
use crate::layer::{
    bitrate_at, Bitrates, VideoLayer, DEFAULT_MAX_LAYER_SPATIAL,
    DEFAULT_MAX_LAYER_TEMPORAL, INVALID_LAYER, INVALID_LAYER_SPATIAL,
    INVALID_LAYER_TEMPORAL,
};
use crate::packet::ExtPacket;
use crate::rtp_munger::{
    RtpMunger, RtpMungerState, SequenceNumberOrdering, SnTs, TranslationParamsRtp,
};
use crate::selector::{
    self, VideoLayerSelector, Vp8TemporalLayerSelector,
};

pub const FLAG_PAUSE_ON_DOWNGRADE: bool = true;
pub const FLAG_FILTER_RTX: bool = false;
pub const FLAG_FILTER_RTX_LAYERS: bool = true;
pub const TRANSITION_COST_SPATIAL: i32 = 10;

pub const RESUME_BEHIND_THRESHOLD_SECONDS: f64 = 0.2;
pub const RESUME_BEHIND_HIGH_THRESHOLD_SECONDS: f64 = 2.0;
pub const LAYER_SWITCH_BEHIND_THRESHOLD_SECONDS: f64 = 0.05;
pub const SWITCH_AHEAD_THRESHOLD_SECONDS: f64 = 0.025;

pub const DEPENDENCY_DESCRIPTOR_EXTENSION_URI: &str =
    "https://aomediacodec.github.io/av1-rtp-spec/#dependency-descriptor-rtp-header-extension";

/// Kind of the outgoing track. Stays `Unspecified` when constructed from a
/// mime type that is neither audio nor video; translation surfaces that as
/// an error instead of guessing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MediaKind {
    #[default]
    Unspecified,
    Audio,
    Video,
}

impl MediaKind {
    pub fn from_mime_type(mime_type: &str) -> MediaKind {
        match mime_type.split('/').next() {
            Some(kind) if kind.eq_ignore_ascii_case("audio") => MediaKind::Audio,
            Some(kind) if kind.eq_ignore_ascii_case("video") => MediaKind::Video,
            _ => MediaKind::Unspecified,
        }
    }
}

/// The negotiated codec of the outgoing track.
#[derive(Clone, Debug, Default)]
pub struct RtpCodec {
    pub mime_type: String,
    pub clock_rate: u32,
}

#[derive(Clone, Debug)]
pub struct RtpHeaderExtension {
    pub uri: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VideoPauseReason {
    #[default]
    None,
    Muted,
    PubMuted,
    FeedDry,
    Bandwidth,
}

impl fmt::Display for VideoPauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoPauseReason::None => write!(f, "NONE"),
            VideoPauseReason::Muted => write!(f, "MUTED"),
            VideoPauseReason::PubMuted => write!(f, "PUB_MUTED"),
            VideoPauseReason::FeedDry => write!(f, "FEED_DRY"),
            VideoPauseReason::Bandwidth => write!(f, "BANDWIDTH"),
        }
    }
}

/// Snapshot of one allocation decision.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoAllocation {
    pub pause_reason: VideoPauseReason,
    pub is_deficient: bool,
    pub bandwidth_requested: i64,
    pub bandwidth_delta: i64,
    pub bandwidth_needed: i64,
    pub bitrates: Bitrates,
    pub target_layer: VideoLayer,
    pub request_layer_spatial: i32,
    pub max_layer: VideoLayer,
    pub distance_to_desired: f64,
}

impl Default for VideoAllocation {
    // start with no feed till feed is seen
    fn default() -> Self {
        Self {
            pause_reason: VideoPauseReason::FeedDry,
            is_deficient: false,
            bandwidth_requested: 0,
            bandwidth_delta: 0,
            bandwidth_needed: 0,
            bitrates: Bitrates::default(),
            target_layer: INVALID_LAYER,
            request_layer_spatial: INVALID_LAYER_SPATIAL,
            max_layer: INVALID_LAYER,
            distance_to_desired: 0.0,
        }
    }
}

impl fmt::Display for VideoAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VideoAllocation{{pause: {}, def: {}, bwr: {}, del: {}, bwn: {}, rates: {:?}, target: {}, req: {}, max: {}, dist: {:.2}}}",
            self.pause_reason,
            self.is_deficient,
            self.bandwidth_requested,
            self.bandwidth_delta,
            self.bandwidth_needed,
            self.bitrates,
            self.target_layer,
            self.request_layer_spatial,
            self.max_layer,
            self.distance_to_desired,
        )
    }
}

/// Inputs snapshotted by the cooperative allocation protocol between
/// `provisional_allocate_prepare` and `provisional_allocate_commit`.
#[derive(Clone, Debug)]
struct VideoAllocationProvisional {
    muted: bool,
    pub_muted: bool,
    max_seen_layer: VideoLayer,
    available_layers: Vec<i32>,
    bitrates: Bitrates,
    max_layer: VideoLayer,
    current_layer: VideoLayer,
    allocated_layer: VideoLayer,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VideoTransition {
    pub from: VideoLayer,
    pub to: VideoLayer,
    pub bandwidth_delta: i64,
}

impl fmt::Display for VideoTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VideoTransition{{from: {}, to: {}, del: {}}}",
            self.from, self.to, self.bandwidth_delta
        )
    }
}

/// Per-packet translation decision.
#[derive(Clone, Debug, Default)]
pub struct TranslationParams {
    pub should_drop: bool,
    pub is_resuming: bool,
    pub is_switching: bool,
    pub rtp: Option<TranslationParamsRtp>,
    pub dd_bytes: Option<Vec<u8>>,
    pub marker: bool,
}

/// Everything needed to resume this forwarder in another process after a
/// subscriber migration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForwarderState {
    pub started: bool,
    pub reference_layer_spatial: i32,
    pub pre_start_time: Option<SystemTime>,
    pub ext_first_ts: u64,
    pub ref_ts_offset: u64,
    pub rtp: RtpMungerState,
    pub codec: CodecMungerState,
}

impl Default for ForwarderState {
    fn default() -> Self {
        Self {
            started: false,
            reference_layer_spatial: INVALID_LAYER_SPATIAL,
            pre_start_time: None,
            ext_first_ts: 0,
            ref_ts_offset: 0,
            rtp: RtpMungerState::default(),
            codec: CodecMungerState::default(),
        }
    }
}

/// Maps an RTP timestamp between the timebases of two spatial layers using
/// accumulated RTCP sender report evidence. Fails until a sender report has
/// been seen for the target layer.
pub trait ReferenceTimestampSource: Send + Sync {
    fn reference_layer_rtp_timestamp(
        &self,
        ts: u32,
        layer: i32,
        reference_layer: i32,
    ) -> Result<u32>;
}

/// The extended timestamp a packet emitted at a given wall clock moment
/// should carry. Fails before the first sender report.
pub trait ExpectedTimestampSource: Send + Sync {
    fn expected_rtp_timestamp(&self, at: SystemTime) -> Result<u64>;
}

/// Per-subscription forwarding engine: layer allocation, source-switch
/// timestamp reconciliation, and per-packet translation.
///
/// All public operations are serialized by one reader-writer lock; the
/// engine holds no tasks or timers and never blocks under the lock. The
/// timestamp source callbacks are invoked with the lock held and must not
/// re-enter.
pub struct Forwarder {
    inner: RwLock<ForwarderInner>,
}

struct ForwarderInner {
    kind: MediaKind,
    codec: RtpCodec,
    reference_timestamps: Option<Box<dyn ReferenceTimestampSource>>,
    expected_timestamps: Option<Box<dyn ExpectedTimestampSource>>,

    muted: bool,
    pub_muted: bool,
    resume_behind_threshold: f64,

    started: bool,
    pre_start_time: Option<SystemTime>,
    ext_first_ts: u64,
    last_ssrc: u32,
    reference_layer_spatial: i32,
    ref_ts_offset: u64,

    provisional: Option<VideoAllocationProvisional>,

    last_allocation: VideoAllocation,

    rtp_munger: RtpMunger,

    vls: Box<dyn VideoLayerSelector>,

    codec_munger: Box<dyn CodecMunger>,
}

impl Forwarder {
    pub fn new(
        kind: MediaKind,
        reference_timestamps: Option<Box<dyn ReferenceTimestampSource>>,
        expected_timestamps: Option<Box<dyn ExpectedTimestampSource>>,
    ) -> Self {
        let mut vls: Box<dyn VideoLayerSelector> =
            Box::new(selector::Null::new());
        if kind == MediaKind::Video {
            vls.set_max_temporal(DEFAULT_MAX_LAYER_TEMPORAL);
        }
        Self {
            inner: RwLock::new(ForwarderInner {
                kind,
                codec: RtpCodec::default(),
                reference_timestamps,
                expected_timestamps,
                muted: false,
                pub_muted: false,
                resume_behind_threshold: 0.0,
                started: false,
                pre_start_time: None,
                ext_first_ts: 0,
                last_ssrc: 0,
                reference_layer_spatial: INVALID_LAYER_SPATIAL,
                ref_ts_offset: 0,
                provisional: None,
                last_allocation: VideoAllocation::default(),
                rtp_munger: RtpMunger::new(),
                vls,
                codec_munger: Box::new(codec_munger::Null::new()),
            }),
        }
    }

    /// Bind the selector and codec munger once the negotiated codec is known.
    /// The variants chosen here are fixed for the forwarder's life.
    pub fn determine_codec(
        &self,
        codec: RtpCodec,
        extensions: &[RtpHeaderExtension],
    ) {
        let mut f = self.inner.write();
        if !f.codec.mime_type.is_empty() {
            return;
        }
        f.codec = codec;

        let dd_available = extensions
            .iter()
            .any(|ext| ext.uri == DEPENDENCY_DESCRIPTOR_EXTENSION_URI);

        match f.codec.mime_type.to_lowercase().as_str() {
            "video/vp8" => {
                f.codec_munger = Box::new(codec_munger::Vp8Munger::new());
                let vls = selector::Simulcast::from_null(f.vls.as_ref());
                f.vls = Box::new(vls);
                f.vls.set_temporal_layer_selector(Box::new(
                    Vp8TemporalLayerSelector::new(),
                ));
            }
            "video/h264" => {
                let vls = selector::Simulcast::from_null(f.vls.as_ref());
                f.vls = Box::new(vls);
            }
            "video/vp9" | "video/av1" => {
                // TODO: add VP9 SVC and dependency descriptor selector
                // variants; until those exist both codecs bind the simulcast
                // selector
                let _ = dd_available;
                let vls = selector::Simulcast::from_null(f.vls.as_ref());
                f.vls = Box::new(vls);
            }
            _ => {}
        }
    }

    pub fn get_state(&self) -> ForwarderState {
        let f = self.inner.read();
        if !f.started {
            return ForwarderState::default();
        }
        ForwarderState {
            started: f.started,
            reference_layer_spatial: f.reference_layer_spatial,
            pre_start_time: f.pre_start_time,
            ext_first_ts: f.ext_first_ts,
            ref_ts_offset: f.ref_ts_offset,
            rtp: f.rtp_munger.get_last(),
            codec: f.codec_munger.get_state(),
        }
    }

    pub fn seed_state(&self, state: ForwarderState) {
        if !state.started {
            return;
        }
        let mut f = self.inner.write();
        f.rtp_munger.seed_last(state.rtp);
        f.codec_munger.seed_state(state.codec);
        f.started = true;
        f.reference_layer_spatial = state.reference_layer_spatial;
        f.pre_start_time = state.pre_start_time;
        f.ext_first_ts = state.ext_first_ts;
        f.ref_ts_offset = state.ref_ts_offset;
    }

    /// Returns whether the mute took effect. A mute is declined while the
    /// stream is paused for bandwidth: muting would tell the publisher no
    /// layers are needed and the track could then never restart.
    pub fn mute(&self, muted: bool, is_subscribe_mutable: bool) -> bool {
        let mut f = self.inner.write();
        if f.muted == muted {
            return false;
        }
        if muted && !is_subscribe_mutable {
            debug!("ignoring forwarder mute, paused due to congestion");
            return false;
        }
        debug!(muted, "setting forwarder mute");
        f.muted = muted;
        // resync when muted so that sequence numbers do not jump on unmute
        if muted {
            f.resync();
        }
        true
    }

    pub fn is_muted(&self) -> bool {
        self.inner.read().muted
    }

    pub fn pub_mute(&self, pub_muted: bool) -> bool {
        let mut f = self.inner.write();
        if f.pub_muted == pub_muted {
            return false;
        }
        debug!(muted = pub_muted, "setting forwarder pub mute");
        f.pub_muted = pub_muted;
        // resync when pub muted so that sequence numbers do not jump on unmute
        if pub_muted {
            f.resync();
        }
        true
    }

    pub fn is_pub_muted(&self) -> bool {
        self.inner.read().pub_muted
    }

    pub fn is_any_muted(&self) -> bool {
        let f = self.inner.read();
        f.muted || f.pub_muted
    }

    pub fn set_max_published_layer(&self, max_published_layer: i32) -> bool {
        let mut f = self.inner.write();
        let existing_max_seen = f.vls.get_max_seen();
        if max_published_layer <= existing_max_seen.spatial {
            return false;
        }
        f.vls.set_max_seen_spatial(max_published_layer);
        debug!(layer = max_published_layer, "setting max published layer");
        true
    }

    pub fn set_max_temporal_layer_seen(&self, max_temporal_layer_seen: i32) -> bool {
        let mut f = self.inner.write();
        let existing_max_seen = f.vls.get_max_seen();
        if max_temporal_layer_seen <= existing_max_seen.temporal {
            return false;
        }
        f.vls.set_max_seen_temporal(max_temporal_layer_seen);
        debug!(
            max_temporal_layer_seen,
            "setting max temporal layer seen"
        );
        true
    }

    pub fn set_max_spatial_layer(&self, spatial_layer: i32) -> (bool, VideoLayer) {
        let mut f = self.inner.write();
        if f.kind == MediaKind::Audio {
            return (false, INVALID_LAYER);
        }
        let existing_max = f.vls.get_max();
        if spatial_layer == existing_max.spatial {
            return (false, existing_max);
        }
        debug!(layer = spatial_layer, "setting max spatial layer");
        f.vls.set_max_spatial(spatial_layer);
        (true, f.vls.get_max())
    }

    pub fn set_max_temporal_layer(&self, temporal_layer: i32) -> (bool, VideoLayer) {
        let mut f = self.inner.write();
        if f.kind == MediaKind::Audio {
            return (false, INVALID_LAYER);
        }
        let existing_max = f.vls.get_max();
        if temporal_layer == existing_max.temporal {
            return (false, existing_max);
        }
        debug!(layer = temporal_layer, "setting max temporal layer");
        f.vls.set_max_temporal(temporal_layer);
        (true, f.vls.get_max())
    }

    pub fn max_layer(&self) -> VideoLayer {
        self.inner.read().vls.get_max()
    }

    pub fn current_layer(&self) -> VideoLayer {
        self.inner.read().vls.get_current()
    }

    pub fn target_layer(&self) -> VideoLayer {
        self.inner.read().vls.get_target()
    }

    /// The spatial layer the publisher should keep alive for this
    /// subscription. While the current layer is above a newly lowered max,
    /// current is reported so it does not stop before the switch completes.
    pub fn get_max_subscribed_spatial(&self) -> i32 {
        let f = self.inner.read();
        let mut layer = INVALID_LAYER_SPATIAL; // covers the muted case
        if !f.muted {
            layer = f.vls.get_max().spatial;
            if layer < f.vls.get_current().spatial {
                layer = f.vls.get_current().spatial;
            }
        }
        layer
    }

    pub fn get_current_spatial_and_ts_offset(&self) -> (i32, u64) {
        let f = self.inner.read();
        if f.kind == MediaKind::Audio {
            return (0, f.rtp_munger.get_pinned_ts_offset());
        }
        (
            f.vls.get_current().spatial,
            f.rtp_munger.get_pinned_ts_offset(),
        )
    }

    pub fn is_deficient(&self) -> bool {
        self.inner.read().last_allocation.is_deficient
    }

    pub fn pause_reason(&self) -> VideoPauseReason {
        self.inner.read().last_allocation.pause_reason
    }

    pub fn bandwidth_requested(&self, brs: &Bitrates) -> i64 {
        let f = self.inner.read();
        get_bandwidth_needed(
            brs,
            f.vls.get_target(),
            f.last_allocation.bandwidth_requested,
        )
    }

    pub fn distance_to_desired(
        &self,
        available_layers: &[i32],
        brs: &Bitrates,
    ) -> f64 {
        let f = self.inner.read();
        get_distance_to_desired(
            f.muted,
            f.pub_muted,
            f.vls.get_max_seen(),
            available_layers,
            brs,
            f.vls.get_target(),
            f.vls.get_max(),
        )
    }

    pub fn get_optimal_bandwidth_needed(&self, brs: &Bitrates) -> i64 {
        let f = self.inner.read();
        get_optimal_bandwidth_needed(
            f.muted,
            f.pub_muted,
            f.vls.get_max_seen().spatial,
            brs,
            f.vls.get_max(),
        )
    }

    pub fn allocate_optimal(
        &self,
        available_layers: &[i32],
        brs: Bitrates,
        allow_overshoot: bool,
    ) -> VideoAllocation {
        self.inner
            .write()
            .allocate_optimal(available_layers, brs, allow_overshoot)
    }

    pub fn provisional_allocate_prepare(
        &self,
        available_layers: &[i32],
        bitrates: Bitrates,
    ) {
        let mut f = self.inner.write();
        let provisional = VideoAllocationProvisional {
            muted: f.muted,
            pub_muted: f.pub_muted,
            max_seen_layer: f.vls.get_max_seen(),
            available_layers: available_layers.to_vec(),
            bitrates,
            max_layer: f.vls.get_max(),
            current_layer: f.vls.get_current(),
            allocated_layer: INVALID_LAYER,
        };
        f.provisional = Some(provisional);
    }

    pub fn provisional_allocate_reset(&self) {
        let mut f = self.inner.write();
        if let Some(provisional) = f.provisional.as_mut() {
            provisional.allocated_layer = INVALID_LAYER;
        }
    }

    pub fn provisional_allocate(
        &self,
        available_channel_capacity: i64,
        layer: VideoLayer,
        allow_pause: bool,
        allow_overshoot: bool,
    ) -> (bool, i64) {
        self.inner.write().provisional_allocate(
            available_channel_capacity,
            layer,
            allow_pause,
            allow_overshoot,
        )
    }

    pub fn provisional_allocate_get_cooperative_transition(
        &self,
        allow_overshoot: bool,
    ) -> (VideoTransition, Vec<i32>, Bitrates) {
        self.inner
            .write()
            .provisional_allocate_get_cooperative_transition(allow_overshoot)
    }

    pub fn provisional_allocate_get_best_weighted_transition(
        &self,
    ) -> (VideoTransition, Vec<i32>, Bitrates) {
        self.inner
            .write()
            .provisional_allocate_get_best_weighted_transition()
    }

    pub fn provisional_allocate_commit(&self) -> VideoAllocation {
        self.inner.write().provisional_allocate_commit()
    }

    pub fn allocate_next_higher(
        &self,
        available_channel_capacity: i64,
        available_layers: &[i32],
        brs: Bitrates,
        allow_overshoot: bool,
    ) -> (VideoAllocation, bool) {
        self.inner.write().allocate_next_higher(
            available_channel_capacity,
            available_layers,
            brs,
            allow_overshoot,
        )
    }

    pub fn get_next_higher_transition(
        &self,
        brs: &Bitrates,
        allow_overshoot: bool,
    ) -> (VideoTransition, bool) {
        self.inner
            .write()
            .get_next_higher_transition(brs, allow_overshoot)
    }

    pub fn pause(
        &self,
        available_layers: &[i32],
        brs: Bitrates,
    ) -> VideoAllocation {
        self.inner.write().pause(available_layers, brs)
    }

    pub fn resync(&self) {
        self.inner.write().resync();
    }

    pub fn check_sync(&self) -> (bool, i32) {
        self.inner.read().vls.check_sync()
    }

    /// Filter NACKs while congested: retransmitting layers the decoder is
    /// about to flush only adds load to an already stressed channel.
    pub fn filter_rtx(
        &self,
        nacks: &[u16],
    ) -> (
        Vec<u16>,
        [bool; (DEFAULT_MAX_LAYER_SPATIAL + 1) as usize],
    ) {
        let f = self.inner.read();
        let filtered = if !FLAG_FILTER_RTX {
            nacks.to_vec()
        } else {
            f.rtp_munger.filter_rtx(nacks)
        };

        let mut disallowed_layers =
            [false; (DEFAULT_MAX_LAYER_SPATIAL + 1) as usize];
        if FLAG_FILTER_RTX_LAYERS {
            let current_layer = f.vls.get_current();
            let target_layer = f.vls.get_target();
            for (layer, disallowed) in disallowed_layers.iter_mut().enumerate() {
                if f.last_allocation.is_deficient
                    && (target_layer.spatial < current_layer.spatial
                        || layer as i32 > current_layer.spatial)
                {
                    *disallowed = true;
                }
            }
        }
        (filtered, disallowed_layers)
    }

    pub fn get_translation_params(
        &self,
        pkt: &ExtPacket,
        layer: i32,
    ) -> Result<TranslationParams> {
        let mut f = self.inner.write();
        if f.muted || f.pub_muted {
            return Ok(TranslationParams {
                should_drop: true,
                ..Default::default()
            });
        }
        match f.kind {
            MediaKind::Audio => f.get_translation_params_audio(pkt, layer),
            MediaKind::Video => f.get_translation_params_video(pkt, layer),
            MediaKind::Unspecified => Err(Error::UnknownKind),
        }
    }

    /// Codec-specific forwarding check and any needed in-band rewrite.
    /// Returns (forward, input size, output size); output size 0 means the
    /// payload goes out untouched.
    pub fn translate_codec_header(
        &self,
        pkt: &ExtPacket,
        tpr: &TranslationParamsRtp,
        output_buffer: &mut [u8],
    ) -> Result<(bool, usize, usize)> {
        let mut f = self.inner.write();

        let (temporal_layer, is_switching) = f.vls.select_temporal(pkt);
        match f.codec_munger.update_and_get(
            pkt,
            tpr.sn_ordering == SequenceNumberOrdering::OutOfOrder,
            tpr.sn_ordering == SequenceNumberOrdering::Gap,
            temporal_layer,
            output_buffer,
        ) {
            Ok((input_size, output_size)) => Ok((true, input_size, output_size)),
            Err(err) => {
                if err == Error::FilteredTemporalLayer {
                    // filtered, update sequence number offset to prevent holes
                    f.rtp_munger.packet_dropped(pkt);
                }
                if is_switching {
                    f.vls.rollback();
                }
                match err {
                    Error::FilteredTemporalLayer
                    | Error::OutOfOrderPictureIdCacheMiss => Ok((false, 0, 0)),
                    err => Err(err),
                }
            }
        }
    }

    /// Sequence numbers and timestamps for probe padding. Padding is only
    /// generated at frame boundaries; when the stream is paused a marker is
    /// forced since the restart key frame resets the decoder anyway.
    pub fn get_sn_ts_for_padding(
        &self,
        num: usize,
        force_marker: bool,
    ) -> Result<Vec<SnTs>> {
        let mut f = self.inner.write();
        f.maybe_start();
        let force_marker = force_marker || !f.vls.get_target().is_valid();
        f.rtp_munger
            .update_and_get_padding_sn_ts(num, 0, 0, force_marker, 0)
    }

    /// Sequence numbers and timestamps for locally generated blank frames,
    /// paced at `frame_rate` but never ahead of the expected timestamp.
    /// Also reports whether an extra packet closes the frame in progress.
    pub fn get_sn_ts_for_blank_frames(
        &self,
        frame_rate: u32,
        num_packets: usize,
    ) -> Result<(Vec<SnTs>, bool)> {
        let mut f = self.inner.write();
        f.maybe_start();

        let frame_end_needed = !f.rtp_munger.is_on_frame_boundary();
        let num_packets = if frame_end_needed {
            num_packets + 1
        } else {
            num_packets
        };

        let ext_last_ts = f.rtp_munger.get_last().ext_last_ts;
        let mut ext_expected_ts = ext_last_ts;
        if let Some(expected) = &f.expected_timestamps {
            if let Ok(ts_ext) = expected.expected_rtp_timestamp(SystemTime::now())
            {
                ext_expected_ts = ts_ext;
            }
        }
        if ext_expected_ts.wrapping_sub(ext_last_ts) as i64 <= 0 {
            ext_expected_ts = ext_last_ts.wrapping_add(1);
        }
        let clock_rate = f.codec.clock_rate;
        let snts = f.rtp_munger.update_and_get_padding_sn_ts(
            num_packets,
            clock_rate,
            frame_rate,
            frame_end_needed,
            ext_expected_ts,
        )?;
        Ok((snts, frame_end_needed))
    }

    /// Codec header bytes for a blank/padding frame.
    pub fn get_padding(
        &self,
        frame_end_needed: bool,
        output_buffer: &mut [u8],
    ) -> Result<usize> {
        let mut f = self.inner.write();
        f.codec_munger
            .update_and_get_padding(!frame_end_needed, output_buffer)
    }
}

impl ForwarderInner {
    fn resync(&mut self) {
        self.vls.set_current(INVALID_LAYER);
        self.last_ssrc = 0;
        if self.pub_muted {
            self.resume_behind_threshold = RESUME_BEHIND_THRESHOLD_SECONDS;
        }
    }

    fn allocate_optimal(
        &mut self,
        available_layers: &[i32],
        brs: Bitrates,
        allow_overshoot: bool,
    ) -> VideoAllocation {
        if self.kind == MediaKind::Audio {
            return self.last_allocation.clone();
        }

        let max_layer = self.vls.get_max();
        let max_seen_layer = self.vls.get_max_seen();
        let current_layer = self.vls.get_current();
        let request_spatial = self.vls.get_request_spatial();
        let mut alloc = VideoAllocation {
            pause_reason: VideoPauseReason::None,
            bitrates: brs,
            target_layer: INVALID_LAYER,
            request_layer_spatial: request_spatial,
            max_layer,
            ..Default::default()
        };
        let optimal_bandwidth_needed = get_optimal_bandwidth_needed(
            self.muted,
            self.pub_muted,
            max_seen_layer.spatial,
            &brs,
            max_layer,
        );
        if optimal_bandwidth_needed == 0 {
            alloc.pause_reason = VideoPauseReason::FeedDry;
        }
        alloc.bandwidth_needed = optimal_bandwidth_needed;

        let get_max_temporal = || {
            let mut max_temporal = max_layer.temporal;
            if max_seen_layer.temporal != INVALID_LAYER_TEMPORAL
                && max_seen_layer.temporal < max_temporal
            {
                max_temporal = max_seen_layer.temporal;
            }
            max_temporal
        };

        if !max_layer.is_valid()
            || max_seen_layer.spatial == INVALID_LAYER_SPATIAL
        {
            // nothing to do when max layers are not valid or nothing published
        } else if self.muted {
            alloc.pause_reason = VideoPauseReason::Muted;
        } else if self.pub_muted {
            alloc.pause_reason = VideoPauseReason::PubMuted;
        } else {
            // Find the highest layer that can be requested, taking available
            // layers and overshoot into account. Continue at current when it
            // is still served (covers layer-stop mis-detection and a dry feed
            // resuming); when nothing is streaming, latch opportunistically.
            let max_layer_spatial_limit =
                max_layer.spatial.min(max_seen_layer.spatial);
            let mut highest_available_layer = INVALID_LAYER_SPATIAL;
            let mut request_layer_spatial = INVALID_LAYER_SPATIAL;
            for &al in available_layers {
                if al > request_layer_spatial && al <= max_layer_spatial_limit {
                    request_layer_spatial = al;
                }
                if al > highest_available_layer {
                    highest_available_layer = al;
                }
            }
            if request_layer_spatial == INVALID_LAYER_SPATIAL
                && highest_available_layer != INVALID_LAYER_SPATIAL
                && allow_overshoot
                && self.vls.is_overshoot_okay()
            {
                request_layer_spatial = highest_available_layer;
            }

            if current_layer.is_valid() {
                if (request_layer_spatial == request_spatial
                    && current_layer.spatial == request_spatial)
                    || request_layer_spatial == INVALID_LAYER_SPATIAL
                {
                    // current is locked to desired, or the feed may be dry;
                    // streaming can continue or latch on when it resumes
                    alloc.target_layer = VideoLayer::new(
                        current_layer.spatial,
                        get_max_temporal(),
                    );
                } else {
                    // current layer has stopped, switch to highest available
                    alloc.target_layer = VideoLayer::new(
                        request_layer_spatial,
                        get_max_temporal(),
                    );
                }
                alloc.request_layer_spatial = alloc.target_layer.spatial;
            } else {
                // opportunistically latch on to anything
                let mut max_spatial = max_layer.spatial;
                if allow_overshoot
                    && self.vls.is_overshoot_okay()
                    && max_seen_layer.spatial > max_spatial
                {
                    max_spatial = max_seen_layer.spatial;
                }
                alloc.target_layer = VideoLayer::new(
                    max_seen_layer.spatial.min(max_spatial),
                    get_max_temporal(),
                );
                alloc.request_layer_spatial =
                    if request_layer_spatial == INVALID_LAYER_SPATIAL {
                        max_layer_spatial_limit
                    } else {
                        request_layer_spatial
                    };
            }
        }

        if !alloc.target_layer.is_valid() {
            alloc.target_layer = INVALID_LAYER;
            alloc.request_layer_spatial = INVALID_LAYER_SPATIAL;
        } else {
            alloc.bandwidth_requested = optimal_bandwidth_needed;
        }
        alloc.bandwidth_delta = alloc.bandwidth_requested
            - get_bandwidth_needed(
                &brs,
                self.vls.get_target(),
                self.last_allocation.bandwidth_requested,
            );
        alloc.distance_to_desired = get_distance_to_desired(
            self.muted,
            self.pub_muted,
            max_seen_layer,
            available_layers,
            &brs,
            alloc.target_layer,
            max_layer,
        );

        self.update_allocation(alloc, "optimal")
    }

    fn provisional_allocate(
        &mut self,
        available_channel_capacity: i64,
        layer: VideoLayer,
        allow_pause: bool,
        allow_overshoot: bool,
    ) -> (bool, i64) {
        let overshoot_okay = self.vls.is_overshoot_okay();
        let Some(provisional) = self.provisional.as_mut() else {
            return (false, 0);
        };

        if provisional.muted
            || provisional.pub_muted
            || provisional.max_seen_layer.spatial == INVALID_LAYER_SPATIAL
            || !provisional.max_layer.is_valid()
            || ((!allow_overshoot || !overshoot_okay)
                && layer.greater_than(provisional.max_layer))
        {
            return (false, 0);
        }

        let required_bitrate = bitrate_at(&provisional.bitrates, layer);
        if required_bitrate == 0 {
            return (false, 0);
        }

        let already_allocated_bitrate =
            bitrate_at(&provisional.bitrates, provisional.allocated_layer);

        // a layer under maximum fits, take it
        if !layer.greater_than(provisional.max_layer)
            && required_bitrate
                <= available_channel_capacity + already_allocated_bitrate
        {
            provisional.allocated_layer = layer;
            return (true, required_bitrate - already_allocated_bitrate);
        }

        // The layer does not fit (under maximum but too big, or above maximum
        // with overshoot allowed). If pause is not allowed, take the lowest
        // offered layer anyway to guarantee minimum streaming.
        if !allow_pause
            && (!provisional.allocated_layer.is_valid()
                || !layer.greater_than(provisional.allocated_layer))
        {
            provisional.allocated_layer = layer;
            return (true, required_bitrate - already_allocated_bitrate);
        }

        (false, 0)
    }

    // Cooperative transitions keep all tracks streaming if at all possible:
    // never an upgrade while congested, a downgrade when the current target
    // is no longer served, and the minimal streamable layer when paused.
    fn provisional_allocate_get_cooperative_transition(
        &mut self,
        allow_overshoot: bool,
    ) -> (VideoTransition, Vec<i32>, Bitrates) {
        let existing_target_layer = self.vls.get_target();
        let last_bandwidth_requested = self.last_allocation.bandwidth_requested;
        let overshoot_okay = self.vls.is_overshoot_okay();
        let Some(provisional) = self.provisional.as_mut() else {
            return (
                VideoTransition {
                    from: existing_target_layer,
                    to: existing_target_layer,
                    bandwidth_delta: 0,
                },
                Vec::new(),
                Bitrates::default(),
            );
        };
        let bitrates = provisional.bitrates;
        let available_layers = provisional.available_layers.clone();

        if provisional.muted || provisional.pub_muted {
            provisional.allocated_layer = INVALID_LAYER;
            return (
                VideoTransition {
                    from: existing_target_layer,
                    to: INVALID_LAYER,
                    bandwidth_delta: -get_bandwidth_needed(
                        &bitrates,
                        existing_target_layer,
                        last_bandwidth_requested,
                    ),
                },
                available_layers,
                bitrates,
            );
        }

        // check if the current target can be preserved
        if existing_target_layer.is_valid() {
            let mut maximal_layer = INVALID_LAYER;
            let mut maximal_bandwidth_required = 0i64;
            'maximal: for s in (0..=provisional
                .max_layer
                .spatial
                .min(DEFAULT_MAX_LAYER_SPATIAL))
                .rev()
            {
                for t in (0..=provisional
                    .max_layer
                    .temporal
                    .min(DEFAULT_MAX_LAYER_TEMPORAL))
                    .rev()
                {
                    if bitrates[s as usize][t as usize] != 0 {
                        maximal_layer = VideoLayer::new(s, t);
                        maximal_bandwidth_required = bitrates[s as usize][t as usize];
                        break 'maximal;
                    }
                }
            }

            if maximal_layer.is_valid() {
                if !existing_target_layer.greater_than(maximal_layer)
                    && bitrate_at(&bitrates, existing_target_layer) != 0
                {
                    // streaming under the maximal available layer, hold
                    provisional.allocated_layer = existing_target_layer;
                    return (
                        VideoTransition {
                            from: existing_target_layer,
                            to: existing_target_layer,
                            bandwidth_delta: 0,
                        },
                        available_layers,
                        bitrates,
                    );
                }

                if existing_target_layer.greater_than(maximal_layer) {
                    // the target is no longer served, make the down move
                    provisional.allocated_layer = maximal_layer;
                    return (
                        VideoTransition {
                            from: existing_target_layer,
                            to: maximal_layer,
                            bandwidth_delta: maximal_bandwidth_required
                                - get_bandwidth_needed(
                                    &bitrates,
                                    existing_target_layer,
                                    last_bandwidth_requested,
                                ),
                        },
                        available_layers,
                        bitrates,
                    );
                }
            }
        }

        let find_next_layer = |min_spatial: i32,
                               max_spatial: i32,
                               min_temporal: i32,
                               max_temporal: i32|
         -> (VideoLayer, i64) {
            for s in min_spatial..=max_spatial.min(DEFAULT_MAX_LAYER_SPATIAL) {
                for t in
                    min_temporal..=max_temporal.min(DEFAULT_MAX_LAYER_TEMPORAL)
                {
                    if s < 0 || t < 0 {
                        continue;
                    }
                    if bitrates[s as usize][t as usize] != 0 {
                        return (
                            VideoLayer::new(s, t),
                            bitrates[s as usize][t as usize],
                        );
                    }
                }
            }
            (INVALID_LAYER, 0)
        };

        let mut target_layer = INVALID_LAYER;
        let mut bandwidth_required = 0i64;
        if !existing_target_layer.is_valid() {
            // not streaming, find the minimal layer that can unpause.
            // A layer in the feed could have paused and other options could
            // exist, but the cooperative scheme knocks things back to minimal.
            (target_layer, bandwidth_required) = find_next_layer(
                0,
                provisional.max_layer.spatial,
                0,
                provisional.max_layer.temporal,
            );

            // could not find a minimal layer, overshoot if allowed
            if bandwidth_required == 0
                && provisional.max_layer.is_valid()
                && allow_overshoot
                && overshoot_okay
            {
                (target_layer, bandwidth_required) = find_next_layer(
                    provisional.max_layer.spatial + 1,
                    DEFAULT_MAX_LAYER_SPATIAL,
                    0,
                    DEFAULT_MAX_LAYER_TEMPORAL,
                );
            }
        }

        // nothing available, leave target at current to enable opportunistic
        // forwarding in case current resumes
        if !target_layer.is_valid() {
            target_layer = provisional.current_layer;
            if target_layer.is_valid() {
                bandwidth_required = bitrate_at(&bitrates, target_layer);
            }
        }

        provisional.allocated_layer = target_layer;
        (
            VideoTransition {
                from: existing_target_layer,
                to: target_layer,
                bandwidth_delta: bandwidth_required
                    - get_bandwidth_needed(
                        &bitrates,
                        existing_target_layer,
                        last_bandwidth_requested,
                    ),
            },
            available_layers,
            bitrates,
        )
    }

    // Called on the other tracks of a congested subscriber to find how much
    // this track can give back to unpause the one that needs a change. Best
    // offer = bandwidth saved / (transition cost + quality cost); spatial
    // switches carry a key frame cost, temporal switches are free.
    fn provisional_allocate_get_best_weighted_transition(
        &mut self,
    ) -> (VideoTransition, Vec<i32>, Bitrates) {
        let target_layer = self.vls.get_target();
        let last_bandwidth_requested = self.last_allocation.bandwidth_requested;
        let Some(provisional) = self.provisional.as_mut() else {
            return (
                VideoTransition {
                    from: target_layer,
                    to: target_layer,
                    bandwidth_delta: 0,
                },
                Vec::new(),
                Bitrates::default(),
            );
        };
        let bitrates = provisional.bitrates;
        let available_layers = provisional.available_layers.clone();

        if provisional.muted || provisional.pub_muted {
            provisional.allocated_layer = INVALID_LAYER;
            return (
                VideoTransition {
                    from: target_layer,
                    to: INVALID_LAYER,
                    bandwidth_delta: 0
                        - get_bandwidth_needed(
                            &bitrates,
                            target_layer,
                            last_bandwidth_requested,
                        ),
                },
                available_layers,
                bitrates,
            );
        }

        let mut max_reachable_layer_temporal = INVALID_LAYER_TEMPORAL;
        'reachable: for t in (0..=provisional
            .max_layer
            .temporal
            .min(DEFAULT_MAX_LAYER_TEMPORAL))
            .rev()
        {
            for s in (0..=provisional
                .max_layer
                .spatial
                .min(DEFAULT_MAX_LAYER_SPATIAL))
                .rev()
            {
                if bitrates[s as usize][t as usize] != 0 {
                    max_reachable_layer_temporal = t;
                    break 'reachable;
                }
            }
        }

        if max_reachable_layer_temporal == INVALID_LAYER_TEMPORAL {
            // feed has gone dry, leave target at current for opportunistic
            // forwarding; a resume triggering congestion again is the stream
            // allocator's problem
            provisional.allocated_layer = provisional.current_layer;
            return (
                VideoTransition {
                    from: target_layer,
                    to: provisional.current_layer,
                    bandwidth_delta: 0
                        - get_bandwidth_needed(
                            &bitrates,
                            target_layer,
                            last_bandwidth_requested,
                        ),
                },
                available_layers,
                bitrates,
            );
        }

        let existing_bandwidth_needed = get_bandwidth_needed(
            &bitrates,
            target_layer,
            last_bandwidth_requested,
        );
        let mut best_layer = INVALID_LAYER;
        let mut best_bandwidth_delta = 0i64;
        let mut best_value = 0f32;
        for s in 0..=target_layer.spatial.min(DEFAULT_MAX_LAYER_SPATIAL) {
            for t in 0..=target_layer.temporal.min(DEFAULT_MAX_LAYER_TEMPORAL) {
                if s == target_layer.spatial && t == target_layer.temporal {
                    break;
                }

                let bandwidth_delta = (existing_bandwidth_needed
                    - bitrates[s as usize][t as usize])
                    .max(0);

                let transition_cost = if target_layer.spatial != s {
                    TRANSITION_COST_SPATIAL
                } else {
                    0
                };

                let quality_cost = (max_reachable_layer_temporal + 1)
                    * (target_layer.spatial - s)
                    + (target_layer.temporal - t);

                let value = if transition_cost + quality_cost != 0 {
                    bandwidth_delta as f32
                        / (transition_cost + quality_cost) as f32
                } else {
                    0.0
                };
                if value > best_value
                    || (value == best_value
                        && bandwidth_delta > best_bandwidth_delta)
                {
                    best_value = value;
                    best_bandwidth_delta = bandwidth_delta;
                    best_layer = VideoLayer::new(s, t);
                }
            }
        }

        provisional.allocated_layer = best_layer;
        (
            VideoTransition {
                from: target_layer,
                to: best_layer,
                bandwidth_delta: -best_bandwidth_delta,
            },
            available_layers,
            bitrates,
        )
    }

    fn provisional_allocate_commit(&mut self) -> VideoAllocation {
        let Some(provisional) = self.provisional.clone() else {
            return self.last_allocation.clone();
        };

        let optimal_bandwidth_needed = get_optimal_bandwidth_needed(
            provisional.muted,
            provisional.pub_muted,
            provisional.max_seen_layer.spatial,
            &provisional.bitrates,
            provisional.max_layer,
        );
        let existing_bandwidth_needed = get_bandwidth_needed(
            &provisional.bitrates,
            self.vls.get_target(),
            self.last_allocation.bandwidth_requested,
        );
        let mut allocated_layer = provisional.allocated_layer;
        let mut alloc = VideoAllocation {
            pause_reason: VideoPauseReason::None,
            is_deficient: false,
            bandwidth_requested: 0,
            bandwidth_delta: 0 - existing_bandwidth_needed,
            bitrates: provisional.bitrates,
            bandwidth_needed: optimal_bandwidth_needed,
            target_layer: allocated_layer,
            request_layer_spatial: allocated_layer.spatial,
            max_layer: provisional.max_layer,
            distance_to_desired: get_distance_to_desired(
                provisional.muted,
                provisional.pub_muted,
                provisional.max_seen_layer,
                &provisional.available_layers,
                &provisional.bitrates,
                allocated_layer,
                provisional.max_layer,
            ),
        };

        if provisional.muted {
            alloc.pause_reason = VideoPauseReason::Muted;
        } else if provisional.pub_muted {
            alloc.pause_reason = VideoPauseReason::PubMuted;
        } else if optimal_bandwidth_needed == 0 {
            if allocated_layer.is_valid() {
                // overshoot
                alloc.bandwidth_requested =
                    bitrate_at(&provisional.bitrates, allocated_layer);
                alloc.bandwidth_delta =
                    alloc.bandwidth_requested - existing_bandwidth_needed;
            } else {
                alloc.pause_reason = VideoPauseReason::FeedDry;

                // leave target at current for opportunistic forwarding
                if provisional.current_layer.is_valid()
                    && provisional.current_layer.spatial
                        <= provisional.max_layer.spatial
                {
                    allocated_layer = provisional.current_layer;
                    alloc.target_layer = allocated_layer;
                    alloc.request_layer_spatial = alloc.target_layer.spatial;
                }
            }
        } else {
            if allocated_layer.is_valid() {
                alloc.bandwidth_requested =
                    bitrate_at(&provisional.bitrates, allocated_layer);
            }
            alloc.bandwidth_delta =
                alloc.bandwidth_requested - existing_bandwidth_needed;

            if allocated_layer.greater_than(provisional.max_layer)
                || alloc.bandwidth_requested >= optimal_bandwidth_needed
            {
                // can exceed optimal when overshooting
                alloc.is_deficient = false;
            } else {
                alloc.is_deficient = true;
                if !allocated_layer.is_valid() {
                    alloc.pause_reason = VideoPauseReason::Bandwidth;
                }
            }
        }

        if let Some(p) = self.provisional.as_mut() {
            p.allocated_layer = allocated_layer;
        }
        self.update_allocation(alloc, "cooperative")
    }

    fn allocate_next_higher(
        &mut self,
        available_channel_capacity: i64,
        available_layers: &[i32],
        brs: Bitrates,
        allow_overshoot: bool,
    ) -> (VideoAllocation, bool) {
        if self.kind == MediaKind::Audio {
            return (self.last_allocation.clone(), false);
        }

        // if not deficient, nothing to do
        if !self.last_allocation.is_deficient {
            return (self.last_allocation.clone(), false);
        }

        // if a target move is still pending, don't increase
        let target_layer = self.vls.get_target();
        if target_layer.is_valid() && target_layer != self.vls.get_current() {
            return (self.last_allocation.clone(), false);
        }

        let max_layer = self.vls.get_max();
        let max_seen_layer = self.vls.get_max_seen();
        let optimal_bandwidth_needed = get_optimal_bandwidth_needed(
            self.muted,
            self.pub_muted,
            max_seen_layer.spatial,
            &brs,
            max_layer,
        );

        let already_allocated = bitrate_at(&brs, target_layer);
        let overshoot_okay = self.vls.is_overshoot_okay();
        let muted = self.muted;
        let pub_muted = self.pub_muted;

        // outer None: nothing found in this range, continue the search.
        // inner None: the next layer up does not fit, halt the search (the
        // bitrate order assumption means nothing higher would fit either).
        let do_allocation = |min_spatial: i32,
                             max_spatial: i32,
                             min_temporal: i32,
                             max_temporal: i32|
         -> Option<Option<VideoAllocation>> {
            for s in min_spatial..=max_spatial.min(DEFAULT_MAX_LAYER_SPATIAL) {
                for t in
                    min_temporal..=max_temporal.min(DEFAULT_MAX_LAYER_TEMPORAL)
                {
                    if s < 0 || t < 0 {
                        continue;
                    }
                    let bandwidth_requested = brs[s as usize][t as usize];
                    if bandwidth_requested == 0 {
                        continue;
                    }

                    if (!allow_overshoot || !overshoot_okay)
                        && bandwidth_requested - already_allocated
                            > available_channel_capacity
                    {
                        return Some(None);
                    }

                    let new_target_layer = VideoLayer::new(s, t);
                    let mut alloc = VideoAllocation {
                        pause_reason: VideoPauseReason::None,
                        is_deficient: true,
                        bandwidth_requested,
                        bandwidth_delta: bandwidth_requested - already_allocated,
                        bandwidth_needed: optimal_bandwidth_needed,
                        bitrates: brs,
                        target_layer: new_target_layer,
                        request_layer_spatial: new_target_layer.spatial,
                        max_layer,
                        distance_to_desired: get_distance_to_desired(
                            muted,
                            pub_muted,
                            max_seen_layer,
                            available_layers,
                            &brs,
                            new_target_layer,
                            max_layer,
                        ),
                    };
                    if new_target_layer.greater_than(max_layer)
                        || bandwidth_requested >= optimal_bandwidth_needed
                    {
                        alloc.is_deficient = false;
                    }
                    return Some(Some(alloc));
                }
            }
            None
        };

        // try moving temporal layer up within the streaming spatial layer
        if target_layer.is_valid() {
            if let Some(outcome) = do_allocation(
                target_layer.spatial,
                target_layer.spatial,
                target_layer.temporal + 1,
                max_layer.temporal,
            ) {
                return match outcome {
                    Some(alloc) => {
                        (self.update_allocation(alloc, "next-higher"), true)
                    }
                    None => (self.last_allocation.clone(), false),
                };
            }
        }

        // try moving spatial layer up
        if let Some(outcome) = do_allocation(
            target_layer.spatial + 1,
            max_layer.spatial,
            0,
            max_layer.temporal,
        ) {
            return match outcome {
                Some(alloc) => {
                    (self.update_allocation(alloc, "next-higher"), true)
                }
                None => (self.last_allocation.clone(), false),
            };
        }

        if allow_overshoot && overshoot_okay && max_layer.is_valid() {
            if let Some(outcome) = do_allocation(
                max_layer.spatial + 1,
                DEFAULT_MAX_LAYER_SPATIAL,
                0,
                DEFAULT_MAX_LAYER_TEMPORAL,
            ) {
                return match outcome {
                    Some(alloc) => {
                        (self.update_allocation(alloc, "next-higher"), true)
                    }
                    None => (self.last_allocation.clone(), false),
                };
            }
        }

        (self.last_allocation.clone(), false)
    }

    /// Preview of `allocate_next_higher` that does not mutate anything.
    fn get_next_higher_transition(
        &mut self,
        brs: &Bitrates,
        allow_overshoot: bool,
    ) -> (VideoTransition, bool) {
        if self.kind == MediaKind::Audio {
            return (VideoTransition::default(), false);
        }

        if !self.last_allocation.is_deficient {
            return (VideoTransition::default(), false);
        }

        let target_layer = self.vls.get_target();
        if target_layer.is_valid() && target_layer != self.vls.get_current() {
            return (VideoTransition::default(), false);
        }

        let already_allocated = bitrate_at(brs, target_layer);

        let find_next_higher = |min_spatial: i32,
                                max_spatial: i32,
                                min_temporal: i32,
                                max_temporal: i32|
         -> Option<VideoTransition> {
            for s in min_spatial..=max_spatial.min(DEFAULT_MAX_LAYER_SPATIAL) {
                for t in
                    min_temporal..=max_temporal.min(DEFAULT_MAX_LAYER_TEMPORAL)
                {
                    if s < 0 || t < 0 {
                        continue;
                    }
                    let bandwidth_requested = brs[s as usize][t as usize];
                    // traverse till finding a layer requiring more bits; a
                    // higher temporal of a lower spatial can use more bits
                    // than a lower temporal of a higher spatial
                    if bandwidth_requested == 0
                        || bandwidth_requested < already_allocated
                    {
                        continue;
                    }
                    return Some(VideoTransition {
                        from: target_layer,
                        to: VideoLayer::new(s, t),
                        bandwidth_delta: bandwidth_requested - already_allocated,
                    });
                }
            }
            None
        };

        let max_layer = self.vls.get_max();
        if target_layer.is_valid() {
            if let Some(transition) = find_next_higher(
                target_layer.spatial,
                target_layer.spatial,
                target_layer.temporal + 1,
                max_layer.temporal,
            ) {
                return (transition, true);
            }
        }

        if let Some(transition) = find_next_higher(
            target_layer.spatial + 1,
            max_layer.spatial,
            0,
            max_layer.temporal,
        ) {
            return (transition, true);
        }

        if allow_overshoot && self.vls.is_overshoot_okay() && max_layer.is_valid()
        {
            if let Some(transition) = find_next_higher(
                max_layer.spatial + 1,
                DEFAULT_MAX_LAYER_SPATIAL,
                0,
                DEFAULT_MAX_LAYER_TEMPORAL,
            ) {
                return (transition, true);
            }
        }

        (VideoTransition::default(), false)
    }

    fn pause(
        &mut self,
        available_layers: &[i32],
        brs: Bitrates,
    ) -> VideoAllocation {
        let max_layer = self.vls.get_max();
        let max_seen_layer = self.vls.get_max_seen();
        let optimal_bandwidth_needed = get_optimal_bandwidth_needed(
            self.muted,
            self.pub_muted,
            max_seen_layer.spatial,
            &brs,
            max_layer,
        );
        let mut alloc = VideoAllocation {
            pause_reason: VideoPauseReason::None,
            is_deficient: false,
            bandwidth_requested: 0,
            bandwidth_delta: 0
                - get_bandwidth_needed(
                    &brs,
                    self.vls.get_target(),
                    self.last_allocation.bandwidth_requested,
                ),
            bitrates: brs,
            bandwidth_needed: optimal_bandwidth_needed,
            target_layer: INVALID_LAYER,
            request_layer_spatial: INVALID_LAYER_SPATIAL,
            max_layer,
            distance_to_desired: get_distance_to_desired(
                self.muted,
                self.pub_muted,
                max_seen_layer,
                available_layers,
                &brs,
                INVALID_LAYER,
                max_layer,
            ),
        };

        if self.muted {
            alloc.pause_reason = VideoPauseReason::Muted;
        } else if self.pub_muted {
            alloc.pause_reason = VideoPauseReason::PubMuted;
        } else if optimal_bandwidth_needed == 0 {
            alloc.pause_reason = VideoPauseReason::FeedDry;
        } else {
            // pausing due to lack of bandwidth
            alloc.is_deficient = true;
            alloc.pause_reason = VideoPauseReason::Bandwidth;
        }

        self.update_allocation(alloc, "pause")
    }

    fn update_allocation(
        &mut self,
        mut alloc: VideoAllocation,
        reason: &str,
    ) -> VideoAllocation {
        // H.264 in this engine is single temporal layer
        if alloc.target_layer.is_valid()
            && self.codec.mime_type.eq_ignore_ascii_case("video/h264")
        {
            alloc.target_layer.temporal = 0;
        }

        if alloc.is_deficient != self.last_allocation.is_deficient
            || alloc.pause_reason != self.last_allocation.pause_reason
            || alloc.target_layer != self.last_allocation.target_layer
            || alloc.request_layer_spatial
                != self.last_allocation.request_layer_spatial
        {
            debug!(reason, allocation = %alloc, "stream allocation");
        }

        let target_layer = alloc.target_layer;
        let request_layer_spatial = alloc.request_layer_spatial;
        self.last_allocation = alloc;

        self.set_target_layer(target_layer, request_layer_spatial);
        if !self.vls.get_target().is_valid() {
            self.resync();
        }

        self.last_allocation.clone()
    }

    fn set_target_layer(
        &mut self,
        target_layer: VideoLayer,
        request_layer_spatial: i32,
    ) {
        self.vls.set_target(target_layer);
        if target_layer.is_valid() {
            self.vls.set_request_spatial(request_layer_spatial);
        } else {
            self.vls.set_request_spatial(INVALID_LAYER_SPATIAL);
        }
    }

    // Pick the output timestamp for the first packet of a new source: after
    // the last sent timestamp, close to where real time expects the stream
    // to be, and aligned with the reference layer's timebase.
    //
    // Three candidates:
    //   1. ext_last_ts: timestamp of the last sent packet
    //   2. ext_ref_ts: this packet's timestamp mapped through the feed's
    //      RTCP sender reports
    //   3. ext_expected_ts: timestamp expected from wall clock elapsed
    // Mute/unmute, clock vagaries and pacing can pull these apart.
    fn process_source_switch(
        &mut self,
        pkt: &ExtPacket,
        layer: i32,
    ) -> Result<()> {
        if !self.started {
            self.started = true;
            self.reference_layer_spatial = layer;
            self.rtp_munger.set_last_sn_ts(pkt);
            self.codec_munger.set_last(pkt);
            debug!(
                sequence_number = pkt.packet.sequence(),
                ext_sequence_number = pkt.ext_sequence_number,
                timestamp = pkt.packet.timestamp(),
                ext_timestamp = pkt.ext_timestamp,
                layer,
                reference_layer_spatial = self.reference_layer_spatial,
                "starting forwarding"
            );
            return Ok(());
        } else if self.reference_layer_spatial == INVALID_LAYER_SPATIAL {
            self.reference_layer_spatial = layer;
            debug!(
                ext_sequence_number = pkt.ext_sequence_number,
                ext_timestamp = pkt.ext_timestamp,
                layer,
                "catch up forwarding"
            );
        }

        let rtp_munger_state = self.rtp_munger.get_last();
        let ext_last_ts = rtp_munger_state.ext_last_ts;
        let mut ext_expected_ts = ext_last_ts;
        let mut ext_ref_ts = ext_expected_ts;
        let switching_at = SystemTime::now();

        if let Some(reference) = &self.reference_timestamps {
            // Not having a reference yet is an error: there is no sender
            // report for the layer being switched to. Waiting for a packet
            // of a reported layer gives a better offset at the cost of
            // slightly slower initial adaptation.
            let ts = reference.reference_layer_rtp_timestamp(
                pkt.packet.timestamp(),
                layer,
                self.reference_layer_spatial,
            )?;

            ext_ref_ts = (ext_ref_ts & 0xFFFF_FFFF_0000_0000) + ts as u64;

            // stitch the 32-bit reference into 64 bits, correcting for a
            // wrap in either direction
            let expected_ts32 = ext_expected_ts as u32;
            if ts.wrapping_sub(expected_ts32) < (1 << 31) && ts < expected_ts32 {
                ext_ref_ts = ext_ref_ts.wrapping_add(1 << 32);
            }
            if expected_ts32.wrapping_sub(ts) < (1 << 31)
                && expected_ts32 < ts
                && ext_ref_ts >= (1 << 32)
            {
                ext_ref_ts -= 1 << 32;
            }
        }

        if let Some(expected) = &self.expected_timestamps {
            match expected.expected_rtp_timestamp(switching_at) {
                Ok(ts_ext) => ext_expected_ts = ts_ext,
                Err(_) => {
                    if let Some(pre_start_time) = self.pre_start_time {
                        let time_since_first = switching_at
                            .duration_since(pre_start_time)
                            .unwrap_or_default();
                        let rtp_diff = (time_since_first.as_nanos()
                            * self.codec.clock_rate as u128
                            / 1_000_000_000)
                            as u64;
                        ext_expected_ts = self.ext_first_ts.wrapping_add(rtp_diff);
                        if self.ref_ts_offset == 0 {
                            self.ref_ts_offset =
                                ext_expected_ts.wrapping_sub(ext_ref_ts);
                            info!(
                                ext_first_ts = self.ext_first_ts,
                                ?time_since_first,
                                rtp_diff,
                                ext_ref_ts,
                                ref_ts_offset = self.ref_ts_offset,
                                "calculating ref_ts_offset"
                            );
                        }
                    }
                }
            }
        }
        ext_ref_ts = ext_ref_ts.wrapping_add(self.ref_ts_offset);

        let clock_rate = self.codec.clock_rate as f64;
        let log_transition =
            |message: &str, ext_expected_ts: u64, ext_ref_ts: u64, diff: f64| {
                debug!(
                    layer,
                    ext_expected_ts,
                    ext_ref_ts,
                    ext_last_ts,
                    diff_seconds = diff.abs(),
                    "{}",
                    message
                );
            };

        let mut ext_next_ts;
        if self.last_ssrc == 0 {
            // Resuming. Prefer the reference timestamp so things catch up to
            // real time, unless it has fallen too far behind the expected
            // timestamp: a mute implemented as stopping the track does not
            // advance timestamps across the mute valley, and that stale
            // reference would make the subscriber's jitter buffer balloon.
            // The threshold separates that case from mere pacing latency.
            let diff_seconds =
                (ext_expected_ts.wrapping_sub(ext_ref_ts) as i64) as f64
                    / clock_rate;
            if diff_seconds >= 0.0 {
                if self.resume_behind_threshold > 0.0
                    && diff_seconds > self.resume_behind_threshold
                {
                    log_transition(
                        "resume, reference too far behind",
                        ext_expected_ts,
                        ext_ref_ts,
                        diff_seconds,
                    );
                    ext_next_ts = ext_expected_ts;
                } else if diff_seconds > RESUME_BEHIND_HIGH_THRESHOLD_SECONDS {
                    // likely an incorrect reference calculation
                    log_transition(
                        "resume, reference very far behind",
                        ext_expected_ts,
                        ext_ref_ts,
                        diff_seconds,
                    );
                    ext_next_ts = ext_expected_ts;
                } else {
                    ext_next_ts = ext_ref_ts;
                }
            } else {
                // the reference ahead of expected can happen when the first
                // packet saw abnormal latency, its wall clock anchors expected
                if diff_seconds.abs() > SWITCH_AHEAD_THRESHOLD_SECONDS {
                    log_transition(
                        "resume, reference too far ahead",
                        ext_expected_ts,
                        ext_ref_ts,
                        diff_seconds,
                    );
                }
                ext_next_ts = ext_ref_ts;
            }
            self.resume_behind_threshold = 0.0;
        } else {
            // switching between layers, check if the reference has fallen
            // behind what was already sent
            let diff_seconds = (ext_ref_ts.wrapping_sub(ext_last_ts) as i64)
                as f64
                / clock_rate;
            if diff_seconds < 0.0 {
                if diff_seconds.abs() > LAYER_SWITCH_BEHIND_THRESHOLD_SECONDS {
                    // could be the pacer trickling this layer out; wait for a
                    // more opportune switch point
                    log_transition(
                        "layer switch, reference too far behind",
                        ext_expected_ts,
                        ext_ref_ts,
                        diff_seconds,
                    );
                    return Err(Error::SwitchPointTooFarBehind);
                }
                log_transition(
                    "layer switch, reference is slightly behind",
                    ext_expected_ts,
                    ext_ref_ts,
                    diff_seconds,
                );
                ext_next_ts = ext_last_ts.wrapping_add(1);
            } else {
                let diff_seconds =
                    (ext_expected_ts.wrapping_sub(ext_ref_ts) as i64) as f64
                        / clock_rate;
                if diff_seconds < 0.0
                    && diff_seconds.abs() > SWITCH_AHEAD_THRESHOLD_SECONDS
                {
                    log_transition(
                        "layer switch, reference too far ahead",
                        ext_expected_ts,
                        ext_ref_ts,
                        diff_seconds,
                    );
                }
                ext_next_ts = ext_ref_ts;
            }
        }

        if ext_next_ts.wrapping_sub(ext_last_ts) as i64 <= 0 {
            debug!(
                ext_next_ts,
                ext_last_ts, "next timestamp is before last, adjusting"
            );
            ext_next_ts = ext_last_ts.wrapping_add(1);
        }
        debug!(
            layer,
            ext_last_ts,
            ext_ref_ts,
            ref_ts_offset = self.ref_ts_offset,
            reference_layer_spatial = self.reference_layer_spatial,
            ext_expected_ts,
            ext_next_ts,
            ts_jump = ext_next_ts.wrapping_sub(ext_last_ts),
            next_sn = rtp_munger_state.ext_last_sn.wrapping_add(1),
            ext_incoming_sn = pkt.ext_sequence_number,
            ext_incoming_ts = pkt.ext_timestamp,
            "next timestamp on switch"
        );

        self.rtp_munger.update_sn_ts_offsets(
            pkt,
            1,
            ext_next_ts.wrapping_sub(ext_last_ts),
        );
        self.codec_munger.update_offsets(pkt);
        Ok(())
    }

    fn get_translation_params_common(
        &mut self,
        pkt: &ExtPacket,
        layer: i32,
        tp: &mut TranslationParams,
    ) -> Result<()> {
        if self.last_ssrc != pkt.packet.ssrc() {
            if self.process_source_switch(pkt, layer).is_err() {
                // drop the packet, the next one retries the switch
                tp.should_drop = true;
                return Ok(());
            }
            debug!(
                from = self.last_ssrc,
                to = pkt.packet.ssrc(),
                "switching feed"
            );
            self.last_ssrc = pkt.packet.ssrc();
        }

        match self.rtp_munger.update_and_get_sn_ts(pkt, tp.marker) {
            Ok(tp_rtp) => {
                tp.rtp = Some(tp_rtp);
                Ok(())
            }
            Err(err) => {
                tp.should_drop = true;
                match err {
                    Error::PaddingOnlyPacket
                    | Error::DuplicatePacket
                    | Error::OutOfOrderSequenceNumberCacheMiss => Ok(()),
                    err => Err(err),
                }
            }
        }
    }

    fn get_translation_params_audio(
        &mut self,
        pkt: &ExtPacket,
        layer: i32,
    ) -> Result<TranslationParams> {
        let mut tp = TranslationParams::default();
        if let Err(err) = self.get_translation_params_common(pkt, layer, &mut tp)
        {
            tp.should_drop = true;
            return Err(err);
        }
        Ok(tp)
    }

    fn get_translation_params_video(
        &mut self,
        pkt: &ExtPacket,
        layer: i32,
    ) -> Result<TranslationParams> {
        let mut tp = TranslationParams::default();

        if !self.vls.get_target().is_valid() {
            // stream paused by the allocator
            tp.should_drop = true;
            return Ok(tp);
        }

        let result = self.vls.select(pkt, layer);
        if !result.is_selected {
            tp.should_drop = true;
            if self.started && result.is_relevant {
                // update the highest incoming sequence number and keep the
                // outgoing stream hole free
                if let Ok(tp_rtp) =
                    self.rtp_munger.update_and_get_sn_ts(pkt, result.rtp_marker)
                {
                    if tp_rtp.sn_ordering == SequenceNumberOrdering::Contiguous {
                        self.rtp_munger.packet_dropped(pkt);
                    }
                }
            }
            return Ok(tp);
        }
        tp.is_resuming = result.is_resuming;
        tp.is_switching = result.is_switching;
        tp.dd_bytes = result.dependency_descriptor_extension;
        tp.marker = result.rtp_marker;

        if FLAG_PAUSE_ON_DOWNGRADE
            && self.last_allocation.is_deficient
            && self.vls.get_target().spatial < self.vls.get_current().spatial
        {
            // A target below current means bandwidth forced the down switch;
            // sending the higher layer until its switch point would stress
            // the channel further. In the up direction forwarding continues
            // to the switch point for a smoother stream. A subscription
            // change alone (not DEFICIENT) also keeps streaming for a smooth
            // transition.
            tp.should_drop = true;
            if result.is_switching {
                self.vls.rollback();
            }
            return Ok(tp);
        }

        let res = self.get_translation_params_common(pkt, layer, &mut tp);
        if tp.should_drop && result.is_switching {
            self.vls.rollback();
        }
        res.map(|()| tp)
    }

    /// Start the output stream before any media has been forwarded so that
    /// padding can be generated: seed a random sequence number / timestamp
    /// in the third quartile of their spaces, predictable for subscribers
    /// doing 16-bit rollover detection.
    fn maybe_start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        self.pre_start_time = Some(SystemTime::now());

        let mut rng = rand::thread_rng();
        let sequence_number: u16 = rng.gen_range(0..1u16 << 14) + (1 << 15);
        let timestamp: u32 = rng.gen_range(0..1u32 << 30) + (1 << 31);
        let ext_pkt = ExtPacket::placeholder(sequence_number, timestamp);
        self.rtp_munger.set_last_sn_ts(&ext_pkt);

        self.ext_first_ts = timestamp as u64;
        info!(
            sequence_number,
            timestamp, "starting with dummy forwarding"
        );
    }
}

// -----------------------------------------------------------------------------

fn get_optimal_bandwidth_needed(
    muted: bool,
    pub_muted: bool,
    max_published_layer: i32,
    brs: &Bitrates,
    max_layer: VideoLayer,
) -> i64 {
    if muted || pub_muted || max_published_layer == INVALID_LAYER_SPATIAL {
        return 0;
    }

    for s in (0..=max_layer.spatial.min(DEFAULT_MAX_LAYER_SPATIAL)).rev() {
        for t in (0..=max_layer.temporal.min(DEFAULT_MAX_LAYER_TEMPORAL)).rev() {
            if brs[s as usize][t as usize] == 0 {
                continue;
            }
            return brs[s as usize][t as usize];
        }
    }

    // zero here: publisher stopped all layers (feed dry), the stream tracker
    // declared them stopped (possibly a mis-detection), or the bitrate
    // measurement is still pending
    0
}

fn get_bandwidth_needed(brs: &Bitrates, layer: VideoLayer, fallback: i64) -> i64 {
    let bitrate = bitrate_at(brs, layer);
    if bitrate > 0 {
        bitrate
    } else {
        fallback
    }
}

fn get_distance_to_desired(
    muted: bool,
    pub_muted: bool,
    max_seen_layer: VideoLayer,
    available_layers: &[i32],
    brs: &Bitrates,
    target_layer: VideoLayer,
    max_layer: VideoLayer,
) -> f64 {
    if muted || pub_muted || !max_seen_layer.is_valid() || !max_layer.is_valid()
    {
        return 0.0;
    }

    let mut adjusted_max_layer = max_layer;

    let mut max_available_spatial = INVALID_LAYER_SPATIAL;
    let mut max_available_temporal = INVALID_LAYER_TEMPORAL;

    // max available spatial is min(subscribed max, published max, measured max)
    'spatial: for s in (0..brs.len() as i32).rev() {
        for t in (0..brs[0].len() as i32).rev() {
            if brs[s as usize][t as usize] != 0 {
                max_available_spatial = s;
                break 'spatial;
            }
        }
    }

    // the stream tracker can declare a layer seen before bitrate measurement
    // is available, account for that
    for &layer in available_layers {
        if layer > max_available_spatial {
            max_available_spatial = layer;
            // measurement pending, assume max seen temporal
            max_available_temporal = max_seen_layer.temporal;
        }
    }

    if max_available_spatial < adjusted_max_layer.spatial {
        adjusted_max_layer.spatial = max_available_spatial;
    }
    if max_seen_layer.spatial < adjusted_max_layer.spatial {
        adjusted_max_layer.spatial = max_seen_layer.spatial;
    }

    // max available temporal is min(subscribed max, seen max, measured max in
    // the adjusted spatial layer)
    if (0..brs.len() as i32).contains(&adjusted_max_layer.spatial) {
        for t in (0..brs[0].len() as i32).rev() {
            if brs[adjusted_max_layer.spatial as usize][t as usize] != 0 {
                max_available_temporal = t;
                break;
            }
        }
    }
    if max_available_temporal < adjusted_max_layer.temporal {
        adjusted_max_layer.temporal = max_available_temporal;
    }
    if max_seen_layer.temporal < adjusted_max_layer.temporal {
        adjusted_max_layer.temporal = max_seen_layer.temporal;
    }

    if !adjusted_max_layer.is_valid() {
        adjusted_max_layer = VideoLayer::new(0, 0);
    }

    // a paused target counts from (0, 0) with a penalty
    let adjusted_target_layer = if target_layer.is_valid() {
        target_layer
    } else {
        VideoLayer::new(0, 0)
    };

    let mut distance = (adjusted_max_layer.spatial
        - adjusted_target_layer.spatial)
        * (max_seen_layer.temporal + 1)
        + (adjusted_max_layer.temporal - adjusted_target_layer.temporal);
    if !target_layer.is_valid() {
        distance += max_seen_layer.temporal + 1;
    }

    distance as f64 / (max_seen_layer.temporal + 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PayloadInfo, RtpPacket};

    struct FixedReference(u32);

    impl ReferenceTimestampSource for FixedReference {
        fn reference_layer_rtp_timestamp(
            &self,
            _ts: u32,
            _layer: i32,
            _reference_layer: i32,
        ) -> Result<u32> {
            Ok(self.0)
        }
    }

    struct FixedExpected(u64);

    impl ExpectedTimestampSource for FixedExpected {
        fn expected_rtp_timestamp(&self, _at: SystemTime) -> Result<u64> {
            Ok(self.0)
        }
    }

    fn full_bitrates() -> Bitrates {
        let mut brs = Bitrates::default();
        for (s, row) in brs.iter_mut().enumerate() {
            for (t, cell) in row.iter_mut().enumerate() {
                *cell = ((s * 4 + t + 1) * 100_000) as i64;
            }
        }
        brs
    }

    fn vp8_forwarder(
        reference: Option<Box<dyn ReferenceTimestampSource>>,
        expected: Option<Box<dyn ExpectedTimestampSource>>,
    ) -> Forwarder {
        let f = Forwarder::new(MediaKind::Video, reference, expected);
        f.determine_codec(
            RtpCodec {
                mime_type: "video/vp8".to_string(),
                clock_rate: 90_000,
            },
            &[],
        );
        f.set_max_spatial_layer(2);
        f.set_max_temporal_layer(3);
        f.set_max_published_layer(2);
        f.set_max_temporal_layer_seen(3);
        f
    }

    fn opus_forwarder(
        reference: Option<Box<dyn ReferenceTimestampSource>>,
        expected: Option<Box<dyn ExpectedTimestampSource>>,
    ) -> Forwarder {
        let f = Forwarder::new(MediaKind::Audio, reference, expected);
        f.determine_codec(
            RtpCodec {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48_000,
            },
            &[],
        );
        f
    }

    fn media_packet(
        ssrc: u32,
        ext_sn: u64,
        ext_ts: u64,
        key_frame: bool,
    ) -> ExtPacket {
        let mut rtp = RtpPacket::new();
        rtp.set_ssrc(ssrc);
        rtp.set_sequence(ext_sn as u16);
        rtp.set_timestamp(ext_ts as u32);
        rtp.set_marker(true);
        rtp.set_payload(&[1, 2, 3]);
        ExtPacket {
            packet: rtp,
            key_frame,
            payload: PayloadInfo::None,
            ext_sequence_number: ext_sn,
            ext_timestamp: ext_ts,
        }
    }

    #[test]
    fn optimal_allocates_highest_layer() {
        let f = vp8_forwarder(None, None);
        let brs = full_bitrates();

        let alloc = f.allocate_optimal(&[0, 1, 2], brs, false);
        assert_eq!(alloc.target_layer, VideoLayer::new(2, 3));
        assert_eq!(alloc.bandwidth_requested, brs[2][3]);
        assert_eq!(alloc.pause_reason, VideoPauseReason::None);
        assert!(!alloc.is_deficient);
        assert_eq!(f.target_layer(), VideoLayer::new(2, 3));
    }

    #[test]
    fn optimal_with_dry_feed_pauses() {
        let f = vp8_forwarder(None, None);

        let alloc = f.allocate_optimal(&[], Bitrates::default(), false);
        assert_eq!(alloc.pause_reason, VideoPauseReason::FeedDry);
        assert_eq!(alloc.bandwidth_requested, 0);
        assert_eq!(alloc.bandwidth_needed, 0);
        // target stays latched opportunistically so forwarding can resume
        // the moment the feed comes back
        assert_eq!(alloc.target_layer, VideoLayer::new(2, 3));
    }

    #[test]
    fn optimal_latches_single_published_layer() {
        let f = Forwarder::new(MediaKind::Video, None, None);
        f.determine_codec(
            RtpCodec {
                mime_type: "video/vp8".to_string(),
                clock_rate: 90_000,
            },
            &[],
        );
        f.set_max_spatial_layer(2);
        f.set_max_temporal_layer(3);
        f.set_max_published_layer(1);
        f.set_max_temporal_layer_seen(2);

        let mut brs = Bitrates::default();
        brs[1][2] = 400_000;
        let alloc = f.allocate_optimal(&[0, 1], brs, false);
        assert_eq!(alloc.target_layer, VideoLayer::new(1, 2));
        assert_eq!(alloc.bandwidth_requested, 400_000);
        assert!(!alloc.is_deficient);
    }

    #[test]
    fn optimal_is_idempotent_across_pause() {
        let f = vp8_forwarder(None, None);
        let brs = full_bitrates();

        let first = f.allocate_optimal(&[0, 1, 2], brs, false);
        let paused = f.pause(&[0, 1, 2], brs);
        assert_eq!(paused.target_layer, INVALID_LAYER);
        let second = f.allocate_optimal(&[0, 1, 2], brs, false);
        assert_eq!(first.target_layer, second.target_layer);
    }

    #[test]
    fn h264_targets_temporal_zero() {
        let f = Forwarder::new(MediaKind::Video, None, None);
        f.determine_codec(
            RtpCodec {
                mime_type: "video/h264".to_string(),
                clock_rate: 90_000,
            },
            &[],
        );
        f.set_max_spatial_layer(2);
        f.set_max_temporal_layer(3);
        f.set_max_published_layer(2);
        f.set_max_temporal_layer_seen(3);

        let alloc = f.allocate_optimal(&[0, 1, 2], full_bitrates(), false);
        assert_eq!(alloc.target_layer, VideoLayer::new(2, 0));
    }

    #[test]
    fn max_seen_is_monotonic() {
        let f = vp8_forwarder(None, None);
        // vp8_forwarder already pushed max seen to (2, 3)
        assert!(!f.set_max_published_layer(1));
        assert!(!f.set_max_published_layer(2));
        assert!(!f.set_max_temporal_layer_seen(2));
        assert!(!f.set_max_temporal_layer_seen(3));
    }

    #[test]
    fn mute_declined_when_not_subscribe_mutable() {
        let f = vp8_forwarder(None, None);
        assert!(!f.mute(true, false));
        assert!(!f.is_muted());
        assert!(f.mute(true, true));
        assert!(f.is_muted());
        // unmute is always honored
        assert!(f.mute(false, false));
        assert!(!f.is_muted());
    }

    #[test]
    fn cooperative_downgrades_to_highest_available() {
        let f = vp8_forwarder(None, None);
        let brs = full_bitrates();
        f.allocate_optimal(&[0, 1, 2], brs, false);

        let mut constrained = Bitrates::default();
        constrained[0][0] = brs[0][0];
        constrained[1][1] = brs[1][1];
        f.provisional_allocate_prepare(&[0, 1], constrained);
        let (transition, _, _) =
            f.provisional_allocate_get_cooperative_transition(false);
        assert_eq!(transition.from, VideoLayer::new(2, 3));
        assert_eq!(transition.to, VideoLayer::new(1, 1));
        assert_eq!(transition.bandwidth_delta, constrained[1][1] - brs[2][3]);
    }

    #[test]
    fn cooperative_holds_target_when_still_served() {
        let f = vp8_forwarder(None, None);
        let brs = full_bitrates();
        f.allocate_optimal(&[0, 1, 2], brs, false);

        f.provisional_allocate_prepare(&[0, 1, 2], brs);
        let (transition, _, _) =
            f.provisional_allocate_get_cooperative_transition(false);
        assert_eq!(transition.from, VideoLayer::new(2, 3));
        assert_eq!(transition.to, VideoLayer::new(2, 3));
        assert_eq!(transition.bandwidth_delta, 0);
    }

    #[test]
    fn cooperative_unpauses_at_minimal_layer() {
        let f = vp8_forwarder(None, None);
        // paused: target invalid
        f.pause(&[0, 1, 2], full_bitrates());

        f.provisional_allocate_prepare(&[0, 1, 2], full_bitrates());
        let (transition, _, _) =
            f.provisional_allocate_get_cooperative_transition(false);
        assert_eq!(transition.to, VideoLayer::new(0, 0));
    }

    #[test]
    fn cooperative_gives_everything_back_when_muted() {
        let f = vp8_forwarder(None, None);
        let brs = full_bitrates();
        f.allocate_optimal(&[0, 1, 2], brs, false);
        f.mute(true, true);

        f.provisional_allocate_prepare(&[0, 1, 2], brs);
        let (transition, _, _) =
            f.provisional_allocate_get_cooperative_transition(false);
        assert_eq!(transition.to, INVALID_LAYER);
        assert_eq!(transition.bandwidth_delta, -brs[2][3]);
    }

    #[test]
    fn weighted_transition_prefers_cheap_temporal_move() {
        let f = vp8_forwarder(None, None);
        let brs = full_bitrates();
        f.allocate_optimal(&[0, 1, 2], brs, false);

        f.provisional_allocate_prepare(&[0, 1, 2], brs);
        let (transition, _, _) =
            f.provisional_allocate_get_best_weighted_transition();

        // temporal-only moves cost no key frame; (2, 0) maximises saved
        // bandwidth per cost and wins the tie on bandwidth delta
        assert_eq!(transition.from, VideoLayer::new(2, 3));
        assert_eq!(transition.to, VideoLayer::new(2, 0));
        assert_eq!(transition.bandwidth_delta, -(brs[2][3] - brs[2][0]));

        // never an upgrade
        assert!(!transition.to.greater_than(transition.from));
        assert!(transition.bandwidth_delta <= 0);
    }

    #[test]
    fn provisional_allocate_respects_capacity() {
        let f = vp8_forwarder(None, None);
        let brs = full_bitrates();
        f.provisional_allocate_prepare(&[0, 1, 2], brs);

        let (ok, used) =
            f.provisional_allocate(brs[1][1], VideoLayer::new(1, 1), true, false);
        assert!(ok);
        assert_eq!(used, brs[1][1]);

        // an upgrade beyond capacity plus already-allocated bits is refused
        // when pause is allowed
        let (ok, _) =
            f.provisional_allocate(100_000, VideoLayer::new(2, 3), true, false);
        assert!(!ok);
    }

    #[test]
    fn provisional_allocate_commits_nonfitting_when_pause_disallowed() {
        let f = vp8_forwarder(None, None);
        let brs = full_bitrates();
        f.provisional_allocate_prepare(&[0, 1, 2], brs);

        // no capacity at all, but pause is not allowed: minimum streaming
        let (ok, used) =
            f.provisional_allocate(0, VideoLayer::new(0, 0), false, false);
        assert!(ok);
        assert_eq!(used, brs[0][0]);

        let alloc = f.provisional_allocate_commit();
        assert_eq!(alloc.target_layer, VideoLayer::new(0, 0));
        assert!(alloc.is_deficient);
        assert_eq!(alloc.bandwidth_requested, brs[0][0]);
    }

    #[test]
    fn commit_without_allocation_pauses_for_bandwidth() {
        let f = vp8_forwarder(None, None);
        let brs = full_bitrates();
        f.allocate_optimal(&[0, 1, 2], brs, false);

        f.provisional_allocate_prepare(&[0, 1, 2], brs);
        let (ok, _) =
            f.provisional_allocate(0, VideoLayer::new(0, 0), true, false);
        assert!(!ok);
        let alloc = f.provisional_allocate_commit();
        assert_eq!(alloc.pause_reason, VideoPauseReason::Bandwidth);
        assert!(alloc.is_deficient);
        assert_eq!(alloc.target_layer, INVALID_LAYER);
    }

    #[test]
    fn pause_reason_precedence() {
        let f = vp8_forwarder(None, None);
        let alloc = f.pause(&[0, 1, 2], full_bitrates());
        assert_eq!(alloc.pause_reason, VideoPauseReason::Bandwidth);
        assert!(alloc.is_deficient);

        f.mute(true, true);
        let alloc = f.pause(&[0, 1, 2], full_bitrates());
        assert_eq!(alloc.pause_reason, VideoPauseReason::Muted);
        assert!(!alloc.is_deficient);
    }

    // drive the forwarder into a deficient state streaming (0, 0) with the
    // current layer caught up to target
    fn deficient_forwarder(brs: Bitrates) -> Forwarder {
        let f = vp8_forwarder(None, None);
        f.provisional_allocate_prepare(&[0, 1, 2], brs);
        f.provisional_allocate(brs[0][0], VideoLayer::new(0, 0), false, false);
        let alloc = f.provisional_allocate_commit();
        assert!(alloc.is_deficient);

        // a key frame of layer 0 latches current onto the target
        let tp = f
            .get_translation_params(&media_packet(10, 100, 1000, true), 0)
            .unwrap();
        assert!(!tp.should_drop);
        assert_eq!(f.current_layer(), f.target_layer());
        f
    }

    #[test]
    fn next_higher_boosts_one_temporal_step() {
        let brs = full_bitrates();
        let f = deficient_forwarder(brs);

        let (transition, available) =
            f.get_next_higher_transition(&brs, false);
        assert!(available);
        assert_eq!(transition.to, VideoLayer::new(0, 1));

        let (alloc, boosted) =
            f.allocate_next_higher(brs[0][1] - brs[0][0], &[0, 1, 2], brs, false);
        assert!(boosted);
        assert_eq!(alloc.target_layer, VideoLayer::new(0, 1));
        assert!(alloc.is_deficient);

        // the new target is pending until a packet moves current up,
        // so no further boost happens
        let (_, boosted) =
            f.allocate_next_higher(i64::MAX, &[0, 1, 2], brs, false);
        assert!(!boosted);
    }

    #[test]
    fn next_higher_halts_when_first_candidate_does_not_fit() {
        let brs = full_bitrates();
        let f = deficient_forwarder(brs);

        // (0, 1) needs brs[0][1] - brs[0][0] more than allocated; smaller
        // capacity halts the search instead of skipping to other layers
        let (_, boosted) = f.allocate_next_higher(
            brs[0][1] - brs[0][0] - 1,
            &[0, 1, 2],
            brs,
            false,
        );
        assert!(!boosted);
    }

    #[test]
    fn downgrade_guard_drops_higher_layer_when_deficient() {
        let f = vp8_forwarder(None, None);
        let brs = full_bitrates();
        f.allocate_optimal(&[0, 1, 2], brs, false);

        // start streaming the top layer
        let tp = f
            .get_translation_params(&media_packet(30, 100, 1000, true), 2)
            .unwrap();
        assert!(!tp.should_drop);
        assert_eq!(f.current_layer().spatial, 2);

        // congestion knocks the target down to (0, 0)
        f.provisional_allocate_prepare(&[0, 1, 2], brs);
        f.provisional_allocate(brs[0][0], VideoLayer::new(0, 0), false, false);
        let alloc = f.provisional_allocate_commit();
        assert!(alloc.is_deficient);
        assert_eq!(f.target_layer(), VideoLayer::new(0, 0));

        // the still-current higher layer is dropped rather than forwarded
        let tp = f
            .get_translation_params(&media_packet(30, 101, 2000, false), 2)
            .unwrap();
        assert!(tp.should_drop);
    }

    #[test]
    fn rtx_is_curbed_for_all_layers_during_down_switch() {
        let f = vp8_forwarder(None, None);
        let brs = full_bitrates();
        f.allocate_optimal(&[0, 1, 2], brs, false);
        f.get_translation_params(&media_packet(30, 100, 1000, true), 2)
            .unwrap();

        f.provisional_allocate_prepare(&[0, 1, 2], brs);
        f.provisional_allocate(brs[0][0], VideoLayer::new(0, 0), false, false);
        f.provisional_allocate_commit();

        let (filtered, disallowed) = f.filter_rtx(&[1, 2, 3]);
        assert_eq!(filtered, vec![1, 2, 3]);
        assert_eq!(disallowed, [true, true, true]);
    }

    #[test]
    fn translation_drops_while_paused_or_muted() {
        let f = vp8_forwarder(None, None);
        // allocator has not allocated, target is invalid
        let tp = f
            .get_translation_params(&media_packet(30, 100, 1000, true), 0)
            .unwrap();
        assert!(tp.should_drop);

        f.allocate_optimal(&[0, 1, 2], full_bitrates(), false);
        f.mute(true, true);
        let tp = f
            .get_translation_params(&media_packet(30, 101, 2000, true), 0)
            .unwrap();
        assert!(tp.should_drop);
    }

    #[test]
    fn unspecified_kind_surfaces_unknown_kind() {
        let f = Forwarder::new(MediaKind::Unspecified, None, None);
        let err = f
            .get_translation_params(&media_packet(1, 100, 1000, false), 0)
            .unwrap_err();
        assert_eq!(err, Error::UnknownKind);
    }

    #[test]
    fn media_kind_from_mime_type() {
        assert_eq!(MediaKind::from_mime_type("audio/opus"), MediaKind::Audio);
        assert_eq!(MediaKind::from_mime_type("Video/VP8"), MediaKind::Video);
        assert_eq!(
            MediaKind::from_mime_type("application/octet-stream"),
            MediaKind::Unspecified
        );
        assert_eq!(MediaKind::from_mime_type(""), MediaKind::Unspecified);
    }

    #[test]
    fn resume_far_behind_uses_expected_timestamp() {
        let f = vp8_forwarder(
            Some(Box::new(FixedReference(10_000))),
            Some(Box::new(FixedExpected(100_000))),
        );
        f.allocate_optimal(&[0, 1, 2], full_bitrates(), false);

        let tp = f
            .get_translation_params(&media_packet(1, 100, 1000, true), 2)
            .unwrap();
        assert_eq!(tp.rtp.unwrap().ext_timestamp, 1000);

        // publisher mutes for a while, then resumes
        f.pub_mute(true);
        f.pub_mute(false);

        // expected - reference = 1s at 90kHz, beyond the 0.2s resume
        // threshold: the stale reference is ignored
        let tp = f
            .get_translation_params(&media_packet(1, 101, 2000, true), 2)
            .unwrap();
        assert!(tp.is_resuming);
        let rtp = tp.rtp.unwrap();
        assert_eq!(rtp.ext_sequence_number, 101);
        assert_eq!(rtp.ext_timestamp, 100_000);
    }

    #[test]
    fn resume_slightly_behind_uses_reference_timestamp() {
        let f = vp8_forwarder(
            Some(Box::new(FixedReference(10_000))),
            Some(Box::new(FixedExpected(25_000))),
        );
        f.allocate_optimal(&[0, 1, 2], full_bitrates(), false);

        f.get_translation_params(&media_packet(1, 100, 1000, true), 2)
            .unwrap();
        f.pub_mute(true);
        f.pub_mute(false);

        // expected - reference is under the resume threshold: stay on the
        // reference timebase and let the stream catch up
        let tp = f
            .get_translation_params(&media_packet(1, 101, 2000, true), 2)
            .unwrap();
        assert_eq!(tp.rtp.unwrap().ext_timestamp, 10_000);
    }

    #[test]
    fn layer_switch_reference_too_far_behind_drops() {
        let f = opus_forwarder(
            Some(Box::new(FixedReference(97_000))),
            Some(Box::new(FixedExpected(100_000))),
        );
        f.get_translation_params(&media_packet(1, 100, 100_000, false), 0)
            .unwrap();
        f.get_translation_params(&media_packet(1, 101, 100_960, false), 0)
            .unwrap();

        // reference is 82.5ms behind the last sent timestamp at 48kHz
        let tp = f
            .get_translation_params(&media_packet(2, 7000, 200_000, false), 0)
            .unwrap();
        assert!(tp.should_drop);
        assert!(tp.rtp.is_none());

        // nothing moved: the old source continues with its offsets intact
        let state = f.get_state();
        assert_eq!(state.rtp.ext_last_ts, 100_960);
        let tp = f
            .get_translation_params(&media_packet(1, 102, 101_920, false), 0)
            .unwrap();
        let rtp = tp.rtp.unwrap();
        assert_eq!(rtp.ext_sequence_number, 102);
        assert_eq!(rtp.ext_timestamp, 101_920);
    }

    #[test]
    fn layer_switch_slightly_behind_bumps_nominally() {
        let f = opus_forwarder(
            Some(Box::new(FixedReference(99_600))),
            Some(Box::new(FixedExpected(100_000))),
        );
        f.get_translation_params(&media_packet(1, 100, 100_000, false), 0)
            .unwrap();
        f.get_translation_params(&media_packet(1, 101, 100_960, false), 0)
            .unwrap();

        // reference is 28.3ms behind: within tolerance, nominal +1 bump
        let tp = f
            .get_translation_params(&media_packet(2, 7000, 200_000, false), 0)
            .unwrap();
        assert!(!tp.should_drop);
        let rtp = tp.rtp.unwrap();
        assert_eq!(rtp.ext_sequence_number, 102);
        assert_eq!(rtp.ext_timestamp, 100_961);
    }

    #[test]
    fn output_counters_monotonic_across_source_switch() {
        let f = opus_forwarder(
            Some(Box::new(FixedReference(150_000))),
            Some(Box::new(FixedExpected(150_500))),
        );

        let mut last_sn = 0u64;
        let mut last_ts = 0u64;
        let packets = [
            (1u32, 100u64, 100_000u64),
            (1, 101, 100_960),
            (2, 7000, 300_000),
            (2, 7001, 300_960),
            (2, 7002, 301_920),
        ];
        for (ssrc, sn, ts) in packets {
            let tp = f
                .get_translation_params(&media_packet(ssrc, sn, ts, false), 0)
                .unwrap();
            let rtp = tp.rtp.unwrap();
            assert!(rtp.ext_sequence_number > last_sn);
            assert!(rtp.ext_timestamp > last_ts);
            last_sn = rtp.ext_sequence_number;
            last_ts = rtp.ext_timestamp;
        }
    }

    #[test]
    fn state_round_trips_through_seed() {
        let f = opus_forwarder(None, None);
        f.get_translation_params(&media_packet(1, 100, 100_000, false), 0)
            .unwrap();
        f.get_translation_params(&media_packet(1, 101, 100_960, false), 0)
            .unwrap();

        let state = f.get_state();
        assert!(state.started);

        let seeded = opus_forwarder(None, None);
        seeded.seed_state(state.clone());
        assert_eq!(seeded.get_state(), state);

        // serialization round trip for migration transport
        let encoded = serde_json::to_string(&state).unwrap();
        let decoded: ForwarderState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn unstarted_state_is_empty() {
        let f = opus_forwarder(None, None);
        assert_eq!(f.get_state(), ForwarderState::default());
        // seeding an unstarted snapshot is a no-op
        f.seed_state(ForwarderState::default());
        assert_eq!(f.get_state(), ForwarderState::default());
    }

    #[test]
    fn padding_before_media_seeds_third_quartile() {
        let f = vp8_forwarder(None, None);
        let snts = f.get_sn_ts_for_padding(3, false).unwrap();
        assert_eq!(snts.len(), 3);
        for window in snts.windows(2) {
            assert_eq!(
                window[1].ext_sequence_number,
                window[0].ext_sequence_number + 1
            );
        }
        // seeded into the third quartile of the 16-bit / 32-bit spaces
        let first = snts[0].sequence_number();
        assert!((1 << 15..3 << 14).contains(&first));
        assert!(snts[0].ext_timestamp as u32 >= 1 << 31);
    }

    #[test]
    fn blank_frames_advance_without_running_ahead() {
        let f = vp8_forwarder(None, None);
        let (snts, frame_end_needed) =
            f.get_sn_ts_for_blank_frames(30, 5).unwrap();
        assert!(!frame_end_needed);
        assert_eq!(snts.len(), 5);
        for window in snts.windows(2) {
            assert!(
                window[1].ext_sequence_number > window[0].ext_sequence_number
            );
            assert!(window[1].ext_timestamp >= window[0].ext_timestamp);
        }
    }

    #[test]
    fn codec_header_filters_temporal_layers_above_target() {
        let f = vp8_forwarder(None, None);
        f.set_max_temporal_layer(0);
        f.allocate_optimal(&[0, 1, 2], full_bitrates(), false);
        assert_eq!(f.target_layer().temporal, 0);

        let descriptor =
            |picture_id: u16, tl0: u8, tid: u8| -> Vec<u8> {
                let pid = (picture_id | 0b1000_0000_0000_0000).to_be_bytes();
                vec![
                    0b1000_0000,
                    0b1110_0000,
                    pid[0],
                    pid[1],
                    tl0,
                    tid << 6,
                    7,
                    7,
                ]
            };
        let vp8_packet = |ext_sn: u64, picture_id: u16, tid: u8, key: bool| {
            let payload = descriptor(picture_id, 1, tid);
            let mut pkt = media_packet(40, ext_sn, ext_sn * 3000, key);
            pkt.packet.set_payload(&payload);
            pkt.payload = PayloadInfo::Vp8(
                codec::vp8::ParsedHeader::read(&payload).unwrap(),
            );
            pkt
        };

        let base = vp8_packet(100, 50, 0, true);
        let tp = f.get_translation_params(&base, 0).unwrap();
        let mut out = [0u8; 64];
        let (forward, in_size, out_size) = f
            .translate_codec_header(&base, &tp.rtp.unwrap(), &mut out)
            .unwrap();
        assert!(forward);
        assert_eq!(in_size, out_size);

        // a frame of temporal layer 1 is filtered, not forwarded
        let high = vp8_packet(101, 51, 1, false);
        let tp = f.get_translation_params(&high, 0).unwrap();
        let (forward, _, _) = f
            .translate_codec_header(&high, &tp.rtp.unwrap(), &mut out)
            .unwrap();
        assert!(!forward);

        // the next base layer frame keeps picture ids contiguous
        let next = vp8_packet(102, 52, 0, false);
        let tp = f.get_translation_params(&next, 0).unwrap();
        let rtp = tp.rtp.unwrap();
        // sequence hole from the filtered packet is closed
        assert_eq!(rtp.ext_sequence_number, 101);
        let (forward, _, out_size) = f
            .translate_codec_header(&next, &rtp, &mut out)
            .unwrap();
        assert!(forward);
        let header =
            codec::vp8::ParsedHeader::read(&out[..out_size]).unwrap();
        assert_eq!(header.picture_id, Some(51));
    }

    #[test]
    fn check_sync_reports_request_layer() {
        let f = vp8_forwarder(None, None);
        f.allocate_optimal(&[0, 1, 2], full_bitrates(), false);
        let (in_sync, layer) = f.check_sync();
        assert!(!in_sync);
        assert_eq!(layer, 2);

        f.get_translation_params(&media_packet(30, 100, 1000, true), 2)
            .unwrap();
        let (in_sync, _) = f.check_sync();
        assert!(in_sync);
    }

    #[test]
    fn max_subscribed_spatial_holds_current_during_switch_down() {
        let f = vp8_forwarder(None, None);
        f.allocate_optimal(&[0, 1, 2], full_bitrates(), false);
        f.get_translation_params(&media_packet(30, 100, 1000, true), 2)
            .unwrap();
        assert_eq!(f.get_max_subscribed_spatial(), 2);

        // subscriber lowers its max below the still-streaming current
        f.set_max_spatial_layer(1);
        assert_eq!(f.get_max_subscribed_spatial(), 2);

        f.mute(true, true);
        assert_eq!(f.get_max_subscribed_spatial(), INVALID_LAYER_SPATIAL);
    }
}
