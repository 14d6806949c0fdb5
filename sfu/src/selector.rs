use tracing::debug;

use crate::layer::{VideoLayer, INVALID_LAYER, INVALID_LAYER_SPATIAL};
use crate::packet::{ExtPacket, PayloadInfo};

/// Outcome of offering one packet to the selector.
#[derive(Clone, Debug, Default)]
pub struct SelectionResult {
    pub is_selected: bool,
    /// Not selected, but part of the stream being forwarded; the caller keeps
    /// sequence number bookkeeping coherent for it.
    pub is_relevant: bool,
    pub is_resuming: bool,
    pub is_switching: bool,
    pub rtp_marker: bool,
    pub dependency_descriptor_extension: Option<Vec<u8>>,
}

/// Codec-specific decision of when a temporal layer move may take effect.
pub trait TemporalLayerSelector: Send {
    /// Returns (temporal layer now in effect, whether this packet switches).
    fn select(&mut self, pkt: &ExtPacket, current: i32, target: i32)
        -> (i32, bool);
}

/// VP8 temporal stepping: up only at a layer sync point (or key frame) of a
/// frame at or below the target, down immediately.
#[derive(Default)]
pub struct Vp8TemporalLayerSelector;

impl Vp8TemporalLayerSelector {
    pub fn new() -> Self {
        Self
    }
}

impl TemporalLayerSelector for Vp8TemporalLayerSelector {
    fn select(
        &mut self,
        pkt: &ExtPacket,
        current: i32,
        target: i32,
    ) -> (i32, bool) {
        if current == target {
            return (current, false);
        }
        if current > target {
            return (target, true);
        }

        let PayloadInfo::Vp8(header) = &pkt.payload else {
            return (current, false);
        };
        let temporal_layer_id =
            header.temporal_layer_id.unwrap_or(0) as i32;
        if pkt.key_frame
            || (header.layer_sync && temporal_layer_id <= target)
        {
            return (target, true);
        }

        (current, false)
    }
}

/// Per-packet video layer selection. One trait, variants per codec family;
/// the forwarder holds exactly one for its lifetime once the codec is known.
pub trait VideoLayerSelector: Send {
    fn get_max(&self) -> VideoLayer;
    fn set_max_spatial(&mut self, spatial: i32);
    fn set_max_temporal(&mut self, temporal: i32);

    fn get_max_seen(&self) -> VideoLayer;
    fn set_max_seen_spatial(&mut self, spatial: i32);
    fn set_max_seen_temporal(&mut self, temporal: i32);

    fn get_target(&self) -> VideoLayer;
    fn set_target(&mut self, layer: VideoLayer);

    fn get_request_spatial(&self) -> i32;
    fn set_request_spatial(&mut self, spatial: i32);

    fn get_current(&self) -> VideoLayer;
    fn set_current(&mut self, layer: VideoLayer);

    fn is_overshoot_okay(&self) -> bool;

    /// Whether forwarding is locked to the requested spatial layer; when not,
    /// also reports which layer should be requested to get there.
    fn check_sync(&self) -> (bool, i32);

    fn select(&mut self, pkt: &ExtPacket, layer: i32) -> SelectionResult;

    /// Temporal layer in effect for this packet, possibly stepping the
    /// current temporal layer towards the target.
    fn select_temporal(&mut self, pkt: &ExtPacket) -> (i32, bool);

    /// Undo the layer move committed by the most recent select, used when
    /// the packet that carried the switch ends up dropped.
    fn rollback(&mut self);

    fn set_temporal_layer_selector(
        &mut self,
        tls: Box<dyn TemporalLayerSelector>,
    );
}

/// Layer bookkeeping shared by all selector variants.
pub struct Base {
    max_layer: VideoLayer,
    max_seen_layer: VideoLayer,
    target_layer: VideoLayer,
    request_spatial: i32,
    current_layer: VideoLayer,
    previous_layer: VideoLayer,
    tls: Option<Box<dyn TemporalLayerSelector>>,
}

impl Base {
    fn new() -> Self {
        Self {
            max_layer: INVALID_LAYER,
            max_seen_layer: INVALID_LAYER,
            target_layer: INVALID_LAYER,
            request_spatial: INVALID_LAYER_SPATIAL,
            current_layer: INVALID_LAYER,
            previous_layer: INVALID_LAYER,
            tls: None,
        }
    }

    fn check_sync(&self) -> (bool, i32) {
        let request = self.request_spatial;
        let locked = !self.target_layer.is_valid()
            || self.current_layer.spatial == request;
        (locked, request)
    }

    fn select_temporal(&mut self, pkt: &ExtPacket) -> (i32, bool) {
        let current = self.current_layer.temporal;
        let target = self.target_layer.temporal;
        let Some(tls) = self.tls.as_mut() else {
            return (current, false);
        };
        let (temporal, is_switching) = tls.select(pkt, current, target);
        if is_switching {
            self.previous_layer = self.current_layer;
            self.current_layer.temporal = temporal;
        }
        (temporal, is_switching)
    }

    fn rollback(&mut self) {
        debug!(
            current = %self.current_layer,
            previous = %self.previous_layer,
            "rolling back layer selection"
        );
        self.current_layer = self.previous_layer;
    }
}

macro_rules! delegate_base {
    () => {
        fn get_max(&self) -> VideoLayer {
            self.base.max_layer
        }

        fn set_max_spatial(&mut self, spatial: i32) {
            self.base.max_layer.spatial = spatial;
        }

        fn set_max_temporal(&mut self, temporal: i32) {
            self.base.max_layer.temporal = temporal;
        }

        fn get_max_seen(&self) -> VideoLayer {
            self.base.max_seen_layer
        }

        fn set_max_seen_spatial(&mut self, spatial: i32) {
            self.base.max_seen_layer.spatial = spatial;
        }

        fn set_max_seen_temporal(&mut self, temporal: i32) {
            self.base.max_seen_layer.temporal = temporal;
        }

        fn get_target(&self) -> VideoLayer {
            self.base.target_layer
        }

        fn set_target(&mut self, layer: VideoLayer) {
            self.base.target_layer = layer;
        }

        fn get_request_spatial(&self) -> i32 {
            self.base.request_spatial
        }

        fn set_request_spatial(&mut self, spatial: i32) {
            self.base.request_spatial = spatial;
        }

        fn get_current(&self) -> VideoLayer {
            self.base.current_layer
        }

        fn set_current(&mut self, layer: VideoLayer) {
            self.base.current_layer = layer;
        }

        fn check_sync(&self) -> (bool, i32) {
            self.base.check_sync()
        }

        fn select_temporal(&mut self, pkt: &ExtPacket) -> (i32, bool) {
            self.base.select_temporal(pkt)
        }

        fn rollback(&mut self) {
            self.base.rollback();
        }

        fn set_temporal_layer_selector(
            &mut self,
            tls: Box<dyn TemporalLayerSelector>,
        ) {
            self.base.tls = Some(tls);
        }
    };
}

/// Selector used before the codec is known; never selects a packet but keeps
/// all the layer bookkeeping so it can be carried into a real variant.
pub struct Null {
    base: Base,
}

impl Default for Null {
    fn default() -> Self {
        Self::new()
    }
}

impl Null {
    pub fn new() -> Self {
        Self { base: Base::new() }
    }
}

impl VideoLayerSelector for Null {
    delegate_base!();

    fn is_overshoot_okay(&self) -> bool {
        false
    }

    fn select(&mut self, _pkt: &ExtPacket, _layer: i32) -> SelectionResult {
        SelectionResult::default()
    }
}

/// Simulcast selection: each spatial layer is its own SSRC, so a spatial
/// switch happens only on a key frame of the wanted stream.
pub struct Simulcast {
    base: Base,
}

impl Default for Simulcast {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulcast {
    pub fn new() -> Self {
        Self { base: Base::new() }
    }

    /// Carry the layer bookkeeping over from the selector used before the
    /// codec was known.
    pub fn from_null(prior: &dyn VideoLayerSelector) -> Self {
        let mut base = Base::new();
        base.max_layer = prior.get_max();
        base.max_seen_layer = prior.get_max_seen();
        base.target_layer = prior.get_target();
        base.request_spatial = prior.get_request_spatial();
        base.current_layer = prior.get_current();
        Self { base }
    }
}

impl VideoLayerSelector for Simulcast {
    delegate_base!();

    fn is_overshoot_okay(&self) -> bool {
        true
    }

    fn select(&mut self, pkt: &ExtPacket, layer: i32) -> SelectionResult {
        let mut result = SelectionResult::default();

        let current = self.base.current_layer;
        let target = self.base.target_layer;

        if current.spatial != target.spatial && pkt.key_frame {
            // a key frame of the wanted stream is the switch point; while
            // nothing is streaming, any key frame at or below target will do
            if layer == target.spatial
                || (!current.is_valid() && layer < target.spatial)
            {
                self.base.previous_layer = current;
                self.base.current_layer = VideoLayer::new(layer, target.temporal);
                result.is_switching = true;
                result.is_resuming = !current.is_valid();
                debug!(
                    from = %current,
                    to = %self.base.current_layer,
                    layer,
                    "simulcast spatial switch"
                );
            }
        }

        let current = self.base.current_layer;
        if !current.is_valid() || layer != current.spatial {
            return result;
        }

        result.is_selected = true;
        result.rtp_marker = pkt.packet.has_marker();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::RtpPacket;

    fn key_frame(ssrc: u32) -> ExtPacket {
        let mut rtp = RtpPacket::new();
        rtp.set_ssrc(ssrc);
        rtp.set_payload(&[1]);
        ExtPacket {
            packet: rtp,
            key_frame: true,
            ..Default::default()
        }
    }

    fn delta_frame(marker: bool) -> ExtPacket {
        let mut rtp = RtpPacket::new();
        rtp.set_marker(marker);
        rtp.set_payload(&[1]);
        ExtPacket {
            packet: rtp,
            key_frame: false,
            ..Default::default()
        }
    }

    fn vp8_delta(tid: u8, layer_sync: bool) -> ExtPacket {
        let mut pkt = delta_frame(true);
        pkt.payload = PayloadInfo::Vp8(codec::vp8::ParsedHeader {
            picture_id: Some(1),
            tl0_pic_idx: Some(1),
            temporal_layer_id: Some(tid),
            layer_sync,
            ..Default::default()
        });
        pkt
    }

    #[test]
    fn waits_for_key_frame_of_target_layer() {
        let mut selector = Simulcast::new();
        selector.set_target(VideoLayer::new(1, 3));
        selector.set_current(INVALID_LAYER);

        // delta frames of the target layer do not switch
        assert!(!selector.select(&delta_frame(true), 1).is_selected);
        // key frame of another higher layer does not switch
        assert!(!selector.select(&key_frame(9), 2).is_selected);

        let result = selector.select(&key_frame(7), 1);
        assert!(result.is_selected);
        assert!(result.is_switching);
        assert!(result.is_resuming);
        assert_eq!(selector.get_current(), VideoLayer::new(1, 3));

        // packets of other layers stay unselected afterwards
        assert!(!selector.select(&delta_frame(true), 0).is_selected);
        assert!(selector.select(&delta_frame(true), 1).is_selected);
    }

    #[test]
    fn latches_lower_layer_while_resuming() {
        let mut selector = Simulcast::new();
        selector.set_target(VideoLayer::new(2, 3));
        selector.set_current(INVALID_LAYER);

        let result = selector.select(&key_frame(1), 0);
        assert!(result.is_selected);
        assert!(result.is_resuming);
        assert_eq!(selector.get_current().spatial, 0);
    }

    #[test]
    fn rollback_restores_previous_layer() {
        let mut selector = Simulcast::new();
        selector.set_target(VideoLayer::new(1, 3));
        selector.set_current(VideoLayer::new(0, 3));

        let result = selector.select(&key_frame(1), 1);
        assert!(result.is_switching);
        assert_eq!(selector.get_current().spatial, 1);

        selector.rollback();
        assert_eq!(selector.get_current().spatial, 0);
    }

    #[test]
    fn check_sync_tracks_request_spatial() {
        let mut selector = Simulcast::new();
        selector.set_target(VideoLayer::new(1, 3));
        selector.set_request_spatial(1);
        selector.set_current(VideoLayer::new(0, 3));
        assert_eq!(selector.check_sync(), (false, 1));

        selector.set_current(VideoLayer::new(1, 3));
        assert_eq!(selector.check_sync(), (true, 1));

        // a paused stream is in sync by definition
        selector.set_target(INVALID_LAYER);
        selector.set_current(INVALID_LAYER);
        assert_eq!(selector.check_sync().0, true);
    }

    #[test]
    fn temporal_moves_gated_by_vp8_sync_points() {
        let mut selector = Simulcast::new();
        selector.set_temporal_layer_selector(Box::new(
            Vp8TemporalLayerSelector::new(),
        ));
        selector.set_target(VideoLayer::new(0, 2));
        selector.set_current(VideoLayer::new(0, 0));

        // plain delta frame cannot step up
        assert_eq!(selector.select_temporal(&vp8_delta(2, false)), (0, false));
        // layer sync frame at or below target steps up
        assert_eq!(selector.select_temporal(&vp8_delta(1, true)), (2, true));
        assert_eq!(selector.get_current().temporal, 2);

        // moving down is immediate
        selector.set_target(VideoLayer::new(0, 1));
        assert_eq!(selector.select_temporal(&vp8_delta(0, false)), (1, true));
    }

    #[test]
    fn from_null_carries_layer_state() {
        let mut null = Null::new();
        null.set_max_spatial(2);
        null.set_max_temporal(3);
        null.set_max_seen_spatial(1);
        null.set_max_seen_temporal(2);
        null.set_target(VideoLayer::new(1, 2));
        null.set_current(VideoLayer::new(1, 1));
        null.set_request_spatial(1);

        let simulcast = Simulcast::from_null(&null);
        assert_eq!(simulcast.get_max(), VideoLayer::new(2, 3));
        assert_eq!(simulcast.get_max_seen(), VideoLayer::new(1, 2));
        assert_eq!(simulcast.get_target(), VideoLayer::new(1, 2));
        assert_eq!(simulcast.get_current(), VideoLayer::new(1, 1));
        assert_eq!(simulcast.get_request_spatial(), 1);
    }

    #[test]
    fn null_never_selects() {
        let mut null = Null::new();
        null.set_target(VideoLayer::new(0, 0));
        null.set_current(VideoLayer::new(0, 0));
        assert!(!null.select(&key_frame(1), 0).is_selected);
    }
}
