use std::collections::BTreeMap;

use codec::vp8;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::packet::{expand_truncated_counter, ExtPacket, PayloadInfo};

const PICTURE_ID_OFFSET_HISTORY_SIZE: usize = 64;

/// Migration snapshot of a codec munger, tagged by variant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecMungerState {
    #[default]
    None,
    Vp8(Vp8MungerState),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vp8MungerState {
    pub ext_last_picture_id: u64,
    pub picture_id_offset: u64,
    pub ext_last_tl0_pic_idx: u64,
    pub tl0_pic_idx_offset: u64,
}

/// Rewrites codec in-band state (e.g. VP8 picture id) so that frame counters
/// stay continuous across source switches that the RTP munger has already
/// hidden at the sequence number level.
pub trait CodecMunger: Send {
    /// Anchor on the first packet of a forwarding session.
    fn set_last(&mut self, pkt: &ExtPacket);

    /// Re-anchor offsets on a source switch.
    fn update_offsets(&mut self, pkt: &ExtPacket);

    /// Rewrite the packet's codec header into `out`. Returns
    /// (input size, output size); output size 0 means forward as-is.
    fn update_and_get(
        &mut self,
        pkt: &ExtPacket,
        is_out_of_order: bool,
        is_gap: bool,
        max_temporal: i32,
        out: &mut [u8],
    ) -> Result<(usize, usize)>;

    /// Emit a codec header for a locally generated padding packet;
    /// `new_frame` consumes a frame counter.
    fn update_and_get_padding(&mut self, new_frame: bool, out: &mut [u8])
        -> Result<usize>;

    fn get_state(&self) -> CodecMungerState;
    fn seed_state(&mut self, state: CodecMungerState);
}

/// Codec munger for codecs with no in-band state to rewrite.
#[derive(Default)]
pub struct Null;

impl Null {
    pub fn new() -> Self {
        Self
    }
}

impl CodecMunger for Null {
    fn set_last(&mut self, _pkt: &ExtPacket) {}

    fn update_offsets(&mut self, _pkt: &ExtPacket) {}

    fn update_and_get(
        &mut self,
        _pkt: &ExtPacket,
        _is_out_of_order: bool,
        _is_gap: bool,
        _max_temporal: i32,
        _out: &mut [u8],
    ) -> Result<(usize, usize)> {
        Ok((0, 0))
    }

    fn update_and_get_padding(
        &mut self,
        _new_frame: bool,
        _out: &mut [u8],
    ) -> Result<usize> {
        Ok(0)
    }

    fn get_state(&self) -> CodecMungerState {
        CodecMungerState::None
    }

    fn seed_state(&mut self, _state: CodecMungerState) {}
}

/// VP8 picture id / TL0 index continuity across source switches, temporal
/// layer filtering, and descriptors for padding frames.
///
/// Outgoing id = extended incoming id - offset, the same scheme the RTP
/// munger uses for sequence numbers. Offsets shift when whole frames are
/// dropped (temporal filtering) or fabricated (padding).
pub struct Vp8Munger {
    ext_highest_incoming_picture_id: u64,
    ext_highest_incoming_tl0_pic_idx: u64,
    picture_id_offset: u64,
    tl0_pic_idx_offset: u64,
    ext_last_picture_id: u64,
    ext_last_tl0_pic_idx: u64,
    // picture id offset in effect from a given incoming picture id on
    picture_id_offsets: BTreeMap<u64, u64>,
    // the picture id of the frame currently being filtered, to shift the
    // offset once per frame rather than once per packet
    dropping_picture_id: Option<u64>,
    anchored: bool,
}

impl Default for Vp8Munger {
    fn default() -> Self {
        Self::new()
    }
}

impl Vp8Munger {
    pub fn new() -> Self {
        Self {
            ext_highest_incoming_picture_id: 0,
            ext_highest_incoming_tl0_pic_idx: 0,
            picture_id_offset: 0,
            tl0_pic_idx_offset: 0,
            ext_last_picture_id: 0,
            ext_last_tl0_pic_idx: 0,
            picture_id_offsets: BTreeMap::new(),
            dropping_picture_id: None,
            anchored: false,
        }
    }

    fn vp8_header(pkt: &ExtPacket) -> Result<&vp8::ParsedHeader> {
        match &pkt.payload {
            PayloadInfo::Vp8(header) => Ok(header),
            PayloadInfo::None => Err(Error::MissingCodecHeader),
        }
    }

    fn record_picture_id_offset(&mut self, from_picture_id: u64) {
        self.picture_id_offsets
            .insert(from_picture_id, self.picture_id_offset);
        while self.picture_id_offsets.len() > PICTURE_ID_OFFSET_HISTORY_SIZE {
            self.picture_id_offsets.pop_first();
        }
    }
}

impl CodecMunger for Vp8Munger {
    fn set_last(&mut self, pkt: &ExtPacket) {
        let Ok(header) = Self::vp8_header(pkt) else {
            return;
        };
        let (Some(picture_id), Some(tl0_pic_idx)) =
            (header.picture_id, header.tl0_pic_idx)
        else {
            return;
        };

        self.ext_highest_incoming_picture_id = picture_id as u64;
        self.ext_highest_incoming_tl0_pic_idx = tl0_pic_idx as u64;
        self.picture_id_offset = 0;
        self.tl0_pic_idx_offset = 0;
        self.ext_last_picture_id = picture_id as u64;
        self.ext_last_tl0_pic_idx = tl0_pic_idx as u64;
        self.picture_id_offsets.clear();
        self.record_picture_id_offset(picture_id as u64);
        self.dropping_picture_id = None;
        self.anchored = true;
    }

    fn update_offsets(&mut self, pkt: &ExtPacket) {
        let Ok(header) = Self::vp8_header(pkt) else {
            return;
        };
        let (Some(picture_id), Some(tl0_pic_idx)) =
            (header.picture_id, header.tl0_pic_idx)
        else {
            return;
        };

        if !self.anchored {
            self.set_last(pkt);
            return;
        }

        // counters restart with the new source
        self.ext_highest_incoming_picture_id = picture_id as u64;
        self.ext_highest_incoming_tl0_pic_idx = tl0_pic_idx as u64;
        self.picture_id_offset = (picture_id as u64)
            .wrapping_sub(self.ext_last_picture_id)
            .wrapping_sub(1);
        self.tl0_pic_idx_offset = (tl0_pic_idx as u64)
            .wrapping_sub(self.ext_last_tl0_pic_idx)
            .wrapping_sub(1);
        self.picture_id_offsets.clear();
        self.record_picture_id_offset(picture_id as u64);
        self.dropping_picture_id = None;
    }

    fn update_and_get(
        &mut self,
        pkt: &ExtPacket,
        is_out_of_order: bool,
        _is_gap: bool,
        max_temporal: i32,
        out: &mut [u8],
    ) -> Result<(usize, usize)> {
        let header = Self::vp8_header(pkt)?;
        let picture_id = header.picture_id.ok_or(Error::MissingCodecHeader)?;
        let tl0_pic_idx = header.tl0_pic_idx.ok_or(Error::MissingCodecHeader)?;

        if !self.anchored {
            self.set_last(pkt);
        }

        let ext_picture_id = expand_truncated_counter(
            picture_id as u64,
            &mut self.ext_highest_incoming_picture_id,
            15,
        );
        let ext_tl0_pic_idx = expand_truncated_counter(
            tl0_pic_idx as u64,
            &mut self.ext_highest_incoming_tl0_pic_idx,
            8,
        );

        let (out_picture_id, out_tl0_pic_idx) = if is_out_of_order {
            let offset = self
                .picture_id_offsets
                .range(..=ext_picture_id)
                .next_back()
                .map(|(_, &offset)| offset)
                .ok_or(Error::OutOfOrderPictureIdCacheMiss)?;
            (
                ext_picture_id.wrapping_sub(offset),
                ext_tl0_pic_idx.wrapping_sub(self.tl0_pic_idx_offset),
            )
        } else {
            if let Some(temporal_layer_id) = header.temporal_layer_id {
                if max_temporal >= 0 && temporal_layer_id as i32 > max_temporal {
                    // close the picture id hole once per dropped frame
                    if self.dropping_picture_id != Some(ext_picture_id) {
                        self.picture_id_offset =
                            self.picture_id_offset.wrapping_add(1);
                        self.record_picture_id_offset(
                            ext_picture_id.wrapping_add(1),
                        );
                        self.dropping_picture_id = Some(ext_picture_id);
                        debug!(
                            picture_id = ext_picture_id,
                            temporal_layer_id, max_temporal, "filtering frame"
                        );
                    }
                    return Err(Error::FilteredTemporalLayer);
                }
            }

            let out_picture_id = ext_picture_id.wrapping_sub(self.picture_id_offset);
            let out_tl0_pic_idx =
                ext_tl0_pic_idx.wrapping_sub(self.tl0_pic_idx_offset);
            self.ext_last_picture_id = out_picture_id;
            self.ext_last_tl0_pic_idx = out_tl0_pic_idx;
            (out_picture_id, out_tl0_pic_idx)
        };

        let payload = pkt.packet.payload();
        if out.len() < payload.len() {
            return Err(Error::OutputBufferTooSmall);
        }
        out[..payload.len()].copy_from_slice(payload);
        vp8::modify_header(
            &mut out[..payload.len()],
            (out_picture_id & 0x7fff) as vp8::TruncatedPictureId,
            out_tl0_pic_idx as vp8::TruncatedTl0PicIdx,
        );

        Ok((payload.len(), payload.len()))
    }

    fn update_and_get_padding(
        &mut self,
        new_frame: bool,
        out: &mut [u8],
    ) -> Result<usize> {
        if out.len() < vp8::MIN_HEADER_SIZE {
            return Err(Error::OutputBufferTooSmall);
        }

        if new_frame {
            self.ext_last_picture_id = self.ext_last_picture_id.wrapping_add(1);
            // a frame counter was consumed locally, shift real frames after it
            self.picture_id_offset = self.picture_id_offset.wrapping_sub(1);
            self.record_picture_id_offset(
                self.ext_highest_incoming_picture_id.wrapping_add(1),
            );
        }

        Ok(vp8::write_min_header(
            out,
            (self.ext_last_picture_id & 0x7fff) as vp8::TruncatedPictureId,
            self.ext_last_tl0_pic_idx as vp8::TruncatedTl0PicIdx,
            new_frame,
        ))
    }

    fn get_state(&self) -> CodecMungerState {
        CodecMungerState::Vp8(Vp8MungerState {
            ext_last_picture_id: self.ext_last_picture_id,
            picture_id_offset: self.picture_id_offset,
            ext_last_tl0_pic_idx: self.ext_last_tl0_pic_idx,
            tl0_pic_idx_offset: self.tl0_pic_idx_offset,
        })
    }

    fn seed_state(&mut self, state: CodecMungerState) {
        let CodecMungerState::Vp8(state) = state else {
            return;
        };
        self.ext_last_picture_id = state.ext_last_picture_id;
        self.picture_id_offset = state.picture_id_offset;
        self.ext_last_tl0_pic_idx = state.ext_last_tl0_pic_idx;
        self.tl0_pic_idx_offset = state.tl0_pic_idx_offset;
        self.anchored = true;
    }
}
