use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::packet::ExtPacket;

// History bounds. Out-of-order arrivals older than what these windows retain
// are dropped with a cache-miss error rather than translated with a wrong
// offset.
const SN_OFFSET_HISTORY_SIZE: usize = 64;
const DROPPED_HISTORY_SIZE: usize = 256;
const PADDING_HISTORY_SIZE: usize = 256;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SequenceNumberOrdering {
    #[default]
    Contiguous,
    OutOfOrder,
    Gap,
}

/// Outgoing sequence number / timestamp for one translated packet, still in
/// extended (64-bit) form. Transport truncates to the wire width.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TranslationParamsRtp {
    pub sn_ordering: SequenceNumberOrdering,
    pub ext_sequence_number: u64,
    pub ext_timestamp: u64,
}

impl TranslationParamsRtp {
    pub fn sequence_number(&self) -> u16 {
        self.ext_sequence_number as u16
    }

    pub fn timestamp(&self) -> u32 {
        self.ext_timestamp as u32
    }
}

/// One generated padding packet's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnTs {
    pub ext_sequence_number: u64,
    pub ext_timestamp: u64,
}

impl SnTs {
    pub fn sequence_number(&self) -> u16 {
        self.ext_sequence_number as u16
    }

    pub fn timestamp(&self) -> u32 {
        self.ext_timestamp as u32
    }
}

/// The part of the munger state that survives a subscriber migration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpMungerState {
    pub ext_last_sn: u64,
    pub ext_second_last_sn: u64,
    pub ext_last_ts: u64,
    pub ext_second_last_ts: u64,
    pub last_marker: bool,
    pub second_last_marker: bool,
}

/// Rewrites outgoing sequence numbers and timestamps so that the subscriber
/// sees one gapless stream across source switches, drops, and padding.
///
/// Outgoing = incoming - offset. The offsets only change at discrete points
/// (source switch, dropped packet, generated padding); the history keyed by
/// the incoming sequence number each offset took effect at lets late
/// arrivals be translated with the offset that was current for them.
pub struct RtpMunger {
    ext_highest_incoming_sn: u64,
    sn_offset: u64,
    ts_offset: u64,

    ext_last_sn: u64,
    ext_second_last_sn: u64,
    ext_last_ts: u64,
    ext_second_last_ts: u64,
    last_marker: bool,
    second_last_marker: bool,

    // sequence number offset in effect from a given incoming SN on
    sn_offsets: BTreeMap<u64, u64>,
    // incoming SNs whose outgoing slot was reclaimed after a drop
    dropped_sns: BTreeSet<u64>,
    // outgoing SNs fabricated for padding, for RTX filtering
    padding_sns: BTreeSet<u64>,
}

impl Default for RtpMunger {
    fn default() -> Self {
        Self::new()
    }
}

impl RtpMunger {
    pub fn new() -> Self {
        Self {
            ext_highest_incoming_sn: 0,
            sn_offset: 0,
            ts_offset: 0,
            ext_last_sn: 0,
            ext_second_last_sn: 0,
            ext_last_ts: 0,
            ext_second_last_ts: 0,
            last_marker: true,
            second_last_marker: true,
            sn_offsets: BTreeMap::new(),
            dropped_sns: BTreeSet::new(),
            padding_sns: BTreeSet::new(),
        }
    }

    /// Anchor the munger on the first packet of a forwarding session. The
    /// packet itself maps to its own numbers.
    pub fn set_last_sn_ts(&mut self, pkt: &ExtPacket) {
        self.ext_highest_incoming_sn = pkt.ext_sequence_number.wrapping_sub(1);
        self.sn_offset = 0;
        self.ts_offset = 0;
        self.ext_last_sn = pkt.ext_sequence_number;
        self.ext_second_last_sn = self.ext_last_sn;
        self.ext_last_ts = pkt.ext_timestamp;
        self.ext_second_last_ts = self.ext_last_ts;
        self.last_marker = true;
        self.second_last_marker = true;
        self.sn_offsets.clear();
        self.sn_offsets.insert(pkt.ext_sequence_number, 0);
        self.dropped_sns.clear();
    }

    /// Re-anchor on a source switch. The first packet of the new source will
    /// come out `sn_adjust` sequence numbers and `ts_adjust` timestamp ticks
    /// after the last forwarded packet.
    pub fn update_sn_ts_offsets(
        &mut self,
        pkt: &ExtPacket,
        sn_adjust: u64,
        ts_adjust: u64,
    ) {
        self.sn_offset = pkt
            .ext_sequence_number
            .wrapping_sub(self.ext_last_sn)
            .wrapping_sub(sn_adjust);
        self.ts_offset = pkt
            .ext_timestamp
            .wrapping_sub(self.ext_last_ts)
            .wrapping_sub(ts_adjust);
        self.ext_highest_incoming_sn = pkt.ext_sequence_number.wrapping_sub(1);

        // extended counters restart with the new source, old lookups are void
        self.sn_offsets.clear();
        self.sn_offsets
            .insert(pkt.ext_sequence_number, self.sn_offset);
        self.dropped_sns.clear();
    }

    /// Classify the packet's ordering and produce its outgoing numbers.
    pub fn update_and_get_sn_ts(
        &mut self,
        pkt: &ExtPacket,
        marker: bool,
    ) -> Result<TranslationParamsRtp> {
        let ext_sn = pkt.ext_sequence_number;

        if ext_sn == self.ext_highest_incoming_sn {
            return Err(Error::DuplicatePacket);
        }

        if ext_sn < self.ext_highest_incoming_sn {
            // late arrival, translate with the offset that applied to it
            if self.dropped_sns.contains(&ext_sn) {
                return Err(Error::OutOfOrderSequenceNumberCacheMiss);
            }
            let sn_offset = self
                .sn_offsets
                .range(..=ext_sn)
                .next_back()
                .map(|(_, &offset)| offset)
                .ok_or(Error::OutOfOrderSequenceNumberCacheMiss)?;
            return Ok(TranslationParamsRtp {
                sn_ordering: SequenceNumberOrdering::OutOfOrder,
                ext_sequence_number: ext_sn.wrapping_sub(sn_offset),
                ext_timestamp: pkt.ext_timestamp.wrapping_sub(self.ts_offset),
            });
        }

        let diff = ext_sn - self.ext_highest_incoming_sn;
        self.ext_highest_incoming_sn = ext_sn;

        if pkt.packet.is_padding_only() {
            // not forwarded, reclaim the outgoing slot
            self.sn_offset = self.sn_offset.wrapping_add(1);
            self.record_sn_offset(ext_sn.wrapping_add(1));
            self.record_dropped(ext_sn);
            return Err(Error::PaddingOnlyPacket);
        }

        let sn_ordering = if diff == 1 {
            SequenceNumberOrdering::Contiguous
        } else {
            SequenceNumberOrdering::Gap
        };

        let ext_sequence_number = ext_sn.wrapping_sub(self.sn_offset);
        let ext_timestamp = pkt.ext_timestamp.wrapping_sub(self.ts_offset);

        self.ext_second_last_sn = self.ext_last_sn;
        self.ext_second_last_ts = self.ext_last_ts;
        self.second_last_marker = self.last_marker;
        self.ext_last_sn = ext_sequence_number;
        self.ext_last_ts = ext_timestamp;
        self.last_marker = marker;

        Ok(TranslationParamsRtp {
            sn_ordering,
            ext_sequence_number,
            ext_timestamp,
        })
    }

    /// Close the sequence number hole left by a packet that was translated
    /// and then dropped. Only the most recently translated packet can be
    /// retroactively dropped.
    pub fn packet_dropped(&mut self, pkt: &ExtPacket) {
        if pkt.ext_sequence_number != self.ext_highest_incoming_sn {
            return;
        }

        self.sn_offset = self.sn_offset.wrapping_add(1);
        self.record_sn_offset(pkt.ext_sequence_number.wrapping_add(1));
        self.record_dropped(pkt.ext_sequence_number);

        self.ext_last_sn = self.ext_second_last_sn;
        self.ext_last_ts = self.ext_second_last_ts;
        self.last_marker = self.second_last_marker;
    }

    /// Generate `num` padding packets' worth of outgoing numbers. Padding can
    /// only start at a frame boundary unless `force_marker` closes frames.
    /// With a frame rate, each generated frame advances the timestamp, capped
    /// at `ext_expected_ts` (when non-zero) so padding never runs ahead of
    /// real time.
    pub fn update_and_get_padding_sn_ts(
        &mut self,
        num: usize,
        clock_rate: u32,
        frame_rate: u32,
        force_marker: bool,
        ext_expected_ts: u64,
    ) -> Result<Vec<SnTs>> {
        if num == 0 {
            return Ok(Vec::new());
        }
        if !force_marker && !self.last_marker {
            return Err(Error::PaddingNotOnFrameBoundary);
        }

        // a frame is open, the first padding packet closes it at the same timestamp
        let close_current_frame = !self.last_marker;

        let mut snts = Vec::with_capacity(num);
        let mut ext_timestamp = self.ext_last_ts;
        for i in 0..num {
            let ext_sequence_number =
                self.ext_last_sn.wrapping_add(i as u64 + 1);
            let starts_new_frame = !(i == 0 && close_current_frame);
            if starts_new_frame && clock_rate != 0 && frame_rate != 0 {
                let frames = if close_current_frame {
                    i as u64
                } else {
                    i as u64 + 1
                };
                let mut ts = self.ext_last_ts.wrapping_add(std::cmp::max(
                    1,
                    frames * clock_rate as u64 / frame_rate as u64,
                ));
                if ext_expected_ts != 0
                    && (ts.wrapping_sub(ext_expected_ts) as i64) > 0
                {
                    ts = ext_expected_ts;
                }
                if (ts.wrapping_sub(ext_timestamp) as i64) > 0 {
                    ext_timestamp = ts;
                }
            }
            snts.push(SnTs {
                ext_sequence_number,
                ext_timestamp,
            });
            self.record_padding(ext_sequence_number);
        }

        if let Some(last) = snts.last() {
            self.ext_second_last_sn = self.ext_last_sn;
            self.ext_second_last_ts = self.ext_last_ts;
            self.second_last_marker = self.last_marker;
            self.ext_last_sn = last.ext_sequence_number;
            self.ext_last_ts = last.ext_timestamp;
            if force_marker {
                self.last_marker = true;
            }
        }

        // outgoing sequence space was consumed without incoming packets
        self.sn_offset = self.sn_offset.wrapping_sub(num as u64);
        self.record_sn_offset(self.ext_highest_incoming_sn.wrapping_add(1));

        Ok(snts)
    }

    /// Drop NACKs for sequence numbers this munger fabricated as padding;
    /// there is no source packet to retransmit for them.
    pub fn filter_rtx(&self, nacks: &[u16]) -> Vec<u16> {
        nacks
            .iter()
            .copied()
            .filter(|&sn| {
                let ext = self.extend_outgoing_sn(sn);
                !self.padding_sns.contains(&ext)
            })
            .collect()
    }

    pub fn is_on_frame_boundary(&self) -> bool {
        self.last_marker
    }

    /// The timestamp conversion constant currently in effect
    /// (outgoing = incoming - offset).
    pub fn get_pinned_ts_offset(&self) -> u64 {
        self.ts_offset
    }

    pub fn get_last(&self) -> RtpMungerState {
        RtpMungerState {
            ext_last_sn: self.ext_last_sn,
            ext_second_last_sn: self.ext_second_last_sn,
            ext_last_ts: self.ext_last_ts,
            ext_second_last_ts: self.ext_second_last_ts,
            last_marker: self.last_marker,
            second_last_marker: self.second_last_marker,
        }
    }

    pub fn seed_last(&mut self, state: RtpMungerState) {
        self.ext_last_sn = state.ext_last_sn;
        self.ext_second_last_sn = state.ext_second_last_sn;
        self.ext_last_ts = state.ext_last_ts;
        self.ext_second_last_ts = state.ext_second_last_ts;
        self.last_marker = state.last_marker;
        self.second_last_marker = state.second_last_marker;
    }

    // Lift a truncated outgoing sequence number near the last sent one.
    fn extend_outgoing_sn(&self, sn: u16) -> u64 {
        let base = self.ext_last_sn & !0xffff;
        let candidates = [
            base.wrapping_sub(1 << 16) | sn as u64,
            base | sn as u64,
            base.wrapping_add(1 << 16) | sn as u64,
        ];
        let mut best = candidates[0];
        for candidate in candidates {
            let best_distance =
                (best.wrapping_sub(self.ext_last_sn) as i64).unsigned_abs();
            let distance =
                (candidate.wrapping_sub(self.ext_last_sn) as i64).unsigned_abs();
            if distance < best_distance {
                best = candidate;
            }
        }
        best
    }

    fn record_sn_offset(&mut self, from_sn: u64) {
        self.sn_offsets.insert(from_sn, self.sn_offset);
        while self.sn_offsets.len() > SN_OFFSET_HISTORY_SIZE {
            self.sn_offsets.pop_first();
        }
    }

    fn record_dropped(&mut self, sn: u64) {
        self.dropped_sns.insert(sn);
        while self.dropped_sns.len() > DROPPED_HISTORY_SIZE {
            self.dropped_sns.pop_first();
        }
    }

    fn record_padding(&mut self, sn: u64) {
        self.padding_sns.insert(sn);
        while self.padding_sns.len() > PADDING_HISTORY_SIZE {
            self.padding_sns.pop_first();
        }
    }
}
