//! VP8 RTP payload descriptor and frame header fields used when forwarding.
//!
//! Wire formats: https://datatracker.ietf.org/doc/html/rfc7741 (payload
//! descriptor) and https://datatracker.ietf.org/doc/html/rfc6386#section-9.1
//! (frame header).

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

pub type TruncatedPictureId = u16;
pub type FullPictureId = u64;
pub type TruncatedTl0PicIdx = u8;
pub type FullTl0PicIdx = u64;

// payload descriptor, required first octet
const X_BIT: u8 = 0b1000_0000; // extended control bits present
const S_BIT: u8 = 0b0001_0000; // start of VP8 partition
const PID_MASK: u8 = 0b0000_0111; // partition index

// extension octet
const I_BIT: u8 = 0b1000_0000; // picture id present
const L_BIT: u8 = 0b0100_0000; // TL0PICIDX present
const T_BIT: u8 = 0b0010_0000; // TID present
const K_BIT: u8 = 0b0001_0000; // KEYIDX present

// first picture id octet: set when the id is the two-octet (15-bit) form
const M_BIT: u8 = 0b1000_0000;

// T/K octet
const TID_SHIFT: u32 = 6;
const Y_BIT: u8 = 0b0010_0000; // layer sync

// first octet of the frame tag: inverse key frame flag
const P_BIT: u8 = 0b0000_0001;

// key frame header: 3-octet frame tag, 3-octet start code, then
// two 16-bit little-endian size fields of 14 bits each
const FRAME_TAG_SIZE: usize = 3;
const START_CODE_SIZE: usize = 3;
const SIZE_FIELD_MASK: u16 = 0x3fff;

/// Frame geometry carried by a key frame header.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelSize {
    pub width: usize,
    pub height: usize,
}

/// The descriptor and frame header fields a forwarder cares about.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct ParsedHeader {
    /// Frame ordering counter, 15 bits on the wire. Continuity matters to
    /// the decoder, so it must be rewritten when stitching streams together.
    pub picture_id: Option<TruncatedPictureId>,

    /// Counts frames of temporal layer 0, which higher temporal layers
    /// reference. Rewritten alongside the picture id.
    pub tl0_pic_idx: Option<TruncatedTl0PicIdx>,

    /// Temporal layer of this frame; frames above the subscriber's temporal
    /// target can be dropped without breaking later frames.
    pub temporal_layer_id: Option<u8>,

    /// Set when this frame references layer 0 directly, making it a safe
    /// point to step the temporal layer up.
    pub layer_sync: bool,

    pub is_key_frame: bool,

    /// Present on key frames only; subsequent frames keep this size.
    pub resolution: Option<PixelSize>,
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn octet(&mut self) -> Result<u8> {
        ensure!(self.pos < self.buf.len(), "truncated vp8 payload");
        let octet = self.buf[self.pos];
        self.pos += 1;
        Ok(octet)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        ensure!(self.pos + n <= self.buf.len(), "truncated vp8 payload");
        self.pos += n;
        Ok(())
    }

    fn le_u16(&mut self) -> Result<u16> {
        ensure!(self.pos + 2 <= self.buf.len(), "truncated vp8 payload");
        let value = u16::from_le_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }
}

impl ParsedHeader {
    /// Read the payload descriptor and, when the packet starts partition
    /// zero, the frame tag behind it.
    pub fn read(payload: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(payload);
        let mut header = Self::default();

        let required = cursor.octet()?;

        if required & X_BIT != 0 {
            let extension = cursor.octet()?;

            if extension & I_BIT != 0 {
                let hi = cursor.octet()?;
                // the one-octet form is legal but WebRTC senders never use it
                ensure!(hi & M_BIT != 0, "one-octet picture id");
                let lo = cursor.octet()?;
                header.picture_id =
                    Some(u16::from_be_bytes([hi & !M_BIT, lo]));
            }

            if extension & L_BIT != 0 {
                header.tl0_pic_idx = Some(cursor.octet()?);
            }

            if extension & (T_BIT | K_BIT) != 0 {
                let tk = cursor.octet()?;
                if extension & T_BIT != 0 {
                    header.temporal_layer_id = Some(tk >> TID_SHIFT);
                    header.layer_sync = tk & Y_BIT != 0;
                }
            }
        }

        // The frame tag only follows in packets that carry the start of
        // partition zero (RFC 7741 section 4.3).
        if required & S_BIT != 0 && required & PID_MASK == 0 {
            let tag = cursor.octet()?;
            header.is_key_frame = tag & P_BIT == 0;
            cursor.skip(FRAME_TAG_SIZE - 1)?;
            if header.is_key_frame {
                cursor.skip(START_CODE_SIZE)?;
                header.resolution = Some(PixelSize {
                    width: (cursor.le_u16()? & SIZE_FIELD_MASK) as usize,
                    height: (cursor.le_u16()? & SIZE_FIELD_MASK) as usize,
                });
            }
        }

        Ok(header)
    }
}

/// Rewrite the picture id and TL0 index of a descriptor in place. The
/// descriptor must carry both fields with the two-octet picture id form;
/// payloads that parsed successfully with both fields present do.
pub fn modify_header(
    payload: &mut [u8],
    picture_id: TruncatedPictureId,
    tl0_pic_idx: TruncatedTl0PicIdx,
) {
    if payload.len() < 2 || payload[0] & X_BIT == 0 {
        return;
    }
    let extension = payload[1];
    let mut at = 2;
    if extension & I_BIT != 0 && payload.len() >= at + 2 {
        let id = (picture_id | (M_BIT as u16) << 8).to_be_bytes();
        payload[at] = id[0];
        payload[at + 1] = id[1];
        at += 2;
    }
    if extension & L_BIT != 0 && payload.len() > at {
        payload[at] = tl0_pic_idx;
    }
}

/// Octet length of the descriptor written by [`write_min_header`].
pub const MIN_HEADER_SIZE: usize = 5;

/// Write the smallest descriptor carrying a picture id and TL0 index, for
/// locally generated frames such as padding at a frame boundary.
pub fn write_min_header(
    out: &mut [u8],
    picture_id: TruncatedPictureId,
    tl0_pic_idx: TruncatedTl0PicIdx,
    starts_partition: bool,
) -> usize {
    let mut required = X_BIT;
    if starts_partition {
        required |= S_BIT;
    }
    out[0] = required;
    out[1] = I_BIT | L_BIT;
    let id = (picture_id | (M_BIT as u16) << 8).to_be_bytes();
    out[2] = id[0];
    out[3] = id[1];
    out[4] = tl0_pic_idx;
    MIN_HEADER_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(picture_id: u16, tl0: u8, tid: u8, layer_sync: bool) -> Vec<u8> {
        let mut tk = tid << TID_SHIFT;
        if layer_sync {
            tk |= Y_BIT;
        }
        let pid = (picture_id | 0x8000).to_be_bytes();
        vec![X_BIT, I_BIT | L_BIT | T_BIT, pid[0], pid[1], tl0, tk]
    }

    #[test]
    fn parse_descriptor() {
        let payload = descriptor(1234, 56, 2, true);
        let header = ParsedHeader::read(&payload).unwrap();
        assert_eq!(header.picture_id, Some(1234));
        assert_eq!(header.tl0_pic_idx, Some(56));
        assert_eq!(header.temporal_layer_id, Some(2));
        assert!(header.layer_sync);
        assert!(!header.is_key_frame);
        assert_eq!(header.resolution, None);
    }

    #[test]
    fn parse_key_frame_with_resolution() {
        let mut payload = descriptor(7, 1, 0, false);
        payload[0] |= S_BIT;
        // frame tag with P = 0, then start code and 640x480 in 14-bit fields
        payload.extend_from_slice(&[0x00, 0x00, 0x00]);
        payload.extend_from_slice(&[0x9d, 0x01, 0x2a]);
        payload.extend_from_slice(&640u16.to_le_bytes());
        payload.extend_from_slice(&480u16.to_le_bytes());

        let header = ParsedHeader::read(&payload).unwrap();
        assert!(header.is_key_frame);
        assert_eq!(
            header.resolution,
            Some(PixelSize {
                width: 640,
                height: 480
            })
        );
    }

    #[test]
    fn rejects_one_octet_picture_id() {
        // I bit set but the M bit of the picture id field is zero
        let payload = vec![X_BIT, I_BIT, 0x12, 0x34];
        assert!(ParsedHeader::read(&payload).is_err());
    }

    #[test]
    fn rejects_truncated_payload() {
        let payload = descriptor(1234, 56, 2, false);
        assert!(ParsedHeader::read(&payload[..3]).is_err());
    }

    #[test]
    fn modify_header_rewrites_in_place() {
        let mut payload = descriptor(1234, 56, 0, false);
        modify_header(&mut payload, 4321, 78);
        let header = ParsedHeader::read(&payload).unwrap();
        assert_eq!(header.picture_id, Some(4321));
        assert_eq!(header.tl0_pic_idx, Some(78));
        // untouched fields survive the rewrite
        assert_eq!(header.temporal_layer_id, Some(0));
    }

    #[test]
    fn min_header_parses_back() {
        let mut out = [0u8; MIN_HEADER_SIZE];
        let n = write_min_header(&mut out, 777, 3, false);
        assert_eq!(n, MIN_HEADER_SIZE);
        let header = ParsedHeader::read(&out).unwrap();
        assert_eq!(header.picture_id, Some(777));
        assert_eq!(header.tl0_pic_idx, Some(3));
        assert!(!header.is_key_frame);
    }
}
