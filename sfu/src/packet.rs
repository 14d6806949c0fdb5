use byteorder::{BigEndian, ByteOrder};
use bytes::BytesMut;

pub const RTP_HEADER_LEN: usize = 12;

const MARKER_PT_OFFSET: usize = 1;
const SEQUENCE_OFFSET: usize = 2;
const TIMESTAMP_OFFSET: usize = 4;
const SSRC_OFFSET: usize = 8;

const MARKER_BIT: u8 = 0x80;
const PT_MASK: u8 = 0x7f;
const CC_MASK: u8 = 0x0f;
const PADDING_BIT: u8 = 0x20;
const EXTENSION_BIT: u8 = 0x10;

/// A byte-backed RTP packet. Field accessors read and write the wire format
/// directly, so a packet can be forwarded without a parse/serialize cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RtpPacket {
    inner: BytesMut,
}

impl RtpPacket {
    /// New RTP packet with a v2 header and everything else zeroed.
    pub fn new() -> RtpPacket {
        let mut inner = BytesMut::with_capacity(RTP_HEADER_LEN);
        inner.resize(RTP_HEADER_LEN, 0);
        inner[0] = 0x80;
        RtpPacket { inner }
    }

    // Minimal sanity check on an RTP-like buffer (version bits present)
    pub fn is_valid(buf: &[u8]) -> bool {
        buf.len() >= RTP_HEADER_LEN && buf[0] & 0xc0 == 0x80
    }

    // Wrap an existing RTP buffer without validation
    pub fn from_vec(buf: Vec<u8>) -> Self {
        Self {
            inner: BytesMut::from(buf.as_slice()),
        }
    }

    pub fn ssrc(&self) -> u32 {
        BigEndian::read_u32(&self.inner[SSRC_OFFSET..])
    }

    pub fn set_ssrc(&mut self, ssrc: u32) {
        BigEndian::write_u32(&mut self.inner[SSRC_OFFSET..], ssrc);
    }

    pub fn sequence(&self) -> u16 {
        BigEndian::read_u16(&self.inner[SEQUENCE_OFFSET..])
    }

    pub fn set_sequence(&mut self, seq: u16) {
        BigEndian::write_u16(&mut self.inner[SEQUENCE_OFFSET..], seq);
    }

    pub fn timestamp(&self) -> u32 {
        BigEndian::read_u32(&self.inner[TIMESTAMP_OFFSET..])
    }

    pub fn set_timestamp(&mut self, ts: u32) {
        BigEndian::write_u32(&mut self.inner[TIMESTAMP_OFFSET..], ts);
    }

    pub fn has_marker(&self) -> bool {
        (self.inner[MARKER_PT_OFFSET] >> 7 & 0x1) > 0
    }

    pub fn set_marker(&mut self, m: bool) {
        if m {
            self.inner[MARKER_PT_OFFSET] |= MARKER_BIT;
        } else {
            self.inner[MARKER_PT_OFFSET] &=
                self.inner[MARKER_PT_OFFSET] ^ MARKER_BIT;
        }
    }

    pub fn payload_type(&self) -> u8 {
        self.inner[MARKER_PT_OFFSET] & PT_MASK
    }

    pub fn set_payload_type(&mut self, pt: u8) {
        self.inner[MARKER_PT_OFFSET] &= self.inner[MARKER_PT_OFFSET] ^ PT_MASK;
        self.inner[MARKER_PT_OFFSET] |= pt & PT_MASK;
    }

    pub fn has_padding(&self) -> bool {
        self.inner[0] & PADDING_BIT > 0
    }

    fn csrc_count(&self) -> u8 {
        self.inner[0] & CC_MASK
    }

    fn has_extension(&self) -> bool {
        self.inner[0] & EXTENSION_BIT > 0
    }

    // Byte length of the extension block (0 if no extension)
    fn extension_length(&self) -> usize {
        if !self.has_extension() {
            return 0;
        }
        let offset = self.csrc_count() as usize * 4 + RTP_HEADER_LEN + 2;
        if self.inner.len() < offset + 2 {
            return 0;
        }
        (BigEndian::read_u16(&self.inner[offset..]) as usize + 1) * 4
    }

    // Byte offset where the RTP payload begins (after CSRCs and extensions)
    pub fn payload_offset(&self) -> usize {
        self.csrc_count() as usize * 4 + RTP_HEADER_LEN + self.extension_length()
    }

    pub fn payload(&self) -> &[u8] {
        let offset = self.payload_offset().min(self.inner.len());
        &self.inner[offset..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let offset = self.payload_offset().min(self.inner.len());
        &mut self.inner[offset..]
    }

    // Replace payload, preserving header and extensions
    pub fn set_payload(&mut self, payload: &[u8]) {
        let offset = self.payload_offset().min(self.inner.len());
        self.inner.truncate(offset);
        self.inner.extend_from_slice(payload);
    }

    /// True when the packet carries nothing but padding bytes.
    pub fn is_padding_only(&self) -> bool {
        let payload = self.payload();
        if payload.is_empty() {
            return true;
        }
        self.has_padding() && payload.len() == payload[payload.len() - 1] as usize
    }

    pub fn data(&self) -> &[u8] {
        &self.inner
    }
}

/// Parsed codec payload info carried alongside a packet.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum PayloadInfo {
    #[default]
    None,
    Vp8(codec::vp8::ParsedHeader),
}

/// An incoming RTP packet lifted into the forwarder's extended counter space.
/// The receive pipeline tracks rollovers per source, so the 64-bit sequence
/// number and timestamp here are monotonic for one SSRC.
#[derive(Clone, Debug, Default)]
pub struct ExtPacket {
    pub packet: RtpPacket,
    pub key_frame: bool,
    pub payload: PayloadInfo,
    pub ext_sequence_number: u64,
    pub ext_timestamp: u64,
}

impl ExtPacket {
    /// A placeholder packet carrying only counters, used to seed munger state
    /// before any real packet has been forwarded.
    pub fn placeholder(sequence_number: u16, timestamp: u32) -> Self {
        let mut packet = RtpPacket::new();
        packet.set_sequence(sequence_number);
        packet.set_timestamp(timestamp);
        Self {
            packet,
            key_frame: false,
            payload: PayloadInfo::None,
            ext_sequence_number: sequence_number as u64,
            ext_timestamp: timestamp as u64,
        }
    }
}

/// Lift a truncated rolling counter (sequence number, timestamp, picture
/// id, ...) into 64 bits by choosing the cycle that puts it closest to the
/// highest value seen so far, then advancing that watermark.
pub fn expand_truncated_counter(
    truncated: u64,
    highest_seen: &mut u64,
    width: usize,
) -> u64 {
    let modulus = 1u64 << width;
    let half = modulus >> 1;
    let value = truncated & (modulus - 1);

    let cycle_base = *highest_seen & !(modulus - 1);
    let watermark = *highest_seen & (modulus - 1);

    let expanded = if value < watermark && watermark - value > half {
        // wrapped forward into the next cycle
        cycle_base + modulus + value
    } else if value > watermark && value - watermark > half && cycle_base >= modulus
    {
        // a straggler from the previous cycle
        cycle_base - modulus + value
    } else {
        cycle_base + value
    };

    if expanded > *highest_seen {
        *highest_seen = expanded;
    }
    expanded
}
