use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the forwarding engine. Most are benign-drop or
/// transient-retry signals consumed by the translation pipeline; callers only
/// ever see a drop decision or a retryable error, never a panic.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("unknown kind of codec")]
    UnknownKind,

    #[error("padding only packet")]
    PaddingOnlyPacket,

    #[error("duplicate packet")]
    DuplicatePacket,

    #[error("out of order sequence number cache miss")]
    OutOfOrderSequenceNumberCacheMiss,

    #[error("padding cannot start in the middle of a frame")]
    PaddingNotOnFrameBoundary,

    #[error("switch point too far behind")]
    SwitchPointTooFarBehind,

    #[error("no reference timestamp for layer")]
    NoReferenceTimestamp,

    #[error("no expected timestamp")]
    NoExpectedTimestamp,

    #[error("filtered VP8 temporal layer")]
    FilteredTemporalLayer,

    #[error("out of order picture id cache miss")]
    OutOfOrderPictureIdCacheMiss,

    #[error("missing codec header")]
    MissingCodecHeader,

    #[error("output buffer too small")]
    OutputBufferTooSmall,
}
