//! Error types for GN protocol operations

use thiserror::Error;

/// A byte run that cannot be a frame: wrong marker, CRC or length.
///
/// The stream parser recovers from these by emitting garbage and
/// resynchronizing; they only surface from direct calls to
/// [`Frame::decode`](super::protocol::Frame::decode).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("frame too short: {len} bytes")]
    TooShort { len: usize },

    #[error("bad frame marker: 0x{0:02x}")]
    BadMarker(u8),

    #[error("header CRC mismatch: computed 0x{computed:02x}, received 0x{received:02x}")]
    CrcMismatch { computed: u8, received: u8 },

    #[error("frame length {actual} does not match header ({expected} bytes)")]
    LengthMismatch { expected: usize, actual: usize },
}

/// A well-formed frame whose content makes no sense for its opcode.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("nonce report payload of {0} bytes is not a multiple of 8")]
    NoncePayloadLength(usize),

    #[error("status payload too short: {0} bytes")]
    StatusPayloadTooShort(usize),

    #[error("init acknowledgement payload too short: {0} bytes")]
    InitPayloadTooShort(usize),

    #[error("notice message is not NUL-terminated")]
    UnterminatedNotice,

    #[error("core map of {bytes} bytes cannot describe {dies} dies of {cores} cores")]
    CoreMapTooShort { bytes: usize, dies: u8, cores: u8 },

    #[error("status report for die {die}, but only {dies} dies are present")]
    UnknownDie { die: u8, dies: usize },
}

/// Caller-supplied values rejected before any bytes are produced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unknown opcode: 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("payload of {0} bytes is not a multiple of 4")]
    UnalignedPayload(usize),

    #[error("payload of {0} bytes exceeds 1020 bytes")]
    PayloadTooLong(usize),

    #[error("hash job must be 60 bytes, got {0}")]
    HashJobLength(usize),
}
