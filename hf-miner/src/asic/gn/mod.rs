//! HashFast GN die support.
//!
//! This module provides the wire protocol for GN dies behind the HashFast USB
//! interface controller: frame encoding, typed decoding of device replies, and
//! recovery of frames from the raw byte stream.

pub mod crc;
pub mod error;
pub mod parser;
pub mod protocol;

#[cfg(test)]
pub mod test_data;

// Re-export commonly used types
pub use error::{FramingError, ProtocolError, ValidationError};
pub use parser::{ParserError, ParserState, StreamParser};
pub use protocol::{
    CandidateNonce, Frame, FrameCodec, HashJob, InitAck, InitFlags, MonitorSample, NonceReport,
    Notice, Opcode, StatusReport, Token, WorkProtocol,
};
