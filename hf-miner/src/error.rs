//! Crate-wide error type.

use crate::asic::gn::{FramingError, ParserError, ProtocolError, ValidationError};
use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("invalid frame field: {0}")]
    Validation(#[from] ValidationError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream parser failure: {0}")]
    Parser(#[from] ParserError),

    /// A die reported over-temperature cutoff.
    #[error("thermal cutoff on die {die}")]
    ThermalFault { die: u8 },

    /// The controller rejected OP_USB_INIT.
    #[error("device initialization failed with operation status {status}")]
    InitFailed { status: u8 },
}

pub type Result<T> = std::result::Result<T, Error>;
