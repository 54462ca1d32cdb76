//! Incremental recovery of frames from the device byte stream.
//!
//! USB bulk reads split and join frames arbitrarily and the link may carry
//! noise, so the parser consumes bytes one at a time and keeps only the frame
//! in progress. Anything that fails to synchronize on the marker and header
//! CRC comes out as a [`Token::Garbage`] run; the next marker starts over.

use std::collections::VecDeque;
use thiserror::Error;

use super::crc::crc8;
use super::error::ProtocolError;
use super::protocol::{Frame, HexBytes, Token, FRAME_MARKER, HEADER_LEN};
use crate::tracing::prelude::*;

/// Where the parser is within the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// Collecting garbage until the next marker
    OutOfSync,
    /// Marker seen, collecting the rest of the 8-byte header
    ParsingHeader,
    /// Header valid, collecting the declared payload
    ParsingData,
    /// A frame just completed; the next byte must be a marker
    NextFrame,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParserError {
    #[error("payload overrun: {received} bytes collected for a {expected}-byte payload")]
    PayloadOverrun { expected: usize, received: usize },
}

/// Byte-at-a-time frame recovery with a FIFO of parsed tokens.
///
/// Frames with a valid header but nonsensical content are queued as
/// `Err(ProtocolError)` in their stream position so the caller can drop that
/// one frame and carry on.
#[derive(Debug)]
pub struct StreamParser {
    state: ParserState,
    garbage: Vec<u8>,
    frame: Vec<u8>,
    data_len: usize,
    tokens: VecDeque<Result<Token, ProtocolError>>,
    typed: bool,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    pub fn new() -> Self {
        Self {
            state: ParserState::OutOfSync,
            garbage: Vec::new(),
            frame: Vec::with_capacity(HEADER_LEN),
            data_len: 0,
            tokens: VecDeque::new(),
            typed: true,
        }
    }

    /// Parser for host-to-device traffic. Requests reuse the reply opcodes
    /// with different payloads, so every frame is queued as
    /// [`Token::Generic`].
    pub fn host_side() -> Self {
        Self {
            typed: false,
            ..Self::new()
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Consume a chunk of the stream, queueing every token it completes.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), ParserError> {
        for &byte in bytes {
            self.push(byte)?;
        }
        Ok(())
    }

    pub fn has_token(&self) -> bool {
        !self.tokens.is_empty()
    }

    /// Oldest queued token, if any.
    pub fn take_token(&mut self) -> Option<Result<Token, ProtocolError>> {
        self.tokens.pop_front()
    }

    /// Take queued tokens in order until the queue is empty.
    pub fn drain_tokens(&mut self) -> impl Iterator<Item = Result<Token, ProtocolError>> + '_ {
        std::iter::from_fn(move || self.take_token())
    }

    /// Bytes held as garbage that no marker has flushed yet.
    pub fn pending_garbage(&self) -> &[u8] {
        &self.garbage
    }

    /// Queue any held garbage, e.g. at the end of a capture. A partial frame
    /// in progress is queued as garbage too.
    pub fn flush(&mut self) {
        if matches!(
            self.state,
            ParserState::ParsingHeader | ParserState::ParsingData
        ) {
            self.garbage.append(&mut self.frame);
        }
        self.flush_garbage();
        self.state = ParserState::OutOfSync;
    }

    /// Drop all state and queued tokens.
    pub fn reset(&mut self) {
        *self = Self {
            typed: self.typed,
            ..Self::new()
        };
    }

    fn push(&mut self, byte: u8) -> Result<(), ParserError> {
        match self.state {
            ParserState::OutOfSync => {
                if byte == FRAME_MARKER {
                    self.flush_garbage();
                    self.start_frame();
                } else {
                    self.garbage.push(byte);
                }
            }
            ParserState::ParsingHeader => {
                if self.frame.len() < HEADER_LEN - 1 {
                    self.frame.push(byte);
                } else if byte == crc8(&self.frame[1..]) {
                    self.frame.push(byte);
                    self.data_len = 4 * self.frame[6] as usize;
                    if self.data_len == 0 {
                        self.complete_frame();
                    } else {
                        self.state = ParserState::ParsingData;
                    }
                } else {
                    // Bad header: the bytes join the garbage run, which is
                    // flushed by the next marker.
                    trace!(header = %HexBytes(&self.frame), crc = byte, "GN header CRC mismatch");
                    self.garbage.append(&mut self.frame);
                    self.garbage.push(byte);
                    self.state = ParserState::OutOfSync;
                }
            }
            ParserState::ParsingData => {
                self.frame.push(byte);
                let received = self.frame.len() - HEADER_LEN;
                if received == self.data_len {
                    self.complete_frame();
                } else if received > self.data_len {
                    return Err(ParserError::PayloadOverrun {
                        expected: self.data_len,
                        received,
                    });
                }
            }
            ParserState::NextFrame => {
                if byte == FRAME_MARKER {
                    self.start_frame();
                } else {
                    self.garbage.push(byte);
                    self.state = ParserState::OutOfSync;
                }
            }
        }
        Ok(())
    }

    fn start_frame(&mut self) {
        self.frame.clear();
        self.frame.push(FRAME_MARKER);
        self.data_len = 0;
        self.state = ParserState::ParsingHeader;
    }

    fn complete_frame(&mut self) {
        let bytes = std::mem::take(&mut self.frame);
        self.state = ParserState::NextFrame;

        match Frame::decode(&bytes) {
            Ok(frame) => {
                trace!(frame = %frame, raw = %HexBytes(&bytes), "RX GN");
                let token = if self.typed {
                    Token::try_from(frame)
                } else {
                    Ok(Token::Generic(frame))
                };
                self.tokens.push_back(token);
            }
            Err(e) => {
                // Header CRC and length were checked while collecting.
                warn!(error = %e, "Collected frame failed to decode");
                self.tokens.push_back(Ok(Token::Garbage(bytes)));
            }
        }
    }

    fn flush_garbage(&mut self) {
        if !self.garbage.is_empty() {
            let garbage = std::mem::take(&mut self.garbage);
            self.tokens.push_back(Ok(Token::Garbage(garbage)));
        }
    }
}
