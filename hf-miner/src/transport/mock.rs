//! In-memory transport for tests.

use std::collections::VecDeque;

use async_trait::async_trait;

use super::{Transport, TransportError};
use crate::asic::gn::protocol::HEADER_LEN;
use crate::asic::gn::Frame;

/// Records every packet sent and replays queued device traffic.
#[derive(Debug)]
pub struct MockTransport {
    sent: Vec<Vec<u8>>,
    incoming: VecDeque<Vec<u8>>,
    max_send: usize,
    max_receive: usize,
    send_limit: Option<usize>,
    fail_sends: bool,
    initialized: bool,
    shut_down: bool,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            sent: Vec::new(),
            incoming: VecDeque::new(),
            max_send: 64,
            max_receive: 64,
            send_limit: None,
            fail_sends: false,
            initialized: false,
            shut_down: false,
        }
    }

    /// Accept at most `limit` bytes per send.
    pub fn with_send_limit(mut self, limit: usize) -> Self {
        self.send_limit = Some(limit);
        self
    }

    /// Queue one read's worth of device traffic.
    pub fn push_incoming(&mut self, bytes: impl Into<Vec<u8>>) {
        self.incoming.push_back(bytes.into());
    }

    pub fn set_fail_sends(&mut self, fail: bool) {
        self.fail_sends = fail;
    }

    pub fn sent_packets(&self) -> &[Vec<u8>] {
        &self.sent
    }

    pub fn sent_bytes(&self) -> Vec<u8> {
        self.sent.concat()
    }

    /// Split everything sent so far back into frames.
    pub fn sent_frames(&self) -> Vec<Frame> {
        let bytes = self.sent_bytes();
        let mut frames = Vec::new();
        let mut rest = bytes.as_slice();
        while rest.len() >= HEADER_LEN {
            let len = HEADER_LEN + 4 * usize::from(rest[6]);
            let Some(frame) = rest.get(..len) else {
                break;
            };
            frames.push(Frame::decode(frame).expect("host sent a malformed frame"));
            rest = &rest[len..];
        }
        frames
    }

    /// Reads queued by [`push_incoming`](Self::push_incoming) and not yet
    /// received.
    pub fn pending_incoming(&self) -> usize {
        self.incoming.len()
    }

    pub fn clear_sent(&mut self) {
        self.sent.clear();
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn init(&mut self) -> Result<(), TransportError> {
        self.initialized = true;
        self.shut_down = false;
        Ok(())
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        if self.shut_down {
            return Err(TransportError::Closed);
        }
        if self.fail_sends {
            return Err(TransportError::Usb("injected send failure".into()));
        }

        let len = self.send_limit.map_or(bytes.len(), |limit| bytes.len().min(limit));
        self.sent.push(bytes[..len].to_vec());
        Ok(len)
    }

    async fn receive(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        if self.shut_down {
            return Err(TransportError::Closed);
        }

        let Some(mut bytes) = self.incoming.pop_front() else {
            return Ok(Vec::new());
        };
        if bytes.len() > max_len {
            let rest = bytes.split_off(max_len);
            self.incoming.push_front(rest);
        }
        Ok(bytes)
    }

    fn max_send_size(&self) -> usize {
        self.max_send
    }

    fn max_receive_size(&self) -> usize {
        self.max_receive
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.shut_down = true;
        Ok(())
    }
}
