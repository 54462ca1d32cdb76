//! Byte transport between the host and the USB interface controller.
//!
//! The session only needs a packet pipe: send a buffer, receive whatever has
//! arrived, and the packet size limits of each direction. [`usb`] provides
//! the real bulk-endpoint implementation; tests use [`mock`].

#[cfg(test)]
pub mod mock;
pub mod usb;

pub use usb::UsbBulkTransport;

use async_trait::async_trait;

use crate::tracing::prelude::*;

/// Attempts [`receive_available`] makes before reporting nothing.
pub const RECEIVE_ATTEMPTS: usize = 4;

/// Errors from a transport primitive.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no USB device {vid:04x}:{pid:04x} found")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("device has no interface with bulk IN and OUT endpoints")]
    NoBulkInterface,

    #[error("USB error: {0}")]
    Usb(String),

    #[error("write stalled after {sent} of {expected} bytes")]
    WriteStalled { sent: usize, expected: usize },

    #[error("transport is shut down")]
    Closed,
}

/// Packet-level access to the device.
///
/// `receive` must not block waiting for traffic: when nothing has arrived it
/// returns an empty buffer.
#[async_trait]
pub trait Transport: Send {
    /// Prepare the device for traffic.
    async fn init(&mut self) -> Result<(), TransportError>;

    /// Send one packet of at most [`max_send_size`](Self::max_send_size)
    /// bytes, returning the number of bytes written. An empty buffer is a
    /// zero-length packet.
    async fn send(&mut self, bytes: &[u8]) -> Result<usize, TransportError>;

    /// Receive up to `max_len` bytes; empty when nothing is available.
    async fn receive(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError>;

    fn max_send_size(&self) -> usize;

    fn max_receive_size(&self) -> usize;

    /// Release the device. Further calls fail with [`TransportError::Closed`].
    async fn shutdown(&mut self) -> Result<(), TransportError>;
}

/// Send a message of any length as a sequence of packets.
///
/// A partial send is continued with the unsent remainder. When the last
/// packet is exactly the maximum size a zero-length packet follows, since
/// the device only sees a transfer end on a short packet.
pub async fn send_message<T>(transport: &mut T, bytes: &[u8]) -> Result<(), TransportError>
where
    T: Transport + ?Sized,
{
    let max = transport.max_send_size().max(1);

    for chunk in bytes.chunks(max) {
        let mut sent = 0;
        while sent < chunk.len() {
            let written = transport.send(&chunk[sent..]).await?;
            if written == 0 {
                return Err(TransportError::WriteStalled {
                    sent,
                    expected: chunk.len(),
                });
            }
            if sent + written < chunk.len() {
                trace!(written, remaining = chunk.len() - sent - written, "Partial send");
            }
            sent += written;
        }
    }

    if !bytes.is_empty() && bytes.len() % max == 0 {
        trace!(bytes = bytes.len(), "Sending zero-length packet");
        transport.send(&[]).await?;
    }

    Ok(())
}

/// Receive whatever the device has queued, asking up to
/// [`RECEIVE_ATTEMPTS`] times before giving up with an empty buffer.
pub async fn receive_available<T>(transport: &mut T) -> Result<Vec<u8>, TransportError>
where
    T: Transport + ?Sized,
{
    let max = transport.max_receive_size();
    for _ in 0..RECEIVE_ATTEMPTS {
        let bytes = transport.receive(max).await?;
        if !bytes.is_empty() {
            return Ok(bytes);
        }
    }
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;

    #[tokio::test]
    async fn send_message_chunks_to_max_size() {
        let mut transport = MockTransport::new();
        let message: Vec<u8> = (0..150).map(|i| i as u8).collect();

        send_message(&mut transport, &message).await.unwrap();

        let packets = transport.sent_packets();
        assert_eq!(
            packets.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![64, 64, 22]
        );
        assert_eq!(packets.concat(), message);
    }

    #[tokio::test]
    async fn send_message_terminates_full_packet() {
        let mut transport = MockTransport::new();

        send_message(&mut transport, &[0xaa; 128]).await.unwrap();

        let packets = transport.sent_packets();
        assert_eq!(
            packets.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![64, 64, 0]
        );
    }

    #[tokio::test]
    async fn send_message_short_frame_needs_no_terminator() {
        let mut transport = MockTransport::new();

        send_message(&mut transport, &[0xaa; 8]).await.unwrap();

        assert_eq!(transport.sent_packets().len(), 1);
    }

    #[tokio::test]
    async fn send_message_resends_remainder() {
        let mut transport = MockTransport::new().with_send_limit(32);
        let message: Vec<u8> = (0..100).map(|i| i as u8).collect();

        send_message(&mut transport, &message).await.unwrap();

        let packets = transport.sent_packets();
        assert_eq!(
            packets.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![32, 32, 32, 4]
        );
        assert_eq!(packets.concat(), message);
    }

    #[tokio::test]
    async fn send_message_reports_stalled_write() {
        let mut transport = MockTransport::new().with_send_limit(0);

        let result = send_message(&mut transport, &[0; 20]).await;

        assert!(matches!(
            result,
            Err(TransportError::WriteStalled {
                sent: 0,
                expected: 20
            })
        ));
    }

    #[tokio::test]
    async fn send_message_empty_sends_nothing() {
        let mut transport = MockTransport::new();

        send_message(&mut transport, &[]).await.unwrap();

        assert!(transport.sent_packets().is_empty());
    }

    #[tokio::test]
    async fn receive_available_retries_empty_reads() {
        let mut transport = MockTransport::new();
        transport.push_incoming(Vec::new());
        transport.push_incoming(Vec::new());
        transport.push_incoming(vec![1, 2, 3]);

        assert_eq!(receive_available(&mut transport).await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn receive_available_gives_up() {
        let mut transport = MockTransport::new();
        for _ in 0..RECEIVE_ATTEMPTS {
            transport.push_incoming(Vec::new());
        }
        transport.push_incoming(vec![9]);

        assert!(receive_available(&mut transport).await.unwrap().is_empty());
        assert_eq!(receive_available(&mut transport).await.unwrap(), vec![9]);
    }
}
