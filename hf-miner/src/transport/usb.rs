//! USB bulk transport to the GN interface controller.
//!
//! The controller exposes one interface with a bulk IN/OUT endpoint pair
//! carrying the serial frame stream. IN transfers stay queued on the endpoint
//! between receives; a receive waits a short timeout for the oldest one to
//! complete so the session can poll without blocking, and a timeout leaves
//! the transfer in flight for the next call.

use nusb::transfer::{Direction, EndpointType, Queue, RequestBuffer};
use nusb::{Device, Interface};
use std::time::Duration;

use async_trait::async_trait;

use super::{Transport, TransportError};
use crate::config::UsbConfig;
use crate::tracing::prelude::*;

/// Full-speed bulk packet size used by the controller.
pub const MAX_PACKET_SIZE: usize = 64;

/// Longest a receive waits for traffic before reporting none.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_millis(10);

/// IN transfers kept submitted on the endpoint.
const IN_FLIGHT_TRANSFERS: usize = 2;

/// Endpoints found on the device.
#[derive(Debug, Clone, Copy)]
struct BulkEndpoints {
    interface: u8,
    alt_setting: u8,
    in_address: u8,
    out_address: u8,
    in_packet_size: usize,
    out_packet_size: usize,
}

/// Bulk-endpoint [`Transport`] on top of `nusb`.
pub struct UsbBulkTransport {
    config: UsbConfig,
    device: Option<Device>,
    interface: Option<Interface>,
    endpoints: Option<BulkEndpoints>,
    in_queue: Option<Queue<RequestBuffer>>,
}

impl std::fmt::Debug for UsbBulkTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbBulkTransport")
            .field("config", &self.config)
            .field("open", &self.interface.is_some())
            .field("endpoints", &self.endpoints)
            .field(
                "in_flight",
                &self.in_queue.as_ref().map_or(0, Queue::pending),
            )
            .finish()
    }
}

impl UsbBulkTransport {
    /// Transport for the device named in `config`; nothing is opened until
    /// [`Transport::init`].
    pub fn new(config: UsbConfig) -> Self {
        Self {
            config,
            device: None,
            interface: None,
            endpoints: None,
            in_queue: None,
        }
    }

    fn open(&mut self) -> Result<(), TransportError> {
        let UsbConfig { vid, pid, .. } = self.config;

        let info = nusb::list_devices()
            .map_err(usb_error)?
            .find(|dev| dev.vendor_id() == vid && dev.product_id() == pid)
            .ok_or(TransportError::DeviceNotFound { vid, pid })?;

        info!(
            vid = format!("{:04x}", vid),
            pid = format!("{:04x}", pid),
            bus = info.bus_number(),
            address = info.device_address(),
            serial = info.serial_number().unwrap_or("unknown"),
            "Opening USB device"
        );

        let device = info.open().map_err(usb_error)?;
        let endpoints = find_bulk_endpoints(&device)?;

        let interface = device
            .claim_interface(endpoints.interface)
            .map_err(usb_error)?;
        if endpoints.alt_setting != 0 {
            interface
                .set_alt_setting(endpoints.alt_setting)
                .map_err(usb_error)?;
        }

        debug!(
            interface = endpoints.interface,
            alt_setting = endpoints.alt_setting,
            ep_in = format!("0x{:02x}", endpoints.in_address),
            ep_out = format!("0x{:02x}", endpoints.out_address),
            "Claimed bulk interface"
        );

        self.in_queue = Some(interface.bulk_in_queue(endpoints.in_address));
        self.device = Some(device);
        self.interface = Some(interface);
        self.endpoints = Some(endpoints);
        Ok(())
    }

    fn open_interface(&self) -> Result<(&Interface, BulkEndpoints), TransportError> {
        match (&self.interface, self.endpoints) {
            (Some(interface), Some(endpoints)) => Ok((interface, endpoints)),
            _ => Err(TransportError::Closed),
        }
    }
}

fn usb_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::Usb(e.to_string())
}

/// First interface alt setting carrying both a bulk IN and a bulk OUT
/// endpoint.
fn find_bulk_endpoints(device: &Device) -> Result<BulkEndpoints, TransportError> {
    let configuration = device.active_configuration().map_err(usb_error)?;

    for alt in configuration.interface_alt_settings() {
        let bulk = |direction: Direction| {
            alt.endpoints().find(|ep| {
                ep.transfer_type() == EndpointType::Bulk && ep.direction() == direction
            })
        };

        if let (Some(ep_in), Some(ep_out)) = (bulk(Direction::In), bulk(Direction::Out)) {
            return Ok(BulkEndpoints {
                interface: alt.interface_number(),
                alt_setting: alt.alternate_setting(),
                in_address: ep_in.address(),
                out_address: ep_out.address(),
                in_packet_size: ep_in.max_packet_size().min(MAX_PACKET_SIZE),
                out_packet_size: ep_out.max_packet_size().min(MAX_PACKET_SIZE),
            });
        }
    }

    Err(TransportError::NoBulkInterface)
}

#[async_trait]
impl Transport for UsbBulkTransport {
    async fn init(&mut self) -> Result<(), TransportError> {
        if self.interface.is_none() {
            self.open()?;
        }
        Ok(())
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        let (interface, endpoints) = self.open_interface()?;

        let completion = interface
            .bulk_out(endpoints.out_address, bytes.to_vec())
            .await;
        let response = completion.into_result().map_err(usb_error)?;

        Ok(response.actual_length())
    }

    async fn receive(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let timeout = self.config.receive_timeout;
        let queue = self.in_queue.as_mut().ok_or(TransportError::Closed)?;

        while queue.pending() < IN_FLIGHT_TRANSFERS {
            queue.submit(RequestBuffer::new(max_len));
        }

        // next_complete is cancel-safe: on timeout the transfer stays queued
        // and its data is returned by a later call.
        match tokio::time::timeout(timeout, queue.next_complete()).await {
            Ok(completion) => completion.into_result().map_err(usb_error),
            Err(_) => Ok(Vec::new()),
        }
    }

    fn max_send_size(&self) -> usize {
        self.endpoints
            .map_or(MAX_PACKET_SIZE, |endpoints| endpoints.out_packet_size)
    }

    fn max_receive_size(&self) -> usize {
        self.endpoints
            .map_or(MAX_PACKET_SIZE, |endpoints| endpoints.in_packet_size)
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        if let Some(mut queue) = self.in_queue.take() {
            queue.cancel_all();
        }
        if self.interface.take().is_some() {
            debug!("Released USB interface");
        }
        self.endpoints = None;
        self.device = None;
        Ok(())
    }
}
