//! Daemon lifecycle management for hf-miner.
//!
//! This module opens the device, drives the test session in a background
//! task, and handles signals and graceful shutdown.

use tokio::signal::unix::{self, SignalKind};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::tracing::prelude::*;
use crate::{
    config::{SessionConfig, UsbConfig},
    session::{CycleOutcome, Session, TerminationReason},
    transport::{Transport, UsbBulkTransport},
};

/// The main daemon.
pub struct Daemon {
    session_config: SessionConfig,
    usb_config: UsbConfig,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    pub fn new(session_config: SessionConfig, usb_config: UsbConfig) -> Self {
        Self {
            session_config,
            usb_config,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run until the session terminates or a signal asks us to stop.
    pub async fn run(self) -> anyhow::Result<()> {
        let transport = UsbBulkTransport::new(self.usb_config.clone());
        let mut session = Session::new(transport, self.session_config.clone());

        self.tracker.spawn({
            let shutdown = self.shutdown.clone();
            async move {
                let reason = drive(&mut session, shutdown.clone()).await;
                info!(reason = %reason, "Session finished");
                // Wake the signal wait below when the session stopped itself.
                shutdown.cancel();
            }
        });
        self.tracker.close();

        info!(
            vid = format!("{:04x}", self.usb_config.vid),
            pid = format!("{:04x}", self.usb_config.pid),
            clockrate = self.session_config.clockrate,
            search_difficulty = self.session_config.search_difficulty,
            "Started."
        );
        info!("For debugging, set RUST_LOG=hf_miner=debug or trace.");

        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT.");
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM.");
            },
            _ = self.shutdown.cancelled() => {},
        }

        self.shutdown.cancel();
        self.tracker.wait().await;
        info!("Exiting.");

        Ok(())
    }
}

/// Cycle `session` until it terminates or `shutdown` fires, pausing
/// `cycle_delay` between cycles. Cancellation runs the shutdown path.
pub async fn drive<T: Transport>(
    session: &mut Session<T>,
    shutdown: CancellationToken,
) -> TerminationReason {
    let delay = session.config().cycle_delay;

    loop {
        tokio::select! {
            outcome = session.one_cycle() => {
                if let CycleOutcome::Terminated(reason) = outcome {
                    return reason;
                }
            }
            _ = shutdown.cancelled() => break,
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => break,
        }
    }

    session.terminate(TerminationReason::Cancelled).await;
    TerminationReason::Cancelled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asic::gn::{test_data, Frame, Opcode};
    use crate::session::SessionState;
    use crate::transport::mock::MockTransport;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn cancellation_shuts_the_device_down() {
        let shutdown = CancellationToken::new();
        let mut transport = MockTransport::new();
        transport.push_incoming(test_data::INIT_ACK_FRAME);
        let mut session = Session::new(transport, SessionConfig::default());

        let cancel = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.cancel();
        };
        let (reason, ()) = tokio::join!(drive(&mut session, shutdown.clone()), cancel);

        assert_eq!(reason, TerminationReason::Cancelled);
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(session.transport().is_shut_down());
        let last = session.transport().sent_frames().pop().unwrap();
        assert_eq!(last.opcode(), Some(Opcode::UsbShutdown));
    }

    #[tokio::test(start_paused = true)]
    async fn drive_returns_when_session_terminates() {
        let mut transport = MockTransport::new();
        transport.push_incoming(test_data::INIT_ACK_FRAME);
        let thermal = Frame::builder(Opcode::Status)
            .core_address(0x80)
            .data(vec![0; 12])
            .encode()
            .unwrap();
        transport.push_incoming(thermal);
        let mut session = Session::new(transport, SessionConfig::default());

        let reason = drive(&mut session, CancellationToken::new()).await;
        assert_eq!(reason, TerminationReason::ThermalCutoff { die: 0 });
    }
}
