//! The hash-rate test session.
//!
//! A [`Session`] owns the transport, the stream parser and the scheduler, and
//! advances one polling cycle per [`Session::one_cycle`] call:
//!
//! - **Starting**: send OP_USB_INIT every retry interval until the controller
//!   answers, then size the scheduler from the reply.
//! - **Running**: drain parsed tokens (grading nonces, reconciling status
//!   reports), then refill every free core slot with a random test job.
//! - **Terminated**: entered on thermal cutoff, cancellation or any fault,
//!   after a best-effort OP_USB_SHUTDOWN. Nothing more is sent until
//!   [`Session::reset`].

use bytes::BytesMut;
use rand::{rngs::StdRng, SeedableRng};
use std::fmt;
use tokio::time::Instant;
use tokio_util::codec::Encoder;

use crate::asic::gn::{
    Frame, FrameCodec, InitAck, InitFlags, NonceReport, StatusReport, StreamParser, Token,
    WorkProtocol,
};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::pow::{self, TestJob};
use crate::scheduler::{Scheduler, SlotKind};
use crate::tracing::prelude::*;
use crate::transport::{receive_available, send_message, Transport};
use crate::types::{nominal_hash_rate, HashRate};

/// A hash frame is preceded by a receive poll when its index within the
/// die's batch is a multiple of this.
const RECEIVE_POLL_INTERVAL: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Terminated,
}

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    ThermalCutoff { die: u8 },
    InitFailed { status: u8 },
    Cancelled,
    Fault(String),
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ThermalCutoff { die } => write!(f, "thermal cutoff on die {}", die),
            Self::InitFailed { status } => {
                write!(f, "initialization failed with status {}", status)
            }
            Self::Cancelled => f.write_str("cancelled"),
            Self::Fault(message) => write!(f, "fault: {}", message),
        }
    }
}

impl From<Error> for TerminationReason {
    fn from(error: Error) -> Self {
        match error {
            Error::ThermalFault { die } => Self::ThermalCutoff { die },
            Error::InitFailed { status } => Self::InitFailed { status },
            other => Self::Fault(other.to_string()),
        }
    }
}

/// Result of one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Continue,
    Terminated(TerminationReason),
}

/// Running totals since the session (re)started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStats {
    /// Hashes implied by good nonces: 2^difficulty each
    pub total_hashes: u64,
    pub good_nonces: u64,
    pub bad_nonces: u64,
    pub unknown_sequences: u64,
    /// Bad nonces plus unknown sequences
    pub total_errors: u64,
    /// Average since the first good nonce
    pub hash_rate: HashRate,
    pub init_attempts: u32,
    pub hash_frames_sent: u64,
    pub garbage_bytes: u64,
}

pub struct Session<T: Transport> {
    transport: T,
    transport_ready: bool,
    config: SessionConfig,
    state: SessionState,
    parser: StreamParser,
    codec: FrameCodec,
    scheduler: Scheduler,
    rng: StdRng,
    stats: SessionStats,
    device: Option<InitAck>,
    last_init_sent: Option<Instant>,
    hash_rate_start: Option<Instant>,
    last_report: Option<Instant>,
    termination: Option<TerminationReason>,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self::with_rng(transport, config, StdRng::from_entropy())
    }

    /// Session drawing test jobs and slot order from `rng`.
    pub fn with_rng(transport: T, config: SessionConfig, rng: StdRng) -> Self {
        Self {
            transport,
            transport_ready: false,
            config,
            state: SessionState::Starting,
            parser: StreamParser::new(),
            codec: FrameCodec,
            scheduler: Scheduler::default(),
            rng,
            stats: SessionStats::default(),
            device: None,
            last_init_sent: None,
            hash_rate_start: None,
            last_report: None,
            termination: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The controller's handshake reply, once received.
    pub fn device(&self) -> Option<&InitAck> {
        self.device.as_ref()
    }

    pub fn termination(&self) -> Option<&TerminationReason> {
        self.termination.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Active slots withheld from the next cycles.
    pub fn set_throttle(&mut self, throttle: usize) {
        self.config.throttle = throttle;
    }

    /// Run one polling cycle.
    ///
    /// Any error ends the session through [`terminate`](Self::terminate);
    /// once terminated, cycles only report the stored reason.
    pub async fn one_cycle(&mut self) -> CycleOutcome {
        if let Some(reason) = &self.termination {
            return CycleOutcome::Terminated(reason.clone());
        }

        match self.cycle().await {
            Ok(()) => CycleOutcome::Continue,
            Err(e) => {
                let reason = TerminationReason::from(e);
                self.terminate(reason.clone()).await;
                CycleOutcome::Terminated(reason)
            }
        }
    }

    /// Stop the session: best-effort OP_USB_SHUTDOWN, release the transport
    /// and refuse further work. Only the first reason is kept.
    pub async fn terminate(&mut self, reason: TerminationReason) {
        if self.termination.is_some() {
            return;
        }

        match &reason {
            TerminationReason::Cancelled => info!("Session cancelled"),
            other => error!(reason = %other, "Session terminated"),
        }

        if self.transport_ready {
            match self.send_frame(Frame::usb_shutdown()).await {
                Ok(()) => info!("Sent OP_USB_SHUTDOWN"),
                Err(e) => debug!(error = %e, "OP_USB_SHUTDOWN not delivered"),
            }
            if let Err(e) = self.transport.shutdown().await {
                debug!(error = %e, "Transport shutdown failed");
            }
            self.transport_ready = false;
        }

        self.state = SessionState::Terminated;
        self.termination = Some(reason);
    }

    /// Discard all device, scheduler and statistics state and go back to
    /// [`SessionState::Starting`]. The transport is re-initialized on the
    /// next cycle if it was shut down.
    pub fn reset(&mut self) {
        info!("Session reset");
        self.state = SessionState::Starting;
        self.parser.reset();
        self.scheduler = Scheduler::default();
        self.stats = SessionStats::default();
        self.device = None;
        self.last_init_sent = None;
        self.hash_rate_start = None;
        self.last_report = None;
        self.termination = None;
    }

    async fn cycle(&mut self) -> Result<()> {
        if !self.transport_ready {
            self.transport.init().await?;
            self.transport_ready = true;
        }

        self.poll().await?;

        match self.state {
            SessionState::Starting => self.handshake().await,
            SessionState::Running => self.run().await,
            SessionState::Terminated => Ok(()),
        }
    }

    /// Feed whatever the device has sent into the parser.
    async fn poll(&mut self) -> Result<()> {
        let bytes = receive_available(&mut self.transport).await?;
        if !bytes.is_empty() {
            self.parser.feed(&bytes)?;
        }
        Ok(())
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        let mut buf = BytesMut::with_capacity(frame.wire_len());
        self.codec.encode(frame, &mut buf)?;
        send_message(&mut self.transport, &buf).await?;
        Ok(())
    }

    async fn handshake(&mut self) -> Result<()> {
        let now = Instant::now();
        let due = self
            .last_init_sent
            .map_or(true, |sent| now.duration_since(sent) >= self.config.init_retry);

        if due {
            let init = Frame::usb_init(
                WorkProtocol::UsbMappedSerial,
                InitFlags::SHED_SUPPORTED,
                self.config.clockrate,
            );
            self.send_frame(init).await?;
            self.stats.init_attempts += 1;
            self.last_init_sent = Some(now);
            info!(
                attempt = self.stats.init_attempts,
                clockrate = self.config.clockrate,
                "Sent OP_USB_INIT"
            );
        }

        while let Some(token) = self.parser.take_token() {
            match token {
                Ok(Token::InitAck(ack)) => return self.complete_handshake(ack).await,
                Ok(other) => debug!(token = ?other, "Ignoring token before handshake"),
                Err(e) => warn!(error = %e, "Dropping malformed frame"),
            }
        }

        Ok(())
    }

    async fn complete_handshake(&mut self, ack: InitAck) -> Result<()> {
        self.send_frame(Frame::fan(self.config.fan_speed)).await?;
        debug!(speed = self.config.fan_speed, "Sent OP_FAN");

        log_init_ack(&ack);

        if ack.base.operation_status != 0 {
            return Err(Error::InitFailed {
                status: ack.base.operation_status,
            });
        }

        self.scheduler = Scheduler::from_init_ack(&ack);
        for die in self.scheduler.dies() {
            info!(
                die = die.index(),
                good_cores = die.good_core_count(),
                cores = die.cores(),
                "Core map"
            );
        }
        info!(
            nominal = %nominal_hash_rate(self.config.clockrate),
            search_difficulty = self.config.search_difficulty,
            "Device ready"
        );

        self.device = Some(ack);
        self.state = SessionState::Running;
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        self.report_hash_rate();

        while let Some(token) = self.parser.take_token() {
            match token {
                Ok(token) => self.handle_token(token)?,
                Err(e) => warn!(error = %e, "Dropping malformed frame"),
            }
        }

        self.issue_work().await
    }

    fn handle_token(&mut self, token: Token) -> Result<()> {
        match token {
            Token::NonceReport(report) => self.handle_nonces(&report),
            Token::StatusReport(status) => return self.handle_status(&status),
            Token::InitAck(_) => info!("Unexpected OP_USB_INIT reply while running"),
            Token::Notice(notice) => warn!(
                code = notice.code,
                extra_data = notice.extra_data,
                message = notice.message.as_deref().unwrap_or(""),
                "OP_USB_NOTICE"
            ),
            Token::Generic(frame) => match frame.opcode() {
                Some(_) => info!(opcode = frame.opcode_name(), "Unhandled frame"),
                None => warn!(
                    opcode = format!("0x{:02x}", frame.opcode_byte()),
                    "Frame with unknown opcode"
                ),
            },
            Token::Garbage(bytes) => {
                self.stats.garbage_bytes += bytes.len() as u64;
                warn!(bytes = bytes.len(), "Garbage");
            }
        }
        Ok(())
    }

    fn handle_nonces(&mut self, report: &NonceReport) {
        let die = report.die;

        for candidate in &report.nonces {
            let record = self
                .scheduler
                .die(die)
                .ok()
                .and_then(|state| state.lookup(candidate.sequence));

            let Some(record) = record else {
                self.stats.unknown_sequences += 1;
                self.stats.total_errors += 1;
                warn!(
                    die,
                    sequence = candidate.sequence,
                    nonce = format!("0x{:08x}", candidate.nonce),
                    "Unknown sequence"
                );
                continue;
            };

            let (zero_bits, _digest) = pow::verify(&record.job, candidate.nonce);
            if pow::is_good(zero_bits, record.search_difficulty) {
                let now = Instant::now();
                let start = *self.hash_rate_start.get_or_insert(now);
                self.last_report.get_or_insert(now);

                let hashes = 1u64
                    .checked_shl(u32::from(record.search_difficulty))
                    .unwrap_or(u64::MAX);
                self.stats.good_nonces += 1;
                self.stats.total_hashes = self.stats.total_hashes.saturating_add(hashes);
                self.stats.hash_rate =
                    HashRate::from_hashes(self.stats.total_hashes, now.duration_since(start));

                info!(
                    die,
                    core = record.core,
                    sequence = candidate.sequence,
                    nonce = format!("0x{:08x}", candidate.nonce),
                    zero_bits,
                    "Good nonce"
                );
            } else {
                self.stats.bad_nonces += 1;
                self.stats.total_errors += 1;
                warn!(
                    die,
                    core = record.core,
                    sequence = candidate.sequence,
                    nonce = format!("0x{:08x}", candidate.nonce),
                    zero_bits,
                    "Bad nonce"
                );
            }
        }
    }

    fn handle_status(&mut self, status: &StatusReport) -> Result<()> {
        // A cutoff stops the session whichever die it names.
        if status.thermal_cutoff && self.scheduler.die(status.die).is_err() {
            return Err(Error::ThermalFault { die: status.die });
        }

        let die = match self.scheduler.die_mut(status.die) {
            Ok(die) => die,
            Err(e) => {
                warn!(error = %e, "Dropping status report");
                return Ok(());
            }
        };

        die.apply_status(status, &mut self.rng)?;

        info!(
            die = status.die,
            last_sequence = status.last_sequence,
            temperature = format!("{:.1}", status.monitor.die_temperature),
            throttle = self.config.throttle,
            "Die status"
        );
        Ok(())
    }

    /// Refill free slots: the active slots of every die first, then the
    /// pending slots of every die. Throttling skips the pending pass.
    async fn issue_work(&mut self) -> Result<()> {
        let throttle = self.config.throttle;
        let dies = self.scheduler.dies().len();

        for index in 0..dies {
            let cores = self.scheduler.dies_mut()[index].take_active(throttle);
            self.issue_batch(index, SlotKind::Active, cores).await?;
        }

        for index in 0..dies {
            let cores = self.scheduler.dies_mut()[index].take_pending();
            if throttle > 0 {
                if !cores.is_empty() {
                    debug!(die = index, withheld = cores.len(), "Throttled pending slots");
                }
                continue;
            }
            self.issue_batch(index, SlotKind::Pending, cores).await?;
        }

        Ok(())
    }

    /// Send one job per core to die `index`, polling receive before every
    /// tenth frame of the batch.
    async fn issue_batch(&mut self, index: usize, kind: SlotKind, cores: Vec<u8>) -> Result<()> {
        let difficulty = self.config.search_difficulty;

        for (n, core) in cores.into_iter().enumerate() {
            if n % RECEIVE_POLL_INTERVAL == 0 {
                self.poll().await?;
            }

            let job = TestJob::random(&mut self.rng);
            let issued =
                self.scheduler.dies_mut()[index].issue(core, job, difficulty, Instant::now());
            if let Some(old) = issued.evicted {
                debug!(
                    die = index,
                    core = old.core,
                    sequence = old.sequence,
                    "Dropped record of superseded work"
                );
            }

            trace!(
                die = index,
                core,
                sequence = issued.sequence,
                pending = kind == SlotKind::Pending,
                "Issuing job"
            );
            self.send_frame(issued.frame).await?;
            self.stats.hash_frames_sent += 1;
        }

        Ok(())
    }

    fn report_hash_rate(&mut self) {
        let Some(last) = self.last_report else {
            return;
        };

        let now = Instant::now();
        if now.duration_since(last) > self.config.report_interval {
            info!(
                hash_rate = %self.stats.hash_rate,
                total_hashes = self.stats.total_hashes,
                total_errors = self.stats.total_errors,
                "Average hash rate"
            );
            self.last_report = Some(now);
        }
    }
}

fn log_init_ack(ack: &InitAck) {
    if ack.is_gn_asic() {
        info!(
            dies = ack.dies,
            cores_per_die = ack.cores_per_die,
            reference_clock_mhz = ack.reference_clock_mhz,
            "HashFast GN ASIC answered OP_USB_INIT"
        );
    } else {
        warn!(
            device_id = ack.device_id,
            dies = ack.dies,
            cores_per_die = ack.cores_per_die,
            "Unexpected device id in OP_USB_INIT reply"
        );
    }

    let base = &ack.base;
    info!(
        firmware_rev = base.firmware_rev,
        hardware_rev = base.hardware_rev,
        serial_number = format!("{:08x}", base.serial_number),
        operation_status = base.operation_status,
        extra_status_1 = base.extra_status_1,
        sequence_modulus = base.sequence_modulus,
        hash_clockrate = base.hash_clockrate,
        inflight_target = base.inflight_target,
        "USB init base"
    );

    let config = &ack.config;
    debug!(
        status_period_ms = config.status_period_ms,
        enable_periodic_status = config.enable_periodic_status,
        send_status_on_core_idle = config.send_status_on_core_idle,
        send_status_on_pending_empty = config.send_status_on_pending_empty,
        pwm_active_level = config.pwm_active_level,
        forward_all_privileged_packets = config.forward_all_privileged_packets,
        status_batch_delay = config.status_batch_delay,
        watchdog_secs = config.watchdog_secs,
        disable_sensors = config.disable_sensors,
        rx_header_timeout = config.rx_header_timeout,
        rx_ignore_header_crc = config.rx_ignore_header_crc,
        rx_data_timeout = config.rx_data_timeout,
        rx_ignore_data_crc = config.rx_ignore_data_crc,
        stats_interval = config.stats_interval,
        stat_diagnostic = config.stat_diagnostic,
        measure_interval_ms = config.measure_interval_ms,
        "Die configuration"
    );
    debug!(
        one_usec = config.one_usec,
        max_nonces_per_frame = config.max_nonces_per_frame,
        voltage_sample_points = config.voltage_sample_points,
        pwm_phases = config.pwm_phases,
        trim = config.trim,
        clock_diagnostic = config.clock_diagnostic,
        forward_all_packets = config.forward_all_packets,
        pwm_period = config.pwm_period,
        pwm_pulse_period = config.pwm_pulse_period,
        core_map_bytes = ack.core_map.len(),
        "Die configuration, continued"
    );
}
