//! GN protocol frames and their typed decodings.
//!
//! Every message on the USB-mapped serial link is one frame:
//!
//! ```text
//! byte 0      0xaa marker
//! byte 1      opcode
//! byte 2      chip address (die index, 0xff broadcast)
//! byte 3      core address (core index or opcode-specific flags)
//! bytes 4-5   hdata, little-endian
//! byte 6      payload length / 4
//! byte 7      CRC8 over bytes 1..=6
//! bytes 8..   payload, 0-1020 bytes, multiple of 4
//! ```
//!
//! [`Frame`] covers the generic layout. [`Token`] is the closed set of
//! decodings the session acts upon; opcode-specific payloads are parsed into
//! [`NonceReport`], [`StatusReport`], [`InitAck`] and [`Notice`].

use bitflags::bitflags;
use bytes::{BufMut, BytesMut};
use std::{fmt, io};
use strum::{FromRepr, IntoStaticStr};
use tokio_util::codec::Encoder;

use super::crc::crc8;
use super::error::{FramingError, ProtocolError, ValidationError};
use crate::tracing::prelude::*;

/// First byte of every frame.
pub const FRAME_MARKER: u8 = 0xaa;

/// Marker, six header bytes and the CRC.
pub const HEADER_LEN: usize = 8;

/// Largest payload the one-byte length field can describe.
pub const MAX_DATA_LEN: usize = 1020;

/// Wrapper for formatting byte slices as space-separated hex.
pub struct HexBytes<'a>(pub &'a [u8]);

impl fmt::Display for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Operation codes understood by GN dies and the USB interface controller.
#[derive(FromRepr, IntoStaticStr, Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // Serial protocol, handled by the dies
    #[strum(serialize = "OP_NULL")]
    Null = 0,
    #[strum(serialize = "OP_ROOT")]
    Root = 1,
    #[strum(serialize = "OP_RESET")]
    Reset = 2,
    #[strum(serialize = "OP_PLL_CONFIG")]
    PllConfig = 3,
    #[strum(serialize = "OP_ADDRESS")]
    Address = 4,
    #[strum(serialize = "OP_READDRESS")]
    Readdress = 5,
    #[strum(serialize = "OP_HIGHEST")]
    Highest = 6,
    #[strum(serialize = "OP_BAUD")]
    Baud = 7,
    #[strum(serialize = "OP_UNROOT")]
    Unroot = 8,
    #[strum(serialize = "OP_HASH")]
    Hash = 9,
    #[strum(serialize = "OP_NONCE")]
    Nonce = 10,
    #[strum(serialize = "OP_ABORT")]
    Abort = 11,
    #[strum(serialize = "OP_STATUS")]
    Status = 12,
    #[strum(serialize = "OP_GPIO")]
    Gpio = 13,
    #[strum(serialize = "OP_CONFIG")]
    Config = 14,
    #[strum(serialize = "OP_STATISTICS")]
    Statistics = 15,
    #[strum(serialize = "OP_GROUP")]
    Group = 16,
    #[strum(serialize = "OP_CLOCKGATE")]
    ClockGate = 17,

    // USB interface controller
    #[strum(serialize = "OP_USB_INIT")]
    UsbInit = 128,
    #[strum(serialize = "OP_GET_TRACE")]
    GetTrace = 129,
    #[strum(serialize = "OP_LOOPBACK_USB")]
    LoopbackUsb = 130,
    #[strum(serialize = "OP_LOOPBACK_UART")]
    LoopbackUart = 131,
    #[strum(serialize = "OP_DFU")]
    Dfu = 132,
    #[strum(serialize = "OP_USB_SHUTDOWN")]
    UsbShutdown = 133,
    #[strum(serialize = "OP_DIE_STATUS")]
    DieStatus = 134,
    #[strum(serialize = "OP_GWQ_STATUS")]
    GwqStatus = 135,
    #[strum(serialize = "OP_WORK_RESTART")]
    WorkRestart = 136,
    #[strum(serialize = "OP_USB_STATS1")]
    UsbStats1 = 137,
    #[strum(serialize = "OP_USB_GWQSTATS")]
    UsbGwqStats = 138,
    #[strum(serialize = "OP_USB_NOTICE")]
    UsbNotice = 139,
    #[strum(serialize = "OP_PING")]
    Ping = 140,
    #[strum(serialize = "OP_CORE_MAP")]
    CoreMap = 141,
    #[strum(serialize = "OP_VERSION")]
    Version = 142,
    #[strum(serialize = "OP_FAN")]
    Fan = 143,
    #[strum(serialize = "OP_NAME")]
    Name = 144,
    #[strum(serialize = "OP_USB_DEBUG")]
    UsbDebug = 255,
}

impl Opcode {
    pub fn name(self) -> &'static str {
        self.into()
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Name for a raw opcode byte, including bytes outside the table.
pub fn opcode_name(raw: u8) -> &'static str {
    Opcode::from_repr(raw).map_or("OP_UNKNOWN", Opcode::name)
}

/// Work protocol selected in the low bits of an OP_USB_INIT core address.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkProtocol {
    UsbMappedSerial = 0,
    GlobalWorkQueue = 1,
}

bitflags! {
    /// Option bits of an OP_USB_INIT core address, above the protocol field.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InitFlags: u8 {
        const OVERRIDE_CONFIG = 0x08;
        const PLL_BYPASS = 0x10;
        const NO_AUTO_INIT = 0x20;
        const AT_SPEED_CORE_TEST = 0x40;
        /// Without this the controller disables core 95 in GWQ mode, hiding
        /// it from the working core map.
        const SHED_SUPPORTED = 0x80;
    }
}

/// One wire frame. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    opcode: u8,
    chip_address: u8,
    core_address: u8,
    hdata: u16,
    data: Vec<u8>,
    crc8: u8,
}

impl Frame {
    /// Start building an outbound frame. All other fields default to zero or
    /// empty.
    pub fn builder(opcode: Opcode) -> FrameBuilder {
        FrameBuilder {
            opcode: opcode as u8,
            chip_address: 0,
            core_address: 0,
            hdata: 0,
            data: Vec::new(),
        }
    }

    /// Start building from a raw opcode byte; [`FrameBuilder::build`] rejects
    /// bytes outside the opcode table.
    pub fn builder_raw(opcode: u8) -> FrameBuilder {
        FrameBuilder {
            opcode,
            chip_address: 0,
            core_address: 0,
            hdata: 0,
            data: Vec::new(),
        }
    }

    // Only for payloads whose length is fixed and valid by construction.
    fn assemble(opcode: Opcode, chip_address: u8, core_address: u8, hdata: u16, data: Vec<u8>) -> Self {
        debug_assert!(data.len() % 4 == 0 && data.len() <= MAX_DATA_LEN);
        let [lo, hi] = hdata.to_le_bytes();
        let header = [
            opcode as u8,
            chip_address,
            core_address,
            lo,
            hi,
            (data.len() / 4) as u8,
        ];
        Self {
            opcode: opcode as u8,
            chip_address,
            core_address,
            hdata,
            data,
            crc8: crc8(&header),
        }
    }

    /// Parse one complete frame.
    ///
    /// The byte run must hold exactly one frame: marker, valid header CRC,
    /// and precisely the payload length the header declares.
    pub fn decode(bytes: &[u8]) -> Result<Self, FramingError> {
        if bytes.len() < HEADER_LEN {
            return Err(FramingError::TooShort { len: bytes.len() });
        }

        if bytes[0] != FRAME_MARKER {
            return Err(FramingError::BadMarker(bytes[0]));
        }

        let computed = crc8(&bytes[1..7]);
        if computed != bytes[7] {
            return Err(FramingError::CrcMismatch {
                computed,
                received: bytes[7],
            });
        }

        let expected = HEADER_LEN + 4 * bytes[6] as usize;
        if bytes.len() != expected {
            return Err(FramingError::LengthMismatch {
                expected,
                actual: bytes.len(),
            });
        }

        Ok(Self {
            opcode: bytes[1],
            chip_address: bytes[2],
            core_address: bytes[3],
            hdata: u16::from_le_bytes([bytes[4], bytes[5]]),
            data: bytes[HEADER_LEN..].to_vec(),
            crc8: bytes[7],
        })
    }

    /// Raw opcode byte as seen on the wire.
    pub fn opcode_byte(&self) -> u8 {
        self.opcode
    }

    /// The opcode, if it is one from the table.
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_repr(self.opcode)
    }

    pub fn opcode_name(&self) -> &'static str {
        opcode_name(self.opcode)
    }

    pub fn chip_address(&self) -> u8 {
        self.chip_address
    }

    pub fn core_address(&self) -> u8 {
        self.core_address
    }

    pub fn hdata(&self) -> u16 {
        self.hdata
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The header's length field: payload bytes / 4.
    pub fn length_field(&self) -> u8 {
        (self.data.len() / 4) as u8
    }

    pub fn crc8(&self) -> u8 {
        self.crc8
    }

    /// Total bytes on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.data.len()
    }

    pub fn write_to(&self, dst: &mut impl BufMut) {
        dst.put_u8(FRAME_MARKER);
        dst.put_u8(self.opcode);
        dst.put_u8(self.chip_address);
        dst.put_u8(self.core_address);
        dst.put_u16_le(self.hdata);
        dst.put_u8(self.length_field());
        dst.put_u8(self.crc8);
        dst.put_slice(&self.data);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.wire_len());
        self.write_to(&mut bytes);
        bytes
    }

    /// OP_USB_INIT asking the controller to bring up the dies at `clockrate`
    /// MHz.
    pub fn usb_init(protocol: WorkProtocol, flags: InitFlags, clockrate: u16) -> Self {
        Self::assemble(
            Opcode::UsbInit,
            0,
            protocol as u8 | flags.bits(),
            clockrate,
            Vec::new(),
        )
    }

    /// OP_FAN broadcast setting the fan speed.
    pub fn fan(speed: u16) -> Self {
        Self::assemble(Opcode::Fan, 0xff, 0x01, speed, Vec::new())
    }

    /// OP_USB_SHUTDOWN; hdata 2 asks the controller to power the dies down.
    pub fn usb_shutdown() -> Self {
        Self::assemble(Opcode::UsbShutdown, 0, 0, 2, Vec::new())
    }

    /// OP_HASH carrying `job` for `core` of `die`, tagged with `sequence`.
    pub fn hash(die: u8, core: u8, sequence: u16, job: &HashJob) -> Self {
        Self::assemble(Opcode::Hash, die, core, sequence, job.to_bytes().to_vec())
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} chip={} core={} hdata=0x{:04x} len={}",
            self.opcode_name(),
            self.chip_address,
            self.core_address,
            self.hdata,
            self.data.len()
        )
    }
}

/// Field-by-field construction of an outbound [`Frame`].
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    opcode: u8,
    chip_address: u8,
    core_address: u8,
    hdata: u16,
    data: Vec<u8>,
}

impl FrameBuilder {
    pub fn chip_address(mut self, chip_address: u8) -> Self {
        self.chip_address = chip_address;
        self
    }

    pub fn core_address(mut self, core_address: u8) -> Self {
        self.core_address = core_address;
        self
    }

    pub fn hdata(mut self, hdata: u16) -> Self {
        self.hdata = hdata;
        self
    }

    pub fn data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    pub fn build(self) -> Result<Frame, ValidationError> {
        let opcode =
            Opcode::from_repr(self.opcode).ok_or(ValidationError::UnknownOpcode(self.opcode))?;

        if self.data.len() > MAX_DATA_LEN {
            return Err(ValidationError::PayloadTooLong(self.data.len()));
        }
        if self.data.len() % 4 != 0 {
            return Err(ValidationError::UnalignedPayload(self.data.len()));
        }

        Ok(Frame::assemble(
            opcode,
            self.chip_address,
            self.core_address,
            self.hdata,
            self.data,
        ))
    }

    /// Build and serialize in one step.
    pub fn encode(self) -> Result<Vec<u8>, ValidationError> {
        self.build().map(|frame| frame.to_bytes())
    }
}

/// Writes frames into a byte buffer for the transport.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        dst.reserve(frame.wire_len());
        frame.write_to(dst);

        trace!(
            frame = %frame,
            bytes = frame.wire_len(),
            raw = %HexBytes(&dst[start..]),
            "TX GN"
        );

        Ok(())
    }
}

/// Proof-of-work search task for one core (`struct hf_hash_serial`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashJob {
    pub midstate: [u8; 32],
    pub merkle_residual: [u8; 4],
    pub timestamp: u32,
    pub bits: u32,
    pub starting_nonce: u32,
    pub nonce_loops: u32,
    pub ntime_loops: u16,
    pub search_difficulty: u8,
    pub option: u8,
    pub group: u8,
    pub spare: [u8; 3],
}

impl HashJob {
    /// Serialized size; the frame's length field is 15.
    pub const LEN: usize = 60;

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        let mut buf = &mut out[..];
        buf.put_slice(&self.midstate);
        buf.put_slice(&self.merkle_residual);
        buf.put_u32_le(self.timestamp);
        buf.put_u32_le(self.bits);
        buf.put_u32_le(self.starting_nonce);
        buf.put_u32_le(self.nonce_loops);
        buf.put_u16_le(self.ntime_loops);
        buf.put_u8(self.search_difficulty);
        buf.put_u8(self.option);
        buf.put_u8(self.group);
        buf.put_slice(&self.spare);
        out
    }

    /// Parse the payload of an OP_HASH frame.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ValidationError> {
        let bytes: &[u8; Self::LEN] = bytes
            .try_into()
            .map_err(|_| ValidationError::HashJobLength(bytes.len()))?;

        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let mut midstate = [0u8; 32];
        midstate.copy_from_slice(&bytes[0..32]);

        Ok(Self {
            midstate,
            merkle_residual: [bytes[32], bytes[33], bytes[34], bytes[35]],
            timestamp: word(36),
            bits: word(40),
            starting_nonce: word(44),
            nonce_loops: word(48),
            ntime_loops: u16::from_le_bytes([bytes[52], bytes[53]]),
            search_difficulty: bytes[54],
            option: bytes[55],
            group: bytes[56],
            spare: [bytes[57], bytes[58], bytes[59]],
        })
    }
}

/// Mask for the ntime offset in [`CandidateNonce::ntime`].
pub const NTIME_MASK: u16 = 0x0fff;

/// Set in [`CandidateNonce::ntime`] when the core may hold more nonces.
pub const NONCE_SEARCH_FORWARD: u16 = 0x1000;

/// One candidate from an OP_NONCE payload (`struct hf_candidate_nonce`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateNonce {
    pub nonce: u32,
    pub sequence: u16,
    pub ntime: u16,
}

impl CandidateNonce {
    pub const LEN: usize = 8;

    pub fn from_bytes(bytes: &[u8; Self::LEN]) -> Self {
        Self {
            nonce: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            sequence: u16::from_le_bytes([bytes[4], bytes[5]]),
            ntime: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn ntime_offset(&self) -> u16 {
        self.ntime & NTIME_MASK
    }

    pub fn search_forward(&self) -> bool {
        self.ntime & NONCE_SEARCH_FORWARD != 0
    }
}

/// OP_NONCE: candidates found by one die.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceReport {
    pub die: u8,
    pub nonces: Vec<CandidateNonce>,
}

impl TryFrom<&Frame> for NonceReport {
    type Error = ProtocolError;

    fn try_from(frame: &Frame) -> Result<Self, Self::Error> {
        let data = frame.data();
        if data.len() % CandidateNonce::LEN != 0 {
            return Err(ProtocolError::NoncePayloadLength(data.len()));
        }

        let nonces = data
            .chunks_exact(CandidateNonce::LEN)
            .filter_map(|chunk| chunk.try_into().ok())
            .map(CandidateNonce::from_bytes)
            .collect();

        Ok(Self {
            die: frame.chip_address(),
            nonces,
        })
    }
}

/// On-die sensor readings (`struct hf_g1_monitor`).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MonitorSample {
    /// Degrees Celsius
    pub die_temperature: f32,
    /// Volts: main rail, then rails A through E
    pub core_voltage: [f32; 6],
}

impl MonitorSample {
    pub const LEN: usize = 8;
    pub const RAIL_NAMES: [&'static str; 6] = ["main", "A", "B", "C", "D", "E"];

    pub fn from_bytes(bytes: &[u8; Self::LEN]) -> Self {
        let mut core_voltage = [0.0; 6];
        for (volts, raw) in core_voltage.iter_mut().zip(&bytes[2..]) {
            *volts = gn_core_voltage(*raw);
        }

        Self {
            die_temperature: gn_die_temperature(u16::from_le_bytes([bytes[0], bytes[1]])),
            core_voltage,
        }
    }
}

/// ADC reading of a core voltage rail, in volts.
pub fn gn_core_voltage(raw: u8) -> f32 {
    f32::from(raw) / 256.0 * 1.2
}

/// ADC reading of the die temperature sensor, in degrees Celsius.
pub fn gn_die_temperature(raw: u16) -> f32 {
    f32::from(raw) * 240.0 / 4096.0 - 61.5
}

/// OP_STATUS: periodic per-die slot and sensor report.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub die: u8,
    pub thermal_cutoff: bool,
    /// Fan tachometer, in centiseconds per revolution
    pub tach: u8,
    /// Newest job sequence the die has accepted
    pub last_sequence: u16,
    pub monitor: MonitorSample,
    /// Two bits per core, active then pending, least significant first
    pub core_map: Vec<u8>,
}

impl TryFrom<&Frame> for StatusReport {
    type Error = ProtocolError;

    /// The header fields are read first: a cutoff report is accepted even
    /// when its payload is too short to carry a monitor block, which then
    /// reads as zero.
    fn try_from(frame: &Frame) -> Result<Self, Self::Error> {
        let mut status = Self {
            die: frame.chip_address(),
            thermal_cutoff: frame.core_address() & 0x80 != 0,
            tach: frame.core_address() & 0x0f,
            last_sequence: frame.hdata(),
            monitor: MonitorSample::default(),
            core_map: Vec::new(),
        };

        let data = frame.data();
        let monitor: Option<&[u8; MonitorSample::LEN]> = data
            .get(..MonitorSample::LEN)
            .and_then(|bytes| bytes.try_into().ok());

        match monitor {
            Some(monitor) => {
                status.monitor = MonitorSample::from_bytes(monitor);
                status.core_map = data[MonitorSample::LEN..].to_vec();
            }
            None if status.thermal_cutoff => {}
            None => return Err(ProtocolError::StatusPayloadTooShort(data.len())),
        }

        Ok(status)
    }
}

/// Controller identity block at the start of an OP_USB_INIT reply
/// (`struct hf_usb_init_base`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsbInitBase {
    pub firmware_rev: u16,
    pub hardware_rev: u16,
    pub serial_number: u32,
    /// Zero on success
    pub operation_status: u8,
    pub extra_status_1: u8,
    pub sequence_modulus: u16,
    pub hash_clockrate: u16,
    pub inflight_target: u16,
}

impl UsbInitBase {
    pub const LEN: usize = 16;

    pub fn from_bytes(b: &[u8; Self::LEN]) -> Self {
        Self {
            firmware_rev: u16::from_le_bytes([b[0], b[1]]),
            hardware_rev: u16::from_le_bytes([b[2], b[3]]),
            serial_number: u32::from_le_bytes([b[4], b[5], b[6], b[7]]),
            operation_status: b[8],
            extra_status_1: b[9],
            sequence_modulus: u16::from_le_bytes([b[10], b[11]]),
            hash_clockrate: u16::from_le_bytes([b[12], b[13]]),
            inflight_target: u16::from_le_bytes([b[14], b[15]]),
        }
    }
}

/// Die configuration echoed in an OP_USB_INIT reply (`struct hf_config_data`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigData {
    pub status_period_ms: u16,
    pub enable_periodic_status: bool,
    pub send_status_on_core_idle: bool,
    pub send_status_on_pending_empty: bool,
    pub pwm_active_level: bool,
    pub forward_all_privileged_packets: bool,
    pub status_batch_delay: u8,
    pub watchdog_secs: u8,
    pub disable_sensors: bool,
    pub rx_header_timeout: u8,
    pub rx_ignore_header_crc: bool,
    pub rx_data_timeout: u8,
    pub rx_ignore_data_crc: bool,
    pub stats_interval: u8,
    pub stat_diagnostic: bool,
    pub measure_interval_ms: u8,
    pub one_usec: u16,
    pub max_nonces_per_frame: u8,
    pub voltage_sample_points: u8,
    pub pwm_phases: u8,
    pub trim: u8,
    pub clock_diagnostic: bool,
    pub forward_all_packets: bool,
    pub pwm_period: u16,
    pub pwm_pulse_period: u16,
}

impl ConfigData {
    pub const LEN: usize = 16;

    pub fn from_bytes(b: &[u8; Self::LEN]) -> Self {
        let first = u16::from_le_bytes([b[0], b[1]]);
        let second = u32::from_le_bytes([b[8], b[9], b[10], b[11]]);
        let bit16 = |n: u32| first & (1 << n) != 0;
        let bit8 = |byte: u8| byte & 0x80 != 0;

        Self {
            status_period_ms: first & 0x07ff,
            enable_periodic_status: bit16(11),
            send_status_on_core_idle: bit16(12),
            send_status_on_pending_empty: bit16(13),
            pwm_active_level: bit16(14),
            forward_all_privileged_packets: bit16(15),
            status_batch_delay: b[2],
            watchdog_secs: b[3] & 0x7f,
            disable_sensors: bit8(b[3]),
            rx_header_timeout: b[4] & 0x7f,
            rx_ignore_header_crc: bit8(b[4]),
            rx_data_timeout: b[5] & 0x7f,
            rx_ignore_data_crc: bit8(b[5]),
            stats_interval: b[6] & 0x7f,
            stat_diagnostic: bit8(b[6]),
            measure_interval_ms: b[7],
            one_usec: (second & 0x0000_0fff) as u16,
            max_nonces_per_frame: ((second & 0x0000_f000) >> 12) as u8,
            voltage_sample_points: ((second & 0x00ff_0000) >> 16) as u8,
            pwm_phases: ((second & 0x0300_0000) >> 24) as u8,
            trim: ((second & 0x3c00_0000) >> 26) as u8,
            clock_diagnostic: second & 0x4000_0000 != 0,
            forward_all_packets: second & 0x8000_0000 != 0,
            pwm_period: u16::from_le_bytes([b[12], b[13]]),
            pwm_pulse_period: u16::from_le_bytes([b[14], b[15]]),
        }
    }
}

/// Device id reported in the low byte of an OP_USB_INIT reply's hdata.
pub const DEVICE_ID_GN_ASIC: u8 = 1;

/// OP_USB_INIT reply: board dimensions, identity and the working core map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitAck {
    pub dies: u8,
    pub cores_per_die: u8,
    pub device_id: u8,
    pub reference_clock_mhz: u8,
    pub base: UsbInitBase,
    pub config: ConfigData,
    /// `dies * cores_per_die` bits, one die at a time, least significant first
    pub core_map: Vec<u8>,
}

impl InitAck {
    pub fn is_gn_asic(&self) -> bool {
        self.device_id == DEVICE_ID_GN_ASIC
    }
}

impl TryFrom<&Frame> for InitAck {
    type Error = ProtocolError;

    fn try_from(frame: &Frame) -> Result<Self, Self::Error> {
        let data = frame.data();
        let too_short = || ProtocolError::InitPayloadTooShort(data.len());

        let base: &[u8; UsbInitBase::LEN] = data
            .get(..UsbInitBase::LEN)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(too_short)?;
        let config: &[u8; ConfigData::LEN] = data
            .get(UsbInitBase::LEN..UsbInitBase::LEN + ConfigData::LEN)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(too_short)?;

        let [device_id, reference_clock_mhz] = frame.hdata().to_le_bytes();

        Ok(Self {
            dies: frame.chip_address(),
            cores_per_die: frame.core_address(),
            device_id,
            reference_clock_mhz,
            base: UsbInitBase::from_bytes(base),
            config: ConfigData::from_bytes(config),
            core_map: data[UsbInitBase::LEN + ConfigData::LEN..].to_vec(),
        })
    }
}

/// OP_USB_NOTICE: asynchronous event from the controller
/// (`struct hf_usb_notice_data`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub code: u16,
    pub extra_data: Option<u32>,
    pub message: Option<String>,
}

impl TryFrom<&Frame> for Notice {
    type Error = ProtocolError;

    fn try_from(frame: &Frame) -> Result<Self, Self::Error> {
        let data = frame.data();
        let length_field = frame.length_field();

        let extra_data = (length_field > 0)
            .then(|| u32::from_le_bytes([data[0], data[1], data[2], data[3]]));

        let message = if length_field > 1 {
            let raw = &data[4..];
            let end = raw
                .iter()
                .position(|&b| b == 0)
                .ok_or(ProtocolError::UnterminatedNotice)?;
            // Firmware strings are plain bytes; map each one to a char.
            Some(raw[..end].iter().map(|&b| char::from(b)).collect())
        } else {
            None
        };

        Ok(Self {
            code: frame.hdata(),
            extra_data,
            message,
        })
    }
}

/// One parsed item from the device byte stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Any frame without a typed decoding, including unknown opcodes
    Generic(Frame),
    NonceReport(NonceReport),
    StatusReport(StatusReport),
    InitAck(InitAck),
    Notice(Notice),
    /// Bytes that could not be synchronized to a frame
    Garbage(Vec<u8>),
}

impl TryFrom<Frame> for Token {
    type Error = ProtocolError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        Ok(match frame.opcode() {
            Some(Opcode::Nonce) => Token::NonceReport(NonceReport::try_from(&frame)?),
            Some(Opcode::Status) => Token::StatusReport(StatusReport::try_from(&frame)?),
            Some(Opcode::UsbInit) => Token::InitAck(InitAck::try_from(&frame)?),
            Some(Opcode::UsbNotice) => Token::Notice(Notice::try_from(&frame)?),
            _ => Token::Generic(frame),
        })
    }
}
