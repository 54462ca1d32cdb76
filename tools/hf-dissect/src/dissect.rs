//! Protocol dissection engine.
//!
//! Each direction gets its own stream parser, since bulk transfers split and
//! join frames freely. Every token a transfer completes is described in one
//! line using the library's decoders.

use crate::capture::{Direction, Transfer};
use hf_miner::asic::gn::protocol::HexBytes;
use hf_miner::asic::gn::{
    Frame, HashJob, InitAck, NonceReport, Opcode, StatusReport, StreamParser, Token,
};

/// How a dissected item should be highlighted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
    Error,
}

/// One decoded token.
#[derive(Debug, Clone, PartialEq)]
pub struct DissectedToken {
    pub summary: String,
    pub severity: Severity,
}

/// Tokens completed by one transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct DissectedTransfer {
    pub timestamp: f64,
    pub direction: Direction,
    pub raw_data: Vec<u8>,
    pub tokens: Vec<DissectedToken>,
}

/// Per-direction frame recovery over a whole capture.
pub struct Dissector {
    host: StreamParser,
    device: StreamParser,
}

impl Default for Dissector {
    fn default() -> Self {
        Self::new()
    }
}

impl Dissector {
    pub fn new() -> Self {
        Self {
            host: StreamParser::host_side(),
            device: StreamParser::new(),
        }
    }

    pub fn process(&mut self, transfer: &Transfer) -> DissectedTransfer {
        let parser = self.parser(transfer.direction);
        let tokens = match parser.feed(&transfer.data) {
            Ok(()) => drain(parser, transfer.direction),
            Err(e) => {
                parser.reset();
                vec![DissectedToken {
                    summary: format!("Parser failure, resynchronizing: {}", e),
                    severity: Severity::Error,
                }]
            }
        };

        DissectedTransfer {
            timestamp: transfer.timestamp,
            direction: transfer.direction,
            raw_data: transfer.data.clone(),
            tokens,
        }
    }

    /// Describe whatever each parser still holds at the end of the capture.
    pub fn finish(&mut self, timestamp: f64) -> Vec<DissectedTransfer> {
        [Direction::Out, Direction::In]
            .into_iter()
            .filter_map(|direction| {
                let parser = self.parser(direction);
                parser.flush();
                let tokens = drain(parser, direction);
                (!tokens.is_empty()).then(|| DissectedTransfer {
                    timestamp,
                    direction,
                    raw_data: Vec::new(),
                    tokens,
                })
            })
            .collect()
    }

    fn parser(&mut self, direction: Direction) -> &mut StreamParser {
        match direction {
            Direction::Out => &mut self.host,
            Direction::In => &mut self.device,
        }
    }
}

fn drain(parser: &mut StreamParser, direction: Direction) -> Vec<DissectedToken> {
    parser
        .drain_tokens()
        .map(|token| match token {
            Ok(token) => describe(&token, direction),
            Err(e) => DissectedToken {
                summary: format!("Malformed frame: {}", e),
                severity: Severity::Error,
            },
        })
        .collect()
}

/// One-line description of a token.
pub fn describe(token: &Token, direction: Direction) -> DissectedToken {
    let normal = |summary: String| DissectedToken {
        summary,
        severity: Severity::Normal,
    };

    match token {
        Token::Generic(frame) => describe_frame(frame, direction),
        Token::NonceReport(report) => normal(describe_nonces(report)),
        Token::StatusReport(status) => DissectedToken {
            summary: describe_status(status),
            severity: if status.thermal_cutoff {
                Severity::Error
            } else {
                Severity::Normal
            },
        },
        Token::InitAck(ack) => DissectedToken {
            summary: describe_init_ack(ack),
            severity: if ack.base.operation_status == 0 {
                Severity::Normal
            } else {
                Severity::Error
            },
        },
        Token::Notice(notice) => DissectedToken {
            summary: format!(
                "OP_USB_NOTICE code={} extra={} message={:?}",
                notice.code,
                notice
                    .extra_data
                    .map_or_else(|| "-".to_string(), |extra| format!("0x{:08x}", extra)),
                notice.message.as_deref().unwrap_or("")
            ),
            severity: Severity::Warning,
        },
        Token::Garbage(bytes) => DissectedToken {
            summary: format!("Garbage ({} bytes): {}", bytes.len(), HexBytes(bytes)),
            severity: Severity::Warning,
        },
    }
}

fn describe_frame(frame: &Frame, direction: Direction) -> DissectedToken {
    let summary = match (direction, frame.opcode()) {
        (Direction::Out, Some(Opcode::Hash)) => match HashJob::from_bytes(frame.data()) {
            Ok(job) => format!(
                "OP_HASH die={} core={} seq={} difficulty={} midstate={}.. residual={} \
                 ntime=0x{:08x} bits=0x{:08x} nonce=0x{:08x}+{} ntime_loops={}",
                frame.chip_address(),
                frame.core_address(),
                frame.hdata(),
                job.search_difficulty,
                HexBytes(&job.midstate[..8]),
                HexBytes(&job.merkle_residual),
                job.timestamp,
                job.bits,
                job.starting_nonce,
                job.nonce_loops,
                job.ntime_loops
            ),
            Err(e) => {
                return DissectedToken {
                    summary: format!("{}: {}", frame, e),
                    severity: Severity::Error,
                }
            }
        },
        (Direction::Out, Some(Opcode::UsbInit)) => format!(
            "OP_USB_INIT protocol={} flags=0x{:02x} clockrate={} MHz",
            frame.core_address() & 0x07,
            frame.core_address() & !0x07,
            frame.hdata()
        ),
        (Direction::Out, Some(Opcode::Fan)) => {
            format!("OP_FAN chip=0x{:02x} speed={}", frame.chip_address(), frame.hdata())
        }
        (_, Some(Opcode::UsbShutdown)) => format!("OP_USB_SHUTDOWN hdata={}", frame.hdata()),
        (_, Some(_)) => frame.to_string(),
        (_, None) => {
            return DissectedToken {
                summary: format!("Unknown opcode 0x{:02x}: {}", frame.opcode_byte(), frame),
                severity: Severity::Warning,
            }
        }
    };

    DissectedToken {
        summary,
        severity: Severity::Normal,
    }
}

fn describe_nonces(report: &NonceReport) -> String {
    let nonces = report
        .nonces
        .iter()
        .map(|candidate| {
            format!(
                "0x{:08x}@{}{}",
                candidate.nonce,
                candidate.sequence,
                if candidate.search_forward() { "+" } else { "" }
            )
        })
        .collect::<Vec<_>>()
        .join(" ");
    format!("OP_NONCE die={} [{}]", report.die, nonces)
}

fn describe_status(status: &StatusReport) -> String {
    let cutoff = if status.thermal_cutoff {
        " THERMAL CUTOFF"
    } else {
        ""
    };
    format!(
        "OP_STATUS die={} last_seq={} temp={:.1}C vcore={:.3}V map={}{}",
        status.die,
        status.last_sequence,
        status.monitor.die_temperature,
        status.monitor.core_voltage[0],
        HexBytes(&status.core_map),
        cutoff
    )
}

fn describe_init_ack(ack: &InitAck) -> String {
    format!(
        "OP_USB_INIT reply dies={} cores={} device={} refclk={} MHz fw={} hw={} \
         serial={:08x} status={} clockrate={}",
        ack.dies,
        ack.cores_per_die,
        ack.device_id,
        ack.reference_clock_mhz,
        ack.base.firmware_rev,
        ack.base.hardware_rev,
        ack.base.serial_number,
        ack.base.operation_status,
        ack.base.hash_clockrate
    )
}
