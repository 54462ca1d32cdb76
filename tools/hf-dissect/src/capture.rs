//! CSV captures of USB bulk transfers.
//!
//! One row per transfer:
//!
//! ```text
//! time,direction,data
//! 0.000125,OUT,aa 80 00 80 58 02 00 2d
//! 0.004310,IN,aa800108011909...
//! ```
//!
//! `direction` is `OUT` (host to device) or `IN`; `data` is hex, with or
//! without separating spaces.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// Raw CSV row.
#[derive(Debug, Clone, Deserialize)]
struct RawTransfer {
    time: f64,
    direction: String,
    #[serde(default)]
    data: String,
}

/// Transfer direction, named from the host's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

impl FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OUT" | "H2D" => Ok(Direction::Out),
            "IN" | "D2H" => Ok(Direction::In),
            other => bail!("Unknown direction: {}", other),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Out => write!(f, "OUT"),
            Direction::In => write!(f, "IN"),
        }
    }
}

/// One captured bulk transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub timestamp: f64,
    pub direction: Direction,
    pub data: Vec<u8>,
}

impl RawTransfer {
    fn parse(&self) -> Result<Transfer> {
        Ok(Transfer {
            timestamp: self.time,
            direction: self.direction.parse()?,
            data: parse_hex(&self.data)
                .with_context(|| format!("Failed to parse data: {}", self.data))?,
        })
    }
}

/// Parse a hex byte string. Whitespace and an optional `0x` prefix per
/// byte group are ignored.
pub fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let digits: String = s
        .split_whitespace()
        .map(|group| {
            group
                .strip_prefix("0x")
                .or_else(|| group.strip_prefix("0X"))
                .unwrap_or(group)
        })
        .collect();

    if digits.len() % 2 != 0 {
        bail!("Odd number of hex digits");
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("Invalid hex byte: {}", &digits[i..i + 2]))
        })
        .collect()
}

/// CSV capture reader
pub struct CaptureReader<R> {
    reader: csv::Reader<R>,
}

impl CaptureReader<std::fs::File> {
    /// Open a CSV capture file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())
            .with_context(|| format!("Failed to open capture file: {:?}", path.as_ref()))?;
        Ok(Self::from_reader(file))
    }
}

impl<R: Read> CaptureReader<R> {
    pub fn from_reader(reader: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        Self { reader }
    }

    /// Read and parse transfers in file order.
    pub fn transfers(&mut self) -> impl Iterator<Item = Result<Transfer>> + '_ {
        self.reader
            .deserialize::<RawTransfer>()
            .map(|result| result.map_err(anyhow::Error::from)?.parse())
    }
}
