//! Output formatting for dissected transfers.

use crate::capture::Direction;
use crate::dissect::{DissectedTransfer, Severity};
use colored::Colorize;

/// Gray color for hex data output
const HEX_DATA_GRAY: (u8, u8, u8) = (128, 128, 128);

fn gray_hex(text: &str) -> colored::ColoredString {
    let (r, g, b) = HEX_DATA_GRAY;
    text.truecolor(r, g, b)
}

/// Output formatter configuration
#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub show_raw_hex: bool,
    pub use_relative_time: bool,
    pub start_time: Option<f64>,
    pub use_color: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            show_raw_hex: false,
            use_relative_time: false,
            start_time: None,
            use_color: true,
        }
    }
}

/// Format one transfer: a line per token, then the raw bytes if requested.
/// Transfers that completed no token produce no output without raw hex.
pub fn format_transfer(transfer: &DissectedTransfer, config: &OutputConfig) -> Option<String> {
    let show_hex = config.show_raw_hex && !transfer.raw_data.is_empty();
    if transfer.tokens.is_empty() && !show_hex {
        return None;
    }

    let timestamp = format_timestamp(transfer.timestamp, config);
    let direction = format_direction(transfer.direction, config);

    let mut lines: Vec<String> = transfer
        .tokens
        .iter()
        .map(|token| {
            let summary = if config.use_color {
                match token.severity {
                    Severity::Normal => token.summary.normal(),
                    Severity::Warning => token.summary.yellow(),
                    Severity::Error => token.summary.red().bold(),
                }
                .to_string()
            } else {
                token.summary.clone()
            };
            format!("{} {}: {}", timestamp, direction, summary)
        })
        .collect();

    if lines.is_empty() {
        lines.push(format!("{} {}: (partial frame)", timestamp, direction));
    }

    if show_hex {
        for line in format_hex_multiline(&transfer.raw_data).lines() {
            let line = if config.use_color {
                gray_hex(line).to_string()
            } else {
                line.to_string()
            };
            lines.push(format!("        {}", line));
        }
    }

    Some(lines.join("\n"))
}

fn format_direction(direction: Direction, config: &OutputConfig) -> String {
    let label = match direction {
        Direction::Out => "OUT → GN",
        Direction::In => "IN  ← GN",
    };

    if config.use_color {
        let color = match direction {
            Direction::Out => colored::Color::BrightCyan,
            Direction::In => colored::Color::BrightYellow,
        };
        label.color(color).to_string()
    } else {
        label.to_string()
    }
}

fn format_timestamp(timestamp: f64, config: &OutputConfig) -> String {
    let shown = match (config.use_relative_time, config.start_time) {
        (true, Some(start)) => timestamp - start,
        _ => timestamp,
    };
    format!("{:10.6}", shown)
}

/// Format hex data with line wrapping at 16 bytes per line
fn format_hex_multiline(data: &[u8]) -> String {
    data.chunks(16)
        .map(|chunk| {
            chunk
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dissect::DissectedToken;

    fn plain() -> OutputConfig {
        OutputConfig {
            use_color: false,
            ..OutputConfig::default()
        }
    }

    fn transfer(tokens: Vec<DissectedToken>, raw_data: Vec<u8>) -> DissectedTransfer {
        DissectedTransfer {
            timestamp: 12.5,
            direction: Direction::In,
            raw_data,
            tokens,
        }
    }

    #[test]
    fn one_line_per_token() {
        let tokens = vec![
            DissectedToken {
                summary: "first".into(),
                severity: Severity::Normal,
            },
            DissectedToken {
                summary: "second".into(),
                severity: Severity::Warning,
            },
        ];
        let text = format_transfer(&transfer(tokens, vec![0xaa]), &plain()).unwrap();
        assert_eq!(
            text,
            " 12.500000 IN  ← GN: first\n 12.500000 IN  ← GN: second"
        );
    }

    #[test]
    fn relative_time_and_hex() {
        let config = OutputConfig {
            show_raw_hex: true,
            use_relative_time: true,
            start_time: Some(10.0),
            use_color: false,
        };
        let raw: Vec<u8> = (0..18).collect();
        let text = format_transfer(&transfer(Vec::new(), raw), &config).unwrap();
        let lines: Vec<_> = text.lines().collect();

        assert_eq!(lines[0], "  2.500000 IN  ← GN: (partial frame)");
        assert_eq!(
            lines[1],
            "        00 01 02 03 04 05 06 07 08 09 0a 0b 0c 0d 0e 0f"
        );
        assert_eq!(lines[2], "        10 11");
    }

    #[test]
    fn silent_without_tokens() {
        assert_eq!(format_transfer(&transfer(Vec::new(), vec![0xaa]), &plain()), None);
    }
}
