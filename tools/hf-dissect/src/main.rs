//! HashFast GN protocol dissector for USB bulk-transfer captures.

mod capture;
mod dissect;
mod output;

use anyhow::{Context, Result};
use capture::{CaptureReader, Direction};
use clap::Parser;
use dissect::Dissector;
use output::{format_transfer, OutputConfig};
use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use tracing_subscriber::filter::LevelFilter;

/// Protocol dissector for HashFast GN USB captures
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// CSV capture with time,direction,data columns
    input: PathBuf,

    /// Show raw hex data for each transfer
    #[arg(short = 'x', long)]
    hex: bool,

    /// Use absolute timestamps instead of relative (seconds from start)
    #[arg(short = 'a', long)]
    absolute_time: bool,

    /// Only show one direction (OUT or IN)
    #[arg(short = 'f', long)]
    filter_direction: Option<Direction>,

    /// Output file (default: stdout)
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.debug {
        // stdout carries the dissection, so logs go to stderr.
        hf_miner::tracing::init_stderr(LevelFilter::DEBUG);
    }

    let mut reader = CaptureReader::open(&args.input)
        .with_context(|| format!("Failed to open capture file: {:?}", args.input))?;

    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(
            std::fs::File::create(path)
                .with_context(|| format!("Failed to create output file: {:?}", path))?,
        ),
        None => Box::new(std::io::stdout().lock()),
    };

    let mut config = OutputConfig {
        show_raw_hex: args.hex,
        use_relative_time: !args.absolute_time,
        start_time: None,
        use_color: !args.no_color && args.output.is_none() && std::io::stdout().is_terminal(),
    };
    colored::control::set_override(config.use_color);

    let mut dissector = Dissector::new();
    let mut last_time = 0.0;
    let mut transfers = 0usize;

    for transfer in reader.transfers() {
        let transfer = transfer?;
        transfers += 1;
        last_time = transfer.timestamp;
        if config.start_time.is_none() {
            config.start_time = Some(transfer.timestamp);
        }

        // Both directions are parsed regardless of the filter so frame
        // boundaries stay intact.
        let dissected = dissector.process(&transfer);
        if args.filter_direction.is_some_and(|d| d != dissected.direction) {
            continue;
        }
        if let Some(text) = format_transfer(&dissected, &config) {
            writeln!(out, "{}", text)?;
        }
    }

    for dissected in dissector.finish(last_time) {
        if args.filter_direction.is_some_and(|d| d != dissected.direction) {
            continue;
        }
        if let Some(text) = format_transfer(&dissected, &config) {
            writeln!(out, "{}", text)?;
        }
    }

    tracing::debug!(transfers, "Capture done");
    Ok(())
}
