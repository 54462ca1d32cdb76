//! Logging setup for the driver and its tools.
//!
//! Binaries call [`init_journald_or_stdout`] (the daemon) or [`init_stderr`]
//! (tools whose stdout carries their own output) once at startup. Everything
//! else imports `crate::tracing::prelude::*` for the `trace!()` through
//! `error!()` macros.

use std::{env, fmt};
use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime, FmtContext, FormatEvent, FormatFields},
    prelude::*,
    registry::LookupSpan,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

const CRATE_PREFIX: &str = "hf_miner::";

/// Initialize logging for the daemon.
///
/// Under systemd (`JOURNAL_STREAM` set) events go to the journal; otherwise
/// to stdout through [`TwoLineFormatter`].
pub fn init_journald_or_stdout() {
    if env::var("JOURNAL_STREAM").is_ok() {
        match tracing_journald::layer() {
            Ok(layer) => tracing_subscriber::registry().with(layer).init(),
            Err(e) => {
                init_writer(LevelFilter::INFO, std::io::stdout);
                error!(error = %e, "Journald unavailable, logging to stdout");
            }
        }
    } else {
        init_writer(LevelFilter::INFO, std::io::stdout);
    }
}

/// Initialize logging to stderr at `default_level` unless `RUST_LOG` says
/// otherwise.
pub fn init_stderr(default_level: LevelFilter) {
    init_writer(default_level, std::io::stderr);
}

fn init_writer<W>(default_level: LevelFilter, make_writer: W)
where
    W: for<'w> tracing_subscriber::fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(make_writer)
                .with_timer(LocalTimer)
                .fmt_fields(tracing_subscriber::fmt::format::DefaultFields::new())
                .event_format(TwoLineFormatter),
        )
        .init();
}

/// Event formatter: time, colored level, short target and message on the
/// first line; structured fields dimmed on a second, indented line.
struct TwoLineFormatter;

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    fields: Vec<(String, String)>,
}

impl tracing::field::Visit for FieldCollector {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        let formatted = format!("{:?}", value);
        if field.name() == "message" {
            self.message = Some(formatted);
            return;
        }

        // Some(x) -> x
        let value = match formatted.strip_prefix("Some(") {
            Some(inner) => inner.strip_suffix(')').unwrap_or(inner).to_string(),
            None => formatted,
        };
        self.fields.push((field.name().to_string(), value));
    }
}

fn level_style(level: tracing::Level) -> (&'static str, &'static str) {
    match level {
        tracing::Level::ERROR => ("\x1b[31m", "ERROR"),
        tracing::Level::WARN => ("\x1b[33m", "WARN "),
        tracing::Level::INFO => ("\x1b[32m", "INFO "),
        tracing::Level::DEBUG => ("\x1b[34m", "DEBUG"),
        tracing::Level::TRACE => ("\x1b[35m", "TRACE"),
    }
}

/// Our own modules lose the crate prefix; events bridged from `log` use
/// their original target.
fn short_target<'a>(target: &'a str, fields: &'a [(String, String)]) -> &'a str {
    if let Some(module) = target.strip_prefix(CRATE_PREFIX) {
        return module;
    }
    if target == "log" {
        if let Some((_, original)) = fields.iter().find(|(k, _)| k == "log.target") {
            return original.trim_matches('"');
        }
    }
    target
}

impl<S, N> FormatEvent<S, N> for TwoLineFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let mut visitor = FieldCollector::default();
        event.record(&mut visitor);

        LocalTimer.format_time(&mut writer)?;

        let (color, label) = level_style(*event.metadata().level());
        write!(writer, " {}{}\x1b[0m ", color, label)?;
        write!(
            writer,
            "{}: ",
            short_target(event.metadata().target(), &visitor.fields)
        )?;

        if let Some(message) = &visitor.message {
            write!(writer, "{}", message.trim_matches('"'))?;
        }

        let mut fields = visitor
            .fields
            .iter()
            .filter(|(key, _)| !key.starts_with("log."))
            .peekable();

        if fields.peek().is_some() {
            // "hh:mm:ss LEVEL " is 15 columns
            write!(writer, "\n\x1b[90m{:15}", "")?;
            for (i, (key, value)) in fields.enumerate() {
                if i > 0 {
                    write!(writer, ", ")?;
                }
                write!(writer, "{}={}", key, value.trim_matches('"'))?;
            }
            write!(writer, "\x1b[0m")?;
        }

        writeln!(writer)
    }
}

/// Local wall-clock time to the second.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let formatted = now
            .format(time::macros::format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| fmt::Error)?;
        write!(w, "{}", formatted)
    }
}
