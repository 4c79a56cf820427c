//! Structured logging setup.
//!
//! Builds an `EnvFilter` from the configured level and a `tracing_subscriber`
//! layer chosen by format, installed once via `registry().with(layer).init()`.
//! This agent always runs under a process supervisor that captures stdout,
//! so there is no rotating file appender — every log line goes to stdout,
//! json or console per `AmbientConfig::log_format`.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::domain::models::{LogFormat, LogLevel};

/// Installs the global `tracing` subscriber. Call exactly once, as early in
/// `main` as the loaded `Config` is available.
pub fn init(level: LogLevel, format: LogFormat) {
    let filter = EnvFilter::new(level_filter_directive(level));

    match format {
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false);
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
        LogFormat::Console => {
            let layer = tracing_subscriber::fmt::layer().pretty().with_span_events(FmtSpan::CLOSE).with_target(true);
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
    }
}

const fn level_filter_directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}
