//! Structured logging using the tracing crate
//!
//! ## Log Format Options
//!
//! The output format is controlled by the `LOG_FORMAT` environment variable:
//!
//! - `json` - Structured JSON format for log aggregation
//! - `pretty` - Human-readable format with colors and indentation
//! - `compact` - Terminal-friendly format with colors but minimal spacing
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: Log level (ERROR, WARN, INFO, DEBUG, TRACE) - defaults to INFO
//! - `LOG_FORMAT`: Output format (json, pretty, compact) - defaults to json
//! - `LOG_SPANS`: Include span events (true/false) - defaults to false
//! - `RUST_LOG`: Override log filtering (follows env_logger format)
//!
//! ## Examples
//!
//! ```bash
//! # Field node, shipping logs to an aggregator
//! LOG_FORMAT=json LOG_LEVEL=INFO ./bobnet-sensors run
//!
//! # Bench testing a new device
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG ./bobnet-sensors run
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Crates whose logs are capped at `warn` unless `RUST_LOG` says otherwise
const QUIET_DEPENDENCIES: [&str; 4] = ["rumqttc", "reqwest", "hyper", "rustls"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogFormat {
    /// JSON format for structured logging (machine-readable)
    Json,
    /// Pretty format with colors and indentation (human-readable)
    Pretty,
    /// Compact format with colors but minimal spacing (terminal-friendly)
    Compact,
}

impl LogFormat {
    /// Parse log format from string, falling back to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Parse a level name, falling back to INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Only the literal `true` (any case) enables span events
pub fn parse_spans(s: &str) -> bool {
    s.eq_ignore_ascii_case("true")
}

/// Build the filter for `level`, or from `rust_log` when it is set
pub fn build_filter(level: Level, rust_log: Option<&str>) -> EnvFilter {
    if let Some(rust_log) = rust_log {
        return EnvFilter::new(rust_log);
    }

    QUIET_DEPENDENCIES
        .iter()
        .filter_map(|krate| format!("{krate}=warn").parse().ok())
        .fold(EnvFilter::new(level.to_string()), |filter, directive| {
            filter.add_directive(directive)
        })
}

fn span_events(include_spans: bool) -> FmtSpan {
    if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// Initialize logging with manual configuration.
///
/// A second call is a no-op: the first subscriber stays installed.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    let rust_log = env::var("RUST_LOG").ok();
    let filter = build_filter(level, rust_log.as_deref());
    let subscriber = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Json => subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("Logging already initialized");
    }
}

/// Initialize logging from environment variables
pub fn init_default_logging() {
    init_logging(default_level(), default_format(), default_spans());
}

/// `LOG_LEVEL` from the environment
pub fn default_level() -> Level {
    parse_level(&env::var("LOG_LEVEL").unwrap_or_default())
}

fn default_format() -> LogFormat {
    LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_default())
}

fn default_spans() -> bool {
    parse_spans(&env::var("LOG_SPANS").unwrap_or_default())
}

/// Create a span around one sensor's polling loop
#[macro_export]
macro_rules! sensor_span {
    ($($field:tt)*) => {
        tracing::info_span!("sensor_poll", $($field)*)
    };
}

/// Create an MQTT operation span
#[macro_export]
macro_rules! mqtt_span {
    ($($field:tt)*) => {
        tracing::info_span!("mqtt_operation", $($field)*)
    };
}

pub use {mqtt_span, sensor_span};
