//! Tests for logging configuration and format parsing
//!
//! Tests the pure functions in the logging module that turn environment
//! values into a subscriber configuration.

use bobnet_sensors::observability::logging::{
    build_filter, init_logging, parse_level, parse_spans, LogFormat,
};
use tracing::Level;

#[test]
fn test_log_format_parse_is_case_insensitive() {
    assert_eq!(LogFormat::parse("jSoN"), LogFormat::Json);
    assert_eq!(LogFormat::parse("PrEtTy"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("CoMpAcT"), LogFormat::Compact);
}

#[test]
fn test_log_format_unknown_defaults_to_json() {
    for input in ["xml", "123", " json", "plain"] {
        assert_eq!(LogFormat::parse(input), LogFormat::Json, "input: {input:?}");
    }
}

#[test]
fn test_level_defaults_to_info() {
    assert_eq!(parse_level("verbose"), Level::INFO);
    assert_eq!(parse_level("warning"), Level::INFO);
    assert_eq!(parse_level("WARN"), Level::WARN);
}

#[test]
fn test_spans_only_for_true() {
    assert!(parse_spans("True"));
    assert!(!parse_spans("on"));
}

#[test]
fn test_filter_keeps_level_for_own_crate() {
    let filter = build_filter(Level::TRACE, None).to_string();

    assert!(filter.contains("trace"), "{filter}");
    assert!(filter.contains("rumqttc=warn"), "{filter}");
    assert!(filter.contains("reqwest=warn"), "{filter}");
    assert!(filter.contains("hyper=warn"), "{filter}");
}

#[test]
fn test_rust_log_replaces_defaults() {
    let filter = build_filter(Level::INFO, Some("rumqttc=debug")).to_string();

    assert_eq!(filter, "rumqttc=debug");
}

#[test]
fn test_logging_can_be_initialized_in_every_format() {
    init_logging(Level::INFO, LogFormat::Json, false);
    init_logging(Level::INFO, LogFormat::Pretty, true);
    init_logging(Level::INFO, LogFormat::Compact, false);

    tracing::info!(sensor = "counter1", "logging initialized");
}
