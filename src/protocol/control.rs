//! Decoding of inbound control payloads
//!
//! The bridge delivers a JSON object with two optional mappings:
//!
//! ```json
//! {
//!   "devices":  {"<device>": {"every": "10s"}},
//!   "commands": {"<device>": {"id": 4, "state": "new", "timestamp": null}}
//! }
//! ```
//!
//! Each `devices` entry becomes a [`ConfigMessage`] and each `commands`
//! entry a [`CommandMessage`]. Configs are emitted before commands, each
//! group in device-name order.

use super::messages::{CommandMessage, CommandState, ConfigMessage, Message};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlPayloadError {
    #[error("payload is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("payload is not a valid control message: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct ControlPayload {
    #[serde(default)]
    devices: BTreeMap<String, Map<String, Value>>,
    #[serde(default)]
    commands: BTreeMap<String, CommandEntry>,
}

#[derive(Debug, Deserialize)]
struct CommandEntry {
    id: i64,
    state: CommandState,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

/// Decode a raw payload into control messages.
///
/// An empty (or whitespace-only) payload is not an error and yields nothing.
pub fn decode_control_payload(payload: &[u8]) -> Result<Vec<Message>, ControlPayloadError> {
    let text = std::str::from_utf8(payload)?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let decoded: ControlPayload = serde_json::from_str(text)?;

    let configs = decoded
        .devices
        .into_iter()
        .map(|(device, config)| Message::Config(ConfigMessage { device, config }));
    let commands = decoded.commands.into_iter().map(|(device, entry)| {
        Message::Command(CommandMessage {
            device,
            id: entry.id,
            state: entry.state,
            timestamp: entry.timestamp,
        })
    });

    Ok(configs.chain(commands).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_empty_payload_yields_nothing() {
        assert!(decode_control_payload(b"").unwrap().is_empty());
        assert!(decode_control_payload(b"  \n").unwrap().is_empty());
    }

    #[test]
    fn test_empty_object_yields_nothing() {
        assert!(decode_control_payload(b"{}").unwrap().is_empty());
    }

    #[test]
    fn test_devices_become_config_messages() {
        let payload = br#"{"devices": {"sensor1": {"every": "10s"}, "sensor2": {"leds": "on"}}}"#;

        let messages = decode_control_payload(payload).unwrap();

        assert_eq!(messages.len(), 2);
        match &messages[0] {
            Message::Config(config) => {
                assert_eq!(config.device, "sensor1");
                assert_eq!(config.config.get("every"), Some(&json!("10s")));
            }
            other => panic!("expected config message, got {other:?}"),
        }
        assert!(matches!(&messages[1], Message::Config(c) if c.device == "sensor2"));
    }

    #[test]
    fn test_command_without_timestamp() {
        for payload in [
            br#"{"commands": {"mydevice": {"id": 1, "state": "new"}}}"#.as_slice(),
            br#"{"commands": {"mydevice": {"id": 1, "state": "new", "timestamp": null}}}"#
                .as_slice(),
        ] {
            let messages = decode_control_payload(payload).unwrap();
            assert_eq!(
                messages,
                vec![Message::Command(CommandMessage::new(
                    "mydevice",
                    1,
                    CommandState::New,
                    None
                ))]
            );
        }
    }

    #[test]
    fn test_command_with_fractional_timestamp() {
        let payload =
            br#"{"commands": {"mydevice": {"id": 1, "state": "ack", "timestamp": "2012-12-12T12:12:12.0012Z"}}}"#;

        let messages = decode_control_payload(payload).unwrap();

        let expected_time = Utc
            .with_ymd_and_hms(2012, 12, 12, 12, 12, 12)
            .unwrap()
            + chrono::Duration::microseconds(1200);
        assert_eq!(
            messages,
            vec![Message::Command(CommandMessage::new(
                "mydevice",
                1,
                CommandState::Ack,
                Some(expected_time)
            ))]
        );
    }

    #[test]
    fn test_configs_precede_commands() {
        let payload = br#"{
            "commands": {"a": {"id": 2, "state": "new"}},
            "devices": {"z": {}}
        }"#;

        let messages = decode_control_payload(payload).unwrap();

        assert!(matches!(messages[0], Message::Config(_)));
        assert!(matches!(messages[1], Message::Command(_)));
    }

    #[test]
    fn test_malformed_payloads_are_errors() {
        assert!(decode_control_payload(b"not json").is_err());
        assert!(decode_control_payload(br#"{"devices": {"d": "not an object"}}"#).is_err());
        assert!(decode_control_payload(br#"{"commands": {"d": {"state": "new"}}}"#).is_err());
        assert!(
            decode_control_payload(br#"{"commands": {"d": {"id": 1, "state": "done"}}}"#).is_err()
        );
        assert!(decode_control_payload(&[0xff, 0xfe]).is_err());
    }
}
