//! Topic and client identity construction for the device bridge
//!
//! Topics follow the bridge's per-device layout:
//! `/devices/{device_id}/config` inbound and `/devices/{device_id}/events`
//! outbound.

use thiserror::Error;

/// Topic and client id construction functions
pub struct TopicBuilder;

impl TopicBuilder {
    /// Build inbound control topic: `/devices/{device_id}/config`
    pub fn build_config_topic(device_id: &str) -> String {
        format!("/devices/{device_id}/config")
    }

    /// Build outbound telemetry topic: `/devices/{device_id}/events`
    pub fn build_events_topic(device_id: &str) -> String {
        format!("/devices/{device_id}/events")
    }

    /// Build client identity:
    /// `projects/{project}/locations/{region}/registries/{registry}/devices/{device}`
    pub fn build_client_id(project_id: &str, region: &str, registry_id: &str, device_id: &str) -> String {
        format!(
            "projects/{project_id}/locations/{region}/registries/{registry_id}/devices/{device_id}"
        )
    }
}

pub fn validate_device_id(device_id: &str) -> Result<(), ValidationError> {
    if device_id.is_empty() {
        return Err(ValidationError::EmptyDeviceId);
    }

    for ch in device_id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidDeviceIdChar(ch));
        }
    }

    Ok(())
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Device ID cannot be empty")]
    EmptyDeviceId,
    #[error("Device ID contains invalid character: '{0}'")]
    InvalidDeviceIdChar(char),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_topic_construction() {
        assert_eq!(TopicBuilder::build_config_topic("test01"), "/devices/test01/config");
        assert_eq!(TopicBuilder::build_events_topic("test01"), "/devices/test01/events");
    }

    #[test]
    fn test_client_id() {
        assert_eq!(
            TopicBuilder::build_client_id("test-project", "europe-west1", "test-registry", "test01"),
            "projects/test-project/locations/europe-west1/registries/test-registry/devices/test01"
        );
    }

    #[test]
    fn test_device_id_validation() {
        assert!(validate_device_id("node-01.kitchen_a").is_ok());
        assert_eq!(validate_device_id(""), Err(ValidationError::EmptyDeviceId));
        assert_eq!(
            validate_device_id("node/01"),
            Err(ValidationError::InvalidDeviceIdChar('/'))
        );
    }

    proptest! {
        #[test]
        fn valid_device_ids_produce_single_segment_topics(id in "[a-zA-Z0-9._-]{1,32}") {
            prop_assert!(validate_device_id(&id).is_ok());
            let topic = TopicBuilder::build_events_topic(&id);
            prop_assert_eq!(topic.split('/').count(), 4);
        }
    }
}
