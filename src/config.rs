//! Configuration for a sensor node
//!
//! A node is configured from a single TOML file with an `[iotcore]` section
//! describing the bridge connection and one `[sensors.<name>]` table per
//! polled sensor.

use crate::protocol::validate_device_id;
use crate::sensors::parse_time;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_BROKER_URL: &str = "mqtts://mqtt.googleapis.com:8883";

/// Main node configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorsConfig {
    pub iotcore: IotCoreSection,
    #[serde(default)]
    pub sensors: BTreeMap<String, SensorSection>,
}

/// Bridge connection section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IotCoreSection {
    pub region: String,
    pub project_id: String,
    pub registry_id: String,
    pub device_id: String,
    /// Inline PEM private key, takes precedence over `private_key_path`
    pub private_key: Option<String>,
    pub private_key_path: Option<PathBuf>,
    /// CA bundle location, downloaded on first use if missing
    pub ca_certs_path: PathBuf,
    /// Broker URL with protocol and port
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
}

fn default_broker_url() -> String {
    DEFAULT_BROKER_URL.to_string()
}

/// One polled sensor: the device type, its polling interval and any
/// device-specific options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorSection {
    pub device: String,
    pub every: Option<String>,
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid device ID: {0}")]
    InvalidDeviceId(String),
    #[error("One of private_key or private_key_path must be set")]
    MissingPrivateKey,
    #[error("Invalid interval for sensor {sensor}: {reason}")]
    InvalidInterval { sensor: String, reason: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SensorsConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SensorsConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("region", &self.iotcore.region),
            ("project_id", &self.iotcore.project_id),
            ("registry_id", &self.iotcore.registry_id),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(format!("{field} cannot be empty")));
            }
        }

        validate_device_id(&self.iotcore.device_id)
            .map_err(|e| ConfigError::InvalidDeviceId(format!("{}: {e}", self.iotcore.device_id)))?;

        if self.iotcore.private_key.is_none() && self.iotcore.private_key_path.is_none() {
            return Err(ConfigError::MissingPrivateKey);
        }

        for (name, sensor) in &self.sensors {
            if let Some(every) = &sensor.every {
                parse_time(every).map_err(|e| ConfigError::InvalidInterval {
                    sensor: name.clone(),
                    reason: e.to_string(),
                })?;
            }
        }

        Ok(())
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[iotcore]
region = "europe-west1"
project_id = "test-project"
registry_id = "test-registry"
device_id = "test01"
private_key = "not a real key"
ca_certs_path = "./roots.pem"

[sensors.counter1]
device = "counter"
every = "10s"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}
