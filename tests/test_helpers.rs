//! Test helpers and utilities for integration tests

use bobnet_sensors::config::SensorsConfig;
use bobnet_sensors::sensors::{Sensor, Sensors};
use bobnet_sensors::testing::mocks::MockDevice;
use std::path::Path;

#[allow(dead_code)]
pub const PRIVATE_KEY_PEM: &str = include_str!("fixtures/rsa_private.pem");
#[allow(dead_code)]
pub const ROOTS_PEM: &str = include_str!("fixtures/roots.pem");

/// Config TOML pointing at the fixture key, with one counter sensor
#[allow(dead_code)]
pub fn config_toml(broker_url: &str, ca_certs_path: &Path) -> String {
    format!(
        r#"
[iotcore]
region = "europe-west1"
project_id = "test-project"
registry_id = "test-registry"
device_id = "test01"
private_key_path = "{key}"
ca_certs_path = "{ca}"
broker_url = "{broker_url}"

[sensors.counter1]
device = "counter"
every = "10s"
start = 3
"#,
        key = fixture_path("rsa_private.pem").display(),
        ca = ca_certs_path.display(),
    )
}

/// Create a test configuration for integration tests
#[allow(dead_code)]
pub fn test_config(broker_url: &str) -> SensorsConfig {
    SensorsConfig::from_toml_str(&config_toml(broker_url, &fixture_path("roots.pem")))
        .expect("test config should be valid")
}

#[allow(dead_code)]
pub fn fixture_path(name: &str) -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// Sensors backed by the given mock devices, polled every 10s
#[allow(dead_code)]
pub fn mock_sensors(devices: Vec<(&str, MockDevice)>) -> Sensors {
    let mut sensors = Sensors::new();
    for (name, device) in devices {
        sensors.insert(
            Sensor::new(name, Some("10s"), Box::new(device)).expect("10s is a valid interval"),
        );
    }
    sensors
}
