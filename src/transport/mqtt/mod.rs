//! MQTT connection to the device bridge
//!
//! The implementation separates pure functions from I/O:
//!
//! - [`connection`] - connection state machine, errors and client options
//! - [`credentials`] - signing key, connection tokens and CA bundle
//! - [`message_handler`] - event routing and control payload handling
//! - [`client`] - the connection itself and its reconnection supervisor
//!
//! # Usage
//!
//! ```rust,no_run
//! use bobnet_sensors::config::SensorsConfig;
//! use bobnet_sensors::looper::Looper;
//! use bobnet_sensors::transport::mqtt::{ConnectionSettings, MqttConnection};
//! use std::path::Path;
//!
//! # tokio_test::block_on(async {
//! let config = SensorsConfig::load_from_file(Path::new("bobnet.toml"))?;
//! let settings = ConnectionSettings::from_config(&config.iotcore).await?;
//!
//! let connection = MqttConnection::new(settings, Looper::new());
//! connection.connect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod credentials;
pub mod message_handler;

pub use client::MqttConnection;
pub use connection::{
    ConnectionEvent, ConnectionSettings, ConnectionState, MqttError, CONNECT_TIMEOUT,
    MQTT_USERNAME, RECONNECT_DELAY,
};
pub use credentials::{create_jwt, load_ca_certs, load_ca_certs_from, load_private_key, Claims};
pub use message_handler::{handle_control_payload, route_mqtt_event, EventRoute};
