//! Pure connection state management for the MQTT bridge connection
//!
//! This module contains the connection state machine, the transport error
//! type and the construction of `rumqttc` options from connection settings.

use super::credentials::{create_jwt, load_ca_certs, load_private_key};
use crate::config::IotCoreSection;
use crate::protocol::TopicBuilder;
use rumqttc::{MqttOptions, Transport as RumqttcTransport};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// How long `connect` and `publish` wait for the broker
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between consecutive failed reconnection attempts
pub const RECONNECT_DELAY: Duration = Duration::from_millis(250);

/// The bridge authenticates with the token alone
pub const MQTT_USERNAME: &str = "unused";

const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Connection state for the bridge connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Not connected, with the reason
    Disconnected(String),
    /// Connection or reconnection in progress
    Connecting,
    /// ConnAck received
    Connected,
    /// Control topic subscription granted
    Subscribed,
    /// Broker refused the control topic subscription; never retried
    SubscriptionDenied(String),
}

impl ConnectionState {
    /// Whether messages can be published in this state
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Subscribed)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectionState::SubscriptionDenied(_))
    }
}

/// Events driving the connection state machine
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    ConnAckReceived,
    SubscriptionGranted,
    SubscriptionRejected(String),
    Disconnected(String),
    ReconnectionStarted,
}

/// Next connection state after an event.
///
/// `SubscriptionDenied` is terminal: no event moves the connection out of it.
pub fn next_state(current: &ConnectionState, event: ConnectionEvent) -> ConnectionState {
    if current.is_fatal() {
        return current.clone();
    }
    match event {
        ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
        ConnectionEvent::SubscriptionGranted => match current {
            ConnectionState::Connected | ConnectionState::Subscribed => ConnectionState::Subscribed,
            other => other.clone(),
        },
        ConnectionEvent::SubscriptionRejected(topic) => ConnectionState::SubscriptionDenied(topic),
        ConnectionEvent::Disconnected(reason) => ConnectionState::Disconnected(reason),
        ConnectionEvent::ReconnectionStarted => ConnectionState::Connecting,
    }
}

/// Delay before the next reconnection attempt.
///
/// The first attempt after a drop is immediate.
pub fn reconnect_delay(consecutive_failures: u32) -> Duration {
    if consecutive_failures == 0 {
        Duration::ZERO
    } else {
        RECONNECT_DELAY
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Timed out waiting for connection")]
    ConnectionTimeout,
    #[error("Subscription denied for {0}")]
    SubscriptionDenied(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Credential error: {0}")]
    Credentials(String),
    #[error("CA certificate error: {0}")]
    CaCertificates(String),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Serialization error")]
    SerializationError(#[from] serde_json::Error),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
}

/// Everything needed to (re)build a connection
#[derive(Clone)]
pub struct ConnectionSettings {
    pub project_id: String,
    pub device_id: String,
    pub client_id: String,
    pub broker_url: String,
    pub private_key: Vec<u8>,
    /// CA bundle, required for `mqtts` brokers
    pub ca_certs: Option<Vec<u8>>,
}

impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("project_id", &self.project_id)
            .field("device_id", &self.device_id)
            .field("client_id", &self.client_id)
            .field("broker_url", &self.broker_url)
            .field("private_key", &"***")
            .field("ca_certs", &self.ca_certs.as_ref().map(Vec::len))
            .finish()
    }
}

impl ConnectionSettings {
    /// Resolve credentials for the configured bridge.
    ///
    /// The CA bundle is only loaded (and downloaded if missing) for TLS
    /// brokers.
    pub async fn from_config(section: &IotCoreSection) -> Result<Self, MqttError> {
        let url = parse_broker_url(&section.broker_url)?;
        let private_key = load_private_key(section).await?;
        let ca_certs = if url.scheme() == "mqtts" {
            Some(load_ca_certs(&section.ca_certs_path).await?)
        } else {
            None
        };

        Ok(Self {
            project_id: section.project_id.clone(),
            device_id: section.device_id.clone(),
            client_id: TopicBuilder::build_client_id(
                &section.project_id,
                &section.region,
                &section.registry_id,
                &section.device_id,
            ),
            broker_url: section.broker_url.clone(),
            private_key,
            ca_certs,
        })
    }

    pub fn config_topic(&self) -> String {
        TopicBuilder::build_config_topic(&self.device_id)
    }

    pub fn events_topic(&self) -> String {
        TopicBuilder::build_events_topic(&self.device_id)
    }
}

fn parse_broker_url(broker_url: &str) -> Result<Url, MqttError> {
    let url =
        Url::parse(broker_url).map_err(|_| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;
    match url.scheme() {
        "mqtt" | "mqtts" => Ok(url),
        _ => Err(MqttError::InvalidBrokerUrl(broker_url.to_string())),
    }
}

/// Build `rumqttc` options for one connection attempt.
///
/// A fresh token is signed on every call, so every reconnection
/// authenticates with a token valid for the full hour.
pub fn configure_mqtt_options(settings: &ConnectionSettings) -> Result<MqttOptions, MqttError> {
    let url = parse_broker_url(&settings.broker_url)?;

    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(settings.broker_url.clone()))?;
    let port = url
        .port()
        .unwrap_or(if url.scheme() == "mqtts" { 8883 } else { 1883 });

    let mut mqtt_options = MqttOptions::new(settings.client_id.clone(), host, port);

    if url.scheme() == "mqtts" {
        let ca = settings.ca_certs.clone().ok_or_else(|| {
            MqttError::CaCertificates("TLS broker configured without CA certificates".to_string())
        })?;
        mqtt_options.set_transport(RumqttcTransport::tls(ca, None, None));
    }

    let password = create_jwt(&settings.project_id, &settings.private_key)?;
    mqtt_options.set_credentials(MQTT_USERNAME, password);
    mqtt_options.set_keep_alive(KEEP_ALIVE);
    mqtt_options.set_clean_session(true);

    Ok(mqtt_options)
}
