//! Transport layer for bridge communication
//!
//! This module provides the transport abstraction, its MQTT implementation
//! and the send loop that drains the outbound queue into a transport.

use crate::looper::Looper;
use crate::protocol::Message;
use tracing::{debug, error};

pub mod mqtt;

pub use mqtt::ConnectionState;

/// Transport trait for bridge communication
///
/// This trait provides an abstraction over the pub/sub connection so the
/// agent can be driven by a mock in tests.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Connect and wait until the broker accepts the connection
    async fn connect(&self) -> Result<(), Self::Error>;

    /// Disconnect from the broker
    async fn disconnect(&self) -> Result<(), Self::Error>;

    /// Publish one outbound message
    async fn publish(&self, message: &Message) -> Result<(), Self::Error>;

    /// Get current connection state
    fn connection_state(&self) -> ConnectionState;

    /// Check if the connection hit a condition that reconnecting cannot fix
    fn is_fatally_disconnected(&self) -> bool;
}

/// Type alias for MQTT transport
pub type MqttTransport = mqtt::MqttConnection;

/// Publish everything queued for sending until the looper stops.
///
/// A failed publish is logged and the message is dropped; the connection
/// reconnects on its own.
pub async fn run_send<T>(transport: &T, looper: &Looper)
where
    T: Transport + ?Sized,
{
    debug!("Starting send loop");
    while !looper.is_stopped() {
        let Some(message) = looper.send_queue().get().await else {
            break;
        };
        if let Err(e) = transport.publish(&message).await {
            error!(message_type = %message.message_type(), error = %e, "Failed to publish message");
        }
    }
    debug!("Stopping send loop");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DataMessage, LogMessage};
    use crate::testing::mocks::MockTransport;
    use serde_json::Map;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_run_send_publishes_in_order() {
        let transport = Arc::new(MockTransport::new());
        let looper = Looper::new();

        looper
            .send_queue()
            .put(DataMessage::new("a", Map::new()).into())
            .await;
        looper.send_queue().put(LogMessage::error("b").into()).await;

        let task = {
            let transport = Arc::clone(&transport);
            let looper = looper.clone();
            tokio::spawn(async move { run_send(transport.as_ref(), &looper).await })
        };

        transport.wait_for_published(2).await;
        looper.stop();
        task.await.unwrap();

        let published = transport.published();
        assert_eq!(published.len(), 2);
        assert!(matches!(published[0], Message::Data(_)));
        assert!(matches!(published[1], Message::Log(_)));
    }

    #[tokio::test]
    async fn test_run_send_survives_publish_failures() {
        let transport = Arc::new(MockTransport::new());
        transport.set_fail_publish(true);
        let looper = Looper::new();

        let task = {
            let transport = Arc::clone(&transport);
            let looper = looper.clone();
            tokio::spawn(async move { run_send(transport.as_ref(), &looper).await })
        };

        looper.send_queue().put(LogMessage::error("lost").into()).await;
        transport.wait_for_attempts(1).await;

        transport.set_fail_publish(false);
        looper.send_queue().put(LogMessage::error("kept").into()).await;
        transport.wait_for_published(1).await;

        looper.stop();
        task.await.unwrap();
        assert_eq!(
            transport.published(),
            vec![Message::from(LogMessage::error("kept"))]
        );
    }

    #[tokio::test]
    async fn test_run_send_exits_when_stopped() {
        let transport = MockTransport::new();
        let looper = Looper::new();
        looper.stop();

        run_send(&transport, &looper).await;
        assert!(transport.published().is_empty());
    }
}
