//! Pure message routing and processing logic for MQTT events
//!
//! This module maps raw `rumqttc` events to routing decisions and turns
//! inbound control payloads into queued control messages.

use crate::error::sanitize_error_message;
use crate::looper::Looper;
use crate::protocol::{decode_control_payload, LogMessage};
use bytes::Bytes;
use rumqttc::{Event, Packet, SubscribeReasonCode};
use tracing::{debug, warn};

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Connection acknowledged - ready to subscribe and publish
    ConnectionAcknowledged,
    /// Message received on a subscribed topic
    MessageReceived { topic: String, payload: Bytes },
    /// Broker sent a disconnect
    Disconnected,
    /// Every requested subscription was granted
    SubscriptionConfirmed { packet_id: u16 },
    /// At least one requested subscription was refused
    SubscriptionRejected { packet_id: u16 },
    /// Infrastructure event (PingResp, PubAck, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// Route an MQTT event to the handling it needs
pub fn route_mqtt_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(incoming) => match incoming {
            Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
            Packet::Publish(publish) => EventRoute::MessageReceived {
                topic: publish.topic.clone(),
                payload: publish.payload.clone(),
            },
            Packet::Disconnect => EventRoute::Disconnected,
            Packet::SubAck(suback) => {
                if suback
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    EventRoute::SubscriptionRejected {
                        packet_id: suback.pkid,
                    }
                } else {
                    EventRoute::SubscriptionConfirmed {
                        packet_id: suback.pkid,
                    }
                }
            }
            other => EventRoute::InfrastructureEvent(format!("{other:?}")),
        },
        Event::Outgoing(_) => EventRoute::OutgoingEvent,
    }
}

/// Whether a received message is for the control topic
pub fn should_process_message(topic: &str, expected_topic: &str) -> bool {
    if topic != expected_topic {
        debug!("Topic mismatch: expected {}, got {}", expected_topic, topic);
        return false;
    }
    true
}

/// Decode a control payload and queue the result.
///
/// Runs on the connection's event-loop task, so only the synchronous queue
/// path is used. Decoded messages go to the config queue; an undecodable
/// payload becomes an error log on the send queue. Returns the number of
/// control messages queued.
pub fn handle_control_payload(payload: &[u8], looper: &Looper) -> usize {
    match decode_control_payload(payload) {
        Ok(messages) => {
            let count = messages.len();
            for message in messages {
                looper.config_queue().put_sync(message);
            }
            debug!(count, "Queued control messages");
            count
        }
        Err(e) => {
            warn!(error = %e, "Invalid control payload");
            looper.send_queue().put_sync(
                LogMessage::error(sanitize_error_message(&format!(
                    "Invalid control message {}",
                    String::from_utf8_lossy(payload)
                )))
                .into(),
            );
            0
        }
    }
}
