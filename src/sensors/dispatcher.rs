//! Applies inbound control messages to sensors
//!
//! Every failure here is turned into a [`LogMessage`] and published back as
//! telemetry. Config updates run on their own task, so a device that panics
//! while applying one is reported like any other config error.

use super::Sensors;
use crate::error::sanitize_error_message;
use crate::looper::Looper;
use crate::protocol::{CommandMessage, ConfigMessage, LogMessage, Message};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ControlDispatcher {
    sensors: Sensors,
}

impl ControlDispatcher {
    pub fn new(sensors: Sensors) -> Self {
        Self { sensors }
    }

    pub fn sensors(&self) -> &Sensors {
        &self.sensors
    }

    /// Apply one control message, returning the messages to publish
    pub async fn apply_control_message(&self, message: Message, looper: &Looper) -> Vec<Message> {
        match message {
            Message::Config(config) => self.apply_config_message(config).await,
            Message::Command(command) => self.apply_command_message(command, looper).await,
            other => {
                warn!(message_type = %other.message_type(), "Invalid control message");
                vec![LogMessage::error(format!("Invalid control message {other:?}")).into()]
            }
        }
    }

    pub async fn apply_config_message(&self, message: ConfigMessage) -> Vec<Message> {
        let Some(sensor) = self.sensors.get(&message.device) else {
            warn!(device = %message.device, "Unknown device in config");
            return vec![
                LogMessage::error(format!("Unknown device in config {}", message.device)).into(),
            ];
        };

        let config = message.config.clone();
        let result = tokio::spawn(async move { sensor.lock().await.update_config(&config) }).await;
        let reason = match result {
            Ok(Ok(())) => {
                info!(device = %message.device, "Applied config");
                return Vec::new();
            }
            Ok(Err(e)) => e.to_string(),
            Err(e) if e.is_panic() => "device panicked".to_string(),
            Err(e) => e.to_string(),
        };

        warn!(device = %message.device, error = %reason, "Config error");
        vec![LogMessage::error(sanitize_error_message(&format!(
            "Config error on {}: {reason}",
            message.device
        )))
        .into()]
    }

    /// Acknowledge and launch a command.
    ///
    /// The command runs as a detached task; the ack is returned before it
    /// completes.
    pub async fn apply_command_message(
        &self,
        message: CommandMessage,
        looper: &Looper,
    ) -> Vec<Message> {
        let Some(sensor) = self.sensors.get(&message.device) else {
            warn!(device = %message.device, "Unknown device in command");
            return vec![
                LogMessage::error(format!("Unknown device in command {}", message.device)).into(),
            ];
        };

        let command = {
            let mut guard = sensor.lock().await;
            let Some(capable) = guard.device_mut().commands() else {
                warn!(device = %message.device, "Device has no run_command");
                return vec![LogMessage::error(format!(
                    "Device {} has no run_command",
                    message.device
                ))
                .into()];
            };

            if !message.should_run() {
                debug!(device = %message.device, id = message.id, "Command already acknowledged");
                return Vec::new();
            }

            capable.run_command(looper.clone())
        };

        let device = message.device.clone();
        let id = message.id;
        let failures = looper.clone();
        tokio::spawn(async move {
            match command.await {
                Ok(()) => info!(device = %device, id, "Command completed"),
                Err(e) => {
                    error!(device = %device, id, error = %e, "Command failed");
                    failures
                        .send_queue()
                        .put(
                            LogMessage::error(sanitize_error_message(&format!(
                                "Command {id} failed on {device}: {e}"
                            )))
                            .into(),
                        )
                        .await;
                }
            }
        });

        info!(device = %message.device, id = message.id, "Command dispatched");
        vec![message.ack().into()]
    }

    /// Drain the config queue until stopped, publishing every response
    pub async fn run_update_config(&self, looper: &Looper) {
        debug!("Starting control dispatcher");
        while !looper.is_stopped() {
            let Some(message) = looper.config_queue().get().await else {
                break;
            };
            for response in self.apply_control_message(message, looper).await {
                looper.send_queue().put(response).await;
            }
        }
        debug!("Stopping control dispatcher");
    }
}
