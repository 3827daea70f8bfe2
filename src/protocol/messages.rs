//! Message types exchanged with the bridge and between agent tasks
//!
//! Every message serializes as a flat JSON object carrying a `type` tag plus
//! the variant's fields, for example:
//!
//! ```
//! use bobnet_sensors::protocol::{CommandResponseMessage, Message};
//!
//! let message = Message::CommandResponse(CommandResponseMessage {
//!     device: "pump".to_string(),
//!     id: 7,
//!     state: "done".to_string(),
//! });
//! let json = serde_json::to_value(&message).unwrap();
//! assert_eq!(json["type"], "command_response");
//! assert_eq!(json["id"], 7);
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// How long an acknowledged command may stay unconfirmed before it is run again
pub const COMMAND_RETRY_WINDOW_HOURS: i64 = 2;

/// All messages handled by the agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Config(ConfigMessage),
    Command(CommandMessage),
    Data(DataMessage),
    CommandResponse(CommandResponseMessage),
    Log(LogMessage),
}

/// Wire tag of each [`Message`] variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Config,
    Command,
    Data,
    CommandResponse,
    Log,
}

impl MessageType {
    pub const ALL: [MessageType; 5] = [
        MessageType::Config,
        MessageType::Command,
        MessageType::Data,
        MessageType::CommandResponse,
        MessageType::Log,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Config => "config",
            MessageType::Command => "command",
            MessageType::Data => "data",
            MessageType::CommandResponse => "command_response",
            MessageType::Log => "log",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Config(_) => MessageType::Config,
            Message::Command(_) => MessageType::Command,
            Message::Data(_) => MessageType::Data,
            Message::CommandResponse(_) => MessageType::CommandResponse,
            Message::Log(_) => MessageType::Log,
        }
    }

    /// Serialize to the JSON payload published on the events topic
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Replacement configuration for one device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigMessage {
    pub device: String,
    pub config: Map<String, Value>,
}

impl ConfigMessage {
    pub fn new(device: impl Into<String>, config: Map<String, Value>) -> Self {
        Self {
            device: device.into(),
            config,
        }
    }
}

impl From<ConfigMessage> for Message {
    fn from(message: ConfigMessage) -> Self {
        Message::Config(message)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CommandState {
    New,
    Ack,
}

/// A remotely issued command together with its retry state.
///
/// `timestamp` records the last time the command was acknowledged; `None`
/// means it has never been attempted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandMessage {
    pub device: String,
    pub id: i64,
    pub state: CommandState,
    pub timestamp: Option<DateTime<Utc>>,
}

impl CommandMessage {
    pub fn new(
        device: impl Into<String>,
        id: i64,
        state: CommandState,
        timestamp: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            device: device.into(),
            id,
            state,
            timestamp,
        }
    }

    /// True for new commands, and for acknowledged commands whose last
    /// acknowledgement is at least [`COMMAND_RETRY_WINDOW_HOURS`] old.
    pub fn should_run(&self) -> bool {
        self.should_run_at(Utc::now())
    }

    pub fn should_run_at(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            CommandState::New => true,
            CommandState::Ack => match self.timestamp {
                Some(acked_at) => acked_at <= now - Duration::hours(COMMAND_RETRY_WINDOW_HOURS),
                // An ack without a time cannot be in the window
                None => true,
            },
        }
    }

    /// Copy of this command marked as acknowledged now
    pub fn ack(&self) -> CommandMessage {
        CommandMessage {
            device: self.device.clone(),
            id: self.id,
            state: CommandState::Ack,
            timestamp: Some(Utc::now()),
        }
    }
}

impl From<CommandMessage> for Message {
    fn from(message: CommandMessage) -> Self {
        Message::Command(message)
    }
}

/// A sensor reading
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataMessage {
    pub device: String,
    pub data: Map<String, Value>,
}

impl DataMessage {
    pub fn new(device: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            device: device.into(),
            data,
        }
    }
}

impl From<DataMessage> for Message {
    fn from(message: DataMessage) -> Self {
        Message::Data(message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResponseMessage {
    pub device: String,
    pub id: i64,
    pub state: String,
}

impl From<CommandResponseMessage> for Message {
    fn from(message: CommandResponseMessage) -> Self {
        Message::CommandResponse(message)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

/// Diagnostic published to the operator alongside telemetry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogMessage {
    pub message: String,
    pub level: LogLevel,
}

impl LogMessage {
    pub fn new(message: impl Into<String>, level: LogLevel) -> Self {
        Self {
            message: message.into(),
            level,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(message, LogLevel::Error)
    }
}

impl From<LogMessage> for Message {
    fn from(message: LogMessage) -> Self {
        Message::Log(message)
    }
}
