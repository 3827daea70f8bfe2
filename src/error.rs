//! Crate-level error types
//!
//! Each layer owns its own error enum; `AgentError` aggregates them for the
//! agent lifecycle and the binary.

use crate::sensors::DeviceError;
use crate::transport::mqtt::MqttError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] MqttError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] crate::agent::LifecycleError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AgentError {
    /// Create internal error
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True when the error means the telemetry path is unusable
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::Transport(MqttError::SubscriptionDenied(_)) | AgentError::Config(_)
        )
    }
}

const MAX_MESSAGE_LEN: usize = 500;
const TRUNCATE_SUFFIX: &str = "...[truncated]";

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

static SECRET_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("secret path pattern is valid")
});

/// Sanitize a message before it leaves the process as telemetry.
///
/// Credentials written as `key=value` or `key: value` are masked, paths into
/// secret directories are redacted and the result is capped at 500 bytes.
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = SECRET_PATTERN.replace_all(message, "${1}=***");
    let mut sanitized = SECRET_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .into_owned();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let mut cut = MAX_MESSAGE_LEN - TRUNCATE_SUFFIX.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(TRUNCATE_SUFFIX);
    }

    sanitized
}

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;
