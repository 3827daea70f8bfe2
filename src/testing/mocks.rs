//! Mock implementations for testing
//!
//! Provides a mock Transport and a mock Device so the agent can be exercised
//! without a broker or hardware.

use crate::error::AgentError;
use crate::looper::Looper;
use crate::protocol::Message;
use crate::sensors::{CommandCapable, CommandFuture, Device, DeviceError};
use crate::transport::{mqtt::ConnectionState, Transport};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Mock transport for testing
#[derive(Debug)]
pub struct MockTransport {
    published: Mutex<Vec<Message>>,
    publish_attempts: AtomicUsize,
    fail_connect: AtomicBool,
    fail_publish: AtomicBool,
    state: Mutex<ConnectionState>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    activity: Notify,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            publish_attempts: AtomicUsize::new(0),
            fail_connect: AtomicBool::new(false),
            fail_publish: AtomicBool::new(false),
            state: Mutex::new(ConnectionState::Disconnected("Not connected".to_string())),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            activity: Notify::new(),
        }
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        let transport = Self::default();
        transport.fail_connect.store(true, Ordering::SeqCst);
        transport
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Force a connection state, e.g. to simulate a denied subscription
    pub fn set_connection_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        self.activity.notify_waiters();
    }

    pub fn published(&self) -> Vec<Message> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn publish_attempts(&self) -> usize {
        self.publish_attempts.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` messages were published successfully
    pub async fn wait_for_published(&self, count: usize) {
        while self.published().len() < count {
            let _ = tokio::time::timeout(WAIT_POLL_INTERVAL, self.activity.notified()).await;
        }
    }

    /// Wait until at least `count` publishes were attempted
    pub async fn wait_for_attempts(&self, count: usize) {
        while self.publish_attempts() < count {
            let _ = tokio::time::timeout(WAIT_POLL_INTERVAL, self.activity.notified()).await;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = AgentError;

    async fn connect(&self) -> Result<(), Self::Error> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(AgentError::internal_error("Mock connection failure"));
        }
        self.set_connection_state(ConnectionState::Subscribed);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.set_connection_state(ConnectionState::Disconnected(
            "Client disconnected".to_string(),
        ));
        Ok(())
    }

    async fn publish(&self, message: &Message) -> Result<(), Self::Error> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);
        let result = if self.fail_publish.load(Ordering::SeqCst) {
            Err(AgentError::internal_error("Mock publish failure"))
        } else {
            self.published
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(message.clone());
            Ok(())
        };
        self.activity.notify_waiters();
        result
    }

    fn connection_state(&self) -> ConnectionState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_fatally_disconnected(&self) -> bool {
        self.connection_state().is_fatal()
    }
}

#[derive(Debug, Default)]
struct MockDeviceState {
    reads: usize,
    config_updates: Vec<Map<String, Value>>,
    command_runs: usize,
}

/// Mock device recording everything done to it.
///
/// Clones share state, so a test can keep one clone while the sensor owns
/// another.
#[derive(Debug, Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<MockDeviceState>>,
    accepts_commands: bool,
    config_error: Option<String>,
    config_panics: bool,
    command_error: Option<String>,
}

impl MockDevice {
    /// Device without command capability
    pub fn new() -> Self {
        Self::default()
    }

    /// Device with command capability
    pub fn with_commands() -> Self {
        Self {
            accepts_commands: true,
            ..Self::default()
        }
    }

    /// Every config update fails with `reason`
    pub fn failing_config(mut self, reason: impl Into<String>) -> Self {
        self.config_error = Some(reason.into());
        self
    }

    /// Every config update panics
    pub fn panicking_config(mut self) -> Self {
        self.config_panics = true;
        self
    }

    /// Every command run fails with `reason`
    pub fn failing_command(mut self, reason: impl Into<String>) -> Self {
        self.accepts_commands = true;
        self.command_error = Some(reason.into());
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockDeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reads(&self) -> usize {
        self.lock().reads
    }

    pub fn config_updates(&self) -> Vec<Map<String, Value>> {
        self.lock().config_updates.clone()
    }

    pub fn command_runs(&self) -> usize {
        self.lock().command_runs
    }
}

impl Device for MockDevice {
    fn value(&mut self) -> Value {
        let mut state = self.lock();
        state.reads += 1;
        json!({"reads": state.reads})
    }

    fn update_config(&mut self, config: &Map<String, Value>) -> Result<(), DeviceError> {
        self.lock().config_updates.push(config.clone());
        if self.config_panics {
            panic!("mock device config panic");
        }
        match &self.config_error {
            Some(reason) => Err(DeviceError::InvalidConfig(reason.clone())),
            None => Ok(()),
        }
    }

    fn commands(&mut self) -> Option<&mut dyn CommandCapable> {
        if self.accepts_commands {
            Some(self)
        } else {
            None
        }
    }
}

impl CommandCapable for MockDevice {
    fn run_command(&mut self, _looper: Looper) -> CommandFuture {
        let state = Arc::clone(&self.state);
        let error = self.command_error.clone();
        Box::pin(async move {
            state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .command_runs += 1;
            match error {
                Some(reason) => Err(DeviceError::CommandFailed(reason)),
                None => Ok(()),
            }
        })
    }
}
