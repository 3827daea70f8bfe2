//! Agent lifecycle management
//!
//! Connects the transport, runs one poller per sensor plus the send and
//! control loops, and tears everything down on shutdown.

use crate::looper::Looper;
use crate::sensors::{ControlDispatcher, Sensor, Sensors};
use crate::transport::{run_send, ConnectionState, Transport};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// How long shutdown waits for tasks before aborting them
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

const FATAL_STATE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Why [`AgentLifecycle::wait_for_shutdown`] returned
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// The shutdown future resolved
    Signal,
    /// The transport can no longer deliver telemetry
    TransportFailure(ConnectionState),
}

/// Agent lifecycle management with dependency injection
pub struct AgentLifecycle<T>
where
    T: Transport + 'static,
{
    looper: Looper,
    transport: Arc<T>,
    dispatcher: ControlDispatcher,
    tasks: Vec<JoinHandle<()>>,
}

impl<T> AgentLifecycle<T>
where
    T: Transport + 'static,
{
    /// Create a lifecycle manager. `looper` must be the one the transport
    /// queues inbound control messages on.
    pub fn new(transport: T, sensors: Sensors, looper: Looper) -> Self {
        Self {
            looper,
            transport: Arc::new(transport),
            dispatcher: ControlDispatcher::new(sensors),
            tasks: Vec::new(),
        }
    }

    pub fn looper(&self) -> &Looper {
        &self.looper
    }

    /// Get the transport instance for testing
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn sensors(&self) -> &Sensors {
        self.dispatcher.sensors()
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Check if the transport connection is fatally disconnected
    pub fn is_fatally_disconnected(&self) -> bool {
        self.transport.is_fatally_disconnected()
    }

    /// Connect and spawn every long-running task
    pub async fn start(&mut self) -> Result<(), LifecycleError> {
        if self.is_running() {
            return Err(LifecycleError::AlreadyStarted);
        }
        if self.looper.is_stopped() {
            return Err(LifecycleError::Stopped);
        }

        info!(sensors = self.sensors().len(), "Starting agent");

        self.transport
            .connect()
            .await
            .map_err(|e| LifecycleError::TransportError(Box::new(e)))?;
        info!("Transport connected");

        for sensor in self.dispatcher.sensors().iter() {
            self.tasks
                .push(tokio::spawn(Sensor::run(Arc::clone(sensor), self.looper.clone())));
        }

        let transport = Arc::clone(&self.transport);
        let looper = self.looper.clone();
        self.tasks.push(tokio::spawn(async move {
            run_send(transport.as_ref(), &looper).await;
        }));

        let dispatcher = self.dispatcher.clone();
        let looper = self.looper.clone();
        self.tasks.push(tokio::spawn(async move {
            dispatcher.run_update_config(&looper).await;
        }));

        info!(tasks = self.tasks.len(), "Agent started");
        Ok(())
    }

    /// Wait for `signal` or for the transport to fail fatally
    pub async fn wait_for_shutdown<F>(&self, signal: F) -> ShutdownReason
    where
        F: Future<Output = ()>,
    {
        let transport = Arc::clone(&self.transport);
        let fatal = async move {
            let mut interval = tokio::time::interval(FATAL_STATE_POLL_INTERVAL);
            loop {
                interval.tick().await;
                if transport.is_fatally_disconnected() {
                    return transport.connection_state();
                }
            }
        };

        tokio::select! {
            _ = signal => ShutdownReason::Signal,
            state = fatal => {
                error!(state = ?state, "Transport failed fatally");
                ShutdownReason::TransportFailure(state)
            }
        }
    }

    /// Stop every task, then disconnect the transport
    pub async fn shutdown(&mut self) -> Result<(), LifecycleError> {
        info!("Shutting down agent");
        self.looper.stop();

        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        for mut handle in self.tasks.drain(..) {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if !e.is_cancelled() => error!("Task shutdown error: {}", e),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("Task didn't stop in time, aborting");
                    handle.abort();
                }
            }
        }

        if let Err(e) = self.transport.disconnect().await {
            warn!("Transport disconnect failed: {}", e);
        }

        info!("Agent shutdown complete");
        Ok(())
    }
}

/// Agent lifecycle errors
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Transport error")]
    TransportError(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Agent already started")]
    AlreadyStarted,
    #[error("Agent was stopped and cannot be restarted")]
    Stopped,
}
