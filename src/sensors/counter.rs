//! Counting device, the hardware-free built-in driver

use super::device::{CommandCapable, CommandFuture, Device, DeviceError};
use crate::looper::Looper;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Yields `start`, `start + 1`, ... on successive reads.
///
/// The `reset` command sets the count back to `start`.
#[derive(Debug, Clone)]
pub struct CounterDevice {
    start: i64,
    count: Arc<AtomicI64>,
}

impl CounterDevice {
    pub fn new(start: i64) -> Self {
        Self {
            start,
            count: Arc::new(AtomicI64::new(start)),
        }
    }

    /// Build from sensor options; only `start` is accepted
    pub fn from_options(options: &Map<String, Value>) -> Result<Self, DeviceError> {
        if let Some(unexpected) = options.keys().find(|key| key.as_str() != "start") {
            return Err(DeviceError::InvalidConfig(format!(
                "unexpected counter option {unexpected}"
            )));
        }
        let start = match options.get("start") {
            Some(value) => parse_start(value)?,
            None => 0,
        };
        Ok(Self::new(start))
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    /// Peek at the next value without consuming it
    pub fn current(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }
}

fn parse_start(value: &Value) -> Result<i64, DeviceError> {
    value
        .as_i64()
        .ok_or_else(|| DeviceError::InvalidConfig(format!("start must be an integer, got {value}")))
}

impl Device for CounterDevice {
    fn value(&mut self) -> Value {
        json!(self.count.fetch_add(1, Ordering::SeqCst))
    }

    fn update_config(&mut self, config: &Map<String, Value>) -> Result<(), DeviceError> {
        if let Some(value) = config.get("start") {
            self.start = parse_start(value)?;
        }
        Ok(())
    }

    fn commands(&mut self) -> Option<&mut dyn CommandCapable> {
        Some(self)
    }
}

impl CommandCapable for CounterDevice {
    fn run_command(&mut self, _looper: Looper) -> CommandFuture {
        let count = Arc::clone(&self.count);
        let start = self.start;
        Box::pin(async move {
            count.store(start, Ordering::SeqCst);
            debug!(start, "Counter reset");
            Ok(())
        })
    }
}
