//! Device capability contract and the device type registry

use crate::looper::Looper;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by devices and the sensor layer
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid time format {0}")]
    InvalidInterval(String),

    #[error("Unknown device type: {0}")]
    UnknownDeviceType(String),

    #[error("{0}")]
    CommandFailed(String),
}

/// Detached command execution, spawned by the dispatcher
pub type CommandFuture = Pin<Box<dyn Future<Output = Result<(), DeviceError>> + Send + 'static>>;

/// Optional capability of devices that accept remote commands
pub trait CommandCapable: Send {
    /// Prepare one command run. The returned future must own everything it
    /// touches; the caller does not await it.
    fn run_command(&mut self, looper: Looper) -> CommandFuture;
}

/// A local sensing device polled by a [`Sensor`](super::Sensor)
pub trait Device: Send + fmt::Debug {
    /// Current reading
    fn value(&mut self) -> Value;

    /// Apply a live configuration change
    fn update_config(&mut self, _config: &Map<String, Value>) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Command capability, if the device has one
    fn commands(&mut self) -> Option<&mut dyn CommandCapable> {
        None
    }
}

/// Builds a device from the options of its `[sensors.<name>]` table
pub type DeviceFactory =
    Arc<dyn Fn(&Map<String, Value>) -> Result<Box<dyn Device>, DeviceError> + Send + Sync>;

/// Device implementations keyed by device type string
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    factories: HashMap<String, DeviceFactory>,
}

impl DeviceRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in device type
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("counter", |options| {
            Ok(Box::new(super::counter::CounterDevice::from_options(options)?) as Box<dyn Device>)
        });
        registry
    }

    pub fn register<F>(&mut self, device_type: impl Into<String>, factory: F)
    where
        F: Fn(&Map<String, Value>) -> Result<Box<dyn Device>, DeviceError> + Send + Sync + 'static,
    {
        self.factories.insert(device_type.into(), Arc::new(factory));
    }

    pub fn create(
        &self,
        device_type: &str,
        options: &Map<String, Value>,
    ) -> Result<Box<dyn Device>, DeviceError> {
        let factory = self
            .factories
            .get(device_type)
            .ok_or_else(|| DeviceError::UnknownDeviceType(device_type.to_string()))?;
        factory(options)
    }

    pub fn device_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("device_types", &self.device_types())
            .finish()
    }
}
