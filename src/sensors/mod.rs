//! Sensors: polled devices and the control dispatcher that reconfigures them
//!
//! A [`Sensor`] wraps one [`Device`] with a name and a polling interval.
//! Sensors are shared between their poller task and the
//! [`ControlDispatcher`], which is the only other party that mutates them.

pub mod counter;
pub mod device;
pub mod dispatcher;

pub use counter::CounterDevice;
pub use device::{CommandCapable, CommandFuture, Device, DeviceError, DeviceFactory, DeviceRegistry};
pub use dispatcher::ControlDispatcher;

use crate::config::SensorSection;
use crate::looper::Looper;
use crate::protocol::DataMessage;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, Instrument};

pub const DEFAULT_INTERVAL: &str = "30s";

static INTERVAL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+(?:\.\d+)?)(s|m|h)$").expect("interval pattern is valid"));

/// Parse an interval such as `10s`, `1.5m` or `2h`
pub fn parse_time(text: &str) -> Result<Duration, DeviceError> {
    let captures = INTERVAL_PATTERN
        .captures(text)
        .ok_or_else(|| DeviceError::InvalidInterval(text.to_string()))?;

    let amount: f64 = captures[1]
        .parse()
        .map_err(|_| DeviceError::InvalidInterval(text.to_string()))?;
    let multiplier = match &captures[2] {
        "s" => 1.0,
        "m" => 60.0,
        _ => 60.0 * 60.0,
    };

    Duration::try_from_secs_f64(amount * multiplier)
        .map_err(|_| DeviceError::InvalidInterval(text.to_string()))
}

pub type SharedSensor = Arc<Mutex<Sensor>>;

/// A named device polled at a fixed interval
#[derive(Debug)]
pub struct Sensor {
    name: String,
    every: Duration,
    device: Box<dyn Device>,
}

impl Sensor {
    pub fn new(name: impl Into<String>, every: Option<&str>, device: Box<dyn Device>) -> Result<Self, DeviceError> {
        let every = parse_time(every.unwrap_or(DEFAULT_INTERVAL))?;
        let sensor = Self {
            name: name.into(),
            every,
            device,
        };
        debug!(sensor = %sensor.name, every = ?sensor.every, device = ?sensor.device, "Created sensor");
        Ok(sensor)
    }

    /// Build from a `[sensors.<name>]` table
    pub fn from_section(
        name: &str,
        section: &SensorSection,
        registry: &DeviceRegistry,
    ) -> Result<Self, DeviceError> {
        let device = registry.create(&section.device, &section.options)?;
        Self::new(name, section.every.as_deref(), device)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn every(&self) -> Duration {
        self.every
    }

    pub fn device_mut(&mut self) -> &mut dyn Device {
        self.device.as_mut()
    }

    /// Apply a live configuration change.
    ///
    /// A non-empty `every` is re-parsed first, then the device sees the whole
    /// config. The interval change is kept even if the device rejects it.
    pub fn update_config(&mut self, config: &Map<String, Value>) -> Result<(), DeviceError> {
        debug!(sensor = %self.name, ?config, "Updating sensor config");
        match config.get("every") {
            None | Some(Value::Null) => {}
            Some(Value::String(every)) if every.is_empty() => {}
            Some(Value::String(every)) => self.every = parse_time(every)?,
            Some(other) => return Err(DeviceError::InvalidInterval(other.to_string())),
        }
        self.device.update_config(config)
    }

    /// Push one reading per interval onto the send queue until stopped
    pub async fn run(sensor: SharedSensor, looper: Looper) {
        let name = sensor.lock().await.name.clone();
        let span = crate::sensor_span!(sensor = %name);
        Self::poll(sensor, looper, name).instrument(span).await
    }

    async fn poll(sensor: SharedSensor, looper: Looper, name: String) {
        debug!("Starting sensor");

        while !looper.is_stopped() {
            let (reading, every) = {
                let mut guard = sensor.lock().await;
                (guard.device.value(), guard.every)
            };

            let mut data = Map::new();
            data.insert("value".to_string(), reading);
            looper
                .send_queue()
                .put(DataMessage::new(name.clone(), data).into())
                .await;
            debug!("Queued reading");

            looper.sleep_until_stopped_or(every).await;
        }

        debug!("Stopping sensor");
    }
}

/// All configured sensors, keyed by name
#[derive(Debug, Clone, Default)]
pub struct Sensors {
    sensors: BTreeMap<String, SharedSensor>,
}

impl Sensors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(
        sections: &BTreeMap<String, SensorSection>,
        registry: &DeviceRegistry,
    ) -> Result<Self, DeviceError> {
        let mut sensors = Self::new();
        for (name, section) in sections {
            sensors.insert(Sensor::from_section(name, section, registry)?);
        }
        info!(count = sensors.len(), "Loaded sensors");
        Ok(sensors)
    }

    pub fn insert(&mut self, sensor: Sensor) {
        self.sensors
            .insert(sensor.name.clone(), Arc::new(Mutex::new(sensor)));
    }

    pub fn get(&self, name: &str) -> Option<SharedSensor> {
        self.sensors.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sensors.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SharedSensor> {
        self.sensors.values()
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }
}
