//! BobNet Sensors
//!
//! A sensor node agent: it polls local devices, forwards their readings to an
//! MQTT device bridge and applies configuration and commands sent back by the
//! bridge.
//!
//! # Overview
//!
//! - [`looper`]: the cancellation signal and the queues shared by every task
//! - [`protocol`]: telemetry and control messages and the bridge topics
//! - [`sensors`]: devices, sensors and the control dispatcher
//! - [`transport`]: the `Transport` seam and its MQTT implementation
//! - [`agent`]: wiring all of the above into a running node
//!
//! # Quick Start
//!
//! ```rust
//! use bobnet_sensors::looper::Looper;
//! use bobnet_sensors::protocol::decode_control_payload;
//! use bobnet_sensors::sensors::{ControlDispatcher, CounterDevice, Sensor, Sensors};
//!
//! # tokio_test::block_on(async {
//! let mut sensors = Sensors::new();
//! sensors.insert(Sensor::new("counter1", Some("10s"), Box::new(CounterDevice::new(0)))?);
//! let dispatcher = ControlDispatcher::new(sensors);
//!
//! // A config message from the bridge changes the polling interval
//! let looper = Looper::new();
//! for message in decode_control_payload(br#"{"devices": {"counter1": {"every": "1m"}}}"#)? {
//!     let replies = dispatcher.apply_control_message(message, &looper).await;
//!     assert!(replies.is_empty());
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod looper;
pub mod observability;
pub mod protocol;
pub mod sensors;
pub mod testing;
pub mod transport;

pub use agent::{AgentLifecycle, LifecycleError, ShutdownReason};
pub use config::{ConfigError, IotCoreSection, SensorSection, SensorsConfig};
pub use error::{AgentError, AgentResult};
pub use looper::Looper;
pub use protocol::*;
pub use transport::mqtt::MqttConnection;
pub use transport::Transport;
