//! Observability for the sensor agent
//!
//! Only structured logging lives here. Readings, acknowledgements and device
//! errors are themselves telemetry and travel over the transport.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

// Span macros for structured logging
pub use logging::{mqtt_span, sensor_span};
