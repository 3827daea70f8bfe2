//! Agent lifecycle for a sensor node
//!
//! Wires the transport, the sensors and the control dispatcher together
//! around a shared [`Looper`](crate::looper::Looper).

pub mod lifecycle;

pub use lifecycle::*;
