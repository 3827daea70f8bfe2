//! Testing utilities and mock implementations
//!
//! This module provides mock implementations for exercising the agent
//! without sensing hardware, and a minimal in-process broker for exercising
//! the MQTT connection without a real one.

pub mod broker;
pub mod mocks;

pub use broker::{FakeBroker, FakeBrokerBehavior, PacketKind, ReceivedPacket};
pub use mocks::*;
