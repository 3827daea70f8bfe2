//! Message model, control payload decoding and topic layout
//!
//! This module defines everything the agent exchanges with the device
//! bridge and passes between its own tasks.

pub mod control;
pub mod messages;
pub mod topics;

pub use control::*;
pub use messages::*;
pub use topics::*;
