//! Shared coordination primitives for the sensor agent
//!
//! A [`Looper`] owns one [`CancellationSignal`] and the two queues that cross
//! between the transport's callback context and the tokio tasks:
//!
//! - `config_queue` carries decoded control messages inbound
//! - `send_queue` carries readings, acknowledgements and logs outbound

pub mod queue;
pub mod signal;

pub use queue::HybridQueue;
pub use signal::CancellationSignal;

use crate::protocol::Message;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Looper {
    signal: CancellationSignal,
    config_queue: HybridQueue<Message>,
    send_queue: HybridQueue<Message>,
}

impl Default for Looper {
    fn default() -> Self {
        Self::new()
    }
}

impl Looper {
    pub fn new() -> Self {
        let signal = CancellationSignal::new();
        Self {
            config_queue: HybridQueue::new(signal.clone()),
            send_queue: HybridQueue::new(signal.clone()),
            signal,
        }
    }

    pub fn signal(&self) -> &CancellationSignal {
        &self.signal
    }

    /// Inbound control messages decoded by the transport
    pub fn config_queue(&self) -> &HybridQueue<Message> {
        &self.config_queue
    }

    /// Outbound telemetry waiting to be published
    pub fn send_queue(&self) -> &HybridQueue<Message> {
        &self.send_queue
    }

    pub fn stop(&self) {
        self.signal.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.signal.is_stopped()
    }

    /// Sleep for `duration`, returning early as soon as the looper is stopped.
    pub async fn sleep_until_stopped_or(&self, duration: Duration) {
        let _ = tokio::time::timeout(duration, self.signal.wait()).await;
    }
}
