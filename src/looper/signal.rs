//! Level-triggered stop flag shared by threads and tokio tasks
//!
//! The flag is backed by two primitives that are always set together inside
//! [`CancellationSignal::stop`]: a condition variable for blocking thread
//! waiters and a `watch` channel for tasks on the tokio scheduler.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

struct SignalState {
    stopped: AtomicBool,
    thread_flag: Mutex<bool>,
    thread_cond: Condvar,
    task_tx: watch::Sender<bool>,
}

/// Stop flag that moves from `false` to `true` exactly once.
///
/// Cloning is cheap; all clones observe the same flag.
#[derive(Clone)]
pub struct CancellationSignal {
    state: Arc<SignalState>,
}

impl fmt::Debug for CancellationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationSignal")
            .field("is_stopped", &self.is_stopped())
            .finish()
    }
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationSignal {
    pub fn new() -> Self {
        let (task_tx, _) = watch::channel(false);
        Self {
            state: Arc::new(SignalState {
                stopped: AtomicBool::new(false),
                thread_flag: Mutex::new(false),
                thread_cond: Condvar::new(),
                task_tx,
            }),
        }
    }

    /// Set the flag and wake every waiter. Calls after the first are no-ops.
    pub fn stop(&self) {
        if self.state.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        *self.state.thread_flag.lock() = true;
        self.state.thread_cond.notify_all();
        self.state.task_tx.send_replace(true);

        debug!("Cancellation signal raised");
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.state.stopped.load(Ordering::SeqCst)
    }

    /// Suspend the calling task until the flag is set.
    /// Resolves immediately if it already is.
    pub async fn wait(&self) {
        let mut rx = self.state.task_tx.subscribe();
        // The sender lives as long as `self`, so this only returns once stopped
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Block the calling thread for at most `timeout`.
    /// Returns whether the flag was set.
    pub fn wait_sync(&self, timeout: Duration) -> bool {
        let mut flag = self.state.thread_flag.lock();
        self.state
            .thread_cond
            .wait_while_for(&mut flag, |stopped| !*stopped, timeout);
        *flag
    }
}
