//! Unbounded FIFO bridging thread producers and tokio consumers
//!
//! Producers on any thread use [`HybridQueue::put_sync`]; tasks await
//! [`HybridQueue::get`], which races the next item against the owning
//! [`CancellationSignal`]. Once the signal is raised new items are dropped
//! and consumers never wait again: they drain what is left, then get `None`.

use super::signal::CancellationSignal;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::trace;

/// Upper bound on how long a blocked thread consumer goes without
/// re-checking the cancellation flag.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct QueueState<T> {
    items: Mutex<VecDeque<T>>,
    thread_available: Condvar,
    task_available: Notify,
}

pub struct HybridQueue<T> {
    state: Arc<QueueState<T>>,
    signal: CancellationSignal,
}

impl<T> Clone for HybridQueue<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            signal: self.signal.clone(),
        }
    }
}

impl<T> fmt::Debug for HybridQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridQueue")
            .field("len", &self.len())
            .field("signal", &self.signal)
            .finish()
    }
}

impl<T> HybridQueue<T> {
    pub fn new(signal: CancellationSignal) -> Self {
        Self {
            state: Arc::new(QueueState {
                items: Mutex::new(VecDeque::new()),
                thread_available: Condvar::new(),
                task_available: Notify::new(),
            }),
            signal,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.state.items.lock()
    }

    fn try_pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Enqueue without blocking. Silently drops the item once stopped.
    pub fn put_sync(&self, item: T) {
        if self.signal.is_stopped() {
            trace!("Queue stopped, dropping item");
            return;
        }

        self.lock().push_back(item);
        self.state.thread_available.notify_one();
        self.state.task_available.notify_one();
    }

    /// Awaitable form of [`put_sync`](Self::put_sync); the queue is
    /// unbounded so this never actually suspends.
    pub async fn put(&self, item: T) {
        self.put_sync(item);
    }

    /// Wait for the next item or for cancellation, whichever comes first.
    pub async fn get(&self) -> Option<T> {
        if self.signal.is_stopped() {
            return self.try_pop();
        }

        loop {
            // Register interest before checking so a concurrent put cannot slip between
            let notified = self.state.task_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_pop() {
                return Some(item);
            }

            tokio::select! {
                biased;
                _ = &mut notified => continue,
                _ = self.signal.wait() => return self.try_pop(),
            }
        }
    }

    /// Blocking dequeue for plain threads, bounded by `timeout`.
    pub fn get_sync(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.lock();

        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            if self.signal.is_stopped() {
                return None;
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            let wait = (deadline - now).min(STOP_POLL_INTERVAL);
            self.state.thread_available.wait_for(&mut items, wait);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
