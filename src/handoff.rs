//! Bounded hand-off queue between the receive worker and the display consumer
//!
//! Single producer (the worker), single consumer (the redraw timer). The
//! consumer polls with [`HandoffQueue::try_pop`] on its own cadence; the
//! condition variable is only there for consumers that prefer to wait.
//!
//! When full, the oldest frame is evicted: a live view wants the newest
//! picture, not a backlog.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Default capacity, one second of video at 25 fps
pub const DEFAULT_QUEUE_CAPACITY: usize = 25;

/// Bounded FIFO with drop-oldest overflow
#[derive(Debug)]
pub struct HandoffQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> HandoffQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Maximum number of queued items
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an item, evicting the oldest if full
    ///
    /// Returns the evicted item, if any.
    pub fn push(&self, item: T) -> Option<T> {
        let evicted = {
            let mut items = self.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(item);
            evicted
        };

        if evicted.is_some() {
            log::trace!("Hand-off queue full, evicted oldest frame");
        }
        self.available.notify_one();
        evicted
    }

    /// Remove and return the oldest item without waiting
    pub fn try_pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Remove and return the oldest item, waiting up to `timeout`
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let items = self.lock();
        let (mut items, _) = self
            .available
            .wait_timeout_while(items, timeout, |items| items.is_empty())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        items.pop_front()
    }

    /// Drain the queue, keeping only the newest item
    pub fn pop_latest(&self) -> Option<T> {
        let mut items = self.lock();
        let latest = items.pop_back();
        items.clear();
        latest
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Lock the queue; a panicked peer cannot leave a `VecDeque` inconsistent
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T> Default for HandoffQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
