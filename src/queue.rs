//! Blocking FIFO that hands decoded messages from reader threads to consumers.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::trace;

/// Unbounded multi-producer, multi-consumer blocking queue.
///
/// [`push`](Self::push) never blocks and wakes at most one waiting consumer.
/// [`pop`](Self::pop) blocks until an item is available. Each item is handed
/// to exactly one consumer, in push order.
#[derive(Debug)]
pub struct DeliveryQueue<T = Vec<u8>> {
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
}

impl<T> Default for DeliveryQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DeliveryQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
        }
    }

    /// Appends `item` to the tail and wakes one blocked consumer.
    pub fn push(&self, item: T) {
        let mut items = self.lock();
        items.push_back(item);
        trace!(len = items.len(), "Pushed to delivery queue");
        drop(items);
        self.not_empty.notify_one();
    }

    /// Removes and returns the head, blocking while the queue is empty.
    pub fn pop(&self) -> T {
        let mut items = self.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }
            items = self
                .not_empty
                .wait(items)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Removes and returns the head if there is one.
    pub fn try_pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Like [`pop`](Self::pop), but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let (mut items, _) = self
            .not_empty
            .wait_timeout_while(self.lock(), timeout, |items| items.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        items.pop_front()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
