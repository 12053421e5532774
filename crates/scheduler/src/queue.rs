//! FIFO task queue shared by the worker pool
//!
//! Tasks are handed out strictly in submission order. Workers block on
//! [`TaskQueue::pop_timeout`] so an idle pool does not spin.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Thread-safe first-in first-out queue
pub struct TaskQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
}

struct QueueState<T> {
    items: VecDeque<T>,
    /// Total items ever pushed
    pushed: u64,
}

impl<T> TaskQueue<T> {
    /// Create a new empty queue
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                pushed: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Push an item onto the back of the queue and wake one waiter
    pub fn push(&self, item: T) {
        let mut state = self.state.lock().unwrap();
        state.items.push_back(item);
        state.pushed += 1;
        drop(state);
        self.available.notify_one();
    }

    /// Pop the oldest item without waiting
    pub fn pop(&self) -> Option<T> {
        self.state.lock().unwrap().items.pop_front()
    }

    /// Pop the oldest item, waiting up to `timeout` for one to arrive
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let state = self.state.lock().unwrap();
        let (mut state, _) = self
            .available
            .wait_timeout_while(state, timeout, |s| s.items.is_empty())
            .unwrap();
        state.items.pop_front()
    }

    /// Wake every waiting consumer (used on shutdown)
    pub fn wake_all(&self) {
        self.available.notify_all();
    }

    /// Remove and return all queued items in order
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.state.lock().unwrap();
        state.items.drain(..).collect()
    }

    /// Remove all items matching a predicate
    ///
    /// Returns the removed items in queue order.
    pub fn remove_if<F>(&self, predicate: F) -> Vec<T>
    where
        F: Fn(&T) -> bool,
    {
        let mut state = self.state.lock().unwrap();
        let mut removed = Vec::new();
        let mut remaining = VecDeque::with_capacity(state.items.len());
        for item in state.items.drain(..) {
            if predicate(&item) {
                removed.push(item);
            } else {
                remaining.push_back(item);
            }
        }
        state.items = remaining;
        removed
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().items.is_empty()
    }

    /// Total number of items ever pushed
    pub fn total_pushed(&self) -> u64 {
        self.state.lock().unwrap().pushed
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
