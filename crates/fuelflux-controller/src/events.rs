//! The serialized event queue.
//!
//! Many producers, one consumer. Every state-affecting input in the
//! system funnels through here; nothing calls the state machine directly.

use fuelflux_core::Event;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Mutex + condvar FIFO of controller events.
#[derive(Default)]
pub struct EventQueue {
    queue: Mutex<VecDeque<Event>>,
    available: Condvar,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event and wake the consumer.
    pub fn post(&self, event: Event) {
        self.queue.lock().expect("lock poisoned").push_back(event);
        self.available.notify_one();
    }

    /// Pop the next event, waiting up to `timeout`.
    ///
    /// The bounded wait keeps the event loop responsive to shutdown.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Event> {
        let mut queue = self.queue.lock().expect("lock poisoned");
        if queue.is_empty() {
            let (guard, _) = self
                .available
                .wait_timeout(queue, timeout)
                .expect("lock poisoned");
            queue = guard;
        }
        queue.pop_front()
    }

    /// Pop the next event without waiting.
    pub fn try_pop(&self) -> Option<Event> {
        self.queue.lock().expect("lock poisoned").pop_front()
    }

    /// Drop consecutive `InputUpdated` events at the front of the queue.
    ///
    /// Called when a display refresh is about to happen anyway, so queued
    /// refresh hints collapse into one.
    pub fn discard_pending_input_updated(&self) {
        let mut queue = self.queue.lock().expect("lock poisoned");
        while queue.front() == Some(&Event::InputUpdated) {
            queue.pop_front();
        }
    }

    /// Drop everything. Used by device reinitialization to discard events
    /// from torn-down peripherals.
    pub fn clear(&self) {
        self.queue.lock().expect("lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
