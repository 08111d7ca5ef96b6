//! FIFO relay of lifecycle events from many producer threads to one consumer

use std::collections::VecDeque;
use parking_lot::{Condvar, Mutex};
use crate::event::TestEvent;

struct EventQueueInner {
    events: VecDeque<TestEvent>,
    stopped: bool,
}

/// Thread-safe FIFO of [`TestEvent`]s.
///
/// Order is the order in which `enqueue` calls take the internal lock. After
/// [`stop`](EventQueue::stop), queued events are still handed out; a blocking
/// dequeue only returns `None` once the queue has drained.
pub struct EventQueue {
    inner: Mutex<EventQueueInner>,
    available: Condvar,
}

impl EventQueue {
    /// Create an empty, running queue
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(EventQueueInner {
                events: VecDeque::new(),
                stopped: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Append an event
    pub fn enqueue(&self, event: TestEvent) {
        self.inner.lock().events.push_back(event);
        self.available.notify_one();
    }

    /// Remove the oldest event.
    ///
    /// With `block_when_empty`, waits until an event arrives or the queue is
    /// stopped. Returns `None` when empty and not blocking, or when stopped
    /// and drained.
    pub fn dequeue(&self, block_when_empty: bool) -> Option<TestEvent> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(event) = inner.events.pop_front() {
                return Some(event);
            }
            if !block_when_empty || inner.stopped {
                return None;
            }
            self.available.wait(&mut inner);
        }
    }

    /// Stop the queue, waking any blocked consumer
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if !inner.stopped {
            inner.stopped = true;
            drop(inner);
            self.available.notify_all();
        }
    }

    /// Accept blocking consumers again after a `stop`
    pub(crate) fn resume(&self) {
        self.inner.lock().stopped = false;
    }

    /// `true` once [`stop`](EventQueue::stop) has been called
    pub fn is_stopped(&self) -> bool {
        self.inner.lock().stopped
    }

    /// Number of queued events (advisory)
    pub fn count(&self) -> usize {
        self.inner.lock().events.len()
    }

    /// `true` if nothing is queued (advisory)
    pub fn is_empty(&self) -> bool {
        self.inner.lock().events.is_empty()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
