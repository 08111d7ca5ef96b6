//! Priority work item queue
//!
//! Holds work items that are ready to run. High-priority items always leave
//! before normal ones; each priority class is FIFO. Every mutation happens
//! under one lock, and blocked dequeuers wait on a condition variable tied to
//! that lock, so an enqueue can never slip between an emptiness check and the
//! wait that follows it.

use std::collections::VecDeque;
use parking_lot::{Condvar, Mutex};
use crate::work_item::{WorkItem, WorkItemPriority};

/// State of a [`WorkItemQueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItemQueueState {
    /// Items are held but not handed out
    Paused,
    /// Items are handed out to dequeuers
    Running,
    /// Terminal: every dequeue returns `None` immediately
    Stopped,
}

struct QueueInner {
    high: VecDeque<WorkItem>,
    normal: VecDeque<WorkItem>,
    state: WorkItemQueueState,
    in_flight: usize,
    items_processed: usize,
    max_count: usize,
}

impl QueueInner {
    fn len(&self) -> usize {
        self.high.len() + self.normal.len()
    }

    fn pop(&mut self) -> Option<WorkItem> {
        self.high.pop_front().or_else(|| self.normal.pop_front())
    }
}

/// Thread-safe, priority-ordered holding area for work items
pub struct WorkItemQueue {
    name: String,
    inner: Mutex<QueueInner>,
    available: Condvar,
}

impl WorkItemQueue {
    /// Create an empty queue in the Paused state
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(QueueInner {
                high: VecDeque::new(),
                normal: VecDeque::new(),
                state: WorkItemQueueState::Paused,
                in_flight: 0,
                items_processed: 0,
                max_count: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Queue name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state
    pub fn state(&self) -> WorkItemQueueState {
        self.inner.lock().state
    }

    /// Add an item at the tail of its own priority class
    pub fn enqueue(&self, item: WorkItem) {
        let priority = item.priority();
        self.enqueue_with_priority(item, priority);
    }

    /// Add an item at the tail of the given priority class.
    ///
    /// Accepted in every state; items enqueued while paused wait for `start`.
    pub fn enqueue_with_priority(&self, item: WorkItem, priority: WorkItemPriority) {
        let mut inner = self.inner.lock();
        match priority {
            WorkItemPriority::High => inner.high.push_back(item),
            WorkItemPriority::Normal => inner.normal.push_back(item),
        }
        inner.max_count = inner.max_count.max(inner.len());
        drop(inner);

        self.available.notify_one();
    }

    /// Take the next item.
    ///
    /// A running queue hands out high-priority items first. When nothing can
    /// be handed out, a blocking call waits for an item, `start` or `stop`;
    /// a non-blocking call returns `None`. A stopped queue always returns
    /// `None` at once.
    pub fn dequeue(&self, blocking: bool) -> Option<WorkItem> {
        let mut inner = self.inner.lock();
        loop {
            match inner.state {
                WorkItemQueueState::Stopped => return None,
                WorkItemQueueState::Running => {
                    if let Some(item) = inner.pop() {
                        inner.in_flight += 1;
                        inner.items_processed += 1;
                        return Some(item);
                    }
                }
                WorkItemQueueState::Paused => {}
            }

            if !blocking {
                return None;
            }
            self.available.wait(&mut inner);
        }
    }

    /// Record that an item returned by `dequeue` has finished executing
    pub fn finish_item(&self) {
        let mut inner = self.inner.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
    }

    /// Start or restart handing out items
    pub fn start(&self) {
        let mut inner = self.inner.lock();
        if inner.state == WorkItemQueueState::Paused {
            inner.state = WorkItemQueueState::Running;
            drop(inner);
            log::info!("{} starting", self.name);
            self.available.notify_all();
        }
    }

    /// Hold items until the next `start`
    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if inner.state == WorkItemQueueState::Running {
            inner.state = WorkItemQueueState::Paused;
            log::info!("{} pausing", self.name);
        }
    }

    /// Stop the queue for good, waking every blocked dequeuer
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if inner.state != WorkItemQueueState::Stopped {
            inner.state = WorkItemQueueState::Stopped;
            let (processed, max_count) = (inner.items_processed, inner.max_count);
            drop(inner);
            log::info!(
                "{} stopping - {} WorkItems processed, max size {}",
                self.name,
                processed,
                max_count
            );
            self.available.notify_all();
        }
    }

    /// Remove everything still queued, high priority first
    pub fn drain(&self) -> Vec<WorkItem> {
        let mut inner = self.inner.lock();
        let QueueInner { high, normal, .. } = &mut *inner;
        high.drain(..).chain(normal.drain(..)).collect()
    }

    /// Number of queued items (advisory)
    pub fn count(&self) -> usize {
        self.inner.lock().len()
    }

    /// `true` if nothing is queued (advisory)
    pub fn is_empty(&self) -> bool {
        self.inner.lock().len() == 0
    }

    /// Items handed out but not yet reported finished
    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    /// Total items handed out so far
    pub fn items_processed(&self) -> usize {
        self.inner.lock().items_processed
    }

    /// Largest number of items queued at once
    pub fn max_count(&self) -> usize {
        self.inner.lock().max_count
    }
}

impl std::fmt::Debug for WorkItemQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("WorkItemQueue")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("count", &inner.len())
            .field("in_flight", &inner.in_flight)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use crate::work_item::TestRef;

    fn item(name: &str, priority: WorkItemPriority) -> WorkItem {
        WorkItem::new(TestRef::new(name), |_| Ok(())).with_priority(priority)
    }

    fn names(queue: &WorkItemQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.dequeue(false))
            .map(|item| item.test().full_name().to_string())
            .collect()
    }

    #[test]
    fn test_new_queue_is_paused_and_empty() {
        let queue = WorkItemQueue::new("test");
        assert_eq!(queue.name(), "test");
        assert_eq!(queue.state(), WorkItemQueueState::Paused);
        assert!(queue.is_empty());
        assert!(queue.dequeue(false).is_none());
    }

    #[test]
    fn test_high_priority_first() {
        let queue = WorkItemQueue::new("test");
        queue.start();
        queue.enqueue(item("A", WorkItemPriority::Normal));
        queue.enqueue(item("B", WorkItemPriority::High));

        assert_eq!(names(&queue), ["B", "A"]);
    }

    #[test]
    fn test_fifo_within_priority() {
        let queue = WorkItemQueue::new("test");
        queue.enqueue(item("n1", WorkItemPriority::Normal));
        queue.enqueue(item("h1", WorkItemPriority::High));
        queue.enqueue(item("n2", WorkItemPriority::Normal));
        queue.enqueue_with_priority(item("h2", WorkItemPriority::Normal), WorkItemPriority::High);
        queue.start();

        assert_eq!(names(&queue), ["h1", "h2", "n1", "n2"]);
        assert_eq!(queue.items_processed(), 4);
        assert_eq!(queue.max_count(), 4);
    }

    #[test]
    fn test_paused_queue_holds_items() {
        let queue = WorkItemQueue::new("test");
        queue.enqueue(item("A", WorkItemPriority::Normal));
        assert!(queue.dequeue(false).is_none());
        assert_eq!(queue.count(), 1);

        queue.start();
        queue.pause();
        assert_eq!(queue.state(), WorkItemQueueState::Paused);
        assert!(queue.dequeue(false).is_none());

        queue.start();
        assert!(queue.dequeue(false).is_some());
    }

    #[test]
    fn test_stop_from_paused_unblocks() {
        let queue = WorkItemQueue::new("test");
        queue.stop();
        assert!(queue.dequeue(true).is_none());

        queue.stop();
        queue.start();
        assert_eq!(queue.state(), WorkItemQueueState::Stopped);
    }

    #[test]
    fn test_stop_wakes_all_blocked_dequeuers() {
        let queue = Arc::new(WorkItemQueue::new("test"));
        queue.start();

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.dequeue(true).is_none())
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        queue.stop();

        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
    }

    #[test]
    fn test_blocking_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(WorkItemQueue::new("test"));
        queue.start();

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.dequeue(true).map(|i| i.test().full_name().to_string()))
        };

        thread::sleep(Duration::from_millis(20));
        queue.enqueue(item("late", WorkItemPriority::Normal));
        assert_eq!(consumer.join().unwrap().as_deref(), Some("late"));
        assert_eq!(queue.in_flight(), 1);

        queue.finish_item();
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn test_drain() {
        let queue = WorkItemQueue::new("test");
        queue.enqueue(item("n", WorkItemPriority::Normal));
        queue.enqueue(item("h", WorkItemPriority::High));

        let drained: Vec<_> = queue.drain().into_iter().map(|i| i.test().full_name().to_string()).collect();
        assert_eq!(drained, ["h", "n"]);
        assert!(queue.is_empty());
    }
}
