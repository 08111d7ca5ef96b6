//! Work shifts
//!
//! A shift is a named group of queues plus the workers assigned to them. It
//! starts and stops them as one unit and notices when all of its work is done.
//! The shift runs no thread of its own: its flags are read from the queues,
//! and end-of-shift detection is driven by its workers going idle.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use parking_lot::Mutex;
use crate::error::Result;
use super::queue::{WorkItemQueue, WorkItemQueueState};
use super::worker::{TestWorker, WorkerEvent};

type EndOfShiftHandler = Arc<dyn Fn(&WorkShift) + Send + Sync>;

/// A coordinated group of queues and their worker threads
pub struct WorkShift {
    name: String,
    queues: Mutex<Vec<Arc<WorkItemQueue>>>,
    workers: Mutex<Vec<TestWorker>>,
    active: AtomicBool,
    busy_workers: AtomicUsize,
    end_of_shift: Mutex<Vec<EndOfShiftHandler>>,
    this: Weak<WorkShift>,
}

impl WorkShift {
    /// Create an empty, inactive shift
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|this| WorkShift {
            name,
            queues: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            active: AtomicBool::new(false),
            busy_workers: AtomicUsize::new(0),
            end_of_shift: Mutex::new(Vec::new()),
            this: this.clone(),
        })
    }

    /// Shift name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` between `start` and the shift stopping or ending
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// `true` if any queue of the shift holds items
    pub fn has_work(&self) -> bool {
        self.queues.lock().iter().any(|queue| !queue.is_empty())
    }

    /// `true` once every queue is stopped and empty
    pub fn is_finished(&self) -> bool {
        self.queues
            .lock()
            .iter()
            .all(|queue| queue.state() == WorkItemQueueState::Stopped && queue.is_empty())
    }

    /// Number of workers currently executing an item
    pub fn busy_workers(&self) -> usize {
        self.busy_workers.load(Ordering::Acquire)
    }

    /// Queues registered with this shift
    pub fn queues(&self) -> Vec<Arc<WorkItemQueue>> {
        self.queues.lock().clone()
    }

    /// Number of assigned workers
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Register a handler called each time the shift runs out of work
    pub fn on_end_of_shift<F>(&self, handler: F)
    where
        F: Fn(&WorkShift) + Send + Sync + 'static,
    {
        self.end_of_shift.lock().push(Arc::new(handler));
    }

    /// Add a queue. Registering a queue twice does nothing; a queue added to
    /// an active shift is started at once.
    pub fn add_queue(&self, queue: Arc<WorkItemQueue>) {
        let mut queues = self.queues.lock();
        if queues.iter().any(|known| Arc::ptr_eq(known, &queue)) {
            return;
        }
        log::debug!("{} shift: adding queue {}", self.name, queue.name());
        queues.push(Arc::clone(&queue));
        drop(queues);

        if self.is_active() {
            queue.start();
        }
    }

    /// Assign a worker to the shift. It starts with the shift, or at once if
    /// the shift is already active.
    pub fn assign(&self, mut worker: TestWorker) -> Result<()> {
        let shift = self.this.clone();
        worker.on_event(move |event| {
            if let Some(shift) = shift.upgrade() {
                shift.on_worker_event(event);
            }
        });

        if self.is_active() {
            worker.start()?;
        }
        self.workers.lock().push(worker);
        Ok(())
    }

    /// Activate the shift: start every queue, then any worker not yet running
    pub fn start(&self) -> Result<()> {
        log::info!("{} shift starting", self.name);
        self.active.store(true, Ordering::Release);

        for queue in self.queues() {
            queue.start();
        }
        for worker in self.workers.lock().iter_mut() {
            if !worker.is_started() {
                worker.start()?;
            }
        }
        Ok(())
    }

    /// Stop every queue so the workers exit after their current item
    pub fn shut_down(&self) {
        self.active.store(false, Ordering::Release);
        for queue in self.queues() {
            queue.stop();
        }
    }

    /// Shut down and wait for every worker thread to exit
    pub fn stop(&self) -> Result<()> {
        self.shut_down();

        let mut first_error = None;
        for worker in self.workers.lock().iter_mut() {
            if let Err(e) = worker.join() {
                log::error!("{} shift: {}", self.name, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Shut down and discard queued items, resolving them as cancelled.
    /// Returns how many items were discarded.
    pub fn cancel(&self) -> usize {
        self.shut_down();

        let mut cancelled = 0;
        for queue in self.queues() {
            for item in queue.drain() {
                item.cancel();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            log::info!("{} shift cancelled {} queued items", self.name, cancelled);
        }
        cancelled
    }

    fn on_worker_event(&self, event: &WorkerEvent) {
        match event {
            WorkerEvent::Busy { .. } => {
                self.busy_workers.fetch_add(1, Ordering::AcqRel);
            }
            WorkerEvent::Executed { .. } => {}
            WorkerEvent::Idle { .. } => {
                self.busy_workers.fetch_sub(1, Ordering::AcqRel);
                if self.is_out_of_work() {
                    self.end_shift();
                }
            }
        }
    }

    fn is_out_of_work(&self) -> bool {
        self.queues
            .lock()
            .iter()
            .all(|queue| queue.is_empty() && queue.in_flight() == 0)
    }

    fn end_shift(&self) {
        if self
            .active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        for queue in self.queues() {
            queue.pause();
        }
        log::info!("{} shift ended", self.name);

        let handlers = self.end_of_shift.lock().clone();
        for handler in handlers {
            handler(self);
        }
    }
}

impl std::fmt::Debug for WorkShift {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkShift")
            .field("name", &self.name)
            .field("active", &self.is_active())
            .field("queues", &self.queues.lock().len())
            .field("workers", &self.worker_count())
            .finish()
    }
}
