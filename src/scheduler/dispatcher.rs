//! Parallel work item dispatcher
//!
//! Routes work items to four lazily created queues and runs them in three
//! shifts, one shift at a time: "Parallel", "NonParallel", "NonParallelSTA".
//! When a shift runs out of work the next shift with work is started; when no
//! shift has work left, every shift is shut down and the run is complete.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use crate::error::{Error, Result};
use crate::work_item::{ApartmentState, ExecutionStrategy, WorkItem};
use super::queue::WorkItemQueue;
use super::shift::WorkShift;
use super::worker::{TestWorker, WorkerConfig, WorkerId};

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Workers on the parallel queue (0 = number of CPU cores)
    pub level_of_parallelism: usize,
    /// Prefix for worker thread names
    pub thread_name_prefix: String,
    /// Pin parallel workers to CPUs round-robin (Linux only)
    pub enable_cpu_affinity: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            level_of_parallelism: num_cpus::get(),
            thread_name_prefix: "Worker".to_string(),
            enable_cpu_affinity: false,
        }
    }
}

/// The four queues a work item can be routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Parallel items, any apartment
    Parallel,
    /// Parallel items that need an STA thread
    ParallelSta,
    /// Items that must run alone
    NonParallel,
    /// Items that must run alone on an STA thread
    NonParallelSta,
}

impl QueueKind {
    /// Queue chosen for a non-direct item
    pub fn for_item(item: &WorkItem) -> Self {
        let sta = item.apartment() == ApartmentState::Sta;
        match (item.strategy(), sta) {
            (ExecutionStrategy::Parallel, false) => QueueKind::Parallel,
            (ExecutionStrategy::Parallel, true) => QueueKind::ParallelSta,
            (_, false) => QueueKind::NonParallel,
            (_, true) => QueueKind::NonParallelSta,
        }
    }

    fn queue_name(self) -> &'static str {
        match self {
            QueueKind::Parallel => "ParallelQueue",
            QueueKind::ParallelSta => "ParallelSTAQueue",
            QueueKind::NonParallel => "NonParallelQueue",
            QueueKind::NonParallelSta => "NonParallelSTAQueue",
        }
    }
}

/// Completion flag shared with the end-of-shift handlers
#[derive(Default)]
struct RunCompletion {
    done: Mutex<bool>,
    signal: Condvar,
}

impl RunCompletion {
    fn complete(&self) {
        *self.done.lock() = true;
        self.signal.notify_all();
    }

    fn is_complete(&self) -> bool {
        *self.done.lock()
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.signal.wait(&mut done);
        }
    }
}

/// Runs work items across shifts of worker threads
pub struct ParallelDispatcher {
    config: DispatcherConfig,
    parallel_shift: Arc<WorkShift>,
    non_parallel_shift: Arc<WorkShift>,
    non_parallel_sta_shift: Arc<WorkShift>,
    parallel_queue: OnceCell<Arc<WorkItemQueue>>,
    parallel_sta_queue: OnceCell<Arc<WorkItemQueue>>,
    non_parallel_queue: OnceCell<Arc<WorkItemQueue>>,
    non_parallel_sta_queue: OnceCell<Arc<WorkItemQueue>>,
    next_worker_id: AtomicUsize,
    items_dispatched: AtomicUsize,
    started: AtomicBool,
    completion: RunCompletion,
}

impl ParallelDispatcher {
    /// Create a dispatcher. No queue or thread exists until items arrive.
    pub fn new(config: DispatcherConfig) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<ParallelDispatcher>| {
            let dispatcher = ParallelDispatcher {
                config,
                parallel_shift: WorkShift::new("Parallel"),
                non_parallel_shift: WorkShift::new("NonParallel"),
                non_parallel_sta_shift: WorkShift::new("NonParallelSTA"),
                parallel_queue: OnceCell::new(),
                parallel_sta_queue: OnceCell::new(),
                non_parallel_queue: OnceCell::new(),
                non_parallel_sta_queue: OnceCell::new(),
                next_worker_id: AtomicUsize::new(0),
                items_dispatched: AtomicUsize::new(0),
                started: AtomicBool::new(false),
                completion: RunCompletion::default(),
            };

            for shift in dispatcher.shifts() {
                let this = this.clone();
                shift.on_end_of_shift(move |ended| {
                    if let Some(dispatcher) = this.upgrade() {
                        dispatcher.on_end_of_shift(ended);
                    }
                });
            }
            dispatcher
        })
    }

    /// Dispatcher configuration
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// The shifts in the order they run
    pub fn shifts(&self) -> [&Arc<WorkShift>; 3] {
        [
            &self.parallel_shift,
            &self.non_parallel_shift,
            &self.non_parallel_sta_shift,
        ]
    }

    /// Number of items dispatched so far
    pub fn items_dispatched(&self) -> usize {
        self.items_dispatched.load(Ordering::Relaxed)
    }

    /// `true` once every shift has been shut down
    pub fn is_complete(&self) -> bool {
        self.completion.is_complete()
    }

    /// The queue of the given kind, if it was ever needed
    pub fn queue(&self, kind: QueueKind) -> Option<&Arc<WorkItemQueue>> {
        self.cell(kind).get()
    }

    /// Dispatch all items and start the first shift that has work.
    ///
    /// Direct items run on the calling thread before any shift starts.
    pub fn start(&self, items: impl IntoIterator<Item = WorkItem>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::RuntimeError {
                reason: "dispatcher already started".to_string(),
            });
        }

        for item in items {
            self.dispatch(item)?;
        }

        if !self.start_next_shift()? {
            log::debug!("No queued work, run complete");
            self.shut_down_all();
        }
        Ok(())
    }

    /// Dispatch one item: run it here if direct, otherwise queue it.
    ///
    /// Items dispatched after the run completed are never executed.
    pub fn dispatch(&self, mut item: WorkItem) -> Result<()> {
        self.items_dispatched.fetch_add(1, Ordering::Relaxed);

        if item.strategy() == ExecutionStrategy::Direct {
            log::debug!("Directly executing {}", item.test());
            item.execute();
            return Ok(());
        }

        let kind = QueueKind::for_item(&item);
        log::debug!("Enqueuing {} on {}", item.test(), kind.queue_name());
        self.queue_for(kind)?.enqueue(item);
        Ok(())
    }

    /// Block until every shift is finished, then join all workers
    pub fn wait_for_completion(&self) -> Result<()> {
        if !self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        self.completion.wait();

        let mut first_error = None;
        for shift in self.shifts() {
            if let Err(e) = shift.stop() {
                first_error.get_or_insert(e);
            }
            // Items that arrived after their queue stopped will never run
            shift.cancel();
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Cancel the run: queued items resolve as cancelled and workers exit
    /// after their current item. Has no effect on a completed run.
    pub fn cancel_run(&self) {
        if self.completion.is_complete() {
            return;
        }
        let cancelled: usize = self.shifts().iter().map(|shift| shift.cancel()).sum();
        log::info!("Run cancelled, {} items discarded", cancelled);
        self.completion.complete();
    }

    fn cell(&self, kind: QueueKind) -> &OnceCell<Arc<WorkItemQueue>> {
        match kind {
            QueueKind::Parallel => &self.parallel_queue,
            QueueKind::ParallelSta => &self.parallel_sta_queue,
            QueueKind::NonParallel => &self.non_parallel_queue,
            QueueKind::NonParallelSta => &self.non_parallel_sta_queue,
        }
    }

    fn queue_for(&self, kind: QueueKind) -> Result<&Arc<WorkItemQueue>> {
        self.cell(kind).get_or_try_init(|| self.create_queue(kind))
    }

    fn create_queue(&self, kind: QueueKind) -> Result<Arc<WorkItemQueue>> {
        let queue = Arc::new(WorkItemQueue::new(kind.queue_name()));
        let prefix = &self.config.thread_name_prefix;

        let (shift, workers) = match kind {
            QueueKind::Parallel => {
                let count = match self.config.level_of_parallelism {
                    0 => num_cpus::get(),
                    n => n,
                };
                let cpus = num_cpus::get().max(1);
                let workers = (0..count)
                    .map(|i| {
                        let mut config = self.worker_config(format!("{}#{}", prefix, i), ApartmentState::Mta);
                        if self.config.enable_cpu_affinity {
                            config.cpu_affinity = Some(i % cpus);
                        }
                        config
                    })
                    .collect::<Vec<_>>();
                (&self.parallel_shift, workers)
            }
            QueueKind::ParallelSta => (
                &self.parallel_shift,
                vec![self.worker_config(format!("{}#STA", prefix), ApartmentState::Sta)],
            ),
            QueueKind::NonParallel => (
                &self.non_parallel_shift,
                vec![self.worker_config(format!("{}#NP", prefix), ApartmentState::Mta)],
            ),
            QueueKind::NonParallelSta => (
                &self.non_parallel_sta_shift,
                vec![self.worker_config(format!("{}#NP_STA", prefix), ApartmentState::Sta)],
            ),
        };

        shift.add_queue(Arc::clone(&queue));
        for config in workers {
            shift.assign(TestWorker::new(Arc::clone(&queue), config))?;
        }
        Ok(queue)
    }

    fn worker_config(&self, name: String, apartment: ApartmentState) -> WorkerConfig {
        WorkerConfig {
            id: WorkerId(self.next_worker_id.fetch_add(1, Ordering::Relaxed)),
            name,
            apartment,
            ..Default::default()
        }
    }

    fn on_end_of_shift(&self, ended: &WorkShift) {
        log::debug!("{} shift out of work", ended.name());
        match self.start_next_shift() {
            Ok(true) => {}
            Ok(false) => self.shut_down_all(),
            Err(e) => {
                log::error!("Failed to start next shift: {}", e);
                self.cancel_run();
            }
        }
    }

    fn start_next_shift(&self) -> Result<bool> {
        for shift in self.shifts() {
            if shift.has_work() {
                shift.start()?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn shut_down_all(&self) {
        for shift in self.shifts() {
            shift.shut_down();
        }
        self.completion.complete();
    }
}

impl Drop for ParallelDispatcher {
    fn drop(&mut self) {
        // Release workers still blocked on paused queues
        for shift in self.shifts() {
            shift.shut_down();
        }
    }
}

impl std::fmt::Debug for ParallelDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelDispatcher")
            .field("config", &self.config)
            .field("items_dispatched", &self.items_dispatched())
            .field("complete", &self.is_complete())
            .finish()
    }
}
