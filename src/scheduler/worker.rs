//! Test worker thread
//!
//! Each worker owns one OS thread bound to a single [`WorkItemQueue`]. It
//! pulls items with a blocking dequeue and executes them until the queue
//! stops handing anything out.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use crate::error::{panic_message, Error, Result};
use crate::work_item::{ApartmentState, TestResult};
use super::queue::WorkItemQueue;

/// Unique identifier for a worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub usize);

impl WorkerId {
    /// Get the numeric ID
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

/// Lifecycle notification raised by a worker
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// The worker took an item and is about to execute it
    Busy {
        /// Worker raising the event
        worker: WorkerId,
    },
    /// The worker finished executing an item
    Executed {
        /// Worker raising the event
        worker: WorkerId,
        /// Result of the item
        result: TestResult,
    },
    /// The worker is about to look for the next item
    Idle {
        /// Worker raising the event
        worker: WorkerId,
    },
}

/// Statistics for a worker thread
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Number of items executed
    pub items_executed: AtomicUsize,
    /// Number of observer callbacks that panicked
    pub observer_panics: AtomicUsize,
}

/// Worker thread configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker ID
    pub id: WorkerId,
    /// Thread name
    pub name: String,
    /// Apartment the thread is created with
    pub apartment: ApartmentState,
    /// CPU to pin the thread to (Linux only)
    pub cpu_affinity: Option<usize>,
    /// Stack size for the thread, if not the platform default
    pub stack_size: Option<usize>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: WorkerId(0),
            name: "Worker#0".to_string(),
            apartment: ApartmentState::Unknown,
            cpu_affinity: None,
            stack_size: None,
        }
    }
}

type WorkerObserver = Arc<dyn Fn(&WorkerEvent) + Send + Sync>;

/// Thread that repeatedly executes work items from one queue
pub struct TestWorker {
    config: WorkerConfig,
    queue: Arc<WorkItemQueue>,
    observers: Vec<WorkerObserver>,
    stats: Arc<WorkerStats>,
    should_stop: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl TestWorker {
    /// Create a worker bound to `queue`
    pub fn new(queue: Arc<WorkItemQueue>, config: WorkerConfig) -> Self {
        Self {
            config,
            queue,
            observers: Vec::new(),
            stats: Arc::new(WorkerStats::default()),
            should_stop: Arc::new(AtomicBool::new(false)),
            alive: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        }
    }

    /// Register an observer for Busy/Executed/Idle events.
    /// Observers added after `start` are not seen by the running thread.
    pub fn on_event<F>(&mut self, observer: F)
    where
        F: Fn(&WorkerEvent) + Send + Sync + 'static,
    {
        self.observers.push(Arc::new(observer));
    }

    /// Spawn the worker thread
    pub fn start(&mut self) -> Result<()> {
        if self.thread_handle.is_some() {
            return Err(Error::RuntimeError {
                reason: format!("{} already started", self.config.name),
            });
        }

        let context = WorkerLoop {
            config: self.config.clone(),
            queue: Arc::clone(&self.queue),
            observers: self.observers.clone(),
            stats: Arc::clone(&self.stats),
            should_stop: Arc::clone(&self.should_stop),
            alive: Arc::clone(&self.alive),
        };

        let mut builder = thread::Builder::new().name(self.config.name.clone());
        if let Some(size) = self.config.stack_size {
            builder = builder.stack_size(size);
        }

        self.alive.store(true, Ordering::Release);
        let handle = builder
            .spawn(move || {
                // Affinity can only be chosen before any test code runs on the thread
                #[cfg(target_os = "linux")]
                if let Some(cpu) = context.config.cpu_affinity {
                    set_cpu_affinity(cpu);
                }
                if context.config.apartment == ApartmentState::Sta {
                    log::debug!("{}: STA requested, no apartment model on this platform", context.config.name);
                }

                context.run();
            })
            .map_err(|e| {
                self.alive.store(false, Ordering::Release);
                Error::SpawnError {
                    name: self.config.name.clone(),
                    reason: e.to_string(),
                }
            })?;

        self.thread_handle = Some(handle);
        Ok(())
    }

    /// Ask the thread to exit before its next dequeue
    pub fn request_stop(&self) {
        self.should_stop.store(true, Ordering::Release);
    }

    /// Wait for the thread to exit.
    ///
    /// The thread only exits once its queue yields no item (or after the
    /// current item when a stop was requested), so stop the queue first.
    pub fn join(&mut self) -> Result<()> {
        if let Some(handle) = self.thread_handle.take() {
            handle.join().map_err(|_| Error::ThreadPanicked {
                name: self.config.name.clone(),
            })?;
        }
        Ok(())
    }

    /// Request a stop and wait for the thread
    pub fn stop(&mut self) -> Result<()> {
        self.request_stop();
        self.join()
    }

    /// `true` once `start` has been called
    pub fn is_started(&self) -> bool {
        self.thread_handle.is_some() || self.alive.load(Ordering::Acquire)
    }

    /// `true` while the worker thread is running its loop
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Worker ID
    pub fn id(&self) -> WorkerId {
        self.config.id
    }

    /// Thread name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Apartment the thread is created with
    pub fn apartment(&self) -> ApartmentState {
        self.config.apartment
    }

    /// The bound queue
    pub fn queue(&self) -> &Arc<WorkItemQueue> {
        &self.queue
    }

    /// Number of items this worker has executed
    pub fn items_executed(&self) -> usize {
        self.stats.items_executed.load(Ordering::Relaxed)
    }

    /// Counters shared with the worker thread
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }
}

impl std::fmt::Debug for TestWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestWorker")
            .field("config", &self.config)
            .field("queue", &self.queue.name())
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Everything the worker thread needs
struct WorkerLoop {
    config: WorkerConfig,
    queue: Arc<WorkItemQueue>,
    observers: Vec<WorkerObserver>,
    stats: Arc<WorkerStats>,
    should_stop: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
}

impl WorkerLoop {
    fn run(self) {
        let worker = self.config.id;
        log::debug!("{} starting on {}", self.config.name, self.queue.name());

        while !self.should_stop.load(Ordering::Acquire) {
            let Some(mut item) = self.queue.dequeue(true) else {
                break;
            };

            self.notify(&WorkerEvent::Busy { worker });
            // Execute contains body failures in the item's own result
            let result = item.execute().clone();
            drop(item);
            self.stats.items_executed.fetch_add(1, Ordering::Relaxed);

            self.notify(&WorkerEvent::Executed { worker, result });
            self.queue.finish_item();
            self.notify(&WorkerEvent::Idle { worker });
        }

        self.alive.store(false, Ordering::Release);
        log::debug!(
            "{} exiting after {} items",
            self.config.name,
            self.stats.items_executed.load(Ordering::Relaxed)
        );
    }

    fn notify(&self, event: &WorkerEvent) {
        for observer in &self.observers {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| observer(event))) {
                self.stats.observer_panics.fetch_add(1, Ordering::Relaxed);
                log::error!(
                    "{}: observer panicked on {:?}: {}",
                    self.config.name,
                    event,
                    panic_message(payload.as_ref())
                );
            }
        }
    }
}

/// Set CPU affinity for the current thread (Linux only)
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn set_cpu_affinity(cpu: usize) {
    use libc::{cpu_set_t, sched_setaffinity, CPU_SET, CPU_ZERO};
    use std::mem;

    // SAFETY: the set is zero-initialized and only passed by reference for the current thread
    let rc = unsafe {
        let mut set: cpu_set_t = mem::zeroed();
        CPU_ZERO(&mut set);
        CPU_SET(cpu, &mut set);
        sched_setaffinity(0, mem::size_of::<cpu_set_t>(), &set)
    };
    if rc != 0 {
        log::warn!("Failed to pin worker thread to CPU {}", cpu);
    }
}
