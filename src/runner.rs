//! One-shot test runs
//!
//! A [`TestRunner`] owns the plumbing for a run: the event queue, the pump
//! that feeds the listener and the dispatcher that executes the items.

use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::Mutex;
use crate::error::Result;
use crate::event::TestListener;
use crate::event_pump::EventPump;
use crate::event_queue::EventQueue;
use crate::scheduler::{DispatcherConfig, ParallelDispatcher};
use crate::work_item::{ResultState, TestResult, WorkItem};

/// Runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Dispatcher settings used for every run
    pub dispatcher: DispatcherConfig,
    /// Name of the event pump thread
    pub pump_name: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            pump_name: "EventPump".to_string(),
        }
    }
}

/// Outcome of a run
pub struct RunSummary {
    /// Final result of every item, in dispatch order
    pub results: Vec<TestResult>,
    /// Number of successful items
    pub passed: usize,
    /// Number of items whose body returned an error
    pub failed: usize,
    /// Number of items that panicked or timed out
    pub errors: usize,
    /// Number of items cancelled before running
    pub cancelled: usize,
    /// Number of items with no conclusive result
    pub inconclusive: usize,
    /// Wall-clock duration of the run
    pub duration: Duration,
    listener: Box<dyn TestListener>,
}

impl RunSummary {
    fn new(results: Vec<TestResult>, duration: Duration, listener: Box<dyn TestListener>) -> Self {
        let count = |state| results.iter().filter(|r| r.state() == state).count();
        Self {
            passed: count(ResultState::Success),
            failed: count(ResultState::Failure),
            errors: count(ResultState::Error),
            cancelled: count(ResultState::Cancelled),
            inconclusive: count(ResultState::Inconclusive),
            results,
            duration,
            listener,
        }
    }

    /// Total number of items
    pub fn total(&self) -> usize {
        self.results.len()
    }

    /// `true` if every item succeeded
    pub fn is_success(&self) -> bool {
        self.passed == self.total()
    }

    /// The listener, after every event was delivered to it
    pub fn listener(&self) -> &dyn TestListener {
        self.listener.as_ref()
    }

    /// Take back the listener
    pub fn into_listener(self) -> Box<dyn TestListener> {
        self.listener
    }
}

impl std::fmt::Debug for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunSummary")
            .field("total", &self.total())
            .field("passed", &self.passed)
            .field("failed", &self.failed)
            .field("errors", &self.errors)
            .field("cancelled", &self.cancelled)
            .field("inconclusive", &self.inconclusive)
            .field("duration", &self.duration)
            .finish()
    }
}

/// Executes batches of work items and reports their events to a listener
pub struct TestRunner {
    config: RunnerConfig,
    active: Mutex<Option<Arc<ParallelDispatcher>>>,
}

impl TestRunner {
    /// Create a runner
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            active: Mutex::new(None),
        }
    }

    /// Runner configuration
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// `true` while a run is in progress
    pub fn is_running(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Run `items` to completion, delivering every event to `listener` on the
    /// pump thread. Returns once all events have been delivered.
    pub fn run(&self, items: Vec<WorkItem>, listener: impl TestListener + 'static) -> Result<RunSummary> {
        let start = Instant::now();
        let events = Arc::new(EventQueue::new());
        let mut pump = EventPump::new(listener, Arc::clone(&events)).with_name(self.config.pump_name.clone());
        pump.start()?;

        let mut completions = Vec::with_capacity(items.len());
        let items: Vec<_> = items
            .into_iter()
            .map(|mut item| {
                item.attach_events(Arc::clone(&events));
                completions.push((item.test().clone(), item.completion()));
                item
            })
            .collect();
        log::info!("Starting run of {} items", items.len());

        let dispatcher = ParallelDispatcher::new(self.config.dispatcher.clone());
        *self.active.lock() = Some(Arc::clone(&dispatcher));
        let dispatched = dispatcher
            .start(items)
            .and_then(|()| dispatcher.wait_for_completion());
        self.active.lock().take();
        if let Err(e) = dispatched {
            dispatcher.cancel_run();
            return Err(e);
        }

        let results = completions
            .into_iter()
            .map(|(test, completion)| completion.wait().unwrap_or_else(|| TestResult::new(test)))
            .collect();
        let listener = pump.into_listener()?;

        let summary = RunSummary::new(results, start.elapsed(), listener);
        log::info!("Run finished: {:?}", summary);
        Ok(summary)
    }

    /// Cancel the run in progress, if any. Items not yet started are
    /// reported as cancelled.
    pub fn cancel(&self) {
        if let Some(dispatcher) = self.active.lock().as_ref() {
            dispatcher.cancel_run();
        }
    }
}

impl Default for TestRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}
