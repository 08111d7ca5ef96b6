//! Work items: the schedulable unit wrapping one runnable test
//!
//! A [`WorkItem`] owns a test body plus the routing flags the dispatcher
//! looks at. Executing it runs the body exactly once, contains any failure in
//! the item's own [`TestResult`], and reports started/finished events into the
//! attached [`EventQueue`].

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use futures::channel::oneshot;
use parking_lot::Mutex;
use crate::error::panic_message;
use crate::event::{OutputStream, TestEvent, TestMessage, TestOutput};
use crate::event_queue::EventQueue;
use crate::sync_context::{ContextConfig, SingleThreadedContext};

/// Opaque reference to a discovered test
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestRef {
    id: usize,
    full_name: Arc<str>,
}

impl TestRef {
    /// Create a reference with a fresh id
    pub fn new(full_name: impl Into<Arc<str>>) -> Self {
        static TEST_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

        Self {
            id: TEST_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            full_name: full_name.into(),
        }
    }

    /// Unique id of this test within the process
    pub fn id(&self) -> usize {
        self.id
    }

    /// Fully qualified test name
    pub fn full_name(&self) -> &str {
        &self.full_name
    }
}

impl fmt::Display for TestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name)
    }
}

/// Dequeue priority of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkItemPriority {
    /// Dequeued before any normal item
    High,
    /// Default priority
    #[default]
    Normal,
}

/// Threading apartment a test asks its worker thread to be created with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApartmentState {
    /// No requirement
    #[default]
    Unknown,
    /// Multi-threaded apartment
    Mta,
    /// Single-threaded apartment
    Sta,
}

/// How the dispatcher should run an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionStrategy {
    /// Run immediately on the dispatching thread
    Direct,
    /// Run in the parallel shift, alongside other parallel items
    Parallel,
    /// Run in a non-parallel shift, one item at a time
    #[default]
    NonParallel,
}

/// Lifecycle of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItemState {
    /// Not yet executed
    Ready,
    /// Body is running
    Running,
    /// Result is final
    Complete,
}

/// Outcome recorded for a test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultState {
    /// The test has not run
    Inconclusive,
    /// The body returned `Ok`
    Success,
    /// The body returned `Err`
    Failure,
    /// The body panicked, timed out, or never released its context
    Error,
    /// The item was discarded before it ran
    Cancelled,
}

/// Result of running one work item
#[derive(Debug, Clone)]
pub struct TestResult {
    test: TestRef,
    state: ResultState,
    message: Option<String>,
    output: String,
    duration: Duration,
}

impl TestResult {
    /// A fresh, inconclusive result for `test`
    pub fn new(test: TestRef) -> Self {
        Self {
            test,
            state: ResultState::Inconclusive,
            message: None,
            output: String::new(),
            duration: Duration::ZERO,
        }
    }

    /// The test this result belongs to
    pub fn test(&self) -> &TestRef {
        &self.test
    }

    /// Final state
    pub fn state(&self) -> ResultState {
        self.state
    }

    /// Failure or error message, if any
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Output written by the body through its [`TestContext`]
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Wall-clock time spent in the body
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// `true` if the body succeeded
    pub fn is_success(&self) -> bool {
        self.state == ResultState::Success
    }

    fn set(&mut self, state: ResultState, message: Option<String>) {
        self.state = state;
        self.message = message;
    }
}

/// Error type test bodies return on failure
pub type BodyError = Box<dyn std::error::Error + Send + Sync>;

/// What a test body returns
pub type TestOutcome = std::result::Result<(), BodyError>;

type SyncBody = Box<dyn FnOnce(&TestContext) -> TestOutcome + Send>;
type BoxedOutcome = Pin<Box<dyn Future<Output = TestOutcome> + Send>>;
type AsyncBody = Box<dyn FnOnce(TestContext) -> BoxedOutcome + Send>;

enum Body {
    Sync(SyncBody),
    Async {
        body: AsyncBody,
        config: ContextConfig,
        timeout: Option<Duration>,
    },
}

/// Handle a test body uses to talk to the outside world
#[derive(Clone)]
pub struct TestContext {
    test: TestRef,
    events: Option<Arc<EventQueue>>,
    output: Arc<Mutex<String>>,
}

impl TestContext {
    fn new(test: TestRef, events: Option<Arc<EventQueue>>) -> Self {
        Self {
            test,
            events,
            output: Arc::new(Mutex::new(String::new())),
        }
    }

    /// The running test
    pub fn test(&self) -> &TestRef {
        &self.test
    }

    /// Write text to the test's standard output
    pub fn write_output(&self, text: impl Into<String>) {
        self.write(OutputStream::Out, text.into());
    }

    /// Write text to the test's error output
    pub fn write_error(&self, text: impl Into<String>) {
        self.write(OutputStream::Error, text.into());
    }

    /// Send a free-form message to `destination`
    pub fn send_message(&self, destination: impl Into<String>, text: impl Into<String>) {
        self.emit(TestEvent::TestMessage(TestMessage::new(
            Some(self.test.clone()),
            destination,
            text,
        )));
    }

    fn write(&self, stream: OutputStream, text: String) {
        self.output.lock().push_str(&text);
        self.emit(TestEvent::TestOutput(TestOutput::new(
            Some(self.test.clone()),
            stream,
            text,
        )));
    }

    fn emit(&self, event: TestEvent) {
        if let Some(events) = &self.events {
            events.enqueue(event);
        }
    }

    fn take_output(&self) -> String {
        std::mem::take(&mut *self.output.lock())
    }
}

/// Resolves with the final result once a work item completes
///
/// Yields `None` if the item was dropped without ever running.
pub struct Completion {
    receiver: oneshot::Receiver<TestResult>,
}

impl Completion {
    /// Block the calling thread until the item completes
    pub fn wait(self) -> Option<TestResult> {
        futures::executor::block_on(self.receiver).ok()
    }
}

impl Future for Completion {
    type Output = Option<TestResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|result| result.ok())
    }
}

/// One schedulable unit wrapping a test body
pub struct WorkItem {
    test: TestRef,
    priority: WorkItemPriority,
    apartment: ApartmentState,
    strategy: ExecutionStrategy,
    state: WorkItemState,
    body: Option<Body>,
    result: TestResult,
    events: Option<Arc<EventQueue>>,
    completion: Option<oneshot::Sender<TestResult>>,
}

impl WorkItem {
    /// Create a work item around a synchronous body
    pub fn new<F>(test: TestRef, body: F) -> Self
    where
        F: FnOnce(&TestContext) -> TestOutcome + Send + 'static,
    {
        Self::with_body(test, Body::Sync(Box::new(body)))
    }

    /// Create a work item around an async body
    ///
    /// The body runs on a fresh [`SingleThreadedContext`] installed on the
    /// executing thread, so every continuation stays on that thread.
    pub fn new_async<F, Fut>(test: TestRef, body: F) -> Self
    where
        F: FnOnce(TestContext) -> Fut + Send + 'static,
        Fut: Future<Output = TestOutcome> + Send + 'static,
    {
        let body: AsyncBody = Box::new(move |context| Box::pin(body(context)));
        Self::with_body(
            test,
            Body::Async {
                body,
                config: ContextConfig::default(),
                timeout: None,
            },
        )
    }

    fn with_body(test: TestRef, body: Body) -> Self {
        Self {
            result: TestResult::new(test.clone()),
            test,
            priority: WorkItemPriority::default(),
            apartment: ApartmentState::default(),
            strategy: ExecutionStrategy::default(),
            state: WorkItemState::Ready,
            body: Some(body),
            events: None,
            completion: None,
        }
    }

    /// Set the dequeue priority
    pub fn with_priority(mut self, priority: WorkItemPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the apartment the executing thread must have
    pub fn with_apartment(mut self, apartment: ApartmentState) -> Self {
        self.apartment = apartment;
        self
    }

    /// Set the dispatch strategy
    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Configure the cooperative context used by an async body.
    /// Has no effect on synchronous bodies.
    pub fn with_context_config(mut self, context: ContextConfig) -> Self {
        if let Some(Body::Async { config, .. }) = &mut self.body {
            *config = context;
        }
        self
    }

    /// Bound how long an async body may take.
    /// Has no effect on synchronous bodies.
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        if let Some(Body::Async { timeout, .. }) = &mut self.body {
            *timeout = Some(limit);
        }
        self
    }

    /// Route lifecycle events of this item into `events`
    pub fn attach_events(&mut self, events: Arc<EventQueue>) {
        self.events = Some(events);
    }

    /// The wrapped test
    pub fn test(&self) -> &TestRef {
        &self.test
    }

    /// Dequeue priority
    pub fn priority(&self) -> WorkItemPriority {
        self.priority
    }

    /// Requested apartment
    pub fn apartment(&self) -> ApartmentState {
        self.apartment
    }

    /// Dispatch strategy
    pub fn strategy(&self) -> ExecutionStrategy {
        self.strategy
    }

    /// Current lifecycle state
    pub fn state(&self) -> WorkItemState {
        self.state
    }

    /// Current result; inconclusive until the item completes
    pub fn result(&self) -> &TestResult {
        &self.result
    }

    /// Consume the item, keeping its result
    pub fn into_result(self) -> TestResult {
        self.result
    }

    /// Get a handle that resolves when this item completes.
    ///
    /// Only the most recently created handle is notified.
    pub fn completion(&mut self) -> Completion {
        let (sender, receiver) = oneshot::channel();
        if self.state == WorkItemState::Complete {
            let _ = sender.send(self.result.clone());
        } else {
            self.completion = Some(sender);
        }
        Completion { receiver }
    }

    /// Run the body once and record its outcome.
    ///
    /// Calling this on an item that already ran returns the stored result.
    pub fn execute(&mut self) -> &TestResult {
        if self.state != WorkItemState::Ready {
            return &self.result;
        }
        self.state = WorkItemState::Running;

        let context = TestContext::new(self.test.clone(), self.events.clone());
        context.emit(TestEvent::TestStarted(self.test.clone()));

        let start = Instant::now();
        let (state, message) = match self.body.take() {
            Some(Body::Sync(body)) => run_sync(body, &context),
            Some(Body::Async { body, config, timeout }) => {
                run_async(body, &context, &config, timeout)
            }
            None => (ResultState::Inconclusive, None),
        };
        self.result.duration = start.elapsed();
        self.result.set(state, message);
        self.result.output = context.take_output();
        self.state = WorkItemState::Complete;

        log::debug!("{} completed: {:?}", self.test, state);

        context.emit(TestEvent::TestFinished(self.result.clone()));
        if let Some(sender) = self.completion.take() {
            let _ = sender.send(self.result.clone());
        }

        &self.result
    }

    /// Mark an item that will never run as cancelled
    pub(crate) fn cancel(mut self) -> TestResult {
        self.body = None;
        self.result.set(ResultState::Cancelled, Some("Test run cancelled".to_string()));
        self.state = WorkItemState::Complete;
        if let Some(sender) = self.completion.take() {
            let _ = sender.send(self.result.clone());
        }
        self.result
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("test", &self.test)
            .field("priority", &self.priority)
            .field("strategy", &self.strategy)
            .field("state", &self.state)
            .finish()
    }
}

fn run_sync(body: SyncBody, context: &TestContext) -> (ResultState, Option<String>) {
    match panic::catch_unwind(AssertUnwindSafe(|| body(context))) {
        Ok(Ok(())) => (ResultState::Success, None),
        Ok(Err(err)) => (ResultState::Failure, Some(err.to_string())),
        Err(payload) => (ResultState::Error, Some(panic_message(payload.as_ref()))),
    }
}

fn run_async(
    body: AsyncBody,
    context: &TestContext,
    config: &ContextConfig,
    timeout: Option<Duration>,
) -> (ResultState, Option<String>) {
    let sync_context = SingleThreadedContext::new();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let future = body(context.clone());
        match timeout {
            Some(limit) => {
                sync_context.block_on_with_timeout(future, config.shutdown_timeout, limit)
            }
            None => sync_context.block_on(future, config.shutdown_timeout),
        }
    }));

    match outcome {
        Ok(Ok(Ok(()))) => (ResultState::Success, None),
        Ok(Ok(Err(err))) => (ResultState::Failure, Some(err.to_string())),
        Ok(Err(err)) => (ResultState::Error, Some(err.to_string())),
        Err(payload) => (ResultState::Error, Some(panic_message(payload.as_ref()))),
    }
}
