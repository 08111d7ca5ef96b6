//! Lifecycle events and the listener they are delivered to

use std::sync::Arc;
use crate::event_queue::EventQueue;
use crate::work_item::{TestRef, TestResult};

/// Stream a piece of test output was written to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Standard output
    Out,
    /// Error output
    Error,
    /// Progress output shown immediately
    Progress,
}

/// Text written by a running test
#[derive(Debug, Clone)]
pub struct TestOutput {
    test: Option<TestRef>,
    stream: OutputStream,
    text: String,
}

impl TestOutput {
    /// Create an output record
    pub fn new(test: Option<TestRef>, stream: OutputStream, text: impl Into<String>) -> Self {
        Self {
            test,
            stream,
            text: text.into(),
        }
    }

    /// Test that produced the output, if known
    pub fn test(&self) -> Option<&TestRef> {
        self.test.as_ref()
    }

    /// Target stream
    pub fn stream(&self) -> OutputStream {
        self.stream
    }

    /// The text
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Free-form message addressed to a named destination
#[derive(Debug, Clone)]
pub struct TestMessage {
    test: Option<TestRef>,
    destination: String,
    text: String,
}

impl TestMessage {
    /// Create a message
    pub fn new(test: Option<TestRef>, destination: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            test,
            destination: destination.into(),
            text: text.into(),
        }
    }

    /// Test that sent the message, if known
    pub fn test(&self) -> Option<&TestRef> {
        self.test.as_ref()
    }

    /// Where the message goes
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// The text
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// A recorded call to a [`TestListener`]
#[derive(Debug, Clone)]
pub enum TestEvent {
    /// A test began executing
    TestStarted(TestRef),
    /// A test finished with a result
    TestFinished(TestResult),
    /// A test wrote output
    TestOutput(TestOutput),
    /// A test sent a message
    TestMessage(TestMessage),
}

impl TestEvent {
    /// Replay this event on `listener`
    pub fn send(&self, listener: &mut dyn TestListener) {
        match self {
            TestEvent::TestStarted(test) => listener.test_started(test),
            TestEvent::TestFinished(result) => listener.test_finished(result),
            TestEvent::TestOutput(output) => listener.test_output(output),
            TestEvent::TestMessage(message) => listener.send_message(message),
        }
    }
}

/// Receiver of test lifecycle callbacks.
///
/// Implementations need not be thread-safe: an [`EventPump`](crate::event_pump::EventPump)
/// only ever calls them from its own thread, one event at a time.
pub trait TestListener: Send {
    /// Called when a test starts
    fn test_started(&mut self, test: &TestRef);

    /// Called when a test finishes
    fn test_finished(&mut self, result: &TestResult);

    /// Called when a test writes output
    fn test_output(&mut self, output: &TestOutput);

    /// Called when a test sends a message
    fn send_message(&mut self, message: &TestMessage);
}

/// Listener that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullListener;

impl TestListener for NullListener {
    fn test_started(&mut self, _test: &TestRef) {}
    fn test_finished(&mut self, _result: &TestResult) {}
    fn test_output(&mut self, _output: &TestOutput) {}
    fn send_message(&mut self, _message: &TestMessage) {}
}

/// Listener that turns every callback back into a [`TestEvent`] on a queue
#[derive(Clone)]
pub struct QueuingEventListener {
    events: Arc<EventQueue>,
}

impl QueuingEventListener {
    /// Queue events onto `events`
    pub fn new(events: Arc<EventQueue>) -> Self {
        Self { events }
    }

    /// The queue being filled
    pub fn events(&self) -> &Arc<EventQueue> {
        &self.events
    }
}

impl Default for QueuingEventListener {
    fn default() -> Self {
        Self::new(Arc::new(EventQueue::new()))
    }
}

impl TestListener for QueuingEventListener {
    fn test_started(&mut self, test: &TestRef) {
        self.events.enqueue(TestEvent::TestStarted(test.clone()));
    }

    fn test_finished(&mut self, result: &TestResult) {
        self.events.enqueue(TestEvent::TestFinished(result.clone()));
    }

    fn test_output(&mut self, output: &TestOutput) {
        self.events.enqueue(TestEvent::TestOutput(output.clone()));
    }

    fn send_message(&mut self, message: &TestMessage) {
        self.events.enqueue(TestEvent::TestMessage(message.clone()));
    }
}
