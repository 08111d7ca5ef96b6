//! Shared helpers for testshift integration tests
//!
//! Provides a listener that records every callback together with the thread
//! it was called on, and bounded wait helpers so a broken scheduler fails a
//! test instead of hanging it.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use parking_lot::Mutex;
use testshift::event::{TestMessage, TestOutput};
use testshift::{TestListener, TestRef, TestResult};

/// Initialize the test environment once
static INIT: Once = Once::new();

/// One-time setup shared by every integration test: routes the crate's
/// `log` output through the test harness (filter with `RUST_LOG`)
pub fn init_test_env() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// A listener callback, as seen by [`RecordingListener`]
#[derive(Debug, Clone)]
pub enum Recorded {
    /// `test_started`
    Started(String),
    /// `test_finished`
    Finished(String),
    /// `test_output`
    Output(String),
    /// `send_message`
    Message(String),
}

/// Listener that records every call, the calling thread and any overlap
#[derive(Clone, Default)]
pub struct RecordingListener {
    calls: Arc<Mutex<Vec<(Recorded, ThreadId)>>>,
    in_call: Arc<AtomicUsize>,
    overlaps: Arc<AtomicUsize>,
    delay: Option<Duration>,
}

impl RecordingListener {
    /// Recording listener that sleeps `delay` inside each callback
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    /// Recorded calls so far
    pub fn calls(&self) -> Vec<Recorded> {
        self.calls.lock().iter().map(|(call, _)| call.clone()).collect()
    }

    /// Distinct threads that made callbacks, in order of first call
    pub fn threads(&self) -> Vec<ThreadId> {
        let mut seen = HashSet::new();
        self.calls
            .lock()
            .iter()
            .map(|(_, id)| *id)
            .filter(|id| seen.insert(*id))
            .collect()
    }

    /// Times a callback started while another was still running
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    fn record(&self, call: Recorded) {
        if self.in_call.fetch_add(1, Ordering::SeqCst) != 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        self.calls.lock().push((call, thread::current().id()));
        self.in_call.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TestListener for RecordingListener {
    fn test_started(&mut self, test: &TestRef) {
        self.record(Recorded::Started(test.full_name().to_string()));
    }

    fn test_finished(&mut self, result: &TestResult) {
        self.record(Recorded::Finished(result.test().full_name().to_string()));
    }

    fn test_output(&mut self, output: &TestOutput) {
        self.record(Recorded::Output(output.text().to_string()));
    }

    fn send_message(&mut self, message: &TestMessage) {
        self.record(Recorded::Message(message.text().to_string()));
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Run `f` on a helper thread and fail if it does not return within `timeout`
pub fn within<T, F>(timeout: Duration, f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = crossbeam::channel::bounded(1);
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    match rx.recv_timeout(timeout) {
        Ok(value) => value,
        Err(_) => panic!("operation did not finish within {:?}", timeout),
    }
}
