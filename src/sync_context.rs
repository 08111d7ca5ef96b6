//! Single-threaded cooperative context for async test bodies
//!
//! Continuations posted to a [`SingleThreadedContext`] from any thread all run
//! on the one thread executing [`run`](SingleThreadedContext::run), in the
//! order they were posted. [`shut_down`](SingleThreadedContext::shut_down)
//! opens a timeout window: if posted work is still outstanding when it
//! closes, the rest is discarded and `run` fails instead of hanging.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Context;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use crossbeam::channel::{bounded, RecvTimeoutError};
use futures::task::{waker_ref, ArcWake};
use parking_lot::{Condvar, Mutex, MutexGuard};
use crate::error::{Error, Result};

type Continuation = Box<dyn FnOnce() + Send + 'static>;
type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Configuration for contexts created by async work items
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// How long outstanding work may keep running once the body has completed
    pub shutdown_timeout: Duration,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Lifecycle of a [`SingleThreadedContext`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextStatus {
    /// `run` has not been called yet
    Created,
    /// `run` is executing
    Running,
    /// `shut_down` was called; draining remaining work
    ShuttingDown,
    /// No more work will run
    Terminated,
}

struct ShutdownWindow {
    deadline: Instant,
    timeout: Duration,
}

struct ContextState {
    queue: VecDeque<Continuation>,
    status: ContextStatus,
    owner: Option<ThreadId>,
    shutdown: Option<ShutdownWindow>,
    forced: bool,
    discarded: usize,
}

impl ContextState {
    fn window_closed(&self) -> Option<Duration> {
        self.shutdown
            .as_ref()
            .filter(|window| Instant::now() >= window.deadline)
            .map(|window| window.timeout)
    }

    /// Terminate, returning the discarded work so it can be dropped outside the lock
    fn force(&mut self) -> VecDeque<Continuation> {
        let dropped = std::mem::take(&mut self.queue);
        self.discarded += dropped.len();
        self.status = ContextStatus::Terminated;
        self.forced = true;
        dropped
    }

    fn forced_error(&self) -> Error {
        Error::ForcedShutdown {
            timeout: self.shutdown.as_ref().map_or(Duration::ZERO, |w| w.timeout),
            discarded: self.discarded,
        }
    }
}

struct ContextInner {
    state: Mutex<ContextState>,
    available: Condvar,
}

thread_local! {
    static CURRENT_CONTEXT: RefCell<Option<SingleThreadedContext>> = const { RefCell::new(None) };
}

/// Cooperative scheduler pinning continuations to one thread
#[derive(Clone)]
pub struct SingleThreadedContext {
    inner: Arc<ContextInner>,
}

impl SingleThreadedContext {
    /// Create a context in the Created state
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                state: Mutex::new(ContextState {
                    queue: VecDeque::new(),
                    status: ContextStatus::Created,
                    owner: None,
                    shutdown: None,
                    forced: false,
                    discarded: 0,
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// The context whose `run` is executing on the calling thread
    pub fn current() -> Option<SingleThreadedContext> {
        CURRENT_CONTEXT.with(|current| current.borrow().clone())
    }

    /// Current lifecycle status
    pub fn status(&self) -> ContextStatus {
        self.inner.state.lock().status
    }

    /// `true` while some thread is inside `run`
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().owner.is_some()
    }

    /// Number of continuations waiting to run (advisory)
    pub fn pending(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Queue a continuation for the context thread.
    ///
    /// Fails once the context has terminated. Posting after the shutdown
    /// window has closed terminates the context and discards queued work.
    pub fn post<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();

        if state.status == ContextStatus::Terminated {
            return Err(match &state.shutdown {
                Some(window) if state.forced => Error::PostAfterShutdown {
                    timeout: window.timeout,
                },
                _ => Error::ContextTerminated,
            });
        }

        if let Some(timeout) = state.window_closed() {
            let dropped = state.force();
            log::warn!(
                "Work posted {:?} after shutdown; discarding {} queued continuations",
                timeout,
                dropped.len()
            );
            drop(state);
            drop(dropped);
            self.inner.available.notify_all();
            return Err(Error::PostAfterShutdown { timeout });
        }

        state.queue.push_back(Box::new(work));
        drop(state);
        self.inner.available.notify_one();
        Ok(())
    }

    /// Run posted continuations on the calling thread until shut down.
    ///
    /// Returns `Ok` once shutdown was requested and the queue drained within
    /// the timeout, or [`Error::ForcedShutdown`] if work was still outstanding
    /// when the window closed. Calling this from a continuation, from a second
    /// thread, or after termination is an error.
    pub fn run(&self) -> Result<()> {
        let me = thread::current().id();
        {
            let mut state = self.inner.state.lock();
            match state.owner {
                Some(owner) if owner == me => return Err(Error::ReentrantRun),
                Some(_) => return Err(Error::AlreadyRunning),
                None => {}
            }
            if state.status == ContextStatus::Terminated {
                return Err(Error::ContextTerminated);
            }
            state.owner = Some(me);
            if state.status == ContextStatus::Created {
                state.status = ContextStatus::Running;
            }
        }

        let _guard = RunGuard::enter(self);
        self.pump()
    }

    fn pump(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        loop {
            if state.status == ContextStatus::Terminated {
                return Err(state.forced_error());
            }

            if !state.queue.is_empty() && state.window_closed().is_some() {
                return Err(self.terminate_forced(state));
            }

            if let Some(work) = state.queue.pop_front() {
                MutexGuard::unlocked(&mut state, work);
                if state.status != ContextStatus::Terminated && state.window_closed().is_some() {
                    return Err(self.terminate_forced(state));
                }
                continue;
            }

            if state.shutdown.is_some() {
                state.status = ContextStatus::Terminated;
                log::debug!("SingleThreadedContext drained and terminated");
                return Ok(());
            }

            self.inner.available.wait(&mut state);
        }
    }

    fn terminate_forced(&self, mut state: MutexGuard<'_, ContextState>) -> Error {
        let dropped = state.force();
        let error = state.forced_error();
        drop(state);
        log::warn!("SingleThreadedContext forced to shut down: {}", error);
        drop(dropped);
        error
    }

    /// Begin shutting down with `timeout` to finish outstanding work.
    ///
    /// Only the first call opens the window; later calls never extend it.
    pub fn shut_down(&self, timeout: Duration) {
        let mut state = self.inner.state.lock();
        if state.shutdown.is_none() && state.status != ContextStatus::Terminated {
            state.shutdown = Some(ShutdownWindow {
                deadline: Instant::now() + timeout,
                timeout,
            });
            state.status = ContextStatus::ShuttingDown;
        }
        drop(state);
        self.inner.available.notify_all();
    }

    /// Schedule `future` to be polled on this context
    pub fn spawn<F>(&self, future: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = Arc::new(LocalTask {
            future: Mutex::new(Some(Box::pin(future))),
            context: self.clone(),
            queued: AtomicBool::new(true),
        });
        self.post(move || task.poll())
    }

    /// Drive `future` to completion on the calling thread.
    ///
    /// Once the future completes the context is shut down with
    /// `shutdown_timeout` for any other work it left behind.
    pub fn block_on<F>(&self, future: F, shutdown_timeout: Duration) -> Result<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let output = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&output);
        let context = self.clone();
        self.spawn(async move {
            let value = future.await;
            *slot.lock() = Some(value);
            context.shut_down(shutdown_timeout);
        })?;

        self.run()?;
        let value = output.lock().take();
        value.ok_or(Error::Incomplete)
    }

    /// Like [`block_on`](Self::block_on), but shuts the context down if the
    /// future has not completed within `test_timeout`.
    pub fn block_on_with_timeout<F>(
        &self,
        future: F,
        shutdown_timeout: Duration,
        test_timeout: Duration,
    ) -> Result<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (done_tx, done_rx) = bounded::<()>(0);
        let timed_out = Arc::new(AtomicBool::new(false));

        let watchdog = {
            let context = self.clone();
            let timed_out = Arc::clone(&timed_out);
            thread::Builder::new()
                .name("testshift-watchdog".to_string())
                .spawn(move || {
                    if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(test_timeout) {
                        timed_out.store(true, Ordering::Release);
                        context.shut_down(Duration::ZERO);
                    }
                })
                .map_err(|e| Error::SpawnError {
                    name: "testshift-watchdog".to_string(),
                    reason: e.to_string(),
                })?
        };

        let outcome = self.block_on(future, shutdown_timeout);
        drop(done_tx);
        let _ = watchdog.join();

        match outcome {
            Err(_) if timed_out.load(Ordering::Acquire) => Err(Error::TestTimedOut {
                timeout: test_timeout,
            }),
            other => other,
        }
    }
}

impl Default for SingleThreadedContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks the calling thread as the context thread for the duration of `run`
struct RunGuard {
    context: SingleThreadedContext,
    previous: Option<SingleThreadedContext>,
}

impl RunGuard {
    fn enter(context: &SingleThreadedContext) -> Self {
        let previous = CURRENT_CONTEXT.with(|current| current.borrow_mut().replace(context.clone()));
        Self {
            context: context.clone(),
            previous,
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.context.inner.state.lock().owner = None;
        let previous = self.previous.take();
        CURRENT_CONTEXT.with(|current| *current.borrow_mut() = previous);
    }
}

/// A future polled only from continuations on its context
struct LocalTask {
    future: Mutex<Option<BoxFuture>>,
    context: SingleThreadedContext,
    queued: AtomicBool,
}

impl LocalTask {
    fn poll(self: Arc<Self>) {
        self.queued.store(false, Ordering::Release);
        let waker = waker_ref(&self);
        let mut cx = Context::from_waker(&waker);

        let mut slot = self.future.lock();
        if let Some(mut future) = slot.take() {
            if future.as_mut().poll(&mut cx).is_pending() {
                *slot = Some(future);
            }
        }
    }
}

impl ArcWake for LocalTask {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if arc_self.queued.swap(true, Ordering::AcqRel) {
            return;
        }
        let task = Arc::clone(arc_self);
        if let Err(e) = arc_self.context.post(move || task.poll()) {
            log::debug!("Dropping wake-up: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_runs_posted_work_in_order() {
        let context = SingleThreadedContext::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let seen = Arc::clone(&seen);
            context.post(move || seen.lock().push(i)).unwrap();
        }
        context.shut_down(Duration::from_secs(5));
        context.run().unwrap();

        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(context.status(), ContextStatus::Terminated);
    }

    #[test]
    fn test_recursive_post() {
        let context = SingleThreadedContext::new();
        let count = Arc::new(AtomicUsize::new(0));

        fn step(context: SingleThreadedContext, count: Arc<AtomicUsize>) {
            if count.fetch_add(1, Ordering::Relaxed) < 9 {
                let next = context.clone();
                context.post(move || step(next, count)).unwrap();
            } else {
                context.shut_down(Duration::from_secs(5));
            }
        }

        let (ctx, cnt) = (context.clone(), Arc::clone(&count));
        context.post(move || step(ctx, cnt)).unwrap();
        context.run().unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn test_reentrant_run_is_error() {
        let context = SingleThreadedContext::new();
        let inner_result = Arc::new(Mutex::new(None));

        let (ctx, slot) = (context.clone(), Arc::clone(&inner_result));
        context
            .post(move || {
                *slot.lock() = Some(ctx.run().map_err(|e| e.to_string()));
                ctx.shut_down(Duration::from_secs(1));
            })
            .unwrap();
        context.run().unwrap();

        let inner = inner_result.lock().take().unwrap();
        assert!(matches!(inner, Err(msg) if msg.contains("re-entrantly")));
    }

    #[test]
    fn test_run_after_terminated_is_error() {
        let context = SingleThreadedContext::new();
        context.shut_down(Duration::from_secs(1));
        context.run().unwrap();

        assert!(matches!(context.run(), Err(Error::ContextTerminated)));
        assert!(matches!(context.post(|| {}), Err(Error::ContextTerminated)));
    }

    #[test]
    fn test_current_is_set_inside_run() {
        let context = SingleThreadedContext::new();
        assert!(SingleThreadedContext::current().is_none());

        let inside = Arc::new(AtomicBool::new(false));
        let (ctx, flag) = (context.clone(), Arc::clone(&inside));
        context
            .post(move || {
                let current = SingleThreadedContext::current();
                flag.store(current.is_some(), Ordering::Relaxed);
                ctx.shut_down(Duration::from_secs(1));
            })
            .unwrap();
        context.run().unwrap();

        assert!(inside.load(Ordering::Relaxed));
        assert!(SingleThreadedContext::current().is_none());
    }

    #[test]
    fn test_forced_shutdown_discards_late_work() {
        let context = SingleThreadedContext::new();
        let late_ran = Arc::new(AtomicBool::new(false));

        let ctx = context.clone();
        context
            .post(move || {
                ctx.shut_down(Duration::from_millis(10));
                thread::sleep(Duration::from_millis(100));
            })
            .unwrap();
        let flag = Arc::clone(&late_ran);
        context.post(move || flag.store(true, Ordering::Relaxed)).unwrap();

        let result = context.run();
        assert!(matches!(result, Err(Error::ForcedShutdown { discarded: 1, .. })));
        assert!(!late_ran.load(Ordering::Relaxed));
        assert!(matches!(context.post(|| {}), Err(Error::PostAfterShutdown { .. })));
    }

    #[test]
    fn test_second_shutdown_does_not_extend_window() {
        let context = SingleThreadedContext::new();
        context.shut_down(Duration::from_millis(10));
        context.shut_down(Duration::from_secs(60));
        thread::sleep(Duration::from_millis(30));

        assert!(matches!(context.post(|| {}), Err(Error::PostAfterShutdown { .. })));
    }

    #[test]
    fn test_block_on_ready_future() {
        let context = SingleThreadedContext::new();
        let value = context.block_on(async { 6 * 7 }, Duration::from_secs(1)).unwrap();
        assert_eq!(value, 42);
    }
}
