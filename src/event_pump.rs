//! Dedicated thread that forwards queued events to a single listener
//!
//! The pump is the one point of serialization between many test threads and a
//! listener that is not assumed to be thread-safe. Workers only enqueue; the
//! listener is only ever called from the pump thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use crate::error::{panic_message, Error, Result};
use crate::event::TestListener;
use crate::event_queue::EventQueue;

/// Whether the pump thread is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPumpState {
    /// No pump thread
    Stopped,
    /// The pump thread is delivering events
    Pumping,
}

/// Drains an [`EventQueue`] on its own thread and calls one listener
pub struct EventPump {
    name: String,
    queue: Arc<EventQueue>,
    listener: Option<Box<dyn TestListener>>,
    pumping: Arc<AtomicBool>,
    delivered: Arc<AtomicUsize>,
    thread_handle: Option<JoinHandle<Box<dyn TestListener>>>,
}

impl EventPump {
    /// Bind `listener` to `queue`. The pump starts in the Stopped state.
    pub fn new(listener: impl TestListener + 'static, queue: Arc<EventQueue>) -> Self {
        Self {
            name: "EventPump".to_string(),
            queue,
            listener: Some(Box::new(listener)),
            pumping: Arc::new(AtomicBool::new(false)),
            delivered: Arc::new(AtomicUsize::new(0)),
            thread_handle: None,
        }
    }

    /// Set the pump thread's name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Name of the pump thread
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state
    pub fn state(&self) -> EventPumpState {
        if self.pumping.load(Ordering::Acquire) {
            EventPumpState::Pumping
        } else {
            EventPumpState::Stopped
        }
    }

    /// Number of events handed to the listener so far
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Start the pump thread. Starting a running pump does nothing; starting
    /// a stopped pump reopens its queue and delivers events enqueued since.
    pub fn start(&mut self) -> Result<()> {
        if self.thread_handle.is_some() {
            return Ok(());
        }
        let Some(mut listener) = self.listener.take() else {
            return Err(Error::RuntimeError {
                reason: format!("{} has no listener", self.name),
            });
        };

        self.queue.resume();
        let name = self.name.clone();
        let queue = Arc::clone(&self.queue);
        let pumping = Arc::clone(&self.pumping);
        let delivered = Arc::clone(&self.delivered);

        self.pumping.store(true, Ordering::Release);
        let spawned = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                log::debug!("{} pumping", name);
                pump_events(&name, &queue, &mut *listener, &delivered);
                pumping.store(false, Ordering::Release);
                log::debug!("{} stopped after {} events", name, delivered.load(Ordering::Relaxed));
                listener
            });

        match spawned {
            Ok(handle) => {
                self.thread_handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.pumping.store(false, Ordering::Release);
                Err(Error::SpawnError {
                    name: self.name.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Stop the queue and wait for the pump thread to deliver what is left and exit
    pub fn stop(&mut self) -> Result<()> {
        self.queue.stop();

        if let Some(handle) = self.thread_handle.take() {
            let joined = handle.join();
            self.pumping.store(false, Ordering::Release);
            match joined {
                Ok(listener) => self.listener = Some(listener),
                Err(_) => {
                    return Err(Error::ThreadPanicked {
                        name: self.name.clone(),
                    })
                }
            }
        }

        Ok(())
    }

    /// Stop the pump and hand back its listener
    pub fn into_listener(mut self) -> Result<Box<dyn TestListener>> {
        self.stop()?;
        self.listener.take().ok_or_else(|| Error::RuntimeError {
            reason: format!("{} lost its listener", self.name),
        })
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            if let Err(e) = self.stop() {
                log::error!("{}: {}", self.name, e);
            }
        }
    }
}

fn pump_events(name: &str, queue: &EventQueue, listener: &mut dyn TestListener, delivered: &AtomicUsize) {
    while let Some(event) = queue.dequeue(true) {
        let sent = panic::catch_unwind(AssertUnwindSafe(|| event.send(&mut *listener)));
        if let Err(payload) = sent {
            log::error!(
                "{}: listener panicked handling {:?}: {}",
                name,
                event,
                panic_message(payload.as_ref())
            );
        }
        delivered.fetch_add(1, Ordering::Relaxed);
    }
}
