//! # testshift
//!
//! The concurrent execution core of a test runner.
//!
//! ## Features
//!
//! - **Work items**: a test body plus its routing flags and result
//! - **Queues**: priority work item queues with Paused/Running/Stopped states
//! - **Workers and shifts**: OS threads draining queues, grouped into shifts
//!   so parallel and non-parallel work never overlap
//! - **Events**: a thread-safe event queue and a pump thread that feeds a
//!   single listener
//! - **Cooperative context**: a single-threaded scheduler that runs async
//!   test bodies on one thread with a bounded shutdown
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use testshift::prelude::*;
//!
//! let items = vec![
//!     WorkItem::new(TestRef::new("math.adds"), |_| Ok(()))
//!         .with_strategy(ExecutionStrategy::Parallel),
//!     WorkItem::new(TestRef::new("io.reads"), |ctx| {
//!         ctx.write_output("reading\n");
//!         Ok(())
//!     }),
//! ];
//!
//! let summary = TestRunner::default().run(items, NullListener)?;
//! assert_eq!(summary.passed, 2);
//! # Ok::<(), testshift::Error>(())
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod error;
pub mod work_item;
pub mod scheduler;
pub mod event;
pub mod event_queue;
pub mod event_pump;
pub mod sync_context;
pub mod runner;

/// Convenient re-exports for common functionality
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::work_item::{
        ApartmentState, Completion, ExecutionStrategy, ResultState, TestContext, TestRef, TestResult,
        WorkItem, WorkItemPriority,
    };
    pub use crate::scheduler::{DispatcherConfig, ParallelDispatcher, WorkItemQueue, WorkShift, TestWorker};
    pub use crate::event::{NullListener, QueuingEventListener, TestEvent, TestListener};
    pub use crate::event_queue::EventQueue;
    pub use crate::event_pump::EventPump;
    pub use crate::sync_context::{ContextConfig, SingleThreadedContext};
    pub use crate::runner::{RunSummary, RunnerConfig, TestRunner};
}

// Re-export the prelude at crate root for convenience
pub use prelude::*;
