//! Thread-based scheduling of work items
//!
//! Work items wait in priority queues, worker threads drain the queues, and
//! shifts group queues with their workers so that parallel and non-parallel
//! work never overlap. The dispatcher ties the three together for a run.

pub mod queue;
pub mod worker;
pub mod shift;
pub mod dispatcher;

pub use queue::{WorkItemQueue, WorkItemQueueState};
pub use worker::{TestWorker, WorkerConfig, WorkerEvent, WorkerId, WorkerStats};
pub use shift::WorkShift;
pub use dispatcher::{DispatcherConfig, ParallelDispatcher, QueueKind};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatcher_creation() {
        let dispatcher = ParallelDispatcher::new(DispatcherConfig::default());
        assert!(dispatcher.config().level_of_parallelism > 0);
        assert_eq!(
            dispatcher.shifts().map(|shift| shift.name().to_string()),
            ["Parallel", "NonParallel", "NonParallelSTA"]
        );
    }
}
