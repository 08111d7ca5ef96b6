//! End-to-end runs through the dispatcher, shifts and event pump

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use testshift::{
    ApartmentState, DispatcherConfig, ExecutionStrategy, ResultState, RunnerConfig, TestRef, TestRunner, WorkItem,
};

use common::{init_test_env, within, Recorded, RecordingListener};

fn runner(parallelism: usize) -> TestRunner {
    TestRunner::new(RunnerConfig {
        dispatcher: DispatcherConfig {
            level_of_parallelism: parallelism,
            thread_name_prefix: "RunnerWorker".to_string(),
            enable_cpu_affinity: false,
        },
        pump_name: "RunnerPump".to_string(),
    })
}

#[test]
fn test_every_item_reports_started_then_finished() {
    init_test_env();
    let items: Vec<_> = (0..40)
        .map(|i| {
            let strategy = if i % 4 == 0 {
                ExecutionStrategy::NonParallel
            } else {
                ExecutionStrategy::Parallel
            };
            WorkItem::new(TestRef::new(format!("t{}", i)), move |ctx| {
                ctx.write_output(format!("hello from {}", i));
                Ok(())
            })
            .with_strategy(strategy)
        })
        .collect();

    let listener = RecordingListener::default();
    let summary = runner(4).run(items, listener.clone()).unwrap();
    assert_eq!(summary.total(), 40);
    assert!(summary.is_success());
    assert!(summary.results.iter().all(|r| r.output().starts_with("hello from")));

    let calls = listener.calls();
    assert_eq!(calls.len(), 120);
    assert_eq!(listener.overlaps(), 0);
    for i in 0..40 {
        let name = format!("t{}", i);
        let started = calls.iter().position(|c| matches!(c, Recorded::Started(n) if *n == name));
        let finished = calls.iter().position(|c| matches!(c, Recorded::Finished(n) if *n == name));
        assert!(started.unwrap() < finished.unwrap(), "{} finished before it started", name);
    }
}

#[test]
fn test_non_parallel_items_never_overlap() {
    init_test_env();
    let running = Arc::new(AtomicUsize::new(0));
    let max_running = Arc::new(AtomicUsize::new(0));

    let items: Vec<_> = (0..10)
        .map(|i| {
            let running = Arc::clone(&running);
            let max_running = Arc::clone(&max_running);
            let apartment = if i % 2 == 0 { ApartmentState::Sta } else { ApartmentState::Mta };
            WorkItem::new(TestRef::new(format!("np{}", i)), move |_| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_running.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .with_strategy(ExecutionStrategy::NonParallel)
            .with_apartment(apartment)
        })
        .collect();

    let summary = runner(4).run(items, testshift::NullListener).unwrap();
    assert_eq!(summary.passed, 10);
    assert_eq!(max_running.load(Ordering::SeqCst), 1);
}

#[test]
fn test_parallel_items_run_concurrently() {
    init_test_env();
    let running = Arc::new(AtomicUsize::new(0));
    let max_running = Arc::new(AtomicUsize::new(0));

    let items: Vec<_> = (0..8)
        .map(|i| {
            let running = Arc::clone(&running);
            let max_running = Arc::clone(&max_running);
            WorkItem::new(TestRef::new(format!("p{}", i)), move |_| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_running.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(30));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .with_strategy(ExecutionStrategy::Parallel)
        })
        .collect();

    let summary = runner(4).run(items, testshift::NullListener).unwrap();
    assert_eq!(summary.passed, 8);
    assert!(max_running.load(Ordering::SeqCst) > 1);
}

#[test]
fn test_async_items_and_timeouts() {
    init_test_env();
    let items = vec![
        WorkItem::new_async(TestRef::new("async.ok"), |ctx| async move {
            ctx.write_output("awaited");
            Ok(())
        })
        .with_strategy(ExecutionStrategy::Parallel),
        WorkItem::new_async(TestRef::new("async.hangs"), |_| async move {
            futures::future::pending::<()>().await;
            Ok(())
        })
        .with_strategy(ExecutionStrategy::Parallel)
        .with_timeout(Duration::from_millis(50)),
    ];

    let summary = within(Duration::from_secs(10), move || {
        runner(2).run(items, testshift::NullListener).unwrap()
    });
    assert_eq!(summary.passed, 1);
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.results[0].output(), "awaited");
    assert_eq!(summary.results[1].state(), ResultState::Error);
}

#[test]
fn test_cancel_from_another_thread() {
    init_test_env();
    let runner = Arc::new(runner(1));
    let items: Vec<_> = (0..50)
        .map(|i| {
            WorkItem::new(TestRef::new(format!("slow{}", i)), |_| {
                thread::sleep(Duration::from_millis(10));
                Ok(())
            })
            .with_strategy(ExecutionStrategy::NonParallel)
        })
        .collect();

    let canceller = {
        let runner = Arc::clone(&runner);
        thread::spawn(move || {
            assert!(common::wait_until(Duration::from_secs(5), || runner.is_running()));
            thread::sleep(Duration::from_millis(30));
            runner.cancel();
        })
    };

    let summary = runner.run(items, testshift::NullListener).unwrap();
    canceller.join().unwrap();
    assert_eq!(summary.total(), 50);
    assert!(summary.cancelled > 0);
    assert_eq!(summary.passed + summary.cancelled, 50);
}
