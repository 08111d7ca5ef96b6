//! Work item queue and dispatcher benchmarks

use std::sync::Arc;
use std::thread;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use testshift::prelude::*;

fn noop(name: usize) -> WorkItem {
    WorkItem::new(TestRef::new(format!("bench{}", name)), |_| Ok(()))
}

fn bench_enqueue_dequeue(c: &mut Criterion) {
    c.bench_function("queue_enqueue_dequeue_1000", |b| {
        b.iter(|| {
            let queue = WorkItemQueue::new("bench");
            queue.start();
            for i in 0..1000 {
                let priority = if i % 10 == 0 { WorkItemPriority::High } else { WorkItemPriority::Normal };
                queue.enqueue(noop(i).with_priority(priority));
            }
            let mut count = 0;
            while let Some(item) = queue.dequeue(false) {
                black_box(item);
                count += 1;
            }
            black_box(count);
        })
    });
}

fn bench_contended_queue(c: &mut Criterion) {
    c.bench_function("queue_4_producers_4_consumers", |b| {
        b.iter(|| {
            let queue = Arc::new(WorkItemQueue::new("contended"));
            queue.start();

            let consumers: Vec<_> = (0..4)
                .map(|_| {
                    let queue = Arc::clone(&queue);
                    thread::spawn(move || {
                        let mut count = 0;
                        while let Some(item) = queue.dequeue(true) {
                            black_box(item);
                            queue.finish_item();
                            count += 1;
                        }
                        count
                    })
                })
                .collect();

            let producers: Vec<_> = (0..4)
                .map(|p| {
                    let queue = Arc::clone(&queue);
                    thread::spawn(move || {
                        for i in 0..250 {
                            queue.enqueue(noop(p * 250 + i));
                        }
                    })
                })
                .collect();
            for producer in producers {
                producer.join().unwrap();
            }

            while queue.count() > 0 {
                thread::yield_now();
            }
            queue.stop();
            let total: usize = consumers.into_iter().map(|c| c.join().unwrap()).sum();
            black_box(total);
        })
    });
}

fn bench_dispatcher_run(c: &mut Criterion) {
    c.bench_function("dispatcher_run_200_parallel", |b| {
        b.iter(|| {
            let dispatcher = ParallelDispatcher::new(DispatcherConfig {
                level_of_parallelism: 4,
                ..Default::default()
            });
            let items = (0..200).map(|i| noop(i).with_strategy(ExecutionStrategy::Parallel));
            dispatcher.start(items).unwrap();
            dispatcher.wait_for_completion().unwrap();
            black_box(dispatcher.items_dispatched());
        })
    });
}

criterion_group!(benches, bench_enqueue_dequeue, bench_contended_queue, bench_dispatcher_run);
criterion_main!(benches);
