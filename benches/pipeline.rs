//! # Pipeline Benchmarks
//!
//! Throughput of the send/recv path across strategies, buffers and thread
//! counts.
//!
//! Run with: `cargo bench --bench pipeline`

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use floodgate::{
    BackpressureController, BufferKind, ControllerConfig, MemoryOrdering, PipelineRegistry,
    Strategy,
};
use std::sync::Arc;
use std::thread;

/// Single-threaded send followed by recv
fn bench_send_recv(c: &mut Criterion) {
    let mut group = c.benchmark_group("send_recv");
    group.throughput(Throughput::Elements(1));

    let kinds = [
        ("fixed", BufferKind::Fixed),
        ("ring", BufferKind::Ring),
        ("growing", BufferKind::Growing { initial_capacity: 16 }),
    ];

    for (name, kind) in kinds {
        group.bench_function(name, |b| {
            let controller = BackpressureController::new(1024, Strategy::Block, kind, None).unwrap();
            b.iter(|| {
                controller.send(std::hint::black_box(1u64)).unwrap();
                std::hint::black_box(controller.recv())
            });
        });
    }

    group.finish();
}

/// Sends into a permanently full buffer
fn bench_full_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_buffer");
    group.throughput(Throughput::Elements(1));

    for strategy in [Strategy::DropOldest, Strategy::DropNewest] {
        group.bench_function(strategy.to_string(), |b| {
            let controller = BackpressureController::new(64, strategy, BufferKind::Ring, None).unwrap();
            for i in 0..64u64 {
                controller.send(i).unwrap();
            }
            b.iter(|| controller.send(std::hint::black_box(7)));
        });
    }

    group.bench_function("try_send_full", |b| {
        let controller = BackpressureController::new(64, Strategy::Block, BufferKind::Ring, None).unwrap();
        for i in 0..64u64 {
            controller.send(i).unwrap();
        }
        b.iter(|| std::hint::black_box(controller.try_send(7)));
    });

    group.finish();
}

/// Different memory orderings for the metrics counters
fn bench_memory_orderings(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_orderings");

    let orderings = [
        ("Relaxed", MemoryOrdering::Relaxed),
        ("AcquireRelease", MemoryOrdering::AcquireRelease),
        ("Sequential", MemoryOrdering::Sequential),
    ];

    for (name, ordering) in orderings {
        group.bench_function(name, |b| {
            let config = ControllerConfig::new(1024, Strategy::Block, BufferKind::Ring)
                .with_ordering(ordering);
            let controller = BackpressureController::with_config(config).unwrap();
            b.iter(|| {
                controller.send(1u64).unwrap();
                std::hint::black_box(controller.recv())
            });
        });
    }

    group.finish();
}

/// Producers and one consumer through a small blocking buffer
fn bench_mpsc_block(c: &mut Criterion) {
    let mut group = c.benchmark_group("mpsc_block");
    const PER_PRODUCER: u64 = 10_000;

    for producers in [1, 2, 4, 8] {
        group.throughput(Throughput::Elements(producers * PER_PRODUCER));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}_producers", producers)),
            &producers,
            |b, &producers| {
                b.iter(|| {
                    let controller = Arc::new(
                        BackpressureController::new(256, Strategy::Block, BufferKind::Ring, None)
                            .unwrap(),
                    );
                    let handles: Vec<_> = (0..producers)
                        .map(|_| {
                            let controller = Arc::clone(&controller);
                            thread::spawn(move || {
                                for i in 0..PER_PRODUCER {
                                    controller.send(i).unwrap();
                                }
                            })
                        })
                        .collect();

                    let mut received = 0;
                    while received < producers * PER_PRODUCER {
                        received += controller.recv_batch(64).len() as u64;
                    }
                    for handle in handles {
                        handle.join().unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

/// Batch receive versus single receive
fn bench_recv_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("recv_batch");

    for batch in [1usize, 16, 128] {
        group.throughput(Throughput::Elements(1024));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter_batched(
                || {
                    let controller =
                        BackpressureController::new(1024, Strategy::Block, BufferKind::Ring, None)
                            .unwrap();
                    for i in 0..1024u64 {
                        controller.send(i).unwrap();
                    }
                    controller
                },
                |controller| {
                    let mut drained = 0;
                    while drained < 1024 {
                        drained += controller.recv_batch(batch).len();
                    }
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Registry lookup of an existing pipeline
fn bench_registry_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");

    group.bench_function("get_or_create_hit", |b| {
        let registry = PipelineRegistry::<u32, u64>::new(ControllerConfig::default()).unwrap();
        for key in 0..100 {
            registry.get_or_create(key);
        }
        let mut key = 0;
        b.iter(|| {
            key = (key + 1) % 100;
            std::hint::black_box(registry.get_or_create(key))
        });
    });

    group.bench_function("stats_100_pipelines", |b| {
        let registry = PipelineRegistry::<u32, u64>::new(ControllerConfig::default()).unwrap();
        for key in 0..100 {
            registry.get_or_create(key);
        }
        b.iter(|| std::hint::black_box(registry.stats()));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_send_recv,
    bench_full_buffer,
    bench_memory_orderings,
    bench_mpsc_block,
    bench_recv_batch,
    bench_registry_lookup
);
criterion_main!(benches);
