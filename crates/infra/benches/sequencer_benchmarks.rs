use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::time::Duration;

use serde_json::json;
use taskmill_core::{JobOptions, LockToken, WorkerId};
use taskmill_infra::sequencer::CompletionSequencer;
use taskmill_infra::store::{InMemoryJobStore, JobStore, NextJob};
use taskmill_infra::worker::WorkerError;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("benchmark runtime")
}

/// Register `n` trivial operations, then drain every outcome.
fn bench_register_and_drain(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("sequencer_register_and_drain");

    for n in [1usize, 16, 256, 4096].iter() {
        group.throughput(Throughput::Elements(*n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), n, |b, &n| {
            b.iter(|| {
                rt.block_on(async {
                    let sequencer: CompletionSequencer<usize, WorkerError> = CompletionSequencer::new();
                    for i in 0..n {
                        sequencer.register(async move { Ok(black_box(i)) });
                    }
                    let mut seen = 0;
                    while let Ok(Some(_)) = sequencer.fetch().await {
                        seen += 1;
                    }
                    assert_eq!(seen, n);
                })
            });
        });
    }

    group.finish();
}

/// Outcomes settle out of registration order.
fn bench_out_of_order_settlement(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("sequencer_out_of_order");
    group.sample_size(20);

    group.bench_function("64_staggered_sleeps", |b| {
        b.iter(|| {
            rt.block_on(async {
                let sequencer: CompletionSequencer<u64, WorkerError> = CompletionSequencer::new();
                for i in 0..64u64 {
                    sequencer.register(async move {
                        tokio::time::sleep(Duration::from_micros((64 - i) * 10)).await;
                        Ok(i)
                    });
                }
                sequencer.wait_all().await;
                while let Ok(Some(v)) = sequencer.fetch().await {
                    black_box(v);
                }
            })
        });
    });

    group.finish();
}

/// Store-side cost of one job's lifecycle (fetch, lock, complete).
fn bench_in_memory_job_cycle(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("in_memory_job_cycle");
    group.throughput(Throughput::Elements(1));

    let store = InMemoryJobStore::new();
    let worker = WorkerId::new();
    let mut seq = 0u64;

    group.bench_function("add_fetch_complete", |b| {
        b.iter(|| {
            rt.block_on(async {
                seq += 1;
                let token = LockToken::new(worker, seq);
                store.add("bench", json!({ "n": seq }), JobOptions::default()).await.unwrap();
                match store.fetch_next_job(&token, Duration::from_secs(30)).await.unwrap() {
                    NextJob::Job(job) => store.mark_completed(&job.id, &token, json!(null)).await.unwrap(),
                    other => panic!("unexpected {other:?}"),
                }
            })
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_register_and_drain,
    bench_out_of_order_settlement,
    bench_in_memory_job_cycle
);
criterion_main!(benches);
