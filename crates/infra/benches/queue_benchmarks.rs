use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::Utc;
use dailycast_infra::jobs::{InMemoryJobStore, Job, JobId, JobOutcome, JobStore, QueueName};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn job(i: usize) -> Job {
    Job::new(
        QueueName::SummaryGenerate,
        JobId::new(format!("summary:bench:{i}")),
        serde_json::json!({ "n": i }),
        Utc::now(),
    )
}

/// Enqueue cost, fresh ids versus duplicates of a live job.
fn bench_enqueue(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("enqueue");
    group.throughput(Throughput::Elements(1));

    group.bench_function("fresh_id", |b| {
        let store = InMemoryJobStore::new();
        let mut i = 0;
        b.iter(|| {
            i += 1;
            rt.block_on(store.enqueue(black_box(job(i)))).unwrap();
        });
    });

    group.bench_function("duplicate_id", |b| {
        let store = InMemoryJobStore::new();
        rt.block_on(store.enqueue(job(0))).unwrap();
        b.iter(|| {
            let outcome = rt.block_on(store.enqueue(black_box(job(0)))).unwrap();
            assert!(outcome.is_duplicate());
        });
    });

    group.finish();
}

/// Claim-and-complete throughput over queues of growing depth.
fn bench_claim_complete(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_complete");

    for depth in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*depth as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), depth, |b, &depth| {
            b.iter(|| {
                rt.block_on(async {
                    let store = InMemoryJobStore::new();
                    for i in 0..depth {
                        store.enqueue(job(i)).await.unwrap();
                    }
                    let now = Utc::now();
                    while let Some(mut claimed) =
                        store.claim_next(QueueName::SummaryGenerate, now).await.unwrap()
                    {
                        claimed.mark_completed(JobOutcome::Done, now, now);
                        store.update(&claimed).await.unwrap();
                    }
                })
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_enqueue, bench_claim_complete);
criterion_main!(benches);
