//! Queue ordering benchmarks
//!
//! Measures effective-priority scoring and dispatch selection over queues of
//! increasing depth.

use chrono::{Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use docqueue::{Job, JobMetadata, JobPriority, PriorityQueueManager};

fn queue(depth: usize) -> Vec<Job> {
    let now = Utc::now();
    (0..depth)
        .map(|i| {
            let priority = JobPriority::ALL[i % JobPriority::ALL.len()];
            let mut job = Job::new(format!("{}.pdf", i), priority, JobMetadata::new(), 3);
            job.created_at = now - Duration::seconds((i * 7 % 3600) as i64);
            job.retry_count = (i % 3) as u32;
            job
        })
        .collect()
}

fn bench_effective_priority(c: &mut Criterion) {
    let manager = PriorityQueueManager::default();
    let jobs = queue(1);
    let now = Utc::now();

    c.bench_function("effective_priority", |b| {
        b.iter(|| manager.effective_priority_at(black_box(&jobs[0]), now))
    });
}

fn bench_select_next(c: &mut Criterion) {
    let manager = PriorityQueueManager::default();
    let mut group = c.benchmark_group("select_next");

    for depth in [10, 100, 1_000, 10_000] {
        let jobs = queue(depth);
        let now = Utc::now();
        group.bench_with_input(BenchmarkId::from_parameter(depth), &jobs, |b, jobs| {
            b.iter(|| manager.select_next(black_box(jobs.iter()), now).map(|j| j.priority))
        });
    }

    group.finish();
}

fn bench_rebalance(c: &mut Criterion) {
    let manager = PriorityQueueManager::default();
    let mut group = c.benchmark_group("rebalance_queue");

    for depth in [100, 1_000] {
        let jobs = queue(depth);
        group.bench_with_input(BenchmarkId::from_parameter(depth), &jobs, |b, jobs| {
            b.iter(|| manager.rebalance_queue(black_box(jobs)).len())
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_effective_priority,
    bench_select_next,
    bench_rebalance
);
criterion_main!(benches);
