//! End-to-end processor throughput with a no-op handler.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use docqueue::{
    handler_fn, BackgroundProcessor, JobPriority, PriorityQueueManager, ProcessorConfig,
    QueuePersistence,
};
use std::time::Duration;

fn bench_batch_throughput(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("process_batch_sync");
    group.sample_size(20);

    for workers in [1, 4] {
        let processor = runtime.block_on(async {
            let processor = BackgroundProcessor::new(
                ProcessorConfig::default().with_max_workers(workers),
                PriorityQueueManager::default(),
                QueuePersistence::in_memory(),
                handler_fn(|_ctx, _progress| async move { Ok(None) }),
            );
            processor.start().await.unwrap();
            processor
        });

        let paths: Vec<String> = (0..100).map(|i| format!("{}.pdf", i)).collect();
        group.throughput(Throughput::Elements(paths.len() as u64));
        group.bench_with_input(BenchmarkId::new("workers", workers), &paths, |b, paths| {
            b.to_async(&runtime).iter(|| async {
                processor
                    .process_batch_sync(paths, JobPriority::Normal, Duration::from_secs(30))
                    .await
                    .unwrap()
            })
        });

        runtime.block_on(processor.shutdown(true));
    }

    group.finish();
}

criterion_group!(benches, bench_batch_throughput);
criterion_main!(benches);
