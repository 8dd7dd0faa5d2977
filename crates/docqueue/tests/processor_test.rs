use async_trait::async_trait;
use docqueue::{
    handler_fn, BackgroundProcessor, HandlerResult, InMemoryStore, JobContext, JobError,
    JobHandler, JobMetadata, JobPriority, JobStatus, PriorityQueueManager, ProcessorConfig,
    ProgressReporter, QueuePersistence,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

const WAIT: Duration = Duration::from_secs(5);

fn fast_config(workers: usize) -> ProcessorConfig {
    ProcessorConfig::default()
        .with_max_workers(workers)
        .with_retry_delay(Duration::from_millis(10), Duration::from_millis(40))
}

fn build<H: JobHandler>(config: ProcessorConfig, handler: H) -> BackgroundProcessor {
    BackgroundProcessor::new(
        config,
        PriorityQueueManager::default(),
        QueuePersistence::in_memory(),
        handler,
    )
}

async fn wait_for_status(processor: &BackgroundProcessor, job_id: &str, wanted: JobStatus) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let status = processor.get_job_status(job_id).await;
        if status == Some(wanted) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} stuck in {:?}, wanted {:?}",
            job_id,
            status,
            wanted
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_until_terminal(processor: &BackgroundProcessor, job_id: &str) -> JobStatus {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Some(status) = processor.get_job_status(job_id).await {
            if status.is_terminal() {
                return status;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "job {} never finished", job_id);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Records the order in which jobs start and how often each one ran.
#[derive(Clone, Default)]
struct RecordingHandler {
    started: Arc<Mutex<Vec<JobPriority>>>,
    runs: Arc<Mutex<HashMap<String, u32>>>,
    delay: Duration,
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn handle(&self, ctx: JobContext, progress: ProgressReporter) -> HandlerResult {
        self.started.lock().unwrap().push(ctx.priority);
        *self.runs.lock().unwrap().entry(ctx.job_id.clone()).or_default() += 1;
        tokio::time::sleep(self.delay).await;
        progress.report(1.0, "done");
        Ok(None)
    }
}

#[tokio::test]
async fn test_status_visible_immediately() {
    let processor = build(fast_config(1), RecordingHandler::default());
    processor.start().await.unwrap();

    let id = processor
        .submit_job("a.pdf", JobPriority::Normal, JobMetadata::new())
        .await
        .unwrap();
    let status = tokio::time::timeout(Duration::from_millis(100), processor.get_job_status(&id))
        .await
        .unwrap();
    assert!(matches!(
        status,
        Some(JobStatus::Queued) | Some(JobStatus::Processing) | Some(JobStatus::Completed)
    ));

    assert_eq!(wait_until_terminal(&processor, &id).await, JobStatus::Completed);
    processor.shutdown(true).await;
}

#[tokio::test]
async fn test_start_order_follows_priority() {
    let handler = RecordingHandler {
        delay: Duration::from_millis(20),
        ..Default::default()
    };
    let processor = build(fast_config(1), handler.clone());

    let mut ids = Vec::new();
    for priority in [JobPriority::Low, JobPriority::Critical, JobPriority::Normal] {
        ids.push(
            processor
                .submit_job("doc.pdf", priority, JobMetadata::new())
                .await
                .unwrap(),
        );
    }
    processor.start().await.unwrap();
    for id in &ids {
        wait_until_terminal(&processor, id).await;
    }

    assert_eq!(
        *handler.started.lock().unwrap(),
        vec![JobPriority::Critical, JobPriority::Normal, JobPriority::Low]
    );
    processor.shutdown(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_double_dispatch() {
    let in_flight = Arc::new(Mutex::new(HashSet::<String>::new()));
    let overlaps = Arc::new(Mutex::new(0u32));
    let runs = Arc::new(Mutex::new(HashMap::<String, u32>::new()));

    let handler = {
        let (in_flight, overlaps, runs) = (in_flight.clone(), overlaps.clone(), runs.clone());
        handler_fn(move |ctx: JobContext, _progress| {
            let (in_flight, overlaps, runs) = (in_flight.clone(), overlaps.clone(), runs.clone());
            async move {
                if !in_flight.lock().unwrap().insert(ctx.job_id.clone()) {
                    *overlaps.lock().unwrap() += 1;
                }
                *runs.lock().unwrap().entry(ctx.job_id.clone()).or_default() += 1;
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_flight.lock().unwrap().remove(&ctx.job_id);
                Ok(None)
            }
        })
    };
    let processor = build(fast_config(4), handler);
    processor.start().await.unwrap();

    let mut submitters = Vec::new();
    for task in 0..5 {
        let processor = processor.clone();
        submitters.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            for n in 0..10 {
                let priority = JobPriority::ALL[(task + n) % JobPriority::ALL.len()];
                ids.push(
                    processor
                        .submit_job(&format!("{}-{}.pdf", task, n), priority, JobMetadata::new())
                        .await
                        .unwrap(),
                );
            }
            ids
        }));
    }

    let mut all_ids = Vec::new();
    for submitter in submitters {
        all_ids.extend(submitter.await.unwrap());
    }
    for id in &all_ids {
        assert_eq!(wait_until_terminal(&processor, id).await, JobStatus::Completed);
    }

    assert_eq!(*overlaps.lock().unwrap(), 0);
    let runs = runs.lock().unwrap();
    assert_eq!(runs.len(), 50);
    assert!(runs.values().all(|&n| n == 1));
    assert_eq!(processor.get_queue_status().stats.completed, 50);
    processor.shutdown(true).await;
}

#[tokio::test]
async fn test_fails_twice_then_succeeds() {
    let attempts = Arc::new(Mutex::new(0u32));
    let handler = {
        let attempts = attempts.clone();
        handler_fn(move |ctx: JobContext, _progress| {
            let attempts = attempts.clone();
            async move {
                *attempts.lock().unwrap() += 1;
                if ctx.attempt <= 2 {
                    Err(JobError::handler(format!("transient failure {}", ctx.attempt)))
                } else {
                    Ok(Some(serde_json::json!({ "pages": 3 })))
                }
            }
        })
    };
    let processor = build(fast_config(1).with_max_retries(3), handler);
    processor.start().await.unwrap();

    let id = processor
        .submit_job("flaky.pdf", JobPriority::Normal, JobMetadata::new())
        .await
        .unwrap();
    assert_eq!(wait_until_terminal(&processor, &id).await, JobStatus::Completed);

    let job = processor.get_job(&id).await.unwrap();
    assert_eq!(job.retry_count, 2);
    assert_eq!(job.result, Some(serde_json::json!({ "pages": 3 })));
    assert_eq!(*attempts.lock().unwrap(), 3);
    assert_eq!(processor.get_queue_status().stats.retried, 2);
    processor.shutdown(true).await;
}

#[tokio::test]
async fn test_retries_exhausted_keeps_last_error() {
    let handler = handler_fn(|ctx: JobContext, _progress| async move {
        Err(JobError::handler(format!("attempt {} failed", ctx.attempt)))
    });
    let processor = build(fast_config(1).with_max_retries(2), handler);
    processor.start().await.unwrap();

    let id = processor
        .submit_job("broken.pdf", JobPriority::High, JobMetadata::new())
        .await
        .unwrap();
    assert_eq!(wait_until_terminal(&processor, &id).await, JobStatus::Failed);

    let job = processor.get_job(&id).await.unwrap();
    assert_eq!(job.retry_count, 2);
    assert_eq!(job.error_message.as_deref(), Some("attempt 3 failed"));
    processor.shutdown(true).await;
}

#[tokio::test]
async fn test_per_job_retry_budget() {
    let handler = handler_fn(|_ctx, _progress| async move { Err(JobError::handler("nope")) });
    let processor = build(fast_config(1).with_max_retries(5), handler);
    processor.start().await.unwrap();

    let id = processor
        .submit_job_with_options("once.pdf", JobPriority::Normal, JobMetadata::new(), 0)
        .await
        .unwrap();
    assert_eq!(wait_until_terminal(&processor, &id).await, JobStatus::Failed);
    assert_eq!(processor.get_job(&id).await.unwrap().retry_count, 0);
    processor.shutdown(true).await;
}

/// Blocks on `release` for `slow.pdf`, returns immediately otherwise.
fn gated_handler(release: Arc<Notify>, seen: Arc<Mutex<Vec<String>>>) -> impl JobHandler {
    handler_fn(move |ctx: JobContext, progress: ProgressReporter| {
        let (release, seen) = (release.clone(), seen.clone());
        async move {
            seen.lock().unwrap().push(ctx.file_path.clone());
            if ctx.file_path == "slow.pdf" {
                progress.report(0.5, "waiting");
                tokio::select! {
                    _ = release.notified() => {}
                    _ = progress.cancelled() => return Err(JobError::Cancelled),
                }
            }
            Ok(None)
        }
    })
}

#[tokio::test]
async fn test_pause_holds_queued_jobs() {
    let release = Arc::new(Notify::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let processor = build(fast_config(1), gated_handler(release.clone(), seen.clone()));
    processor.start().await.unwrap();

    let slow = processor
        .submit_job("slow.pdf", JobPriority::Normal, JobMetadata::new())
        .await
        .unwrap();
    wait_for_status(&processor, &slow, JobStatus::Processing).await;

    processor.pause_processing();
    assert!(processor.is_paused());
    let a = processor
        .submit_job("a.pdf", JobPriority::Critical, JobMetadata::new())
        .await
        .unwrap();
    let b = processor
        .submit_job("b.pdf", JobPriority::Critical, JobMetadata::new())
        .await
        .unwrap();

    release.notify_one();
    wait_for_status(&processor, &slow, JobStatus::Completed).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(processor.get_job_status(&a).await, Some(JobStatus::Queued));
    assert_eq!(processor.get_job_status(&b).await, Some(JobStatus::Queued));
    assert_eq!(processor.get_queue_status().queued, 2);

    processor.resume_processing();
    assert_eq!(wait_until_terminal(&processor, &a).await, JobStatus::Completed);
    assert_eq!(wait_until_terminal(&processor, &b).await, JobStatus::Completed);
    processor.shutdown(true).await;
}

#[tokio::test]
async fn test_cancel_queued_job_never_runs() {
    let release = Arc::new(Notify::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let processor = build(fast_config(1), gated_handler(release, seen.clone()));

    let id = processor
        .submit_job("cancel-me.pdf", JobPriority::Normal, JobMetadata::new())
        .await
        .unwrap();
    assert!(processor.cancel_job(&id).await);
    assert!(!processor.cancel_job(&id).await);
    assert_eq!(processor.get_job_status(&id).await, Some(JobStatus::Cancelled));

    let other = processor
        .submit_job("other.pdf", JobPriority::Background, JobMetadata::new())
        .await
        .unwrap();
    processor.start().await.unwrap();
    wait_until_terminal(&processor, &other).await;

    assert_eq!(*seen.lock().unwrap(), vec!["other.pdf".to_string()]);
    assert_eq!(processor.get_queue_status().stats.cancelled, 1);
    processor.shutdown(true).await;
}

#[tokio::test]
async fn test_cancel_running_job_at_checkpoint() {
    let release = Arc::new(Notify::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let processor = build(fast_config(1), gated_handler(release, seen));
    processor.start().await.unwrap();

    let id = processor
        .submit_job("slow.pdf", JobPriority::Normal, JobMetadata::new())
        .await
        .unwrap();
    wait_for_status(&processor, &id, JobStatus::Processing).await;

    assert!(processor.cancel_job(&id).await);
    assert_eq!(wait_until_terminal(&processor, &id).await, JobStatus::Cancelled);
    assert!(!processor.cancel_job(&id).await);
    processor.shutdown(true).await;
}

#[tokio::test]
async fn test_cancel_after_last_checkpoint_completes() {
    let passed = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let handler = {
        let (passed, release) = (passed.clone(), release.clone());
        handler_fn(move |_ctx, progress: ProgressReporter| {
            let (passed, release) = (passed.clone(), release.clone());
            async move {
                progress.checkpoint()?;
                passed.notify_one();
                release.notified().await;
                Ok(Some(serde_json::json!({ "pages": 1 })))
            }
        })
    };
    let processor = build(fast_config(1), handler);
    processor.start().await.unwrap();

    let id = processor
        .submit_job("late.pdf", JobPriority::Normal, JobMetadata::new())
        .await
        .unwrap();
    wait_for_status(&processor, &id, JobStatus::Processing).await;
    tokio::time::timeout(WAIT, passed.notified()).await.unwrap();

    assert!(processor.cancel_job(&id).await);
    // Flag already set, nothing more to do
    assert!(!processor.cancel_job(&id).await);
    assert_eq!(processor.get_job_status(&id).await, Some(JobStatus::Processing));

    release.notify_one();
    assert_eq!(wait_until_terminal(&processor, &id).await, JobStatus::Completed);
    let job = processor.get_job(&id).await.unwrap();
    assert_eq!(job.result, Some(serde_json::json!({ "pages": 1 })));
    assert_eq!(processor.get_queue_status().stats.cancelled, 0);
    processor.shutdown(true).await;
}

#[tokio::test]
async fn test_cancel_during_retry_backoff() {
    let attempts = Arc::new(Mutex::new(0u32));
    let handler = {
        let attempts = attempts.clone();
        handler_fn(move |_ctx, _progress| {
            let attempts = attempts.clone();
            async move {
                *attempts.lock().unwrap() += 1;
                Err(JobError::handler("storage offline"))
            }
        })
    };
    let config = fast_config(1)
        .with_max_retries(3)
        .with_retry_delay(Duration::from_millis(500), Duration::from_millis(500));
    let processor = build(config, handler);
    processor.start().await.unwrap();

    let id = processor
        .submit_job("backoff.pdf", JobPriority::Normal, JobMetadata::new())
        .await
        .unwrap();
    wait_for_status(&processor, &id, JobStatus::Retrying).await;

    assert!(processor.cancel_job(&id).await);
    assert_eq!(processor.get_job_status(&id).await, Some(JobStatus::Cancelled));

    // Outlive the backoff; the pending requeue must find nothing to revive.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(processor.get_job_status(&id).await, Some(JobStatus::Cancelled));
    assert_eq!(*attempts.lock().unwrap(), 1);

    let snapshot = processor.get_queue_status();
    assert_eq!(snapshot.queued, 0);
    assert_eq!(snapshot.retrying, 0);
    assert_eq!(snapshot.stats.cancelled, 1);
    processor.shutdown(true).await;
}

#[tokio::test]
async fn test_progress_and_callbacks() {
    let release = Arc::new(Notify::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let processor = build(fast_config(1), gated_handler(release.clone(), seen));

    let updates = Arc::new(Mutex::new(Vec::new()));
    {
        let updates = updates.clone();
        processor.register_progress_callback(move |p| {
            updates.lock().unwrap().push((p.progress, p.current_step.clone()));
        });
    }
    processor.start().await.unwrap();

    let id = processor
        .submit_job("slow.pdf", JobPriority::High, JobMetadata::new())
        .await
        .unwrap();
    wait_for_status(&processor, &id, JobStatus::Processing).await;

    let deadline = tokio::time::Instant::now() + WAIT;
    while updates.lock().unwrap().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "no progress callback");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(*updates.lock().unwrap(), vec![(0.5, "waiting".to_string())]);

    let progress = processor.get_job_progress(&id).await.unwrap();
    assert_eq!(progress.status, JobStatus::Processing);
    assert_eq!(progress.progress, 0.5);
    assert_eq!(progress.current_step, "waiting");
    assert_eq!(progress.steps_completed, 1);

    release.notify_one();
    wait_until_terminal(&processor, &id).await;
    let done = processor.get_job_progress(&id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 1.0);
    processor.shutdown(true).await;
}

#[tokio::test]
async fn test_submit_batch() {
    let processor = build(fast_config(2), RecordingHandler::default());
    assert!(processor
        .submit_batch(&[], JobPriority::Normal)
        .await
        .unwrap()
        .is_empty());

    let paths = vec!["a.pdf".to_string(), "".to_string(), "b.pdf".to_string()];
    let ids = processor.submit_batch(&paths, JobPriority::Low).await.unwrap();
    assert_eq!(ids.len(), 2);
    assert_eq!(processor.get_queue_status().queued, 2);
}

#[tokio::test]
async fn test_process_batch_sync() {
    let handler = handler_fn(|ctx: JobContext, _progress| async move {
        if ctx.file_path.starts_with("bad") {
            Err(JobError::handler("unreadable"))
        } else {
            Ok(None)
        }
    });
    let processor = build(fast_config(2).with_max_retries(0), handler);
    processor.start().await.unwrap();

    let paths: Vec<String> = ["a.pdf", "bad.pdf", "b.pdf"].iter().map(|s| s.to_string()).collect();
    let result = processor
        .process_batch_sync(&paths, JobPriority::Normal, WAIT)
        .await
        .unwrap();
    assert_eq!(result.total_jobs, 3);
    assert_eq!(result.successful, 2);
    assert_eq!(result.failed, 1);
    assert!(!result.timed_out);

    let empty = processor
        .process_batch_sync(&[], JobPriority::Normal, WAIT)
        .await
        .unwrap();
    assert_eq!(empty.total_jobs, 0);
    processor.shutdown(true).await;
}

#[tokio::test]
async fn test_process_batch_sync_timeout() {
    let handler = RecordingHandler {
        delay: Duration::from_secs(30),
        ..Default::default()
    };
    let processor = build(fast_config(1), handler);
    processor.start().await.unwrap();

    let paths = vec!["a.pdf".to_string(), "b.pdf".to_string()];
    let result = processor
        .process_batch_sync(&paths, JobPriority::Normal, Duration::from_millis(50))
        .await
        .unwrap();
    assert!(result.timed_out);
    assert_eq!(result.successful + result.failed, 0);
    processor.shutdown(false).await;
}

#[tokio::test]
async fn test_job_timeout_fails_job() {
    let handler = RecordingHandler {
        delay: Duration::from_secs(30),
        ..Default::default()
    };
    let processor = build(
        fast_config(1).with_job_timeout(Duration::from_millis(50)),
        handler,
    );
    processor.start().await.unwrap();

    let id = processor
        .submit_job("huge.pdf", JobPriority::Normal, JobMetadata::new())
        .await
        .unwrap();
    assert_eq!(wait_until_terminal(&processor, &id).await, JobStatus::Failed);
    let job = processor.get_job(&id).await.unwrap();
    assert!(job.error_message.unwrap().contains("timed out"));
    processor.shutdown(true).await;
}

#[tokio::test]
async fn test_handler_panic_does_not_kill_worker() {
    let handler = handler_fn(|ctx: JobContext, _progress| async move {
        if ctx.file_path == "panic.pdf" {
            panic!("malformed xref table");
        }
        Ok(None)
    });
    let processor = build(fast_config(1).with_max_retries(0), handler);
    processor.start().await.unwrap();

    let bad = processor
        .submit_job("panic.pdf", JobPriority::Critical, JobMetadata::new())
        .await
        .unwrap();
    let good = processor
        .submit_job("fine.pdf", JobPriority::Low, JobMetadata::new())
        .await
        .unwrap();

    assert_eq!(wait_until_terminal(&processor, &bad).await, JobStatus::Failed);
    assert_eq!(wait_until_terminal(&processor, &good).await, JobStatus::Completed);
    let job = processor.get_job(&bad).await.unwrap();
    assert!(job.error_message.unwrap().contains("malformed xref table"));
    processor.shutdown(true).await;
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_job() {
    let release = Arc::new(Notify::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let processor = build(fast_config(2), gated_handler(release.clone(), seen));
    processor.start().await.unwrap();
    processor.start().await.unwrap();

    let id = processor
        .submit_job("slow.pdf", JobPriority::Normal, JobMetadata::new())
        .await
        .unwrap();
    wait_for_status(&processor, &id, JobStatus::Processing).await;

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        release.notify_one();
    });
    processor.shutdown(true).await;

    assert_eq!(processor.get_job_status(&id).await, Some(JobStatus::Completed));
    assert!(matches!(
        processor
            .submit_job("late.pdf", JobPriority::Normal, JobMetadata::new())
            .await,
        Err(JobError::ShuttingDown)
    ));
}

#[tokio::test]
async fn test_statistics_through_processor() {
    let handler = handler_fn(|ctx: JobContext, _progress| async move {
        if ctx.file_path == "bad.pdf" {
            Err(JobError::handler("unsupported encoding"))
        } else {
            Ok(None)
        }
    });
    let store = InMemoryStore::new();
    let processor = BackgroundProcessor::new(
        fast_config(2).with_max_retries(0),
        PriorityQueueManager::default(),
        QueuePersistence::new(store.clone()),
        handler,
    );
    processor.start().await.unwrap();

    let paths: Vec<String> = ["1.pdf", "2.pdf", "3.pdf", "4.pdf", "bad.pdf"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let result = processor
        .process_batch_sync(&paths, JobPriority::Normal, WAIT)
        .await
        .unwrap();
    assert_eq!(result.successful, 4);

    // The batch can resolve before a sibling's archive write lands
    let deadline = tokio::time::Instant::now() + WAIT;
    while store.history_count() < 5 {
        assert!(tokio::time::Instant::now() < deadline, "history never caught up");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let stats = processor.get_statistics(7).await.unwrap();
    assert_eq!(stats.success_rate, 80.0);
    assert_eq!(store.pending_count(), 0);
    assert_eq!(store.history_count(), 5);
    processor.shutdown(true).await;
}
