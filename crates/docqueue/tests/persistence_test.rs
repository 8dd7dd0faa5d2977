use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docqueue::{
    handler_fn, BackgroundProcessor, FileStore, HistoryRecord, InMemoryStore, Job, JobContext,
    JobError, JobMetadata, JobPriority, JobStatus, PriorityQueueManager, ProcessorConfig,
    QueuePersistence, QueueStore, Result,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(5);

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

fn metadata() -> JobMetadata {
    let mut metadata = JobMetadata::new();
    metadata.insert("tenant".to_string(), "acme".to_string());
    metadata.insert("source".to_string(), "upload".to_string());
    metadata
}

#[tokio::test]
async fn test_processing_job_round_trips_as_queued() {
    let dir = TempDir::new().unwrap();
    let mut job = Job::new("contract.pdf", JobPriority::High, metadata(), 3);
    job.start();
    job.update_progress(0.4, "ocr");

    {
        let persistence = QueuePersistence::new(FileStore::open(dir.path()).unwrap());
        persistence.save_job(&job).await.unwrap();
    }

    let persistence = QueuePersistence::new(FileStore::open(dir.path()).unwrap());
    let loaded = persistence.load_pending_jobs().await.unwrap();
    assert_eq!(loaded.len(), 1);
    let restored = &loaded[0];
    assert_eq!(restored.job_id, job.job_id);
    assert_eq!(restored.file_path, job.file_path);
    assert_eq!(restored.priority, job.priority);
    assert_eq!(restored.metadata, job.metadata);
    assert_eq!(restored.created_at, job.created_at);
    assert_eq!(restored.status, JobStatus::Queued);
}

#[tokio::test]
async fn test_queued_jobs_survive_restart() {
    let dir = TempDir::new().unwrap();

    let id = {
        let processor = BackgroundProcessor::new(
            ProcessorConfig::default(),
            PriorityQueueManager::default(),
            QueuePersistence::new(FileStore::open(dir.path()).unwrap()),
            handler_fn(|_ctx, _progress| async move { Ok(None) }),
        );
        // Never started, so the job stays queued on disk
        let id = processor
            .submit_job("invoice.pdf", JobPriority::Low, metadata())
            .await
            .unwrap();
        processor.shutdown(true).await;
        id
    };

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let seen = seen.clone();
        handler_fn(move |ctx: JobContext, _progress| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(ctx);
                Ok(None)
            }
        })
    };
    let processor = BackgroundProcessor::new(
        ProcessorConfig::default(),
        PriorityQueueManager::default(),
        QueuePersistence::new(FileStore::open(dir.path()).unwrap()),
        handler,
    );
    processor.start().await.unwrap();
    assert_eq!(wait_until_terminal(&processor, &id).await, JobStatus::Completed);

    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].job_id, id);
        assert_eq!(seen[0].file_path, "invoice.pdf");
        assert_eq!(seen[0].priority, JobPriority::Low);
        assert_eq!(seen[0].metadata, metadata());
    }
    processor.shutdown(true).await;

    let reopened = QueuePersistence::new(FileStore::open(dir.path()).unwrap());
    assert!(reopened.load_pending_jobs().await.unwrap().is_empty());
    let archived = reopened.find_archived(&id).await.unwrap().unwrap();
    assert_eq!(archived.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_restart_recovers_retrying_job() {
    let store = InMemoryStore::new();
    let mut job = Job::new("scan.tiff", JobPriority::Normal, JobMetadata::new(), 3);
    job.start();
    job.schedule_retry("disk full");
    store.save_pending(&job).await.unwrap();

    let processor = BackgroundProcessor::new(
        ProcessorConfig::default(),
        PriorityQueueManager::default(),
        QueuePersistence::new(store.clone()),
        handler_fn(|ctx: JobContext, _progress| async move {
            assert_eq!(ctx.attempt, 2);
            Ok(None)
        }),
    );
    processor.start().await.unwrap();
    assert_eq!(
        wait_until_terminal(&processor, &job.job_id).await,
        JobStatus::Completed
    );
    assert_eq!(processor.get_job(&job.job_id).await.unwrap().retry_count, 1);
    processor.shutdown(true).await;
}

/// Wraps the in-memory store and fails every write while `down` is set.
#[derive(Clone, Default)]
struct FlakyStore {
    inner: InMemoryStore,
    down: Arc<AtomicBool>,
}

impl FlakyStore {
    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            Err(JobError::Persistence("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl QueueStore for FlakyStore {
    async fn save_pending(&self, job: &Job) -> Result<()> {
        self.check()?;
        self.inner.save_pending(job).await
    }

    async fn archive(&self, record: HistoryRecord) -> Result<()> {
        self.check()?;
        self.inner.archive(record).await
    }

    async fn load_pending(&self) -> Result<Vec<Job>> {
        self.inner.load_pending().await
    }

    async fn find_archived(&self, job_id: &str) -> Result<Option<HistoryRecord>> {
        self.inner.find_archived(job_id).await
    }

    async fn history_since(&self, since: DateTime<Utc>) -> Result<Vec<HistoryRecord>> {
        self.inner.history_since(since).await
    }

    async fn purge_history_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.inner.purge_history_before(cutoff).await
    }
}

#[tokio::test]
async fn test_store_outage_does_not_block_processing() {
    let store = FlakyStore::default();
    let processor = BackgroundProcessor::new(
        ProcessorConfig::default().with_max_workers(1),
        PriorityQueueManager::default(),
        QueuePersistence::new(store.clone()),
        handler_fn(|_ctx, _progress| async move { Ok(None) }),
    );
    processor.start().await.unwrap();

    store.down.store(true, Ordering::SeqCst);
    let first = processor
        .submit_job("a.pdf", JobPriority::Normal, JobMetadata::new())
        .await
        .unwrap();
    assert_eq!(wait_until_terminal(&processor, &first).await, JobStatus::Completed);
    assert_eq!(store.inner.history_count(), 0);

    store.down.store(false, Ordering::SeqCst);
    let second = processor
        .submit_job("b.pdf", JobPriority::Normal, JobMetadata::new())
        .await
        .unwrap();
    assert_eq!(wait_until_terminal(&processor, &second).await, JobStatus::Completed);

    let deadline = tokio::time::Instant::now() + WAIT;
    while store.inner.history_count() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "failed archive never retried");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(store.inner.pending_count(), 0);
    processor.shutdown(true).await;
}

#[tokio::test]
async fn test_statistics_from_file_store() {
    let dir = TempDir::new().unwrap();
    let persistence = QueuePersistence::new(FileStore::open(dir.path()).unwrap());

    for ok in [true, true, true, true, false] {
        let mut job = Job::new("a.pdf", JobPriority::Normal, JobMetadata::new(), 0);
        job.start();
        if ok {
            job.complete(None);
        } else {
            job.fail("bad header");
        }
        persistence.archive_job(&job).await.unwrap();
    }

    let stats = persistence.get_statistics(7).await.unwrap();
    assert_eq!(stats.total, 5);
    assert_eq!(stats.success_rate, 80.0);

    let reopened = QueuePersistence::new(FileStore::open(dir.path()).unwrap());
    assert_eq!(reopened.get_statistics(7).await.unwrap().success_rate, 80.0);
}

#[tokio::test]
async fn test_retried_archive_counted_once() {
    let dir = TempDir::new().unwrap();
    let persistence = QueuePersistence::new(FileStore::open(dir.path()).unwrap());

    let mut job = Job::new("invoice.pdf", JobPriority::Normal, metadata(), 0);
    persistence.save_job(&job).await.unwrap();
    job.start();
    job.complete(None);

    // The pending snapshot cannot be rewritten while the temp path is a directory.
    let blocker = dir.path().join("pending_jobs.json.tmp");
    std::fs::create_dir(&blocker).unwrap();
    assert!(persistence.archive_job(&job).await.is_err());
    std::fs::remove_dir(&blocker).unwrap();
    persistence.archive_job(&job).await.unwrap();

    let stats = persistence.get_statistics(7).await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.successful, 1);

    let reopened = QueuePersistence::new(FileStore::open(dir.path()).unwrap());
    assert_eq!(reopened.get_statistics(7).await.unwrap().total, 1);
    assert!(reopened.load_pending_jobs().await.unwrap().is_empty());
}
