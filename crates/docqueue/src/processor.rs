//! The background processor: submission API, worker pool and lifecycle.
//!
//! All in-memory job state lives behind one mutex that is never held across
//! an `.await`. Workers park on a [`Notify`] that is armed before the queue is
//! inspected, so a submission racing with a worker going idle is never lost.
//! A job is removed from the queue and moved to `Processing` in the same
//! critical section, which is what guarantees a single owner per job.
//!
//! Persistence is best effort: every write stores the latest in-memory
//! snapshot, failures are logged and the next state change writes again.

use crate::config::ProcessorConfig;
use crate::error::{JobError, Result};
use crate::job::{
    BatchProcessingResult, Job, JobContext, JobHandler, JobMetadata, JobOutcome, JobPriority,
    JobStatus, ProcessingProgress, ProgressReporter, ProgressSink,
};
use crate::persistence::{QueuePersistence, QueueStatistics};
use crate::priority::PriorityQueueManager;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Called on every accepted progress update, on the reporting worker's
/// thread. Must be fast and must not block.
pub type ProgressCallback = Arc<dyn Fn(&ProcessingProgress) + Send + Sync>;

/// Counters since the processor was constructed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessorStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
}

/// Point-in-time view of the queue, computed on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub queued: usize,
    /// Jobs currently held by a worker.
    pub active: usize,
    /// Jobs waiting out a retry backoff.
    pub retrying: usize,
    /// Jobs that reached a terminal state since startup.
    pub completed: u64,
    pub paused: bool,
    pub workers: usize,
    pub oldest_queued_at: Option<DateTime<Utc>>,
    pub stats: ProcessorStats,
}

struct BatchState {
    remaining: usize,
    successful: usize,
    failed: usize,
    done: Arc<Notify>,
}

#[derive(Default)]
struct State {
    /// Every non-terminal job.
    jobs: HashMap<String, Job>,
    /// Ids of jobs in `Queued`.
    queue: Vec<String>,
    /// Cancellation tokens of jobs in `Processing`.
    tokens: HashMap<String, CancellationToken>,
    finished: HashMap<String, Job>,
    finished_order: VecDeque<String>,
    /// Terminal jobs whose archive write failed.
    unarchived: Vec<Job>,
    batches: HashMap<u64, BatchState>,
    job_batches: HashMap<String, u64>,
    next_batch_id: u64,
    paused: bool,
    shutting_down: bool,
    stats: ProcessorStats,
}

impl State {
    /// Bookkeeping for a job that just became terminal. Returns the batch
    /// notifier when this job was the last outstanding member of a batch.
    fn retire(&mut self, job: Job, cache_size: usize) -> Option<Arc<Notify>> {
        match job.status {
            JobStatus::Completed => self.stats.completed += 1,
            JobStatus::Failed => self.stats.failed += 1,
            JobStatus::Cancelled => self.stats.cancelled += 1,
            _ => {}
        }

        let mut notify = None;
        if let Some(batch_id) = self.job_batches.remove(&job.job_id) {
            if let Some(batch) = self.batches.get_mut(&batch_id) {
                batch.remaining = batch.remaining.saturating_sub(1);
                if job.status == JobStatus::Completed {
                    batch.successful += 1;
                } else {
                    batch.failed += 1;
                }
                if batch.remaining == 0 {
                    notify = Some(batch.done.clone());
                }
            }
        }

        if cache_size > 0 {
            while self.finished_order.len() >= cache_size {
                if let Some(evicted) = self.finished_order.pop_front() {
                    self.finished.remove(&evicted);
                }
            }
            self.finished_order.push_back(job.job_id.clone());
            self.finished.insert(job.job_id.clone(), job);
        }

        notify
    }
}

enum Claim {
    Ready(Job, CancellationToken),
    Idle,
    Shutdown,
}

struct Inner {
    config: ProcessorConfig,
    priority: PriorityQueueManager,
    persistence: QueuePersistence,
    handler: Arc<dyn JobHandler>,
    state: Mutex<State>,
    work_available: Notify,
    persist_lock: tokio::sync::Mutex<()>,
    callbacks: RwLock<Vec<ProgressCallback>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue_new(
        &self,
        file_path: &str,
        priority: JobPriority,
        metadata: JobMetadata,
        max_retries: u32,
        batch: Option<u64>,
    ) -> Result<String> {
        if file_path.trim().is_empty() {
            return Err(JobError::Validation("file_path must not be empty".to_string()));
        }

        let job = Job::new(file_path, priority, metadata, max_retries);
        let job_id = job.job_id.clone();

        let mut state = self.lock_state();
        if state.shutting_down {
            return Err(JobError::ShuttingDown);
        }
        state.queue.push(job_id.clone());
        state.jobs.insert(job_id.clone(), job);
        state.stats.submitted += 1;
        if let Some(batch_id) = batch {
            state.job_batches.insert(job_id.clone(), batch_id);
        }
        Ok(job_id)
    }

    fn try_claim(&self) -> Claim {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        if state.shutting_down {
            return Claim::Shutdown;
        }
        if state.paused {
            return Claim::Idle;
        }

        let now = Utc::now();
        let next = self
            .priority
            .select_next(state.queue.iter().filter_map(|id| state.jobs.get(id)), now)
            .map(|job| (job.job_id.clone(), self.priority.effective_priority_at(job, now)));
        let Some((job_id, effective)) = next else {
            return Claim::Idle;
        };
        debug!(
            job_id = %job_id,
            effective_priority = effective.value(),
            queued = state.queue.len(),
            "Dispatching job"
        );

        state.queue.retain(|id| id != &job_id);
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Claim::Idle;
        };
        if !job.start() {
            warn!(job_id = %job_id, status = %job.status, "Queued entry was not startable");
            return Claim::Idle;
        }
        let snapshot = job.clone();
        let token = CancellationToken::new();
        state.tokens.insert(job_id, token.clone());
        Claim::Ready(snapshot, token)
    }

    /// Waits until a job can be claimed. `None` once shutdown has begun.
    async fn next_job(&self) -> Option<(Job, CancellationToken)> {
        loop {
            let notified = self.work_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_claim() {
                Claim::Ready(job, token) => return Some((job, token)),
                Claim::Shutdown => return None,
                Claim::Idle => notified.await,
            }
        }
    }

    /// Writes the current in-memory snapshot of an active job.
    async fn sync_job(&self, job_id: &str) {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.lock_state().jobs.get(job_id).cloned();
        if let Some(job) = snapshot {
            if let Err(e) = self.persistence.save_job(&job).await {
                warn!(job_id = %job_id, "Failed to persist job state, will retry on next change: {}", e);
            }
        }
    }

    /// Archives a terminal job, along with any earlier archive that failed.
    async fn archive(&self, job: Job) {
        let _guard = self.persist_lock.lock().await;
        let mut pending = std::mem::take(&mut self.lock_state().unarchived);
        pending.push(job);

        let mut failed = Vec::new();
        for job in pending {
            match self.persistence.archive_job(&job).await {
                Ok(()) => info!(job_id = %job.job_id, status = %job.status, "Job archived"),
                Err(e) => {
                    warn!(job_id = %job.job_id, "Failed to archive job, will retry: {}", e);
                    failed.push(job);
                }
            }
        }
        if !failed.is_empty() {
            self.lock_state().unarchived.extend(failed);
        }
    }

    async fn execute(self: Arc<Self>, job: Job, token: CancellationToken) {
        let span = info_span!(
            "job",
            job_id = %job.job_id,
            priority = %job.priority,
            attempt = job.retry_count + 1
        );

        async move {
            info!(file_path = %job.file_path, "Job started");
            self.sync_job(&job.job_id).await;

            let reporter = ProgressReporter::new(
                job.job_id.clone(),
                token.clone(),
                self.clone() as Arc<dyn ProgressSink>,
            );
            let outcome = self.invoke_handler(JobContext::for_job(&job), reporter, &token).await;
            self.finish(&job.job_id, outcome, &token).await;
        }
        .instrument(span)
        .await
    }

    /// Runs the handler in its own task so a panic cannot take the worker
    /// down, applying the configured timeout.
    async fn invoke_handler(
        &self,
        ctx: JobContext,
        reporter: ProgressReporter,
        token: &CancellationToken,
    ) -> JobOutcome {
        let handler = self.handler.clone();
        let mut task = tokio::spawn(async move { handler.handle(ctx, reporter).await });

        let joined = match self.config.job_timeout() {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    token.cancel();
                    task.abort();
                    return JobOutcome::TimedOut(limit);
                }
            },
            None => task.await,
        };

        match joined {
            Ok(result) => JobOutcome::from(result),
            Err(e) if e.is_panic() => {
                let payload = e.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("Handler panicked: {}", message);
                JobOutcome::Failed(format!("handler panicked: {}", message))
            }
            Err(e) => JobOutcome::Failed(format!("handler task aborted: {}", e)),
        }
    }

    /// Maps a handler outcome onto the job's next state.
    async fn finish(self: &Arc<Self>, job_id: &str, outcome: JobOutcome, token: &CancellationToken) {
        let cancel_requested = token.is_cancelled();

        enum Next {
            Archive(Job, Option<Arc<Notify>>),
            Retry(Duration),
        }

        let next = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            state.tokens.remove(job_id);
            let Some(job) = state.jobs.get_mut(job_id) else {
                warn!(job_id = %job_id, "Finished job missing from active set");
                return;
            };

            let mut retry = None;
            match outcome {
                JobOutcome::Completed(payload) => {
                    if cancel_requested {
                        info!("Cancellation arrived after the last checkpoint; job completed normally");
                    }
                    job.complete(payload);
                }
                JobOutcome::Cancelled => {
                    job.cancel();
                }
                JobOutcome::Failed(message) if cancel_requested => {
                    job.error_message = Some(message);
                    job.cancel();
                }
                JobOutcome::Failed(message) => {
                    if job.schedule_retry(message.clone()) {
                        retry = Some(self.config.retry_delay(job.retry_count));
                    } else {
                        job.fail(message);
                    }
                }
                JobOutcome::TimedOut(limit) => {
                    job.fail(JobError::Timeout(limit).to_string());
                }
            }

            match retry {
                Some(delay) => {
                    warn!(
                        retry = job.retry_count,
                        max_retries = job.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = job.error_message.as_deref().unwrap_or(""),
                        "Job failed, retry scheduled"
                    );
                    state.stats.retried += 1;
                    Next::Retry(delay)
                }
                None => {
                    let Some(job) = state.jobs.remove(job_id) else {
                        return;
                    };
                    match job.status {
                        JobStatus::Completed => info!("Job completed"),
                        JobStatus::Failed => error!(
                            error = job.error_message.as_deref().unwrap_or(""),
                            retries = job.retry_count,
                            "Job failed"
                        ),
                        _ => info!(status = %job.status, "Job finished"),
                    }
                    let notify = state.retire(job.clone(), self.config.finished_cache_size);
                    Next::Archive(job, notify)
                }
            }
        };

        match next {
            Next::Archive(job, notify) => {
                self.archive(job).await;
                if let Some(done) = notify {
                    done.notify_one();
                }
            }
            Next::Retry(delay) => {
                self.sync_job(job_id).await;
                let inner = self.clone();
                let job_id = job_id.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    inner.requeue(&job_id).await;
                });
            }
        }
    }

    /// Retrying -> Queued once the backoff has elapsed.
    async fn requeue(&self, job_id: &str) {
        {
            let mut state = self.lock_state();
            if state.shutting_down {
                debug!(job_id = %job_id, "Shutdown in progress; retry left for recovery");
                return;
            }
            let Some(job) = state.jobs.get_mut(job_id) else {
                // Cancelled while waiting
                return;
            };
            if !job.requeue() {
                return;
            }
            state.queue.push(job_id.to_string());
        }
        debug!(job_id = %job_id, "Job re-queued after backoff");
        self.sync_job(job_id).await;
        self.work_available.notify_waiters();
    }

    async fn lookup(&self, job_id: &str) -> Option<Job> {
        {
            let state = self.lock_state();
            if let Some(job) = state.jobs.get(job_id).or_else(|| state.finished.get(job_id)) {
                return Some(job.clone());
            }
        }
        match self.persistence.find_archived(job_id).await {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id = %job_id, "Archive lookup failed: {}", e);
                None
            }
        }
    }
}

impl ProgressSink for Inner {
    fn report(&self, job_id: &str, progress: f64, step: &str) -> bool {
        let view = {
            let mut state = self.lock_state();
            match state.jobs.get_mut(job_id) {
                Some(job) => {
                    if !job.update_progress(progress, step) {
                        return false;
                    }
                    job.progress_view()
                }
                None => return false,
            }
        };

        let callbacks = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback(&view);
        }
        true
    }
}

async fn worker_loop(inner: Arc<Inner>, worker_id: usize) {
    debug!(worker_id, "Worker started");
    while let Some((job, token)) = inner.next_job().await {
        inner.clone().execute(job, token).await;
    }
    debug!(worker_id, "Worker stopped");
}

/// Priority-ordered, persistent background job processor.
///
/// Construct one at startup, call [`start`](Self::start), hand clones to
/// every consumer and call [`shutdown`](Self::shutdown) on termination.
///
/// ```rust,ignore
/// use docqueue::{handler_fn, BackgroundProcessor, JobPriority, QueuePersistence};
///
/// let processor = BackgroundProcessor::new(
///     ProcessorConfig::default(),
///     PriorityQueueManager::default(),
///     QueuePersistence::new(FileStore::open("./data")?),
///     handler_fn(|ctx, progress| async move {
///         progress.report(0.5, "converting");
///         progress.checkpoint()?;
///         Ok(None)
///     }),
/// );
/// processor.start().await?;
/// let id = processor.submit_job("a.pdf", JobPriority::Normal, Default::default()).await?;
/// ```
#[derive(Clone)]
pub struct BackgroundProcessor {
    inner: Arc<Inner>,
}

impl BackgroundProcessor {
    pub fn new<H: JobHandler>(
        config: ProcessorConfig,
        priority: PriorityQueueManager,
        persistence: QueuePersistence,
        handler: H,
    ) -> Self {
        Self::with_handler(config, priority, persistence, Arc::new(handler))
    }

    pub fn with_handler(
        config: ProcessorConfig,
        priority: PriorityQueueManager,
        persistence: QueuePersistence,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                priority,
                persistence,
                handler,
                state: Mutex::new(State::default()),
                work_available: Notify::new(),
                persist_lock: tokio::sync::Mutex::new(()),
                callbacks: RwLock::new(Vec::new()),
                workers: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.inner.config
    }

    pub fn persistence(&self) -> &QueuePersistence {
        &self.inner.persistence
    }

    /// Recovers pending jobs from the store, purges expired history and
    /// spawns the workers. Subsequent calls are no-ops.
    pub async fn start(&self) -> Result<()> {
        if self.inner.lock_state().shutting_down {
            return Err(JobError::ShuttingDown);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        match self.inner.persistence.load_pending_jobs().await {
            Ok(recovered) => {
                let mut restored = Vec::new();
                {
                    let mut state = self.inner.lock_state();
                    for job in recovered {
                        if state.jobs.contains_key(&job.job_id) {
                            continue;
                        }
                        state.queue.push(job.job_id.clone());
                        restored.push(job.job_id.clone());
                        state.jobs.insert(job.job_id.clone(), job);
                    }
                }
                if !restored.is_empty() {
                    info!(count = restored.len(), "Recovered pending jobs");
                }
                for job_id in &restored {
                    self.inner.sync_job(job_id).await;
                }
            }
            Err(e) => warn!("Failed to load pending jobs, starting with an empty queue: {}", e),
        }

        if let Err(e) = self
            .inner
            .persistence
            .cleanup_old_history(self.inner.config.history_retention_days)
            .await
        {
            warn!("Failed to purge old job history: {}", e);
        }

        let workers = self.inner.config.max_workers.max(1);
        let mut handles = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for worker_id in 0..workers {
            handles.push(tokio::spawn(worker_loop(self.inner.clone(), worker_id)));
        }
        info!(workers, "Background processor started");
        Ok(())
    }

    /// Queue a job. Returns its id without waiting for execution.
    pub async fn submit_job(
        &self,
        file_path: &str,
        priority: JobPriority,
        metadata: JobMetadata,
    ) -> Result<String> {
        let max_retries = self.inner.config.max_retries;
        self.submit_job_with_options(file_path, priority, metadata, max_retries)
            .await
    }

    /// Like [`submit_job`](Self::submit_job) with a per-job retry budget.
    pub async fn submit_job_with_options(
        &self,
        file_path: &str,
        priority: JobPriority,
        metadata: JobMetadata,
        max_retries: u32,
    ) -> Result<String> {
        let job_id = self
            .inner
            .enqueue_new(file_path, priority, metadata, max_retries, None)?;
        info!(job_id = %job_id, file_path, priority = %priority, "Job submitted");
        self.inner.sync_job(&job_id).await;
        self.inner.work_available.notify_waiters();
        Ok(job_id)
    }

    /// Submit every path independently. Invalid paths are skipped.
    pub async fn submit_batch(&self, paths: &[String], priority: JobPriority) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(paths.len());
        for path in paths {
            match self.submit_job(path, priority, JobMetadata::new()).await {
                Ok(id) => ids.push(id),
                Err(JobError::ShuttingDown) => return Err(JobError::ShuttingDown),
                Err(e) => warn!(file_path = %path, "Skipping batch entry: {}", e),
            }
        }
        Ok(ids)
    }

    /// Submit a batch and wait until every job is terminal or `timeout`
    /// elapses.
    pub async fn process_batch_sync(
        &self,
        paths: &[String],
        priority: JobPriority,
        timeout: Duration,
    ) -> Result<BatchProcessingResult> {
        let started = Instant::now();
        if paths.is_empty() {
            return Ok(BatchProcessingResult {
                total_jobs: 0,
                successful: 0,
                failed: 0,
                processing_time: 0.0,
                timed_out: false,
            });
        }

        let done = Arc::new(Notify::new());
        let batch_id = {
            let mut state = self.inner.lock_state();
            if state.shutting_down {
                return Err(JobError::ShuttingDown);
            }
            state.next_batch_id += 1;
            let batch_id = state.next_batch_id;
            state.batches.insert(
                batch_id,
                BatchState {
                    remaining: paths.len(),
                    successful: 0,
                    failed: 0,
                    done: done.clone(),
                },
            );
            batch_id
        };

        let max_retries = self.inner.config.max_retries;
        let mut submitted = Vec::with_capacity(paths.len());
        for path in paths {
            match self.inner.enqueue_new(
                path,
                priority,
                JobMetadata::new(),
                max_retries,
                Some(batch_id),
            ) {
                Ok(job_id) => {
                    self.inner.sync_job(&job_id).await;
                    submitted.push(job_id);
                }
                Err(e) => {
                    warn!(file_path = %path, "Batch entry rejected: {}", e);
                    let mut state = self.inner.lock_state();
                    if let Some(batch) = state.batches.get_mut(&batch_id) {
                        batch.remaining = batch.remaining.saturating_sub(1);
                        batch.failed += 1;
                    }
                }
            }
        }
        self.inner.work_available.notify_waiters();
        info!(batch_id, jobs = submitted.len(), "Batch submitted, waiting for completion");

        let already_done = self
            .inner
            .lock_state()
            .batches
            .get(&batch_id)
            .map_or(true, |b| b.remaining == 0);
        let timed_out = !already_done && tokio::time::timeout(timeout, done.notified()).await.is_err();

        let batch = {
            let mut state = self.inner.lock_state();
            for job_id in &submitted {
                state.job_batches.remove(job_id);
            }
            state.batches.remove(&batch_id)
        };
        let (successful, failed) = batch.map_or((0, 0), |b| (b.successful, b.failed));
        if timed_out {
            warn!(batch_id, successful, failed, "Batch timed out before all jobs finished");
        }

        Ok(BatchProcessingResult {
            total_jobs: paths.len(),
            successful,
            failed,
            processing_time: started.elapsed().as_secs_f64(),
            timed_out,
        })
    }

    /// Cancel a job. Queued and retrying jobs are cancelled immediately; a
    /// running job is flagged and stops at its next checkpoint. Returns
    /// false for unknown or already terminal jobs, and for a running job
    /// that was already flagged.
    pub async fn cancel_job(&self, job_id: &str) -> bool {
        let retired = {
            let mut guard = self.inner.lock_state();
            let state = &mut *guard;
            let Some(job) = state.jobs.get_mut(job_id) else {
                return false;
            };
            match job.status {
                JobStatus::Queued | JobStatus::Retrying => {
                    job.cancel();
                    state.queue.retain(|id| id != job_id);
                    let Some(job) = state.jobs.remove(job_id) else {
                        return false;
                    };
                    let notify = state.retire(job.clone(), self.inner.config.finished_cache_size);
                    Some((job, notify))
                }
                JobStatus::Processing => match state.tokens.get(job_id) {
                    Some(token) if !token.is_cancelled() => {
                        token.cancel();
                        None
                    }
                    // Already requested
                    _ => return false,
                },
                _ => return false,
            }
        };

        match retired {
            Some((job, notify)) => {
                info!(job_id = %job_id, "Job cancelled before execution");
                self.inner.archive(job).await;
                if let Some(done) = notify {
                    done.notify_one();
                }
            }
            None => info!(job_id = %job_id, "Cancellation requested for running job"),
        }
        true
    }

    /// Stop dispatching new jobs. Running jobs are unaffected.
    pub fn pause_processing(&self) {
        self.inner.lock_state().paused = true;
        info!("Processing paused");
    }

    pub fn resume_processing(&self) {
        self.inner.lock_state().paused = false;
        info!("Processing resumed");
        self.inner.work_available.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock_state().paused
    }

    pub async fn get_job(&self, job_id: &str) -> Option<Job> {
        self.inner.lookup(job_id).await
    }

    /// `None` when the id is unknown.
    pub async fn get_job_status(&self, job_id: &str) -> Option<JobStatus> {
        self.inner.lookup(job_id).await.map(|job| job.status)
    }

    pub async fn get_job_progress(&self, job_id: &str) -> Option<ProcessingProgress> {
        self.inner.lookup(job_id).await.map(|job| job.progress_view())
    }

    pub fn get_queue_status(&self) -> QueueSnapshot {
        let state = self.inner.lock_state();
        let mut snapshot = QueueSnapshot {
            queued: 0,
            active: 0,
            retrying: 0,
            completed: state.stats.completed + state.stats.failed + state.stats.cancelled,
            paused: state.paused,
            workers: self.inner.config.max_workers,
            oldest_queued_at: None,
            stats: state.stats.clone(),
        };
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Queued => {
                    snapshot.queued += 1;
                    snapshot.oldest_queued_at = Some(match snapshot.oldest_queued_at {
                        Some(oldest) => oldest.min(job.created_at),
                        None => job.created_at,
                    });
                }
                JobStatus::Processing => snapshot.active += 1,
                JobStatus::Retrying => snapshot.retrying += 1,
                _ => {}
            }
        }
        snapshot
    }

    /// Queued jobs in the order they would be dispatched right now.
    pub fn queued_jobs(&self) -> Vec<Job> {
        let queued: Vec<Job> = {
            let state = self.inner.lock_state();
            state
                .queue
                .iter()
                .filter_map(|id| state.jobs.get(id).cloned())
                .collect()
        };
        self.inner.priority.rebalance_queue(&queued)
    }

    /// Jobs currently held by a worker.
    pub fn active_jobs(&self) -> Vec<Job> {
        self.inner
            .lock_state()
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Processing)
            .cloned()
            .collect()
    }

    pub async fn get_statistics(&self, days: u32) -> Result<QueueStatistics> {
        self.inner.persistence.get_statistics(days).await
    }

    pub fn register_progress_callback<F>(&self, callback: F)
    where
        F: Fn(&ProcessingProgress) + Send + Sync + 'static,
    {
        self.inner
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Stop dispatching. With `wait`, returns once every worker has finished
    /// its in-flight job and exited. Queued jobs stay persisted for the next
    /// start.
    pub async fn shutdown(&self, wait: bool) {
        {
            let mut state = self.inner.lock_state();
            if state.shutting_down && !wait {
                return;
            }
            state.shutting_down = true;
        }
        info!(wait, "Background processor shutting down");
        self.inner.work_available.notify_waiters();

        if wait {
            let handles: Vec<_> = self
                .inner
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain(..)
                .collect();
            for result in futures_util::future::join_all(handles).await {
                if let Err(e) = result {
                    error!("Worker terminated abnormally: {}", e);
                }
            }
            info!("Background processor stopped");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock_state().shutting_down
    }
}

impl std::fmt::Debug for BackgroundProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundProcessor")
            .field("config", &self.inner.config)
            .field("snapshot", &self.get_queue_status())
            .finish()
    }
}
