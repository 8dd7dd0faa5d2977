use crate::error::{JobError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Caller-supplied key/value pairs attached to a job.
pub type JobMetadata = HashMap<String, String>;

/// What a handler returns: an optional success payload, or an error.
pub type HandlerResult = std::result::Result<Option<serde_json::Value>, JobError>;

/// Submission priority. Declaration order is dispatch order for equal age.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Background,
}

impl JobPriority {
    pub const ALL: [JobPriority; 5] = [
        JobPriority::Critical,
        JobPriority::High,
        JobPriority::Normal,
        JobPriority::Low,
        JobPriority::Background,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Critical => "critical",
            JobPriority::High => "high",
            JobPriority::Normal => "normal",
            JobPriority::Low => "low",
            JobPriority::Background => "background",
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobPriority {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(JobPriority::Critical),
            "high" => Ok(JobPriority::High),
            "normal" => Ok(JobPriority::Normal),
            "low" => Ok(JobPriority::Low),
            "background" => Ok(JobPriority::Background),
            other => Err(JobError::Validation(format!(
                "unrecognized priority '{}'",
                other
            ))),
        }
    }
}

/// Lifecycle state of a job.
///
/// ```text
/// Queued -> Processing -> Completed | Failed | Cancelled | Retrying
/// Retrying -> Queued
/// any non-terminal -> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Queued, Processing) => true,
            (Processing, Completed | Failed | Retrying) => true,
            (Retrying, Queued) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Retrying => "retrying",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of background work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub file_path: String,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: f64,
    pub current_step: String,
    #[serde(default)]
    pub steps_completed: u32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: JobMetadata,
}

impl Job {
    pub fn new(
        file_path: impl Into<String>,
        priority: JobPriority,
        metadata: JobMetadata,
        max_retries: u32,
    ) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            file_path: file_path.into(),
            priority,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: 0.0,
            current_step: "queued".to_string(),
            steps_completed: 0,
            retry_count: 0,
            max_retries,
            error_message: None,
            result: None,
            metadata,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Seconds spent in the handler, once both timestamps are known.
    pub fn processing_time(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => {
                Some((end - start).num_milliseconds().max(0) as f64 / 1000.0)
            }
            _ => None,
        }
    }

    fn transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        true
    }

    /// Queued -> Processing. Progress restarts for every attempt.
    pub fn start(&mut self) -> bool {
        if !self.transition(JobStatus::Processing) {
            return false;
        }
        self.started_at = Some(Utc::now());
        self.progress = 0.0;
        self.steps_completed = 0;
        self.current_step = "starting".to_string();
        true
    }

    /// Applies a progress report. Ignored unless processing; never moves
    /// progress backwards.
    pub fn update_progress(&mut self, progress: f64, step: &str) -> bool {
        if self.status != JobStatus::Processing || !progress.is_finite() {
            return false;
        }
        let progress = progress.clamp(0.0, 1.0);
        if progress < self.progress {
            return false;
        }
        self.progress = progress;
        if !step.is_empty() && step != self.current_step {
            self.current_step = step.to_string();
            self.steps_completed += 1;
        }
        true
    }

    pub fn complete(&mut self, result: Option<serde_json::Value>) -> bool {
        if !self.transition(JobStatus::Completed) {
            return false;
        }
        self.progress = 1.0;
        self.current_step = "completed".to_string();
        self.result = result;
        true
    }

    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if !self.transition(JobStatus::Failed) {
            return false;
        }
        self.current_step = "failed".to_string();
        self.error_message = Some(message.into());
        true
    }

    pub fn cancel(&mut self) -> bool {
        if !self.transition(JobStatus::Cancelled) {
            return false;
        }
        self.current_step = "cancelled".to_string();
        true
    }

    /// Processing -> Retrying, consuming one retry. Refuses once the retry
    /// budget is spent so `retry_count` never exceeds `max_retries`.
    pub fn schedule_retry(&mut self, message: impl Into<String>) -> bool {
        if self.retry_count >= self.max_retries || !self.transition(JobStatus::Retrying) {
            return false;
        }
        self.retry_count += 1;
        self.error_message = Some(message.into());
        self.current_step = "waiting for retry".to_string();
        true
    }

    /// Retrying -> Queued after the backoff delay.
    pub fn requeue(&mut self) -> bool {
        if !self.transition(JobStatus::Queued) {
            return false;
        }
        self.current_step = "queued".to_string();
        true
    }

    /// Read-only projection for polling clients.
    pub fn progress_view(&self) -> ProcessingProgress {
        ProcessingProgress::from_job(self, Utc::now())
    }
}

/// Polling view of a job. Derived on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingProgress {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: f64,
    pub current_step: String,
    pub steps_completed: u32,
    /// Seconds, extrapolated from elapsed time and current progress.
    pub estimated_time_remaining: Option<f64>,
    pub message: String,
}

impl ProcessingProgress {
    pub fn from_job(job: &Job, now: DateTime<Utc>) -> Self {
        let estimated_time_remaining = match (job.status, job.started_at) {
            (JobStatus::Processing, Some(started)) if job.progress > 0.0 => {
                let elapsed = (now - started).num_milliseconds().max(0) as f64 / 1000.0;
                Some(elapsed * (1.0 - job.progress) / job.progress)
            }
            _ => None,
        };

        let message = match job.status {
            JobStatus::Queued => "Waiting in queue".to_string(),
            JobStatus::Processing => format!("Processing: {}", job.current_step),
            JobStatus::Retrying => format!(
                "Retry {}/{} scheduled: {}",
                job.retry_count,
                job.max_retries,
                job.error_message.as_deref().unwrap_or("unknown error")
            ),
            JobStatus::Completed => "Completed successfully".to_string(),
            JobStatus::Failed => format!(
                "Failed: {}",
                job.error_message.as_deref().unwrap_or("unknown error")
            ),
            JobStatus::Cancelled => "Cancelled".to_string(),
        };

        Self {
            job_id: job.job_id.clone(),
            status: job.status,
            progress: job.progress,
            current_step: job.current_step.clone(),
            steps_completed: job.steps_completed,
            estimated_time_remaining,
            message,
        }
    }
}

/// Aggregate of a synchronous batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchProcessingResult {
    pub total_jobs: usize,
    pub successful: usize,
    pub failed: usize,
    /// Wall-clock seconds from submission to completion (or timeout).
    pub processing_time: f64,
    pub timed_out: bool,
}

/// Context passed to handler execution
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub file_path: String,
    pub priority: JobPriority,
    pub metadata: JobMetadata,
    /// 1 for the first run, incremented per retry.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

impl JobContext {
    pub(crate) fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            file_path: job.file_path.clone(),
            priority: job.priority,
            metadata: job.metadata.clone(),
            attempt: job.retry_count + 1,
            created_at: job.created_at,
        }
    }
}

/// Receiver of progress reports, implemented by the processor.
pub(crate) trait ProgressSink: Send + Sync {
    fn report(&self, job_id: &str, progress: f64, step: &str) -> bool;
}

struct DetachedSink;

impl ProgressSink for DetachedSink {
    fn report(&self, _job_id: &str, _progress: f64, _step: &str) -> bool {
        true
    }
}

/// Handle given to a handler for reporting progress and observing
/// cancellation requests.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: String,
    token: CancellationToken,
    sink: Arc<dyn ProgressSink>,
}

impl ProgressReporter {
    pub(crate) fn new(
        job_id: impl Into<String>,
        token: CancellationToken,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            token,
            sink,
        }
    }

    /// A reporter not attached to any processor, for exercising handlers
    /// in isolation.
    pub fn detached(job_id: impl Into<String>) -> Self {
        Self::new(job_id, CancellationToken::new(), Arc::new(DetachedSink))
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Returns false when the update was ignored (job not processing, or
    /// progress would go backwards).
    pub fn report(&self, progress: f64, step: &str) -> bool {
        self.sink.report(&self.job_id, progress, step)
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancellation checkpoint. Handlers propagate the error with `?`.
    pub fn checkpoint(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Triggers this reporter's cancellation token.
    pub fn cancel(&self) {
        self.token.cancel()
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("job_id", &self.job_id)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

/// The pluggable unit of work invoked once per attempt.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: JobContext, progress: ProgressReporter) -> HandlerResult;
}

/// Adapts an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

/// Build a handler from `|ctx, progress| async move { ... }`.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobContext, ProgressReporter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext, ProgressReporter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext, progress: ProgressReporter) -> HandlerResult {
        (self.0)(ctx, progress).await
    }
}

/// How one handler invocation ended, after panics and timeouts are folded in.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(Option<serde_json::Value>),
    Failed(String),
    Cancelled,
    TimedOut(Duration),
}

impl From<HandlerResult> for JobOutcome {
    fn from(result: HandlerResult) -> Self {
        match result {
            Ok(payload) => JobOutcome::Completed(payload),
            Err(JobError::Cancelled) => JobOutcome::Cancelled,
            Err(JobError::Timeout(limit)) => JobOutcome::TimedOut(limit),
            Err(JobError::Handler(message)) => JobOutcome::Failed(message),
            Err(other) => JobOutcome::Failed(other.to_string()),
        }
    }
}
