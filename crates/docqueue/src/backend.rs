use crate::error::Result;
use crate::job::Job;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod file;
pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

/// An archived terminal job, keyed by `(job_id, archived_at)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub archived_at: DateTime<Utc>,
    /// Seconds between start and completion, when the job ever started.
    pub processing_time: Option<f64>,
    pub job: Job,
}

impl HistoryRecord {
    pub fn new(job: Job) -> Self {
        Self {
            archived_at: Utc::now(),
            processing_time: job.processing_time(),
            job,
        }
    }
}

/// Durable storage for pending job snapshots and the job history archive.
///
/// Implementations serialize their own writes; callers never touch the
/// underlying files or tables directly.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert or replace the pending snapshot for `job.job_id`.
    async fn save_pending(&self, job: &Job) -> Result<()>;

    /// Remove the pending snapshot and append `record` to the history, as
    /// one logical step.
    ///
    /// Idempotent per job id: archiving a job already in the history only
    /// removes its pending snapshot, so a failed archive can be retried.
    async fn archive(&self, record: HistoryRecord) -> Result<()>;

    /// All pending snapshots, exactly as stored.
    async fn load_pending(&self) -> Result<Vec<Job>>;

    /// Latest history entry for a job.
    async fn find_archived(&self, job_id: &str) -> Result<Option<HistoryRecord>>;

    /// History entries archived at or after `since`, oldest first.
    async fn history_since(&self, since: DateTime<Utc>) -> Result<Vec<HistoryRecord>>;

    /// Delete history entries archived before `cutoff`. Returns the count.
    async fn purge_history_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}
