//! Durable queue state and archived job statistics.

use crate::backend::file::FileStore;
use crate::backend::memory::InMemoryStore;
use crate::backend::{HistoryRecord, QueueStore};
use crate::config::ProcessorConfig;
use crate::error::Result;
use crate::job::{Job, JobPriority, JobStatus};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Archived outcomes for one calendar day (UTC).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub successful: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl DailyCount {
    pub fn total(&self) -> usize {
        self.successful + self.failed + self.cancelled
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriorityBreakdown {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub avg_processing_time: Option<f64>,
}

/// Aggregates over the job history in a trailing window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatistics {
    pub period_days: u32,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Percent of finished attempts (successful + failed) that succeeded.
    pub success_rate: f64,
    /// Archived jobs per day over the window.
    pub daily_throughput: f64,
    /// Mean seconds in the handler for jobs that started.
    pub avg_processing_time: Option<f64>,
    /// One entry per day in the window, oldest first, zero-filled.
    pub daily: Vec<DailyCount>,
    pub by_priority: BTreeMap<JobPriority, PriorityBreakdown>,
}

/// Start of a `days`-long statistics window ending at `now`: midnight UTC of
/// the oldest day bucket.
pub fn window_start(days: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    let first_day = (now - Duration::days(days.max(1) as i64 - 1)).date_naive();
    first_day.and_time(NaiveTime::MIN).and_utc()
}

impl QueueStatistics {
    /// Aggregate `records`, treating `now` as the end of a `days`-long window.
    ///
    /// Records archived before [`window_start`] are ignored, so the daily
    /// buckets always sum to `total`.
    pub fn from_records(records: &[HistoryRecord], days: u32, now: DateTime<Utc>) -> Self {
        let days = days.max(1);
        let start = window_start(days, now);
        let first_day = start.date_naive();
        let records: Vec<&HistoryRecord> =
            records.iter().filter(|r| r.archived_at >= start).collect();

        let mut daily: BTreeMap<NaiveDate, DailyCount> = (0..days as i64)
            .map(|offset| {
                let date = first_day + Duration::days(offset);
                (
                    date,
                    DailyCount {
                        date,
                        successful: 0,
                        failed: 0,
                        cancelled: 0,
                    },
                )
            })
            .collect();

        let mut by_priority: BTreeMap<JobPriority, PriorityBreakdown> = BTreeMap::new();
        let mut priority_times: HashMap<JobPriority, (f64, usize)> = HashMap::new();
        let (mut successful, mut failed, mut cancelled) = (0usize, 0usize, 0usize);
        let (mut time_sum, mut timed) = (0.0f64, 0usize);

        for record in &records {
            let breakdown = by_priority.entry(record.job.priority).or_default();
            breakdown.total += 1;

            let day = daily.get_mut(&record.archived_at.date_naive());
            match record.job.status {
                JobStatus::Completed => {
                    successful += 1;
                    breakdown.successful += 1;
                    if let Some(day) = day {
                        day.successful += 1;
                    }
                }
                JobStatus::Failed => {
                    failed += 1;
                    breakdown.failed += 1;
                    if let Some(day) = day {
                        day.failed += 1;
                    }
                }
                JobStatus::Cancelled => {
                    cancelled += 1;
                    breakdown.cancelled += 1;
                    if let Some(day) = day {
                        day.cancelled += 1;
                    }
                }
                other => {
                    tracing::warn!(
                        job_id = %record.job.job_id,
                        status = %other,
                        "Non-terminal job found in history"
                    );
                }
            }

            if let Some(secs) = record.processing_time {
                time_sum += secs;
                timed += 1;
                let entry = priority_times.entry(record.job.priority).or_default();
                entry.0 += secs;
                entry.1 += 1;
            }
        }

        for (priority, (sum, count)) in priority_times {
            if let Some(breakdown) = by_priority.get_mut(&priority) {
                breakdown.avg_processing_time = Some(sum / count as f64);
            }
        }

        let finished = successful + failed;
        let success_rate = if finished == 0 {
            0.0
        } else {
            successful as f64 / finished as f64 * 100.0
        };

        Self {
            period_days: days,
            total: records.len(),
            successful,
            failed,
            cancelled,
            success_rate,
            daily_throughput: records.len() as f64 / days as f64,
            avg_processing_time: (timed > 0).then(|| time_sum / timed as f64),
            daily: daily.into_values().collect(),
            by_priority,
        }
    }

    /// Percent of finished attempts that failed.
    pub fn failure_rate(&self) -> f64 {
        if self.successful + self.failed == 0 {
            0.0
        } else {
            100.0 - self.success_rate
        }
    }
}

/// Owns the durable store. All persistence goes through this type.
#[derive(Clone)]
pub struct QueuePersistence {
    store: Arc<dyn QueueStore>,
}

impl QueuePersistence {
    pub fn new<S: QueueStore + 'static>(store: S) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    pub fn from_arc(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    /// Non-durable persistence, for tests and development.
    pub fn in_memory() -> Self {
        Self::new(InMemoryStore::new())
    }

    /// A [`FileStore`] in `config.data_dir`, or in-memory when unset.
    pub fn from_config(config: &ProcessorConfig) -> Result<Self> {
        match &config.data_dir {
            Some(dir) => {
                tracing::info!(data_dir = %dir.display(), "Using file-backed queue store");
                Ok(Self::new(FileStore::open(dir)?))
            }
            None => {
                tracing::warn!("No data_dir configured; queue state will not survive restarts");
                Ok(Self::in_memory())
            }
        }
    }

    /// Idempotent upsert of the pending snapshot.
    pub async fn save_job(&self, job: &Job) -> Result<()> {
        self.store.save_pending(job).await
    }

    /// Remove from pending and append to history.
    pub async fn archive_job(&self, job: &Job) -> Result<()> {
        self.store.archive(HistoryRecord::new(job.clone())).await
    }

    /// Pending jobs for startup recovery.
    ///
    /// No execution context survives a restart, so `Processing` and
    /// `Retrying` snapshots come back as `Queued`. Snapshots that are already
    /// terminal (the archive write failed earlier) are archived now and not
    /// returned.
    pub async fn load_pending_jobs(&self) -> Result<Vec<Job>> {
        let mut recovered = Vec::new();

        for mut job in self.store.load_pending().await? {
            if job.is_terminal() {
                tracing::info!(job_id = %job.job_id, status = %job.status, "Archiving terminal job left in pending store");
                if let Err(e) = self.archive_job(&job).await {
                    tracing::warn!(job_id = %job.job_id, "Failed to archive recovered job: {}", e);
                }
                continue;
            }

            if matches!(job.status, JobStatus::Processing | JobStatus::Retrying) {
                tracing::info!(job_id = %job.job_id, status = %job.status, "Resetting interrupted job to queued");
                job.status = JobStatus::Queued;
                job.started_at = None;
                job.progress = 0.0;
                job.steps_completed = 0;
                job.current_step = "queued".to_string();
            }

            recovered.push(job);
        }

        recovered.sort_by_key(|j| j.created_at);
        Ok(recovered)
    }

    /// Most recent archived snapshot of a job.
    pub async fn find_archived(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.store.find_archived(job_id).await?.map(|r| r.job))
    }

    pub async fn get_statistics(&self, days: u32) -> Result<QueueStatistics> {
        let now = Utc::now();
        let records = self.store.history_since(window_start(days, now)).await?;
        Ok(QueueStatistics::from_records(&records, days, now))
    }

    /// Archived records within the same window as [`Self::get_statistics`].
    pub async fn history(&self, days: u32) -> Result<Vec<HistoryRecord>> {
        self.store.history_since(window_start(days, Utc::now())).await
    }

    pub async fn history_since(&self, since: DateTime<Utc>) -> Result<Vec<HistoryRecord>> {
        self.store.history_since(since).await
    }

    pub async fn cleanup_old_history(&self, retention_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(retention_days as i64);
        let deleted = self.store.purge_history_before(cutoff).await?;
        if deleted > 0 {
            tracing::info!(deleted, retention_days, "Purged old job history");
        }
        Ok(deleted)
    }
}

impl std::fmt::Debug for QueuePersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuePersistence").finish_non_exhaustive()
    }
}
