//! Effective dispatch priority.
//!
//! `effective = base(priority) - aging_bonus(waited) + retry_penalty(retries)`,
//! lower is dispatched first. Aging accrues linearly at `aging_step` per
//! `aging_interval` of waiting time and is capped, so every job eventually
//! overtakes fresh submissions of the next priority band. The retry penalty
//! grows per retry and is capped at one band by default, so a retried job
//! yields within its band but never falls below the next one. Aging keeps
//! accruing underneath it.

use crate::config::PriorityConfig;
use crate::job::{Job, JobPriority};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;

/// Distance between two adjacent priority bands.
pub const PRIORITY_BAND: f64 = 100.0;

/// Opaque dispatch key. Lower sorts first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectivePriority(f64);

impl EffectivePriority {
    pub fn value(&self) -> f64 {
        self.0
    }
}

impl Eq for EffectivePriority {}

impl PartialOrd for EffectivePriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EffectivePriority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PriorityQueueManager {
    config: PriorityConfig,
}

impl PriorityQueueManager {
    pub fn new(config: PriorityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PriorityConfig {
        &self.config
    }

    pub fn base_priority_value(priority: JobPriority) -> f64 {
        let rank = match priority {
            JobPriority::Critical => 0.0,
            JobPriority::High => 1.0,
            JobPriority::Normal => 2.0,
            JobPriority::Low => 3.0,
            JobPriority::Background => 4.0,
        };
        rank * PRIORITY_BAND
    }

    pub fn aging_bonus(&self, waited: chrono::Duration) -> f64 {
        let waited_secs = waited.num_milliseconds().max(0) as f64 / 1000.0;
        let intervals = waited_secs / self.config.aging_interval_secs.max(1) as f64;
        (intervals * self.config.aging_step).min(self.config.max_aging_bonus)
    }

    pub fn retry_penalty(&self, retry_count: u32) -> f64 {
        (retry_count as f64 * self.config.retry_penalty_step).min(self.config.max_retry_penalty)
    }

    pub fn effective_priority(&self, job: &Job) -> EffectivePriority {
        self.effective_priority_at(job, Utc::now())
    }

    pub fn effective_priority_at(&self, job: &Job, now: DateTime<Utc>) -> EffectivePriority {
        EffectivePriority(
            Self::base_priority_value(job.priority) - self.aging_bonus(now - job.created_at)
                + self.retry_penalty(job.retry_count),
        )
    }

    fn dispatch_key(&self, job: &Job, now: DateTime<Utc>) -> (EffectivePriority, DateTime<Utc>) {
        (self.effective_priority_at(job, now), job.created_at)
    }

    /// Jobs sorted by effective priority, ties broken FIFO by `created_at`.
    /// Pure: the input is left untouched.
    pub fn rebalance_queue(&self, jobs: &[Job]) -> Vec<Job> {
        self.rebalance_queue_at(jobs, Utc::now())
    }

    pub fn rebalance_queue_at(&self, jobs: &[Job], now: DateTime<Utc>) -> Vec<Job> {
        let mut keyed: Vec<_> = jobs
            .iter()
            .map(|job| (self.dispatch_key(job, now), job))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        keyed.into_iter().map(|(_, job)| job.clone()).collect()
    }

    /// The job that should be dispatched next, if any.
    pub fn select_next<'a, I>(&self, jobs: I, now: DateTime<Utc>) -> Option<&'a Job>
    where
        I: IntoIterator<Item = &'a Job>,
    {
        jobs.into_iter()
            .min_by(|a, b| self.dispatch_key(a, now).cmp(&self.dispatch_key(b, now)))
    }
}
