//! Read-only health and performance reporting over a running processor.

use crate::backend::HistoryRecord;
use crate::config::MonitorThresholds;
use crate::error::Result;
use crate::job::{JobPriority, JobStatus};
use crate::persistence::{DailyCount, PriorityBreakdown, QueueStatistics};
use crate::processor::{BackgroundProcessor, QueueSnapshot};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Overall queue health. Ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

impl From<AlertLevel> for HealthStatus {
    fn from(level: AlertLevel) -> Self {
        match level {
            AlertLevel::Warning => HealthStatus::Warning,
            AlertLevel::Critical => HealthStatus::Critical,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthAlert {
    pub level: AlertLevel,
    /// Which measurement tripped, e.g. `backlog` or `failure_rate`.
    pub metric: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub alerts: Vec<HealthAlert>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

impl Trend {
    /// Relative change between the older and newer half of the series that
    /// counts as movement.
    const THRESHOLD: f64 = 0.1;

    /// Compares the mean of the newer half of `series` against the older half.
    pub fn from_series(series: &[f64]) -> Self {
        if series.len() < 2 {
            return Trend::Stable;
        }
        let mid = series.len() / 2;
        let mean = |values: &[f64]| values.iter().sum::<f64>() / values.len() as f64;
        let older = mean(&series[..mid]);
        let newer = mean(&series[mid..]);

        if older == 0.0 {
            return if newer > 0.0 { Trend::Increasing } else { Trend::Stable };
        }
        let change = (newer - older) / older;
        if change > Self::THRESHOLD {
            Trend::Increasing
        } else if change < -Self::THRESHOLD {
            Trend::Decreasing
        } else {
            Trend::Stable
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub period_days: u32,
    pub success_rate: f64,
    pub avg_processing_time: Option<f64>,
    /// Archived jobs per day, averaged over the window.
    pub throughput_per_day: f64,
    pub daily_throughput: Vec<DailyCount>,
    pub trend: Trend,
    pub by_priority: BTreeMap<JobPriority, PriorityBreakdown>,
    pub live: QueueSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryReport {
    pub generated_at: DateTime<Utc>,
    pub health: HealthReport,
    pub metrics: PerformanceMetrics,
    pub statistics: QueueStatistics,
}

/// Aggregates live processor state and archived statistics. Never mutates
/// jobs.
#[derive(Debug, Clone)]
pub struct QueueMonitor {
    processor: BackgroundProcessor,
    thresholds: MonitorThresholds,
}

impl QueueMonitor {
    pub fn new(processor: BackgroundProcessor, thresholds: MonitorThresholds) -> Self {
        Self {
            processor,
            thresholds,
        }
    }

    pub fn thresholds(&self) -> &MonitorThresholds {
        &self.thresholds
    }

    pub async fn check_queue_health(&self) -> HealthReport {
        let now = Utc::now();
        let snapshot = self.processor.get_queue_status();
        let mut alerts = self.live_alerts(&snapshot, now);

        let since = now - Duration::hours(self.thresholds.failure_window_hours as i64);
        match self.processor.persistence().history_since(since).await {
            Ok(records) => {
                alerts.extend(self.failure_alert(&records));
            }
            Err(e) => {
                tracing::warn!("Health check could not read job history: {}", e);
                alerts.push(HealthAlert {
                    level: AlertLevel::Warning,
                    metric: "persistence".to_string(),
                    message: format!("Job history unavailable: {}", e),
                });
            }
        }

        let status = alerts
            .iter()
            .map(|alert| HealthStatus::from(alert.level))
            .max()
            .unwrap_or(HealthStatus::Healthy);

        if status != HealthStatus::Healthy {
            tracing::debug!(status = ?status, alerts = alerts.len(), "Queue health degraded");
        }

        HealthReport {
            status,
            alerts,
            checked_at: now,
        }
    }

    fn live_alerts(&self, snapshot: &QueueSnapshot, now: DateTime<Utc>) -> Vec<HealthAlert> {
        let t = &self.thresholds;
        let mut alerts = Vec::new();

        let backlog = snapshot.queued + snapshot.retrying;
        if let Some(level) = level_for(backlog as f64, t.backlog_warning as f64, t.backlog_critical as f64) {
            alerts.push(HealthAlert {
                level,
                metric: "backlog".to_string(),
                message: format!("{} jobs waiting", backlog),
            });
        }

        if let Some(oldest) = snapshot.oldest_queued_at {
            let age = (now - oldest).num_seconds().max(0);
            let level = level_for(
                age as f64,
                t.queue_age_warning_secs as f64,
                t.queue_age_critical_secs as f64,
            );
            if let Some(level) = level {
                alerts.push(HealthAlert {
                    level,
                    metric: "queue_age".to_string(),
                    message: format!("Oldest queued job has waited {}s", age),
                });
            }
        }

        if snapshot.paused {
            alerts.push(HealthAlert {
                level: AlertLevel::Warning,
                metric: "paused".to_string(),
                message: "Processing is paused".to_string(),
            });
        }

        alerts
    }

    fn failure_alert(&self, records: &[HistoryRecord]) -> Option<HealthAlert> {
        let failed = records
            .iter()
            .filter(|r| r.job.status == JobStatus::Failed)
            .count();
        let finished = failed
            + records
                .iter()
                .filter(|r| r.job.status == JobStatus::Completed)
                .count();
        if finished == 0 {
            return None;
        }
        let rate = failed as f64 / finished as f64 * 100.0;
        let level = level_for(
            rate,
            self.thresholds.failure_rate_warning,
            self.thresholds.failure_rate_critical,
        )?;
        Some(HealthAlert {
            level,
            metric: "failure_rate".to_string(),
            message: format!(
                "{:.1}% of jobs failed in the last {}h ({} of {})",
                rate,
                self.thresholds.failure_window_hours,
                failed,
                finished
            ),
        })
    }

    pub async fn get_performance_metrics(&self, days: u32) -> Result<PerformanceMetrics> {
        let stats = self.processor.get_statistics(days).await?;
        Ok(self.metrics_from(&stats))
    }

    fn metrics_from(&self, stats: &QueueStatistics) -> PerformanceMetrics {
        let series: Vec<f64> = stats.daily.iter().map(|d| d.total() as f64).collect();
        PerformanceMetrics {
            period_days: stats.period_days,
            success_rate: stats.success_rate,
            avg_processing_time: stats.avg_processing_time,
            throughput_per_day: stats.daily_throughput,
            daily_throughput: stats.daily.clone(),
            trend: Trend::from_series(&series),
            by_priority: stats.by_priority.clone(),
            live: self.processor.get_queue_status(),
        }
    }

    pub async fn get_summary_report(&self, days: u32) -> Result<SummaryReport> {
        let health = self.check_queue_health().await;
        let statistics = self.processor.get_statistics(days).await?;
        let metrics = self.metrics_from(&statistics);
        Ok(SummaryReport {
            generated_at: Utc::now(),
            health,
            metrics,
            statistics,
        })
    }
}

fn level_for(value: f64, warning: f64, critical: f64) -> Option<AlertLevel> {
    if value >= critical {
        Some(AlertLevel::Critical)
    } else if value >= warning {
        Some(AlertLevel::Warning)
    } else {
        None
    }
}
