use super::{HistoryRecord, QueueStore};
use crate::error::{JobError, Result};
use crate::job::Job;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Tables {
    pending: HashMap<String, Job>,
    history: Vec<HistoryRecord>,
}

/// In-memory store (not durable, for testing/dev).
///
/// Clones share the same tables, which lets tests simulate a restart by
/// handing a clone to a fresh processor.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| JobError::Persistence("Lock poisoned".to_string()))
    }

    pub fn pending_count(&self) -> usize {
        self.tables().map(|t| t.pending.len()).unwrap_or(0)
    }

    pub fn history_count(&self) -> usize {
        self.tables().map(|t| t.history.len()).unwrap_or(0)
    }
}

#[async_trait]
impl QueueStore for InMemoryStore {
    async fn save_pending(&self, job: &Job) -> Result<()> {
        let mut tables = self.tables()?;
        tables.pending.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn archive(&self, record: HistoryRecord) -> Result<()> {
        let mut tables = self.tables()?;
        tables.pending.remove(&record.job.job_id);
        if !tables.history.iter().any(|r| r.job.job_id == record.job.job_id) {
            tables.history.push(record);
        }
        Ok(())
    }

    async fn load_pending(&self) -> Result<Vec<Job>> {
        let tables = self.tables()?;
        Ok(tables.pending.values().cloned().collect())
    }

    async fn find_archived(&self, job_id: &str) -> Result<Option<HistoryRecord>> {
        let tables = self.tables()?;
        Ok(tables
            .history
            .iter()
            .rev()
            .find(|r| r.job.job_id == job_id)
            .cloned())
    }

    async fn history_since(&self, since: DateTime<Utc>) -> Result<Vec<HistoryRecord>> {
        let tables = self.tables()?;
        let mut records: Vec<_> = tables
            .history
            .iter()
            .filter(|r| r.archived_at >= since)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.archived_at);
        Ok(records)
    }

    async fn purge_history_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut tables = self.tables()?;
        let before = tables.history.len();
        tables.history.retain(|r| r.archived_at >= cutoff);
        Ok(before - tables.history.len())
    }
}
