//! File-based store.
//!
//! Two files live in the data directory:
//! - `pending_jobs.json`: the whole pending map, rewritten through a temp
//!   file and rename so a crash never leaves a torn snapshot.
//! - `job_history.jsonl`: one archived job per line, append-only.
//!
//! Both are mirrored in memory, so reads never touch the disk. Writes run on
//! the blocking pool.

use super::{HistoryRecord, QueueStore};
use crate::error::{JobError, Result};
use crate::job::Job;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

const PENDING_FILE: &str = "pending_jobs.json";
const HISTORY_FILE: &str = "job_history.jsonl";

#[derive(Debug, Default)]
struct Tables {
    pending: HashMap<String, Job>,
    history: Vec<HistoryRecord>,
    archived: HashSet<String>,
}

impl Tables {
    fn set_history(&mut self, history: Vec<HistoryRecord>) {
        self.archived = history.iter().map(|r| r.job.job_id.clone()).collect();
        self.history = history;
    }
}

#[derive(Debug)]
struct Shared {
    dir: PathBuf,
    tables: Mutex<Tables>,
}

impl Shared {
    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|e| JobError::Persistence(format!("Failed to acquire lock: {}", e)))
    }

    fn save_pending(&self, job: Job) -> Result<()> {
        let mut tables = self.tables()?;
        let job_id = job.job_id.clone();
        let previous = tables.pending.insert(job_id.clone(), job);
        if let Err(e) = write_pending(&self.dir, &tables.pending) {
            // Keep memory consistent with what is on disk
            match previous {
                Some(prev) => tables.pending.insert(job_id, prev),
                None => tables.pending.remove(&job_id),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Idempotent per job: a job already in the history is not appended
    /// again, only dropped from pending.
    fn archive(&self, record: HistoryRecord) -> Result<()> {
        let mut tables = self.tables()?;
        let job_id = record.job.job_id.clone();

        if tables.archived.contains(&job_id) {
            tracing::debug!(job_id = %job_id, "Job already in history, skipping append");
        } else {
            let line = serde_json::to_string(&record)?;
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dir.join(HISTORY_FILE))?;
            writeln!(file, "{}", line)?;
            file.flush()?;
            tables.archived.insert(job_id.clone());
            tables.history.push(record);
        }

        if let Some(previous) = tables.pending.remove(&job_id) {
            if let Err(e) = write_pending(&self.dir, &tables.pending) {
                tables.pending.insert(job_id, previous);
                return Err(e);
            }
        }
        Ok(())
    }

    fn purge_history_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut tables = self.tables()?;
        let kept: Vec<_> = tables
            .history
            .iter()
            .filter(|r| r.archived_at >= cutoff)
            .cloned()
            .collect();
        let deleted = tables.history.len() - kept.len();
        if deleted > 0 {
            write_history(&self.dir, &kept)?;
            tables.set_history(kept);
        }
        Ok(deleted)
    }
}

/// Durable store backed by two files in one directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    shared: Arc<Shared>,
}

impl FileStore {
    /// Open (or create) a store in `dir`.
    ///
    /// Pending entries that already appear in the history are dropped: the
    /// process died between appending the history line and rewriting the
    /// pending snapshot. Duplicate history lines for one job keep the last.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut tables = Tables {
            pending: read_pending(&dir.join(PENDING_FILE))?,
            ..Default::default()
        };

        let raw = read_history(&dir.join(HISTORY_FILE))?;
        let read = raw.len();
        let history = latest_per_job(raw);
        if history.len() != read {
            tracing::warn!(
                dropped = read - history.len(),
                "Dropped duplicate job history entries"
            );
            write_history(&dir, &history)?;
        }
        tables.set_history(history);

        let before = tables.pending.len();
        let archived = &tables.archived;
        tables.pending.retain(|id, _| !archived.contains(id));
        if tables.pending.len() != before {
            tracing::warn!(
                dropped = before - tables.pending.len(),
                "Dropped pending snapshots that were already archived"
            );
            write_pending(&dir, &tables.pending)?;
        }

        Ok(Self {
            shared: Arc::new(Shared {
                dir,
                tables: Mutex::new(tables),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Shared) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || f(&shared))
            .await
            .map_err(|e| JobError::Persistence(format!("File store task failed: {}", e)))?
    }
}

/// Keeps the last record per job, preserving file order.
fn latest_per_job(records: Vec<HistoryRecord>) -> Vec<HistoryRecord> {
    let mut last: HashMap<String, usize> = HashMap::new();
    for (index, record) in records.iter().enumerate() {
        last.insert(record.job.job_id.clone(), index);
    }
    records
        .into_iter()
        .enumerate()
        .filter(|(index, record)| last.get(&record.job.job_id) == Some(index))
        .map(|(_, record)| record)
        .collect()
}

fn read_pending(path: &Path) -> Result<HashMap<String, Job>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(HashMap::new());
    }
    Ok(serde_json::from_str(&content)?)
}

fn write_pending(dir: &Path, pending: &HashMap<String, Job>) -> Result<()> {
    let tmp = dir.join(format!("{}.tmp", PENDING_FILE));
    let json = serde_json::to_vec(pending)?;
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, dir.join(PENDING_FILE))?;
    Ok(())
}

fn read_history(path: &Path) -> Result<Vec<HistoryRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<HistoryRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                // Corrupted line, keep the rest readable
                tracing::warn!("Failed to parse job history entry: {}", e);
            }
        }
    }

    Ok(records)
}

fn write_history(dir: &Path, records: &[HistoryRecord]) -> Result<()> {
    let tmp = dir.join(format!("{}.tmp", HISTORY_FILE));
    {
        let mut file = File::create(&tmp)?;
        for record in records {
            writeln!(file, "{}", serde_json::to_string(record)?)?;
        }
        file.sync_all()?;
    }
    fs::rename(&tmp, dir.join(HISTORY_FILE))?;
    Ok(())
}

#[async_trait]
impl QueueStore for FileStore {
    async fn save_pending(&self, job: &Job) -> Result<()> {
        let job = job.clone();
        self.blocking(move |shared| shared.save_pending(job)).await
    }

    async fn archive(&self, record: HistoryRecord) -> Result<()> {
        self.blocking(move |shared| shared.archive(record)).await
    }

    async fn load_pending(&self) -> Result<Vec<Job>> {
        let tables = self.shared.tables()?;
        Ok(tables.pending.values().cloned().collect())
    }

    async fn find_archived(&self, job_id: &str) -> Result<Option<HistoryRecord>> {
        let tables = self.shared.tables()?;
        Ok(tables
            .history
            .iter()
            .rev()
            .find(|r| r.job.job_id == job_id)
            .cloned())
    }

    async fn history_since(&self, since: DateTime<Utc>) -> Result<Vec<HistoryRecord>> {
        let tables = self.shared.tables()?;
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
        self.blocking(move |shared| shared.purge_history_before(cutoff))
            .await
    }
}
