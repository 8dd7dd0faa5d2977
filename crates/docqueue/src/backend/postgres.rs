use super::{HistoryRecord, QueueStore};
use crate::error::{JobError, Result};
use crate::job::Job;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, Row};

fn backend_err(e: sqlx::Error) -> JobError {
    JobError::Persistence(e.to_string())
}

/// Postgres-backed store
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Pool<Postgres>,
    pending_table: String,
    history_table: String,
}

impl PostgresStore {
    /// Tables are named `<prefix>_pending_jobs` and `<prefix>_job_history`.
    pub fn new(pool: Pool<Postgres>, prefix: &str) -> Self {
        Self {
            pool,
            pending_table: format!("{}_pending_jobs", prefix),
            history_table: format!("{}_job_history", prefix),
        }
    }

    /// Initialize the database schema
    pub async fn ensure_schema(&self) -> Result<()> {
        let query = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {pending} (
                job_id TEXT PRIMARY KEY,
                snapshot JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {history} (
                job_id TEXT NOT NULL,
                archived_at TIMESTAMPTZ NOT NULL,
                status TEXT NOT NULL,
                priority TEXT NOT NULL,
                processing_time DOUBLE PRECISION,
                record JSONB NOT NULL,
                PRIMARY KEY (job_id, archived_at)
            );
            CREATE INDEX IF NOT EXISTS idx_{history}_archived_at ON {history} (archived_at);
            "#,
            pending = self.pending_table,
            history = self.history_table,
        );

        sqlx::raw_sql(&query)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;

        Ok(())
    }
}

#[async_trait]
impl QueueStore for PostgresStore {
    async fn save_pending(&self, job: &Job) -> Result<()> {
        let query = format!(
            r#"
            INSERT INTO {} (job_id, snapshot, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (job_id) DO UPDATE SET snapshot = EXCLUDED.snapshot, updated_at = NOW()
            "#,
            self.pending_table
        );

        sqlx::query(&query)
            .bind(&job.job_id)
            .bind(serde_json::to_value(job)?)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;

        Ok(())
    }

    async fn archive(&self, record: HistoryRecord) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(backend_err)?;

        let delete = format!("DELETE FROM {} WHERE job_id = $1", self.pending_table);
        sqlx::query(&delete)
            .bind(&record.job.job_id)
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;

        let insert = format!(
            r#"
            INSERT INTO {0} (job_id, archived_at, status, priority, processing_time, record)
            SELECT $1, $2, $3, $4, $5, $6
            WHERE NOT EXISTS (SELECT 1 FROM {0} WHERE job_id = $1)
            "#,
            self.history_table
        );
        sqlx::query(&insert)
            .bind(&record.job.job_id)
            .bind(record.archived_at)
            .bind(record.job.status.as_str())
            .bind(record.job.priority.as_str())
            .bind(record.processing_time)
            .bind(serde_json::to_value(&record)?)
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;

        tx.commit().await.map_err(backend_err)?;
        Ok(())
    }

    async fn load_pending(&self) -> Result<Vec<Job>> {
        let query = format!("SELECT snapshot FROM {}", self.pending_table);
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;

        rows.into_iter()
            .map(|row| serde_json::from_value(row.get("snapshot")).map_err(JobError::from))
            .collect()
    }

    async fn find_archived(&self, job_id: &str) -> Result<Option<HistoryRecord>> {
        let query = format!(
            "SELECT record FROM {} WHERE job_id = $1 ORDER BY archived_at DESC LIMIT 1",
            self.history_table
        );
        let row = sqlx::query(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;

        match row {
            Some(row) => Ok(Some(serde_json::from_value(row.get("record"))?)),
            None => Ok(None),
        }
    }

    async fn history_since(&self, since: DateTime<Utc>) -> Result<Vec<HistoryRecord>> {
        let query = format!(
            "SELECT record FROM {} WHERE archived_at >= $1 ORDER BY archived_at ASC",
            self.history_table
        );
        let rows = sqlx::query(&query)
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;

        rows.into_iter()
            .map(|row| serde_json::from_value(row.get("record")).map_err(JobError::from))
            .collect()
    }

    async fn purge_history_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let query = format!("DELETE FROM {} WHERE archived_at < $1", self.history_table);
        let result = sqlx::query(&query)
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(result.rows_affected() as usize)
    }
}
