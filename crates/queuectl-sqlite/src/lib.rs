//! SQLite-backed implementation of [`queuectl_core::Store`].
//!
//! The whole queue lives behind one `sqlx::SqlitePool`: short,
//! single-statement transactions per public operation, bound parameters
//! everywhere (never `format!`-built SQL against user input), one pool
//! shared across the CLI and every worker process that opens this file.
//!
//! The interesting part is [`SqliteStore::lease_pending`] and
//! [`SqliteStore::lease_failed_for_retry`]: a `SELECT` to find the
//! highest-ranked candidate row followed by a conditional `UPDATE ... WHERE
//! id = ? AND state = ?`. Two workers can select the same row; only one's
//! `UPDATE` affects a row. The loser observes `rows_affected() == 0` and
//! retries the select-CAS once before giving up.

use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use queuectl_core::{
    format_timestamp, parse_timestamp, Job, JobState, JobStats, JobUpdate, QueueError, Result,
    Store,
};

/// Base columns present since the first schema revision, plus the columns
/// added later by schema evolution (kept as a separate, additive list so
/// `init_schema` can bring an older database file up to date in place).
const EVOLVED_COLUMNS: &[(&str, &str)] = &[
    ("priority", "INTEGER NOT NULL DEFAULT 0"),
    ("run_at", "TEXT"),
    ("timeout", "INTEGER"),
    ("last_output", "TEXT"),
    ("duration_ms", "INTEGER"),
];

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if absent) the SQLite database file at `path` and
    /// bring its schema up to date.
    pub async fn connect(path: &str) -> AnyResult<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .context("invalid sqlite path")?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .context("failed to open sqlite database")?;
        Self::new(pool).await
    }

    /// Wrap an already-open pool (used by tests for `sqlite::memory:`).
    pub async fn new(pool: SqlitePool) -> AnyResult<Self> {
        init_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn init_schema(pool: &SqlitePool) -> AnyResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            command TEXT NOT NULL,
            state TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            next_retry_at TEXT,
            worker_id TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL,
            state TEXT NOT NULL,
            success INTEGER NOT NULL,
            attempts INTEGER NOT NULL,
            duration_ms INTEGER,
            output TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    let existing: Vec<String> = sqlx::query("PRAGMA table_info(jobs)")
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(|row| row.get::<String, _>("name"))
        .collect();

    for (column, definition) in EVOLVED_COLUMNS {
        if !existing.iter().any(|c| c == column) {
            let sql = format!("ALTER TABLE jobs ADD COLUMN {column} {definition}");
            sqlx::query(&sql).execute(pool).await?;
        }
    }

    for index_sql in [
        "CREATE INDEX IF NOT EXISTS idx_state ON jobs(state)",
        "CREATE INDEX IF NOT EXISTS idx_next_retry ON jobs(next_retry_at)",
        "CREATE INDEX IF NOT EXISTS idx_priority ON jobs(priority)",
        "CREATE INDEX IF NOT EXISTS idx_run_at ON jobs(run_at)",
        "CREATE INDEX IF NOT EXISTS idx_job_logs_job_id ON job_logs(job_id)",
        "CREATE INDEX IF NOT EXISTS idx_job_logs_created_at ON job_logs(created_at)",
    ] {
        sqlx::query(index_sql).execute(pool).await?;
    }

    Ok(())
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    command: String,
    state: String,
    attempts: i64,
    max_retries: i64,
    priority: i64,
    run_at: Option<String>,
    next_retry_at: Option<String>,
    timeout: Option<i64>,
    worker_id: Option<String>,
    last_output: Option<String>,
    duration_ms: Option<i64>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            id: row.id,
            command: row.command,
            state: JobState::from_str(&row.state)
                .map_err(|e| QueueError::Store(anyhow::anyhow!(e)))?,
            attempts: row.attempts,
            max_retries: row.max_retries,
            priority: row.priority,
            run_at: row.run_at.as_deref().and_then(parse_timestamp),
            next_retry_at: row.next_retry_at.as_deref().and_then(parse_timestamp),
            timeout: row.timeout.unwrap_or(3600),
            worker_id: row.worker_id,
            last_output: row.last_output,
            duration_ms: row.duration_ms,
            created_at: parse_timestamp(&row.created_at).unwrap_or_else(Utc::now),
            updated_at: parse_timestamp(&row.updated_at).unwrap_or_else(Utc::now),
        })
    }
}

const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, priority, run_at, \
     next_retry_at, timeout, worker_id, last_output, duration_ms, created_at, updated_at";

#[async_trait]
impl Store for SqliteStore {
    async fn create_job(&self, job: &Job) -> Result<bool> {
        let result = sqlx::query(&format!(
            "INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?)"
        ))
        .bind(&job.id)
        .bind(&job.command)
        .bind(job.state.as_str())
        .bind(job.attempts)
        .bind(job.max_retries)
        .bind(job.priority)
        .bind(job.run_at.map(format_timestamp))
        .bind(job.next_retry_at.map(format_timestamp))
        .bind(job.timeout)
        .bind(&job.worker_id)
        .bind(&job.last_output)
        .bind(job.duration_ms)
        .bind(format_timestamp(job.created_at))
        .bind(format_timestamp(job.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(false),
            Err(e) => Err(QueueError::Store(e.into())),
        }
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| QueueError::Store(e.into()))?;
        row.map(Job::try_from).transpose()
    }

    async fn update_job(&self, id: &str, update: JobUpdate) -> Result<()> {
        let mut set_clauses: Vec<String> = Vec::new();
        let mut tx = self.pool.begin().await.map_err(|e| QueueError::Store(e.into()))?;

        macro_rules! push {
            ($name:literal) => {
                set_clauses.push(concat!($name, " = ?").to_string())
            };
        }

        if update.state.is_some() {
            push!("state");
        }
        if update.attempts.is_some() {
            push!("attempts");
        }
        if update.max_retries.is_some() {
            push!("max_retries");
        }
        if update.priority.is_some() {
            push!("priority");
        }
        if update.run_at.is_some() {
            push!("run_at");
        }
        if update.next_retry_at.is_some() {
            push!("next_retry_at");
        }
        if update.timeout.is_some() {
            push!("timeout");
        }
        if update.worker_id.is_some() {
            push!("worker_id");
        }
        if update.last_output.is_some() {
            push!("last_output");
        }
        if update.duration_ms.is_some() {
            push!("duration_ms");
        }
        set_clauses.push("updated_at = ?".to_string());

        let sql = format!(
            "UPDATE jobs SET {} WHERE id = ?",
            set_clauses.join(", ")
        );
        let mut q = sqlx::query(&sql);
        if let Some(v) = update.state {
            q = q.bind(v.as_str());
        }
        if let Some(v) = update.attempts {
            q = q.bind(v);
        }
        if let Some(v) = update.max_retries {
            q = q.bind(v);
        }
        if let Some(v) = update.priority {
            q = q.bind(v);
        }
        if let Some(v) = update.run_at {
            q = q.bind(v.map(format_timestamp));
        }
        if let Some(v) = update.next_retry_at {
            q = q.bind(v.map(format_timestamp));
        }
        if let Some(v) = update.timeout {
            q = q.bind(v);
        }
        if let Some(v) = update.worker_id {
            q = q.bind(v);
        }
        if let Some(v) = update.last_output {
            q = q.bind(v);
        }
        if let Some(v) = update.duration_ms {
            q = q.bind(v);
        }
        q = q.bind(format_timestamp(Utc::now()));
        q = q.bind(id);

        q.execute(&mut *tx).await.map_err(|e| QueueError::Store(e.into()))?;
        tx.commit().await.map_err(|e| QueueError::Store(e.into()))?;
        Ok(())
    }

    async fn list_jobs(&self, state: Option<JobState>, limit: Option<i64>) -> Result<Vec<Job>> {
        let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs");
        if state.is_some() {
            sql.push_str(" WHERE state = ?");
        }
        sql.push_str(" ORDER BY priority DESC, run_at IS NOT NULL, run_at ASC, created_at DESC");
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut query = sqlx::query_as::<_, JobRow>(&sql);
        if let Some(state) = state {
            query = query.bind(state.as_str());
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QueueError::Store(e.into()))?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn get_stats(&self) -> Result<JobStats> {
        let rows = sqlx::query("SELECT state, COUNT(*) as count FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QueueError::Store(e.into()))?;

        let mut stats = JobStats::default();
        for row in rows {
            let state: String = row.get("state");
            let count: i64 = row.get("count");
            match state.as_str() {
                "pending" => stats.pending = count,
                "processing" => stats.processing = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                "dead" => stats.dead = count,
                _ => {}
            }
        }
        Ok(stats)
    }

    async fn log_job_execution(
        &self,
        job_id: &str,
        state: JobState,
        success: bool,
        attempts: i64,
        duration_ms: Option<i64>,
        output: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO job_logs (job_id, state, success, attempts, duration_ms, output, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job_id)
        .bind(state.as_str())
        .bind(success)
        .bind(attempts)
        .bind(duration_ms)
        .bind(output)
        .bind(format_timestamp(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Store(e.into()))?;
        Ok(())
    }

    async fn delete_job(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Store(e.into()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn lease_pending(&self, worker_id: &str) -> Result<Option<Job>> {
        let now = format_timestamp(Utc::now());
        for _attempt in 0..2 {
            let mut tx = self.pool.begin().await.map_err(|e| QueueError::Store(e.into()))?;
            let candidate: Option<String> = sqlx::query(
                "SELECT id FROM jobs \
                 WHERE state = 'pending' \
                   AND (run_at IS NULL OR run_at <= ?) \
                   AND (next_retry_at IS NULL OR next_retry_at <= ?) \
                 ORDER BY priority DESC, run_at IS NOT NULL, run_at ASC, created_at ASC \
                 LIMIT 1",
            )
            .bind(&now)
            .bind(&now)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| QueueError::Store(e.into()))?
            .map(|row| row.get("id"));

            let Some(job_id) = candidate else {
                tx.commit().await.ok();
                return Ok(None);
            };

            let result = sqlx::query(
                "UPDATE jobs SET state = 'processing', worker_id = ?, updated_at = ? \
                 WHERE id = ? AND state = 'pending'",
            )
            .bind(worker_id)
            .bind(&now)
            .bind(&job_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| QueueError::Store(e.into()))?;

            if result.rows_affected() == 1 {
                let row = sqlx::query_as::<_, JobRow>(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"
                ))
                .bind(&job_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| QueueError::Store(e.into()))?;
                tx.commit().await.map_err(|e| QueueError::Store(e.into()))?;
                return Ok(Some(Job::try_from(row)?));
            }

            // Lost the race: another worker's CAS won. Release this
            // transaction and try once more.
            tx.rollback().await.map_err(|e| QueueError::Store(e.into()))?;
        }
        Ok(None)
    }

    async fn lease_failed_for_retry(&self, worker_id: &str) -> Result<Option<Job>> {
        let now = format_timestamp(Utc::now());
        for _attempt in 0..2 {
            let mut tx = self.pool.begin().await.map_err(|e| QueueError::Store(e.into()))?;
            let candidate: Option<String> = sqlx::query(
                "SELECT id FROM jobs \
                 WHERE state = 'failed' \
                   AND next_retry_at IS NOT NULL \
                   AND next_retry_at <= ? \
                 ORDER BY priority DESC, next_retry_at ASC \
                 LIMIT 1",
            )
            .bind(&now)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| QueueError::Store(e.into()))?
            .map(|row| row.get("id"));

            let Some(job_id) = candidate else {
                tx.commit().await.ok();
                return Ok(None);
            };

            let result = sqlx::query(
                "UPDATE jobs SET state = 'processing', worker_id = ?, updated_at = ? \
                 WHERE id = ? AND state = 'failed'",
            )
            .bind(worker_id)
            .bind(&now)
            .bind(&job_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| QueueError::Store(e.into()))?;

            if result.rows_affected() == 1 {
                let row = sqlx::query_as::<_, JobRow>(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"
                ))
                .bind(&job_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| QueueError::Store(e.into()))?;
                tx.commit().await.map_err(|e| QueueError::Store(e.into()))?;
                return Ok(Some(Job::try_from(row)?));
            }

            tx.rollback().await.map_err(|e| QueueError::Store(e.into()))?;
        }
        Ok(None)
    }

    async fn reap_abandoned_leases(&self, default_timeout_secs: i64) -> Result<u64> {
        // Each row's own `timeout` governs its lease window (falling back
        // to the configured default), so this is computed per candidate
        // row in application code rather than as one blanket SQL cutoff.
        let candidates = sqlx::query(
            "SELECT id, updated_at, timeout FROM jobs WHERE state = 'processing'",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueueError::Store(e.into()))?;

        let now = Utc::now();
        let mut reclaimed = 0u64;
        for row in candidates {
            let id: String = row.get("id");
            let updated_at: String = row.get("updated_at");
            let timeout: Option<i64> = row.get("timeout");
            let Some(updated_at) = parse_timestamp(&updated_at) else {
                continue;
            };
            let lease_window = chrono::Duration::seconds(2 * timeout.unwrap_or(default_timeout_secs));
            if now - updated_at < lease_window {
                continue;
            }
            let result = sqlx::query(
                "UPDATE jobs SET state = 'pending', worker_id = NULL, next_retry_at = NULL, \
                 updated_at = ? WHERE id = ? AND state = 'processing'",
            )
            .bind(format_timestamp(now))
            .bind(&id)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Store(e.into()))?;
            reclaimed += result.rows_affected();
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use queuectl_core::JobState;

    async fn memory_store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteStore::new(pool).await.unwrap()
    }

    fn sample_job(id: &str) -> Job {
        let now = Utc::now();
        Job {
            id: id.to_string(),
            command: "echo hi".to_string(),
            state: JobState::Pending,
            attempts: 0,
            max_retries: 3,
            priority: 0,
            run_at: None,
            next_retry_at: None,
            timeout: 30,
            worker_id: None,
            last_output: None,
            duration_ms: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn create_job_rejects_duplicate_id() {
        let store = memory_store().await;
        let job = sample_job("j1");
        assert!(store.create_job(&job).await.unwrap());
        assert!(!store.create_job(&job).await.unwrap());
    }

    #[tokio::test]
    async fn lease_pending_cas_transitions_to_processing() {
        let store = memory_store().await;
        store.create_job(&sample_job("j1")).await.unwrap();

        let leased = store.lease_pending("w1").await.unwrap().unwrap();
        assert_eq!(leased.state, JobState::Processing);
        assert_eq!(leased.worker_id.as_deref(), Some("w1"));

        // Already leased: no more pending candidates.
        assert!(store.lease_pending("w2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lease_pending_orders_by_priority_desc() {
        let store = memory_store().await;
        let mut lo = sample_job("lo");
        lo.priority = 0;
        let mut hi = sample_job("hi");
        hi.priority = 10;
        store.create_job(&lo).await.unwrap();
        store.create_job(&hi).await.unwrap();

        let leased = store.lease_pending("w1").await.unwrap().unwrap();
        assert_eq!(leased.id, "hi");
    }

    #[tokio::test]
    async fn reap_abandoned_leases_reclaims_stale_processing_rows() {
        let store = memory_store().await;
        let mut job = sample_job("j1");
        job.state = JobState::Processing;
        job.worker_id = Some("dead-worker".to_string());
        job.updated_at = Utc::now() - chrono::Duration::seconds(1000);
        sqlx::query(
            "INSERT INTO jobs (id, command, state, attempts, max_retries, priority, run_at, \
             next_retry_at, timeout, worker_id, last_output, duration_ms, created_at, updated_at) \
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(&job.id)
        .bind(&job.command)
        .bind(job.state.as_str())
        .bind(job.attempts)
        .bind(job.max_retries)
        .bind(job.priority)
        .bind(job.run_at.map(format_timestamp))
        .bind(job.next_retry_at.map(format_timestamp))
        .bind(job.timeout)
        .bind(&job.worker_id)
        .bind(&job.last_output)
        .bind(job.duration_ms)
        .bind(format_timestamp(job.created_at))
        .bind(format_timestamp(job.updated_at))
        .execute(store.pool())
        .await
        .unwrap();

        let reclaimed = store.reap_abandoned_leases(60).await.unwrap();
        assert_eq!(reclaimed, 1);
        let job = store.get_job("j1").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert!(job.worker_id.is_none());
    }

    #[tokio::test]
    async fn reap_abandoned_leases_clears_next_retry_at_from_retry_leases() {
        // A job leased via `lease_failed_for_retry` carries its non-null
        // `next_retry_at` into `processing` (the CAS doesn't clear it).
        // If the reaper reclaims such a row, it must still clear
        // `next_retry_at` — invariant 4 forbids a `pending` row from
        // keeping one.
        let store = memory_store().await;
        let mut job = sample_job("j1");
        job.state = JobState::Failed;
        job.next_retry_at = Some(Utc::now() - chrono::Duration::seconds(10));
        store.create_job(&job).await.unwrap();

        let leased = store.lease_failed_for_retry("dead-worker").await.unwrap().unwrap();
        assert_eq!(leased.state, JobState::Processing);
        assert!(leased.next_retry_at.is_some());

        sqlx::query("UPDATE jobs SET updated_at = ? WHERE id = ?")
            .bind(format_timestamp(Utc::now() - chrono::Duration::seconds(1000)))
            .bind("j1")
            .execute(store.pool())
            .await
            .unwrap();

        let reclaimed = store.reap_abandoned_leases(60).await.unwrap();
        assert_eq!(reclaimed, 1);
        let job = store.get_job("j1").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert!(job.worker_id.is_none());
        assert!(job.next_retry_at.is_none());
    }
}
