use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::model::{Job, JobState, JobUpdate};
use crate::store::Store;

/// Validates submissions and applies the state-transition rules layered
/// over the [`Store`]. This is the sole writer of `state` outside of the
/// store's own leasing predicates (and the reaper, which only ever reverts
/// an abandoned lease).
pub struct LifecycleManager<S, C> {
    store: Arc<S>,
    clock: Arc<C>,
    config: QueueConfig,
}

impl<S, C> LifecycleManager<S, C>
where
    S: Store,
    C: Clock,
{
    pub fn new(store: Arc<S>, clock: Arc<C>, config: QueueConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Validate a job submission and durably record it in `pending` state.
    ///
    /// `data` is a JSON object: required `id` and `command` strings;
    /// optional `max_retries`, `priority`, `run_at`, `timeout`. Unknown
    /// fields are ignored. A duplicate `id` is reported as
    /// [`QueueError::Conflict`].
    pub async fn enqueue(&self, data: Value) -> Result<Job> {
        let obj = data
            .as_object()
            .ok_or_else(|| QueueError::Validation("job data must be a JSON object".into()))?;

        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| QueueError::Validation("job must have an 'id' field".into()))?
            .to_string();

        let command = obj
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| QueueError::Validation("job must have a 'command' field".into()))?
            .to_string();

        let priority = match obj.get("priority") {
            Some(v) => coerce_i64(v).ok_or_else(|| {
                QueueError::Validation("priority must be an integer".into())
            })?,
            None => self.config.default_priority,
        };

        let max_retries = match obj.get("max_retries") {
            Some(v) => coerce_i64(v).ok_or_else(|| {
                QueueError::Validation("max_retries must be an integer".into())
            })?,
            None => self.config.max_retries,
        };

        let run_at = match obj.get("run_at") {
            Some(Value::Null) | None => None,
            Some(v) => Some(normalize_run_at(v)?),
        };

        let timeout = match obj.get("timeout") {
            Some(v) => coerce_i64(v)
                .ok_or_else(|| QueueError::Validation("timeout must be an integer".into()))?,
            None => self.config.default_timeout_secs,
        };
        if timeout <= 0 {
            return Err(QueueError::Validation(
                "timeout must be greater than zero".into(),
            ));
        }

        let now = self.clock.now();
        let job = Job {
            id: id.clone(),
            command,
            state: JobState::Pending,
            attempts: 0,
            max_retries,
            priority,
            run_at,
            next_retry_at: None,
            timeout,
            worker_id: None,
            last_output: None,
            duration_ms: None,
            created_at: now,
            updated_at: now,
        };

        let created = self.store.create_job(&job).await?;
        if !created {
            return Err(QueueError::Conflict(format!(
                "job with id '{id}' already exists"
            )));
        }

        self.store
            .get_job(&id)
            .await?
            .ok_or_else(|| QueueError::Store(anyhow::anyhow!("job vanished immediately after insert")))
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        self.store.get_job(id).await
    }

    pub async fn list_jobs(&self, state: Option<JobState>, limit: Option<i64>) -> Result<Vec<Job>> {
        self.store.list_jobs(state, limit).await
    }

    /// Record a successful execution. Clears `worker_id`, `next_retry_at`,
    /// and `run_at`; `attempts` is left at whatever it was at dispatch —
    /// success never increments it.
    pub async fn mark_completed(
        &self,
        job: &Job,
        output: Option<&str>,
        duration_ms: Option<i64>,
    ) -> Result<()> {
        let update = JobUpdate::new()
            .state(JobState::Completed)
            .clear_worker_id()
            .clear_next_retry_at()
            .clear_run_at()
            .last_output(output.map(|s| s.to_string()))
            .duration_ms(duration_ms);
        self.store.update_job(&job.id, update).await?;
        self.store
            .log_job_execution(
                &job.id,
                JobState::Completed,
                true,
                job.attempts,
                duration_ms,
                output,
            )
            .await
    }

    /// Record a failed execution attempt. Returns `true` if the job was
    /// rescheduled for retry (`failed`), `false` if it was moved to the
    /// dead-letter state (`dead`, attempts exhausted).
    ///
    /// Threshold semantics: `attempts' = attempts + 1`; the job dies when
    /// `attempts' >= max_retries`, recording `attempts = attempts'` at
    /// death. A job with `max_retries = M` therefore dies on exactly its
    /// Mth failed attempt.
    pub async fn mark_failed(
        &self,
        job: &Job,
        _worker_id: &str,
        output: Option<&str>,
        duration_ms: Option<i64>,
        error: Option<&str>,
    ) -> Result<bool> {
        let attempts = job.attempts + 1;
        let combined_output = combine_output(output, error);

        if attempts >= job.max_retries {
            let update = JobUpdate::new()
                .state(JobState::Dead)
                .attempts(attempts)
                .clear_worker_id()
                .clear_next_retry_at()
                .clear_run_at()
                .last_output(Some(combined_output.clone()))
                .duration_ms(duration_ms);
            self.store.update_job(&job.id, update).await?;
            self.store
                .log_job_execution(
                    &job.id,
                    JobState::Dead,
                    false,
                    attempts,
                    duration_ms,
                    Some(&combined_output),
                )
                .await?;
            Ok(false)
        } else {
            let next_retry_at = self.clock.next_retry_at(attempts as u32, self.config.backoff_base);
            let update = JobUpdate::new()
                .state(JobState::Failed)
                .attempts(attempts)
                .next_retry_at(next_retry_at)
                .clear_worker_id()
                .last_output(Some(combined_output.clone()))
                .duration_ms(duration_ms);
            self.store.update_job(&job.id, update).await?;
            self.store
                .log_job_execution(
                    &job.id,
                    JobState::Failed,
                    false,
                    attempts,
                    duration_ms,
                    Some(&combined_output),
                )
                .await?;
            Ok(true)
        }
    }

    /// Requeue a `dead` job to `pending` with `attempts` reset to zero.
    /// Returns `false` (and mutates nothing) if the job is absent or not
    /// currently `dead`.
    pub async fn retry_dead_job(&self, id: &str) -> Result<bool> {
        let job = match self.store.get_job(id).await? {
            Some(job) => job,
            None => return Ok(false),
        };
        if job.state != JobState::Dead {
            return Ok(false);
        }
        let update = JobUpdate::new()
            .state(JobState::Pending)
            .attempts(0)
            .clear_next_retry_at()
            .clear_worker_id()
            .clear_run_at();
        self.store.update_job(id, update).await?;
        Ok(true)
    }

    pub async fn get_stats(&self) -> Result<crate::model::JobStats> {
        self.store.get_stats().await
    }
}

fn combine_output(output: Option<&str>, error: Option<&str>) -> String {
    let mut combined = output.unwrap_or("").to_string();
    if let Some(error) = error {
        if !error.is_empty() {
            combined = format!("{combined}\n{error}");
        }
    }
    combined.trim().to_string()
}

fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i)
            } else {
                n.as_f64().map(|f| f as i64)
            }
        }
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn normalize_run_at(value: &Value) -> Result<DateTime<Utc>> {
    let s = value
        .as_str()
        .ok_or_else(|| QueueError::Validation("run_at must be an ISO-8601 string".into()))?;
    crate::clock::parse_timestamp(s)
        .ok_or_else(|| QueueError::Validation(format!("invalid timestamp format: {s}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::model::JobStats;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        jobs: Mutex<std::collections::HashMap<String, Job>>,
        logs: Mutex<Vec<(String, JobState, bool, i64)>>,
    }

    #[async_trait]
    impl Store for MemoryStore {
        async fn create_job(&self, job: &Job) -> Result<bool> {
            let mut jobs = self.jobs.lock().unwrap();
            if jobs.contains_key(&job.id) {
                return Ok(false);
            }
            jobs.insert(job.id.clone(), job.clone());
            Ok(true)
        }

        async fn get_job(&self, id: &str) -> Result<Option<Job>> {
            Ok(self.jobs.lock().unwrap().get(id).cloned())
        }

        async fn update_job(&self, id: &str, update: JobUpdate) -> Result<()> {
            let mut jobs = self.jobs.lock().unwrap();
            let job = jobs.get_mut(id).expect("job exists");
            if let Some(state) = update.state {
                job.state = state;
            }
            if let Some(attempts) = update.attempts {
                job.attempts = attempts;
            }
            if let Some(worker_id) = update.worker_id {
                job.worker_id = worker_id;
            }
            if let Some(next_retry_at) = update.next_retry_at {
                job.next_retry_at = next_retry_at;
            }
            if let Some(run_at) = update.run_at {
                job.run_at = run_at;
            }
            if let Some(last_output) = update.last_output {
                job.last_output = last_output;
            }
            if let Some(duration_ms) = update.duration_ms {
                job.duration_ms = duration_ms;
            }
            job.updated_at = Utc::now();
            Ok(())
        }

        async fn list_jobs(&self, _state: Option<JobState>, _limit: Option<i64>) -> Result<Vec<Job>> {
            Ok(self.jobs.lock().unwrap().values().cloned().collect())
        }

        async fn get_stats(&self) -> Result<JobStats> {
            Ok(JobStats::default())
        }

        async fn log_job_execution(
            &self,
            job_id: &str,
            state: JobState,
            success: bool,
            attempts: i64,
            _duration_ms: Option<i64>,
            _output: Option<&str>,
        ) -> Result<()> {
            self.logs
                .lock()
                .unwrap()
                .push((job_id.to_string(), state, success, attempts));
            Ok(())
        }

        async fn delete_job(&self, id: &str) -> Result<bool> {
            Ok(self.jobs.lock().unwrap().remove(id).is_some())
        }

        async fn lease_pending(&self, _worker_id: &str) -> Result<Option<Job>> {
            Ok(None)
        }

        async fn lease_failed_for_retry(&self, _worker_id: &str) -> Result<Option<Job>> {
            Ok(None)
        }

        async fn reap_abandoned_leases(&self, _lease_timeout_secs: i64) -> Result<u64> {
            Ok(0)
        }
    }

    fn manager() -> LifecycleManager<MemoryStore, SystemClock> {
        LifecycleManager::new(
            Arc::new(MemoryStore::default()),
            Arc::new(SystemClock),
            QueueConfig::default(),
        )
    }

    #[tokio::test]
    async fn enqueue_rejects_missing_id() {
        let mgr = manager();
        let err = mgr
            .enqueue(serde_json::json!({"command": "echo hi"}))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
    }

    #[tokio::test]
    async fn enqueue_rejects_duplicate_id() {
        let mgr = manager();
        mgr.enqueue(serde_json::json!({"id": "j1", "command": "echo hi"}))
            .await
            .unwrap();
        let err = mgr
            .enqueue(serde_json::json!({"id": "j1", "command": "echo bye"}))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Conflict(_)));
    }

    #[tokio::test]
    async fn enqueue_rejects_non_positive_timeout() {
        let mgr = manager();
        let err = mgr
            .enqueue(serde_json::json!({"id": "j1", "command": "echo hi", "timeout": 0}))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
    }

    #[tokio::test]
    async fn mark_failed_retries_then_dies_at_threshold() {
        let mgr = manager();
        let job = mgr
            .enqueue(serde_json::json!({"id": "j2", "command": "false", "max_retries": 2}))
            .await
            .unwrap();

        let should_retry = mgr
            .mark_failed(&job, "w1", Some(""), Some(5), None)
            .await
            .unwrap();
        assert!(should_retry);
        let job = mgr.get_job("j2").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 1);
        assert!(job.next_retry_at.is_some());

        let should_retry = mgr
            .mark_failed(&job, "w1", Some(""), Some(5), None)
            .await
            .unwrap();
        assert!(!should_retry);
        let job = mgr.get_job("j2").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 2);
        assert!(job.next_retry_at.is_none());
        assert!(job.worker_id.is_none());
    }

    #[tokio::test]
    async fn retry_dead_job_resets_attempts_and_is_idempotent() {
        let mgr = manager();
        let job = mgr
            .enqueue(serde_json::json!({"id": "j3", "command": "false", "max_retries": 1}))
            .await
            .unwrap();
        mgr.mark_failed(&job, "w1", Some(""), Some(1), None)
            .await
            .unwrap();

        assert!(mgr.retry_dead_job("j3").await.unwrap());
        let job = mgr.get_job("j3").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.next_retry_at.is_none());

        // Not dead anymore: second call is a no-op.
        assert!(!mgr.retry_dead_job("j3").await.unwrap());
    }

    #[tokio::test]
    async fn mark_completed_never_increments_attempts() {
        let mgr = manager();
        let job = mgr
            .enqueue(serde_json::json!({"id": "j4", "command": "echo hi"}))
            .await
            .unwrap();
        mgr.mark_completed(&job, Some("hi"), Some(3)).await.unwrap();
        let job = mgr.get_job("j4").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts, 0);
        assert!(job.worker_id.is_none());
        assert_eq!(job.last_output.as_deref(), Some("hi"));
    }
}
