use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Job, JobState, JobStats, JobUpdate};

/// Durable, race-free persistence of jobs and execution logs.
///
/// Every method is one transaction; the store never partially commits a
/// multi-field update. The two lease methods are the only operations with
/// real concurrency content — see their doc comments for the compare-and-swap
/// contract multiple worker processes rely on.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a job row. Returns `false` on primary-key collision; never
    /// overwrites an existing row.
    async fn create_job(&self, job: &Job) -> Result<bool>;

    async fn get_job(&self, id: &str) -> Result<Option<Job>>;

    /// Apply the given field set and bump `updated_at`. Unconditional —
    /// callers are expected to have already checked the current state.
    async fn update_job(&self, id: &str, update: JobUpdate) -> Result<()>;

    /// Ordered by `(priority DESC, run_at NULLS LAST ASC, created_at DESC)`.
    async fn list_jobs(&self, state: Option<JobState>, limit: Option<i64>) -> Result<Vec<Job>>;

    async fn get_stats(&self) -> Result<JobStats>;

    #[allow(clippy::too_many_arguments)]
    async fn log_job_execution(
        &self,
        job_id: &str,
        state: JobState,
        success: bool,
        attempts: i64,
        duration_ms: Option<i64>,
        output: Option<&str>,
    ) -> Result<()>;

    async fn delete_job(&self, id: &str) -> Result<bool>;

    /// Select the single highest-ranked `pending` row whose `run_at` and
    /// `next_retry_at` gates have opened, then compare-and-swap it to
    /// `processing` bound to `worker_id`. Ordered by `(priority DESC, run_at
    /// NULLS LAST ASC, created_at ASC)`.
    ///
    /// The select-then-CAS is retried at most once if a concurrent worker
    /// wins the race (the CAS affects zero rows); after that it returns
    /// `Ok(None)` rather than starving the caller.
    async fn lease_pending(&self, worker_id: &str) -> Result<Option<Job>>;

    /// As [`Store::lease_pending`], but over `failed` rows whose
    /// `next_retry_at` has elapsed. Ordered by `(priority DESC,
    /// next_retry_at ASC)`, CAS from `failed` to `processing`.
    async fn lease_failed_for_retry(&self, worker_id: &str) -> Result<Option<Job>>;

    /// Move `processing` rows whose `updated_at` is older than `2 *
    /// timeout` (using each row's own `timeout`, falling back to
    /// `default_timeout_secs` for rows that somehow have none) back to
    /// `pending`, clearing `worker_id` and `next_retry_at` (a row leased via
    /// [`Store::lease_failed_for_retry`] carries a non-null `next_retry_at`
    /// into `processing`; invariant 4 requires it be cleared on the way to
    /// any non-`failed` state). Returns the number of rows reclaimed. This
    /// only ever reverts an abandoned lease — it is not a third kind of
    /// lease transition.
    async fn reap_abandoned_leases(&self, default_timeout_secs: i64) -> Result<u64>;
}
