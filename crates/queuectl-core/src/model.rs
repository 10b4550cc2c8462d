use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The five states a job can occupy. See the module-level invariants in
/// [`crate::lifecycle`] for the allowed transitions between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(format!("invalid state: {other}")),
        }
    }
}

/// A durable unit of work. See the data model section of the spec for the
/// field-by-field semantics; this struct is the in-memory mirror of one row
/// of the `jobs` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub state: JobState,
    pub attempts: i64,
    pub max_retries: i64,
    pub priority: i64,
    #[serde(with = "crate::clock::serde_ts_opt")]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(with = "crate::clock::serde_ts_opt")]
    pub next_retry_at: Option<DateTime<Utc>>,
    pub timeout: i64,
    pub worker_id: Option<String>,
    pub last_output: Option<String>,
    pub duration_ms: Option<i64>,
    #[serde(with = "crate::clock::serde_ts")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "crate::clock::serde_ts")]
    pub updated_at: DateTime<Utc>,
}

/// A field-level optional update applied to a job row.
///
/// Every field is `Option<Option<T>>` where the outer `Option` means "leave
/// this field alone" and the inner `Option` carries the new value,
/// including an explicit `Some(None)` to clear a nullable column. This
/// mirrors the store's `update_job` contract: it applies exactly the given
/// field set and always bumps `updated_at`, unconditionally.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub state: Option<JobState>,
    pub attempts: Option<i64>,
    pub max_retries: Option<i64>,
    pub priority: Option<i64>,
    pub run_at: Option<Option<DateTime<Utc>>>,
    pub next_retry_at: Option<Option<DateTime<Utc>>>,
    pub timeout: Option<i64>,
    pub worker_id: Option<Option<String>>,
    pub last_output: Option<Option<String>>,
    pub duration_ms: Option<Option<i64>>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn attempts(mut self, attempts: i64) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn clear_worker_id(mut self) -> Self {
        self.worker_id = Some(None);
        self
    }

    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(Some(worker_id.into()));
        self
    }

    pub fn clear_next_retry_at(mut self) -> Self {
        self.next_retry_at = Some(None);
        self
    }

    pub fn next_retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_retry_at = Some(Some(at));
        self
    }

    pub fn clear_run_at(mut self) -> Self {
        self.run_at = Some(None);
        self
    }

    pub fn last_output(mut self, output: Option<String>) -> Self {
        self.last_output = Some(output);
        self
    }

    pub fn duration_ms(mut self, duration_ms: Option<i64>) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// Grouped counts of jobs by state, as returned by `get_stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead: i64,
}

impl JobStats {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed + self.dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_json_timestamps_use_trailing_z() {
        let now = Utc::now();
        let job = Job {
            id: "j1".into(),
            command: "echo hi".into(),
            state: JobState::Failed,
            attempts: 1,
            max_retries: 3,
            priority: 0,
            run_at: None,
            next_retry_at: Some(now),
            timeout: 30,
            worker_id: None,
            last_output: None,
            duration_ms: None,
            created_at: now,
            updated_at: now,
        };

        let json = serde_json::to_value(&job).unwrap();
        assert!(json["created_at"].as_str().unwrap().ends_with('Z'));
        assert!(json["next_retry_at"].as_str().unwrap().ends_with('Z'));
        assert!(json["run_at"].is_null());

        let round_tripped: Job = serde_json::from_value(json).unwrap();
        assert_eq!(round_tripped.created_at.timestamp_millis(), now.timestamp_millis());
        assert_eq!(
            round_tripped.next_retry_at.unwrap().timestamp_millis(),
            now.timestamp_millis()
        );
    }
}
