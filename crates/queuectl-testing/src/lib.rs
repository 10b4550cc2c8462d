//! Shared fixtures for `queuectl-core`, `queuectl-sqlite`, and the CLI's
//! integration tests: a steppable clock and an in-memory database, so
//! backoff schedules and leasing races are exercised without sleeping real
//! wall-clock seconds or touching disk.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use queuectl_core::Clock;
use sqlx::sqlite::SqlitePoolOptions;
use queuectl_sqlite::SqliteStore;

/// A clock whose value only moves when told to. Tests drive backoff and
/// lease-abandonment scenarios by calling [`FixedClock::advance`] instead of
/// sleeping.
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += duration;
    }
}

impl Default for FixedClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// An in-memory `SqliteStore` with a randomized memory-DB identifier so
/// concurrent test runs in the same process don't share state.
///
/// `sqlite::memory:` opens a brand new private database per connection; we
/// pin the pool to a single connection so every statement in a test sees
/// the same instance.
pub async fn in_memory_store() -> SqliteStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite pool");
    SqliteStore::new(pool)
        .await
        .expect("initialize in-memory schema")
}

/// A unique job id for tests that enqueue many jobs and don't care about
/// exact naming, only uniqueness.
pub fn random_job_id(prefix: &str) -> String {
    format!("{prefix}-{}", fastrand::u64(..))
}
