use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use queuectl_core::{Job, LifecycleManager, QueueConfig};
use queuectl_sqlite::SqliteStore;
use tokio::process::Command;
use tokio::time::Duration;

use crate::shutdown::ShutdownToken;

type Lifecycle = LifecycleManager<SqliteStore, queuectl_core::SystemClock>;

/// One worker process's poll-lease-execute loop. See the module docs on
/// [`crate::shutdown::ShutdownToken`] for the graceful-shutdown contract.
pub struct WorkerLoop {
    worker_id: String,
    lifecycle: Arc<Lifecycle>,
    config: QueueConfig,
    shutdown: ShutdownToken,
}

impl WorkerLoop {
    pub fn new(
        worker_id: String,
        lifecycle: Arc<Lifecycle>,
        config: QueueConfig,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            worker_id,
            lifecycle,
            config,
            shutdown,
        }
    }

    pub async fn run(self) {
        tracing::info!(worker_id = %self.worker_id, "worker started");

        loop {
            if self.shutdown.is_set() {
                break;
            }

            if let Err(e) = self
                .lifecycle
                .store()
                .reap_abandoned_leases(self.config.default_timeout_secs)
                .await
            {
                tracing::warn!(worker_id = %self.worker_id, error = %e, "lease reaper failed, continuing");
            }

            match self.next_job().await {
                Ok(Some(job)) => {
                    self.process_job(job).await;
                }
                Ok(None) => {
                    tokio::time::sleep(Duration::from_secs(self.config.poll_interval_secs)).await;
                }
                Err(e) => {
                    tracing::error!(worker_id = %self.worker_id, error = %e, "error while polling for work, continuing");
                    tokio::time::sleep(Duration::from_secs(self.config.poll_interval_secs)).await;
                }
            }
        }

        tracing::info!(worker_id = %self.worker_id, "worker stopped");
    }

    async fn next_job(&self) -> queuectl_core::Result<Option<Job>> {
        if let Some(job) = self.lifecycle.store().lease_pending(&self.worker_id).await? {
            return Ok(Some(job));
        }
        self.lifecycle
            .store()
            .lease_failed_for_retry(&self.worker_id)
            .await
    }

    async fn process_job(&self, job: Job) {
        let timeout_secs = if job.timeout > 0 {
            job.timeout
        } else {
            self.config.default_timeout_secs
        };

        tracing::info!(
            worker_id = %self.worker_id,
            job_id = %job.id,
            priority = job.priority,
            timeout = timeout_secs,
            "processing job: {}",
            job.command
        );

        let (success, output, duration_ms) = execute_command(&job.command, timeout_secs).await;

        let result = if success {
            self.lifecycle
                .mark_completed(&job, Some(output.as_str()), Some(duration_ms))
                .await
                .map(|()| true)
        } else {
            self.lifecycle
                .mark_failed(&job, &self.worker_id, Some(output.as_str()), Some(duration_ms), None)
                .await
        };

        match result {
            Ok(true) if success => {
                tracing::info!(worker_id = %self.worker_id, job_id = %job.id, duration_ms, "job completed successfully");
            }
            Ok(true) => {
                tracing::info!(worker_id = %self.worker_id, job_id = %job.id, "job failed, will retry");
            }
            Ok(false) => {
                tracing::warn!(worker_id = %self.worker_id, job_id = %job.id, "job failed permanently, moved to dead letter queue");
            }
            Err(e) => {
                tracing::error!(worker_id = %self.worker_id, job_id = %job.id, error = %e, "failed to record job outcome");
            }
        }
    }
}

/// Execute `command` through a shell with a hard per-job timeout, capturing
/// stdout and stderr into one combined, trimmed string. Returns
/// `(success, output, duration_ms)`. `duration_ms` is the wall time over
/// the whole attempt, including any timeout wait.
async fn execute_command(command: &str, timeout_secs: i64) -> (bool, String, i64) {
    let start = Instant::now();

    let mut cmd = shell_command(command);
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return (false, format!("Execution error: {e}"), elapsed_ms(start)),
    };

    let budget = Duration::from_secs(timeout_secs.max(0) as u64);
    match tokio::time::timeout(budget, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            (output.status.success(), combined.trim().to_string(), elapsed_ms(start))
        }
        Ok(Err(e)) => (false, format!("Execution error: {e}"), elapsed_ms(start)),
        Err(_) => (
            false,
            format!("Command timed out after {timeout_secs} seconds"),
            elapsed_ms(start),
        ),
    }
}

fn elapsed_ms(start: Instant) -> i64 {
    start.elapsed().as_millis() as i64
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(not(unix))]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}
