use std::path::{Path, PathBuf};

/// The per-user directory holding `jobs.db`, `config.json`, and
/// `worker_pids.json`. Defaults to `~/.queuectl`, overridable via
/// `--state-dir` for tests and for running multiple independent queues on
/// one host.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn resolve(override_path: Option<&Path>) -> anyhow::Result<Self> {
        let root = match override_path {
            Some(path) => path.to_path_buf(),
            None => dirs::home_dir()
                .ok_or_else(|| anyhow::anyhow!("could not determine home directory"))?
                .join(".queuectl"),
        };
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn jobs_db(&self) -> PathBuf {
        self.root.join("jobs.db")
    }

    pub fn config_json(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn worker_pids_json(&self) -> PathBuf {
        self.root.join("worker_pids.json")
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }
}
