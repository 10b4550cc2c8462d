/// Tunables the lifecycle engine needs, passed explicitly rather than read
/// from an ambient global. The CLI's config layer (`queuectl-cli::config`)
/// owns loading this from `config.json` and merging in CLI overrides; the
/// core only ever sees the resolved values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueConfig {
    pub max_retries: i64,
    pub backoff_base: f64,
    pub poll_interval_secs: u64,
    pub default_timeout_secs: i64,
    pub default_priority: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: 2.0,
            poll_interval_secs: 1,
            default_timeout_secs: 3600,
            default_priority: 0,
        }
    }
}
