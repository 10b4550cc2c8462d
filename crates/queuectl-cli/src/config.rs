use std::path::Path;

use queuectl_core::QueueConfig;
use serde_json::{Map, Value};

/// `config.json`: a small JSON object in the state directory. Loaded at
/// startup and merged with defaults; mutated only by `config set`. Unknown
/// keys are preserved on round-trip rather than rejected, matching the
/// original's permissive dict-based config.
#[derive(Debug, Clone)]
pub struct FileConfig {
    values: Map<String, Value>,
}

fn defaults() -> Map<String, Value> {
    let mut m = Map::new();
    m.insert("max_retries".into(), Value::from(3));
    m.insert("backoff_base".into(), Value::from(2));
    m.insert("poll_interval".into(), Value::from(1));
    m
}

impl FileConfig {
    /// Load from `path`, creating it with defaults if absent. A malformed
    /// file falls back to defaults rather than failing startup.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let defaults = defaults();
        if path.exists() {
            let text = std::fs::read_to_string(path)?;
            let parsed: Map<String, Value> = serde_json::from_str(&text).unwrap_or_default();
            let mut merged = defaults;
            for (k, v) in parsed {
                merged.insert(k, v);
            }
            Ok(Self { values: merged })
        } else {
            let config = Self { values: defaults };
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(&self.values)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Resolve the tunables the lifecycle engine needs. Any missing or
    /// malformed value falls back to `QueueConfig::default()`'s field.
    pub fn to_queue_config(&self) -> QueueConfig {
        let defaults = QueueConfig::default();
        QueueConfig {
            max_retries: self
                .get("max_retries")
                .and_then(Value::as_i64)
                .unwrap_or(defaults.max_retries),
            backoff_base: self
                .get("backoff_base")
                .and_then(Value::as_f64)
                .unwrap_or(defaults.backoff_base),
            poll_interval_secs: self
                .get("poll_interval")
                .and_then(Value::as_u64)
                .unwrap_or(defaults.poll_interval_secs),
            default_timeout_secs: self
                .get("default_timeout")
                .and_then(Value::as_i64)
                .unwrap_or(defaults.default_timeout_secs),
            default_priority: self
                .get("default_priority")
                .and_then(Value::as_i64)
                .unwrap_or(defaults.default_priority),
        }
    }
}

/// Maps a CLI's kebab-case config key to the on-disk snake_case key. Known
/// keys use an explicit table; anything else is mapped mechanically.
pub fn kebab_to_snake(key: &str) -> String {
    const KNOWN: &[(&str, &str)] = &[
        ("max-retries", "max_retries"),
        ("backoff-base", "backoff_base"),
        ("poll-interval", "poll_interval"),
    ];
    for (kebab, snake) in KNOWN {
        if *kebab == key {
            return (*snake).to_string();
        }
    }
    key.replace('-', "_")
}

pub fn snake_to_kebab(key: &str) -> String {
    key.replace('_', "-")
}

/// Parse a CLI-supplied string value for a known config key into the right
/// JSON type. `max-retries`/`poll-interval` are integers; `backoff-base` is
/// an integer or a float depending on whether the string contains a `.`.
pub fn parse_config_value(internal_key: &str, raw: &str) -> anyhow::Result<Value> {
    match internal_key {
        "max_retries" | "poll_interval" => {
            let v: i64 = raw
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid value for {internal_key}: {raw}"))?;
            Ok(Value::from(v))
        }
        "backoff_base" => {
            if raw.contains('.') {
                let v: f64 = raw
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid value for {internal_key}: {raw}"))?;
                Ok(Value::from(v))
            } else {
                let v: i64 = raw
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid value for {internal_key}: {raw}"))?;
                Ok(Value::from(v))
            }
        }
        _ => Ok(Value::from(raw)),
    }
}
