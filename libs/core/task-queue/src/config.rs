//! Process-level configuration for the task queue core.
//!
//! Follows the workspace's `FromEnv` convention (`core_config`): required
//! values fail fast at startup, optional ones fall back to documented
//! defaults.

use core_config::{env_or_default, env_required, ConfigError, FromEnv};
use std::collections::HashMap;

/// Group scheduling strategy (§4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Fifo,
    Lifo,
    Priority,
    RoundRobin,
}

impl Strategy {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.to_ascii_uppercase().as_str() {
            "FIFO" => Ok(Self::Fifo),
            "LIFO" => Ok(Self::Lifo),
            "PRIORITY" => Ok(Self::Priority),
            "ROUND_ROBIN" | "ROUNDROBIN" => Ok(Self::RoundRobin),
            other => Err(ConfigError::ParseError {
                key: "strategy".to_string(),
                details: format!("unknown strategy '{other}'"),
            }),
        }
    }
}

/// Backoff shape for retry pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    Exponential,
}

impl Backoff {
    fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.to_ascii_uppercase().as_str() {
            "FIXED" => Ok(Self::Fixed),
            "EXPONENTIAL" => Ok(Self::Exponential),
            other => Err(ConfigError::ParseError {
                key: "backoff".to_string(),
                details: format!("unknown backoff '{other}'"),
            }),
        }
    }
}

/// Connection parameters for the backing key/value + pub/sub store (§6).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub uri: String,
    pub key_prefix: Option<String>,
}

impl FromEnv for StoreConfig {
    /// Requires `REDIS_HOST` (no default); `KEY_PREFIX` is optional.
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            uri: env_required("REDIS_HOST")?,
            key_prefix: std::env::var("KEY_PREFIX").ok(),
        })
    }
}

/// Per-queue defaults applied to tasks that don't override them (§6).
#[derive(Debug, Clone)]
pub struct QueueDefaults {
    pub concurrency: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff: Backoff,
    pub timeout_ms: u64,
    pub rate_limit: Option<RateLimit>,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_retries: 3,
            retry_delay_ms: 1000,
            backoff: Backoff::Exponential,
            timeout_ms: 300_000,
            rate_limit: None,
        }
    }
}

/// Per-group defaults (§6).
#[derive(Debug, Clone)]
pub struct GroupDefaults {
    pub strategy: Strategy,
    pub concurrency: usize,
    pub max_concurrency: usize,
    pub priority: i64,
    pub retry_limit: u32,
    pub retry_delay_ms: u64,
    pub timeout_ms: u64,
    pub rate_limit: Option<RateLimit>,
    pub lock_ttl_ms: u64,
}

impl Default for GroupDefaults {
    fn default() -> Self {
        Self {
            strategy: Strategy::Fifo,
            concurrency: 1,
            max_concurrency: 1,
            priority: 0,
            retry_limit: 3,
            retry_delay_ms: 1000,
            timeout_ms: 300_000,
            rate_limit: None,
            lock_ttl_ms: 5_000,
        }
    }
}

/// Sliding-window rate limit: at most `max` admissions per `duration_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max: u32,
    pub duration_ms: u64,
}

/// Dead-letter queue settings (§6).
#[derive(Debug, Clone)]
pub struct DlqConfig {
    pub max_retries: u32,
    pub backoff: Backoff,
    pub alert_threshold: u64,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::Exponential,
            alert_threshold: 10,
        }
    }
}

/// Process-wide configuration: one per `instance_id` (§9 "one facade per
/// named instanceId").
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub instance_id: String,
    pub store: StoreConfig,
    pub queue_defaults: QueueDefaults,
    pub group_defaults: GroupDefaults,
    pub dlq: DlqConfig,
    pub heartbeat_interval_ms: u64,
    pub metrics_interval_ms: u64,
    pub health_check_interval_ms: u64,
    /// Per-group overrides, keyed by group name, hydrated from
    /// `group:priorities` and other per-group persisted config at runtime;
    /// this map only carries process-start defaults.
    pub group_overrides: HashMap<String, GroupDefaults>,
    /// Per-queue overrides, keyed by queue name, read from `QUEUE_<NAME>_*`
    /// env vars at process start (see [`RuntimeConfig::from_env`]).
    pub queue_overrides: HashMap<String, QueueDefaults>,
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let store = StoreConfig::from_env()?;
        let instance_id = env_or_default("INSTANCE_ID", "default");

        let heartbeat_interval_ms: u64 = env_or_default("HEARTBEAT_INTERVAL_MS", "5000")
            .parse()
            .map_err(|e| ConfigError::ParseError {
                key: "HEARTBEAT_INTERVAL_MS".to_string(),
                details: format!("{e}"),
            })?;

        let metrics_interval_ms: u64 = env_or_default("METRICS_INTERVAL_MS", "60000")
            .parse()
            .map_err(|e| ConfigError::ParseError {
                key: "METRICS_INTERVAL_MS".to_string(),
                details: format!("{e}"),
            })?;

        let health_check_interval_ms: u64 = env_or_default("HEALTH_CHECK_INTERVAL_MS", "60000")
            .parse()
            .map_err(|e| ConfigError::ParseError {
                key: "HEALTH_CHECK_INTERVAL_MS".to_string(),
                details: format!("{e}"),
            })?;

        let group_defaults = GroupDefaults::default();
        let queue_defaults = QueueDefaults::default();
        let group_overrides = group_overrides_from_env(&group_defaults)?;
        let queue_overrides = queue_overrides_from_env(&queue_defaults)?;

        Ok(Self {
            instance_id,
            store,
            queue_defaults,
            group_defaults,
            dlq: DlqConfig::default(),
            heartbeat_interval_ms,
            metrics_interval_ms,
            health_check_interval_ms,
            group_overrides,
            queue_overrides,
        })
    }

    /// Resolve a group's effective defaults: per-group override if one was
    /// registered at `createQueue`/`addTaskToGroup` time, else process defaults.
    pub fn group_defaults_for(&self, group: &str) -> GroupDefaults {
        self.group_overrides
            .get(group)
            .cloned()
            .unwrap_or_else(|| self.group_defaults.clone())
    }

    /// Resolve a queue's effective defaults: per-queue override read from
    /// `QUEUE_<NAME>_*` env vars, else process defaults.
    pub fn queue_defaults_for(&self, queue: &str) -> QueueDefaults {
        self.queue_overrides
            .get(queue)
            .cloned()
            .unwrap_or_else(|| self.queue_defaults.clone())
    }
}

/// Turn a name from `GROUP_NAMES`/`QUEUE_NAMES` into its env-var prefix
/// segment: uppercased, with anything that isn't `[A-Z0-9_]` replaced by `_`
/// (env var names can't contain e.g. `-`, which group/queue names otherwise
/// allow freely).
fn env_key_segment(name: &str) -> String {
    name.to_ascii_uppercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn names_from_env(key: &str) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|raw| raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::ParseError {
                key: key.to_string(),
                details: format!("invalid value '{raw}'"),
            }),
        Err(_) => Ok(None),
    }
}

/// Build `GROUP_<NAME>_*` overrides (§6 "per-group config") for every name
/// listed in `GROUP_NAMES`. Any field left unset falls back to `defaults`.
fn group_overrides_from_env(defaults: &GroupDefaults) -> Result<HashMap<String, GroupDefaults>, ConfigError> {
    let mut overrides = HashMap::new();
    for name in names_from_env("GROUP_NAMES") {
        let prefix = format!("GROUP_{}", env_key_segment(&name));
        let mut group = defaults.clone();
        if let Ok(raw) = std::env::var(format!("{prefix}_STRATEGY")) {
            group.strategy = Strategy::parse(&raw)?;
        }
        if let Some(v) = env_parsed(&format!("{prefix}_CONCURRENCY"))? {
            group.concurrency = v;
        }
        if let Some(v) = env_parsed(&format!("{prefix}_MAX_CONCURRENCY"))? {
            group.max_concurrency = v;
        }
        if let Some(v) = env_parsed(&format!("{prefix}_PRIORITY"))? {
            group.priority = v;
        }
        if let Some(v) = env_parsed(&format!("{prefix}_RETRY_LIMIT"))? {
            group.retry_limit = v;
        }
        if let Some(v) = env_parsed(&format!("{prefix}_RETRY_DELAY_MS"))? {
            group.retry_delay_ms = v;
        }
        if let Some(v) = env_parsed(&format!("{prefix}_TIMEOUT_MS"))? {
            group.timeout_ms = v;
        }
        if let Some(v) = env_parsed(&format!("{prefix}_LOCK_TTL_MS"))? {
            group.lock_ttl_ms = v;
        }
        overrides.insert(name, group);
    }
    Ok(overrides)
}

/// Build `QUEUE_<NAME>_*` overrides for every name listed in `QUEUE_NAMES`.
/// Any field left unset falls back to `defaults`.
fn queue_overrides_from_env(defaults: &QueueDefaults) -> Result<HashMap<String, QueueDefaults>, ConfigError> {
    let mut overrides = HashMap::new();
    for name in names_from_env("QUEUE_NAMES") {
        let prefix = format!("QUEUE_{}", env_key_segment(&name));
        let mut queue = defaults.clone();
        if let Some(v) = env_parsed(&format!("{prefix}_CONCURRENCY"))? {
            queue.concurrency = v;
        }
        if let Some(v) = env_parsed(&format!("{prefix}_MAX_RETRIES"))? {
            queue.max_retries = v;
        }
        if let Some(v) = env_parsed(&format!("{prefix}_RETRY_DELAY_MS"))? {
            queue.retry_delay_ms = v;
        }
        if let Ok(raw) = std::env::var(format!("{prefix}_BACKOFF")) {
            queue.backoff = Backoff::parse(&raw)?;
        }
        if let Some(v) = env_parsed(&format!("{prefix}_TIMEOUT_MS"))? {
            queue.timeout_ms = v;
        }
        overrides.insert(name, queue);
    }
    Ok(overrides)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parse_case_insensitive() {
        assert_eq!(Strategy::parse("fifo").unwrap(), Strategy::Fifo);
        assert_eq!(Strategy::parse("ROUND_ROBIN").unwrap(), Strategy::RoundRobin);
        assert!(Strategy::parse("bogus").is_err());
    }

    #[test]
    fn test_store_config_requires_redis_host() {
        temp_env::with_var_unset("REDIS_HOST", || {
            assert!(StoreConfig::from_env().is_err());
        });
    }

    #[test]
    fn test_store_config_from_env() {
        temp_env::with_var("REDIS_HOST", Some("redis://localhost:6379"), || {
            let cfg = StoreConfig::from_env().unwrap();
            assert_eq!(cfg.uri, "redis://localhost:6379");
        });
    }

    #[test]
    fn test_runtime_config_defaults_instance_id() {
        temp_env::with_vars(
            [
                ("REDIS_HOST", Some("redis://localhost:6379")),
                ("INSTANCE_ID", None),
            ],
            || {
                let cfg = RuntimeConfig::from_env().unwrap();
                assert_eq!(cfg.instance_id, "default");
                assert_eq!(cfg.queue_defaults.concurrency, 1);
            },
        );
    }

    #[test]
    fn test_group_defaults_for_falls_back() {
        temp_env::with_var("REDIS_HOST", Some("redis://localhost:6379"), || {
            let cfg = RuntimeConfig::from_env().unwrap();
            let defaults = cfg.group_defaults_for("unregistered-group");
            assert_eq!(defaults.strategy, Strategy::Fifo);
        });
    }
}
