use crate::snapshot::ConfigError;
use oxwatch_alert::rule::Rule;
use oxwatch_common::types::MAX_DURATION_SECS;
use oxwatch_notify::dispatch::DispatchConfig;
use oxwatch_notify::plugin::ReceiverConfig;
use oxwatch_notify::routing::RouteConfig;
use oxwatch_notify::silence::InhibitRule;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/oxwatch.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub route: RouteConfig,
    #[serde(default)]
    pub inhibit_rules: Vec<InhibitRule>,
    #[serde(default)]
    pub receivers: Vec<ReceiverConfig>,
}

/// Where rule expressions are evaluated: a Prometheus-compatible query API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_url")]
    pub url: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: default_source_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on a single rule evaluation.
    #[serde(default = "default_evaluation_timeout_secs")]
    pub evaluation_timeout_secs: u64,
    /// Consecutive failed cycles before a rule reports as degraded.
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u64,
    /// How long resolved alerts stay visible before they are purged.
    #[serde(default = "default_resolve_retention_secs")]
    pub resolve_retention_secs: u64,
    #[serde(default = "default_transition_queue_capacity")]
    pub transition_queue_capacity: usize,
    /// Resolution of the group flush timer.
    #[serde(default = "default_flush_tick_millis")]
    pub flush_tick_millis: u64,
    /// How long expired silences are kept for inspection.
    #[serde(default = "default_silence_retention_secs")]
    pub silence_retention_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            evaluation_timeout_secs: default_evaluation_timeout_secs(),
            degraded_after: default_degraded_after(),
            resolve_retention_secs: default_resolve_retention_secs(),
            transition_queue_capacity: default_transition_queue_capacity(),
            flush_tick_millis: default_flush_tick_millis(),
            silence_retention_secs: default_silence_retention_secs(),
        }
    }
}

impl EngineConfig {
    pub fn evaluation_timeout(&self) -> Duration {
        Duration::from_secs(self.evaluation_timeout_secs)
    }

    pub fn resolve_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.resolve_retention_secs.min(MAX_DURATION_SECS) as i64)
    }

    pub fn flush_tick(&self) -> Duration {
        Duration::from_millis(self.flush_tick_millis.max(10))
    }

    pub fn silence_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.silence_retention_secs.min(MAX_DURATION_SECS) as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_millis")]
    pub initial_backoff_millis: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_millis: default_initial_backoff_millis(),
            max_backoff_secs: default_max_backoff_secs(),
            send_timeout_secs: default_send_timeout_secs(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl DispatchSettings {
    pub fn to_dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            max_attempts: self.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.initial_backoff_millis),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
            send_timeout: Duration::from_secs(self.send_timeout_secs),
            queue_capacity: self.queue_capacity.max(1),
        }
    }
}

fn default_http_port() -> u16 {
    9093
}

fn default_source_url() -> String {
    "http://127.0.0.1:9090".to_string()
}

fn default_evaluation_timeout_secs() -> u64 {
    10
}

fn default_degraded_after() -> u64 {
    oxwatch_alert::evaluator::DEFAULT_DEGRADED_AFTER
}

fn default_resolve_retention_secs() -> u64 {
    oxwatch_alert::state::DEFAULT_RESOLVE_RETENTION_SECS as u64
}

fn default_transition_queue_capacity() -> usize {
    1024
}

fn default_flush_tick_millis() -> u64 {
    1000
}

fn default_silence_retention_secs() -> u64 {
    86400
}

fn default_max_attempts() -> u32 {
    oxwatch_notify::dispatch::DEFAULT_MAX_ATTEMPTS
}

fn default_initial_backoff_millis() -> u64 {
    500
}

fn default_max_backoff_secs() -> u64 {
    60
}

fn default_send_timeout_secs() -> u64 {
    10
}

fn default_queue_capacity() -> usize {
    oxwatch_notify::dispatch::DEFAULT_QUEUE_CAPACITY
}

impl ServerConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_string(),
                source,
            },
            other => other,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })
    }
}
