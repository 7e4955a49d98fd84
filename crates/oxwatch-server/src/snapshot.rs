//! Validated, immutable configuration snapshots.
//!
//! A snapshot is built completely before it becomes visible. Any error
//! rejects the whole snapshot and the engine keeps running the previous one.

use crate::config::ServerConfig;
use chrono::{DateTime, Utc};
use oxwatch_alert::error::RuleError;
use oxwatch_alert::rule::RuleSet;
use oxwatch_notify::error::NotifyError;
use oxwatch_notify::plugin::{ChannelMap, ChannelRegistry, ReceiverConfig};
use oxwatch_notify::routing::Router;
use oxwatch_notify::silence::InhibitRule;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config: failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Config: failed to parse '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Config: {0}")]
    Rule(#[from] RuleError),

    #[error("Config: {0}")]
    Notify(#[from] NotifyError),

    #[error("Config: route {route_id} references unknown receiver '{receiver}'")]
    UnknownReceiver { route_id: String, receiver: String },

    #[error("Config: inhibit rule #{index} has no {side} matchers")]
    InvalidInhibitRule { index: usize, side: &'static str },

    #[error("Config: no config file to reload from")]
    ReloadUnavailable,
}

pub struct ConfigSnapshot {
    pub version: u64,
    pub loaded_at: DateTime<Utc>,
    pub rules: RuleSet,
    pub router: Router,
    pub inhibit_rules: Vec<InhibitRule>,
    pub receivers: Vec<ReceiverConfig>,
    pub channels: ChannelMap,
}

impl ConfigSnapshot {
    pub fn build(config: &ServerConfig, registry: &ChannelRegistry, version: u64) -> Result<Self, ConfigError> {
        let rules = RuleSet::new(config.rules.clone())?;
        let router = Router::new(&config.route)?;
        let channels = registry.build(&config.receivers)?;

        for (route_id, receiver) in referenced(&router) {
            if !channels.contains_key(&receiver) {
                return Err(ConfigError::UnknownReceiver { route_id, receiver });
            }
        }

        for (index, rule) in config.inhibit_rules.iter().enumerate() {
            if rule.source_matchers.is_empty() {
                return Err(ConfigError::InvalidInhibitRule { index, side: "source" });
            }
            if rule.target_matchers.is_empty() {
                return Err(ConfigError::InvalidInhibitRule { index, side: "target" });
            }
        }

        Ok(Self {
            version,
            loaded_at: Utc::now(),
            rules,
            router,
            inhibit_rules: config.inhibit_rules.clone(),
            receivers: config.receivers.clone(),
            channels,
        })
    }
}

/// (route id, receiver) for every receiver reference in the tree.
fn referenced(router: &Router) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut stack = vec![router.root()];
    while let Some(route) = stack.pop() {
        out.extend(route.receivers.iter().map(|r| (route.id.clone(), r.clone())));
        stack.extend(route.children.iter());
    }
    out.sort();
    out
}
