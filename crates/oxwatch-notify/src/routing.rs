//! Routing tree that maps alert labels to receivers and timing policy.
//!
//! Routes are walked depth-first. A route matches when all its matchers
//! accept the label set; the root has no matchers and always matches. Among
//! siblings the first matching route wins unless it sets `continue`, in
//! which case the following siblings are tried as well. A matching route
//! whose children all miss is itself the result.

use crate::error::{NotifyError, Result};
use chrono::Duration;
use oxwatch_common::matcher::{matches_all, Matcher};
use oxwatch_common::types::{LabelSet, MAX_DURATION_SECS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const DEFAULT_GROUP_WAIT_SECS: u64 = 30;
pub const DEFAULT_GROUP_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_REPEAT_INTERVAL_SECS: u64 = 4 * 3600;

/// Route definition as written in configuration. Unset fields inherit from
/// the parent route.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteConfig {
    #[serde(default)]
    pub matchers: Vec<Matcher>,
    #[serde(default)]
    pub receivers: Vec<String>,
    #[serde(default)]
    pub group_by: Option<Vec<String>>,
    #[serde(default)]
    pub group_wait_secs: Option<u64>,
    #[serde(default)]
    pub group_interval_secs: Option<u64>,
    #[serde(default)]
    pub repeat_interval_secs: Option<u64>,
    #[serde(default)]
    pub send_resolved: Option<bool>,
    #[serde(default, rename = "continue")]
    pub continue_matching: bool,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// Which labels form a group's key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupBy {
    /// Every label, so each alert is its own group.
    All,
    Labels(Vec<String>),
}

impl GroupBy {
    fn from_config(labels: Option<&Vec<String>>) -> Self {
        match labels {
            None => GroupBy::All,
            Some(names) if names.iter().any(|n| n == "...") => GroupBy::All,
            Some(names) => {
                let mut names = names.clone();
                names.sort();
                names.dedup();
                GroupBy::Labels(names)
            }
        }
    }

    /// Projects `labels` onto the grouping labels. Missing labels are left
    /// out rather than keyed as empty.
    pub fn key(&self, labels: &LabelSet) -> LabelSet {
        match self {
            GroupBy::All => labels.clone(),
            GroupBy::Labels(names) => names
                .iter()
                .filter_map(|n| labels.get(n).map(|v| (n.clone(), v.clone())))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutePolicy {
    pub group_by: GroupBy,
    pub group_wait_secs: u64,
    pub group_interval_secs: u64,
    pub repeat_interval_secs: u64,
    pub send_resolved: bool,
}

impl RoutePolicy {
    pub fn group_wait(&self) -> Duration {
        Duration::seconds(self.group_wait_secs as i64)
    }

    pub fn group_interval(&self) -> Duration {
        Duration::seconds(self.group_interval_secs as i64)
    }

    pub fn repeat_interval(&self) -> Duration {
        Duration::seconds(self.repeat_interval_secs as i64)
    }
}

#[derive(Debug, Clone)]
pub struct Route {
    /// Position in the tree, e.g. `"0"` for the root and `"0.2.1"` for the
    /// second child of the root's third child.
    pub id: String,
    pub matchers: Vec<Matcher>,
    pub receivers: Vec<String>,
    pub policy: RoutePolicy,
    pub continue_matching: bool,
    pub children: Vec<Route>,
}

impl Route {
    fn compile(
        config: &RouteConfig,
        id: String,
        parent: Option<(&[String], &RoutePolicy, Option<&Vec<String>>)>,
    ) -> Result<Self> {
        let (parent_receivers, parent_policy, parent_group_by) = match parent {
            Some(p) => (Some(p.0), Some(p.1), p.2),
            None => (None, None, None),
        };

        let receivers = if config.receivers.is_empty() {
            parent_receivers.map(<[String]>::to_vec).unwrap_or_default()
        } else {
            config.receivers.clone()
        };
        if receivers.is_empty() {
            return Err(NotifyError::InvalidRoute {
                route_id: id,
                reason: "no receivers configured or inherited".to_string(),
            });
        }

        let group_by_config = config.group_by.as_ref().or(parent_group_by);
        let inherit = |own: Option<u64>, parent: Option<u64>, default: u64| own.or(parent).unwrap_or(default);
        let policy = RoutePolicy {
            group_by: GroupBy::from_config(group_by_config),
            group_wait_secs: inherit(
                config.group_wait_secs,
                parent_policy.map(|p| p.group_wait_secs),
                DEFAULT_GROUP_WAIT_SECS,
            ),
            group_interval_secs: inherit(
                config.group_interval_secs,
                parent_policy.map(|p| p.group_interval_secs),
                DEFAULT_GROUP_INTERVAL_SECS,
            ),
            repeat_interval_secs: inherit(
                config.repeat_interval_secs,
                parent_policy.map(|p| p.repeat_interval_secs),
                DEFAULT_REPEAT_INTERVAL_SECS,
            ),
            send_resolved: config
                .send_resolved
                .or(parent_policy.map(|p| p.send_resolved))
                .unwrap_or(true),
        };
        if policy.group_interval_secs == 0 || policy.repeat_interval_secs == 0 {
            return Err(NotifyError::InvalidRoute {
                route_id: id,
                reason: "group_interval_secs and repeat_interval_secs must be greater than zero"
                    .to_string(),
            });
        }
        let longest = policy
            .group_wait_secs
            .max(policy.group_interval_secs)
            .max(policy.repeat_interval_secs);
        if longest > MAX_DURATION_SECS {
            return Err(NotifyError::InvalidRoute {
                route_id: id,
                reason: "route timings must not exceed ten years".to_string(),
            });
        }

        let children = config
            .routes
            .iter()
            .enumerate()
            .map(|(i, child)| {
                Route::compile(
                    child,
                    format!("{id}.{i}"),
                    Some((receivers.as_slice(), &policy, group_by_config)),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Route {
            id,
            matchers: config.matchers.clone(),
            receivers,
            policy,
            continue_matching: config.continue_matching,
            children,
        })
    }

    fn walk<'a>(&'a self, labels: &LabelSet, out: &mut Vec<&'a Route>) -> bool {
        if !matches_all(&self.matchers, labels) {
            return false;
        }
        let mut child_matched = false;
        for child in &self.children {
            if child.walk(labels, out) {
                child_matched = true;
                if !child.continue_matching {
                    break;
                }
            }
        }
        if !child_matched {
            out.push(self);
        }
        true
    }

    fn find(&self, id: &str) -> Option<&Route> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(id))
    }
}

#[derive(Debug, Clone)]
pub struct Router {
    root: Route,
}

impl Router {
    pub fn new(config: &RouteConfig) -> Result<Self> {
        if !config.matchers.is_empty() {
            return Err(NotifyError::InvalidRoute {
                route_id: "0".to_string(),
                reason: "the root route must not have matchers".to_string(),
            });
        }
        Ok(Self {
            root: Route::compile(config, "0".to_string(), None)?,
        })
    }

    pub fn root(&self) -> &Route {
        &self.root
    }

    /// Routes that handle `labels`, in tree order. Never empty: the root is
    /// the fallback.
    pub fn match_routes(&self, labels: &LabelSet) -> Vec<&Route> {
        let mut out = Vec::new();
        self.root.walk(labels, &mut out);
        out
    }

    /// Union of the receivers of every matching route.
    pub fn receivers_for(&self, labels: &LabelSet) -> BTreeSet<String> {
        self.match_routes(labels)
            .into_iter()
            .flat_map(|r| r.receivers.iter().cloned())
            .collect()
    }

    pub fn route(&self, id: &str) -> Option<&Route> {
        self.root.find(id)
    }
}
