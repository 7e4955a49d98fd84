use crate::error::RuleError;
use oxwatch_common::types::{Annotations, LabelSet, Severity, ALERTNAME_LABEL, MAX_DURATION_SECS, SEVERITY_LABEL};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

pub const DEFAULT_INTERVAL_SECS: u64 = 15;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    /// Becomes the `alertname` label of every alert this rule produces.
    pub name: String,
    /// Opaque expression reference handed to the metrics source.
    pub expr: String,
    /// How long the condition must hold before the alert fires.
    #[serde(default)]
    pub for_secs: u64,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub labels: LabelSet,
    #[serde(default)]
    pub annotations: Annotations,
}

fn default_interval_secs() -> u64 {
    DEFAULT_INTERVAL_SECS
}

impl Rule {
    pub fn for_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.for_secs as i64)
    }

    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs)
    }

    /// Identity labels for an alert produced from `sample`: the sample's own
    /// labels, overridden by the rule's static labels, plus `alertname` and
    /// `severity`.
    pub fn alert_labels(&self, sample: &LabelSet) -> LabelSet {
        let mut labels = sample.clone();
        labels.extend(self.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        labels.insert(ALERTNAME_LABEL.to_string(), self.name.clone());
        labels
            .entry(SEVERITY_LABEL.to_string())
            .or_insert_with(|| self.severity.to_string());
        labels
    }

    /// Expands `{{ $value }}` and `{{ $labels.<name> }}` in annotation values.
    pub fn render_annotations(&self, labels: &LabelSet, value: f64) -> Annotations {
        self.annotations
            .iter()
            .map(|(key, template)| {
                let mut text = template.replace("{{ $value }}", &format!("{value}"));
                for (name, label_value) in labels {
                    text = text.replace(&format!("{{{{ $labels.{name} }}}}"), label_value);
                }
                (key.clone(), text)
            })
            .collect()
    }

    fn validate(&self) -> Result<(), RuleError> {
        let invalid = |reason: &str| RuleError::Invalid {
            rule_id: self.id.clone(),
            reason: reason.to_string(),
        };
        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.expr.trim().is_empty() {
            return Err(invalid("expr must not be empty"));
        }
        if self.interval_secs == 0 {
            return Err(invalid("interval_secs must be greater than zero"));
        }
        if self.interval_secs > MAX_DURATION_SECS || self.for_secs > MAX_DURATION_SECS {
            return Err(invalid("interval_secs and for_secs must not exceed ten years"));
        }
        Ok(())
    }
}

/// An immutable, validated set of rules. Replaced wholesale on reload.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Arc<Rule>>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Result<Self, RuleError> {
        let mut ids = HashSet::new();
        for rule in &rules {
            rule.validate()?;
            if !ids.insert(rule.id.as_str()) {
                return Err(RuleError::DuplicateId(rule.id.clone()));
            }
        }
        Ok(Self {
            rules: rules.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Rule>> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Distinct evaluation intervals, one evaluation loop each.
    pub fn intervals(&self) -> BTreeSet<u64> {
        self.rules.iter().map(|r| r.interval_secs).collect()
    }

    pub fn with_interval(&self, interval_secs: u64) -> impl Iterator<Item = &Arc<Rule>> {
        self.rules
            .iter()
            .filter(move |r| r.interval_secs == interval_secs)
    }

    pub fn ids(&self) -> HashSet<String> {
        self.rules.iter().map(|r| r.id.clone()).collect()
    }
}
