//! Silences and inhibition: the suppression filter applied at flush time.
//!
//! Suppression only affects what gets notified. The alert state machine
//! keeps tracking suppressed alerts, and they stay members of their group.

use crate::error::{NotifyError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use oxwatch_common::matcher::{matches_all, Matcher};
use oxwatch_common::types::{Alert, Fingerprint, LabelSet};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Silence {
    pub id: String,
    pub matchers: Vec<Matcher>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub comment: String,
}

impl Silence {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.starts_at <= now && now < self.ends_at
    }

    /// Matchers are AND-combined. A silence without matchers matches nothing.
    pub fn matches(&self, labels: &LabelSet) -> bool {
        !self.matchers.is_empty() && matches_all(&self.matchers, labels)
    }
}

/// Supplier of the silences in effect at a given instant.
#[async_trait]
pub trait SilenceSource: Send + Sync {
    async fn list_active(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Silence>>;
}

/// In-memory silence registry backing the silence API.
#[derive(Default)]
pub struct SilenceStore {
    silences: DashMap<String, Silence>,
}

impl SilenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &self,
        matchers: Vec<Matcher>,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        created_by: impl Into<String>,
        comment: impl Into<String>,
    ) -> Result<Silence> {
        if matchers.is_empty() {
            return Err(NotifyError::InvalidSilence(
                "at least one matcher is required".to_string(),
            ));
        }
        if ends_at <= starts_at {
            return Err(NotifyError::InvalidSilence(
                "ends_at must be after starts_at".to_string(),
            ));
        }

        let silence = Silence {
            id: oxwatch_common::id::next_prefixed("silence"),
            matchers,
            starts_at,
            ends_at,
            created_by: created_by.into(),
            comment: comment.into(),
        };
        tracing::info!(
            silence_id = %silence.id,
            matchers = %silence.matchers.iter().map(ToString::to_string).collect::<Vec<_>>().join(","),
            ends_at = %silence.ends_at,
            "Silence created"
        );
        self.silences.insert(silence.id.clone(), silence.clone());
        Ok(silence)
    }

    /// Ends a silence at `now`. Returns false if it does not exist or has
    /// already ended.
    pub fn expire(&self, id: &str, now: DateTime<Utc>) -> bool {
        match self.silences.get_mut(id) {
            Some(mut silence) if silence.ends_at > now => {
                silence.ends_at = now.max(silence.starts_at);
                tracing::info!(silence_id = %id, "Silence expired");
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<Silence> {
        self.silences.get(id).map(|s| s.clone())
    }

    pub fn list(&self) -> Vec<Silence> {
        let mut all: Vec<Silence> = self.silences.iter().map(|s| s.value().clone()).collect();
        all.sort_by(|a, b| a.starts_at.cmp(&b.starts_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub fn active(&self, now: DateTime<Utc>) -> Vec<Silence> {
        self.silences
            .iter()
            .filter(|s| s.is_active(now))
            .map(|s| s.value().clone())
            .collect()
    }

    /// Drops silences that ended more than `retention` ago.
    pub fn gc(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let before = self.silences.len();
        self.silences.retain(|_, s| now - s.ends_at < retention);
        before - self.silences.len()
    }
}

#[async_trait]
impl SilenceSource for SilenceStore {
    async fn list_active(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Silence>> {
        Ok(self.active(now))
    }
}

/// While a firing alert matches `source_matchers`, alerts matching
/// `target_matchers` with the same values for every `equal` label are
/// suppressed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InhibitRule {
    pub source_matchers: Vec<Matcher>,
    pub target_matchers: Vec<Matcher>,
    #[serde(default)]
    pub equal: Vec<String>,
}

impl InhibitRule {
    fn equal_labels_match(&self, source: &LabelSet, target: &LabelSet) -> bool {
        self.equal.iter().all(|name| source.get(name) == target.get(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "by", rename_all = "lowercase")]
pub enum Suppression {
    /// Ids of the matching silences.
    Silenced(Vec<String>),
    /// Fingerprints of the firing alerts that inhibit this one.
    Inhibited(Vec<Fingerprint>),
}

/// Suppression check over one consistent view of silences, inhibition
/// rules and firing alerts.
pub struct Suppressor<'a> {
    silences: &'a [Silence],
    inhibit_rules: &'a [InhibitRule],
    firing: &'a [Alert],
    now: DateTime<Utc>,
}

impl<'a> Suppressor<'a> {
    pub fn new(
        silences: &'a [Silence],
        inhibit_rules: &'a [InhibitRule],
        firing: &'a [Alert],
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            silences,
            inhibit_rules,
            firing,
            now,
        }
    }

    /// Silences take precedence in the report; an alert both silenced and
    /// inhibited is reported as silenced.
    pub fn check(&self, alert: &Alert) -> Option<Suppression> {
        let silenced: Vec<String> = self
            .silences
            .iter()
            .filter(|s| s.is_active(self.now) && s.matches(&alert.labels))
            .map(|s| s.id.clone())
            .collect();
        if !silenced.is_empty() {
            return Some(Suppression::Silenced(silenced));
        }

        // Union over every inhibition rule whose target side matches.
        let mut inhibitors: Vec<Fingerprint> = self
            .inhibit_rules
            .iter()
            .filter(|rule| matches_all(&rule.target_matchers, &alert.labels))
            .flat_map(|rule| {
                self.firing.iter().filter(move |source| {
                    source.fingerprint != alert.fingerprint
                        && source.is_firing()
                        && matches_all(&rule.source_matchers, &source.labels)
                        && rule.equal_labels_match(&source.labels, &alert.labels)
                })
            })
            .map(|source| source.fingerprint)
            .collect();
        if inhibitors.is_empty() {
            return None;
        }
        inhibitors.sort();
        inhibitors.dedup();
        Some(Suppression::Inhibited(inhibitors))
    }

    pub fn is_suppressed(&self, alert: &Alert) -> bool {
        self.check(alert).is_some()
    }
}
