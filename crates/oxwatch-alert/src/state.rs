use crate::error::InvariantViolation;
use crate::evaluator::{EvaluationOutcome, RuleEvaluation};
use crate::rule::Rule;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::counter;
use oxwatch_common::types::{format_labels, Alert, AlertState, Fingerprint};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

pub const DEFAULT_RESOLVE_RETENTION_SECS: i64 = 15 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    /// New record, `for` timer running.
    Pending,
    Firing,
    Resolved,
    /// Pending record dropped after a false evaluation. Never notified.
    Discarded,
    /// Resolved record dropped after the retention window.
    Purged,
}

/// A lifecycle change for one fingerprint, with the alert as it was right
/// after the change.
#[derive(Debug, Clone)]
pub struct Transition {
    pub kind: TransitionKind,
    pub alert: Alert,
    pub at: DateTime<Utc>,
}

impl Transition {
    fn new(kind: TransitionKind, alert: &Alert, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            alert: alert.clone(),
            at,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.alert.fingerprint
    }
}

/// Exclusive owner of alert records.
///
/// Records live in a sharded map so evaluation loops for different rules
/// only contend on the shards they touch. Calls to [`apply`] for the same
/// rule must not overlap; the evaluation loop for a rule's interval is the
/// only caller.
///
/// [`apply`]: AlertStateMachine::apply
pub struct AlertStateMachine {
    alerts: DashMap<Fingerprint, Alert>,
    by_rule: DashMap<String, HashSet<Fingerprint>>,
    resolve_retention: chrono::Duration,
    violations: AtomicU64,
}

impl Default for AlertStateMachine {
    fn default() -> Self {
        Self::new(chrono::Duration::seconds(DEFAULT_RESOLVE_RETENTION_SECS))
    }
}

impl AlertStateMachine {
    pub fn new(resolve_retention: chrono::Duration) -> Self {
        Self {
            alerts: DashMap::new(),
            by_rule: DashMap::new(),
            resolve_retention,
            violations: AtomicU64::new(0),
        }
    }

    /// Folds one evaluation of `rule` into the alert table and returns the
    /// resulting transitions in the order they happened.
    pub fn apply(&self, rule: &Rule, evaluation: &RuleEvaluation) -> Vec<Transition> {
        let now = evaluation.at;
        let tracked = self.tracked_for(&rule.id);

        let samples = match &evaluation.outcome {
            EvaluationOutcome::Samples(samples) => samples,
            EvaluationOutcome::Failed(_) => {
                // Hold every record as-is; the `for` timer keeps its start.
                for fp in &tracked {
                    if let Some(mut alert) = self.alerts.get_mut(fp) {
                        alert.failed_evaluations += 1;
                    }
                }
                return Vec::new();
            }
        };

        let mut transitions = Vec::new();
        let mut seen = HashSet::new();
        let mut created = Vec::new();

        for (sample_labels, value) in samples {
            let labels = rule.alert_labels(sample_labels);
            let fp = Fingerprint::from_labels(&labels);
            if !seen.insert(fp) {
                // Static labels collapsed two samples into one identity.
                continue;
            }

            match self.alerts.entry(fp) {
                Entry::Occupied(mut entry) => {
                    let alert = entry.get_mut();
                    if alert.rule_id != rule.id {
                        self.report_violation(InvariantViolation {
                            fingerprint: fp,
                            rule_id: rule.id.clone(),
                            owner: alert.rule_id.clone(),
                            labels: format_labels(&labels),
                        });
                        continue;
                    }

                    alert.last_evaluated_at = now;
                    alert.value = *value;
                    alert.annotations = rule.render_annotations(&alert.labels, *value);

                    match alert.state {
                        AlertState::Pending => {
                            if now - alert.starts_at >= rule.for_duration() {
                                fire(alert, now);
                                transitions.push(Transition::new(TransitionKind::Firing, alert, now));
                            }
                        }
                        AlertState::Firing => {}
                        AlertState::Resolved => {
                            alert.state = AlertState::Pending;
                            alert.starts_at = now;
                            alert.ends_at = None;
                            alert.fired_at = None;
                            alert.failed_evaluations = 0;
                            let kind = if rule.for_secs == 0 {
                                fire(alert, now);
                                TransitionKind::Firing
                            } else {
                                TransitionKind::Pending
                            };
                            transitions.push(Transition::new(kind, alert, now));
                        }
                    }
                }
                Entry::Vacant(entry) => {
                    let mut alert = Alert {
                        fingerprint: fp,
                        rule_id: rule.id.clone(),
                        annotations: rule.render_annotations(&labels, *value),
                        labels,
                        severity: rule.severity,
                        state: AlertState::Pending,
                        starts_at: now,
                        ends_at: None,
                        fired_at: None,
                        last_evaluated_at: now,
                        value: *value,
                        failed_evaluations: 0,
                    };
                    let kind = if rule.for_secs == 0 {
                        fire(&mut alert, now);
                        TransitionKind::Firing
                    } else {
                        TransitionKind::Pending
                    };
                    transitions.push(Transition::new(kind, &alert, now));
                    entry.insert(alert);
                    created.push(fp);
                }
            }
        }

        // Tracked but absent from this cycle's samples: the condition is false.
        let mut discarded = Vec::new();
        for fp in tracked.iter().filter(|fp| !seen.contains(fp)) {
            if let Some(mut alert) = self.alerts.get_mut(fp) {
                match alert.state {
                    AlertState::Pending => discarded.push(*fp),
                    AlertState::Firing => {
                        alert.state = AlertState::Resolved;
                        alert.ends_at = Some(now);
                        alert.last_evaluated_at = now;
                        transitions.push(Transition::new(TransitionKind::Resolved, &alert, now));
                    }
                    AlertState::Resolved => {}
                }
            }
        }
        for fp in discarded {
            if let Some((_, mut alert)) = self.alerts.remove(&fp) {
                alert.last_evaluated_at = now;
                transitions.push(Transition::new(TransitionKind::Discarded, &alert, now));
            }
        }

        self.reindex(&rule.id, &created);
        self.log_transitions(&transitions);
        transitions
    }

    /// Purges resolved records older than the retention window.
    pub fn purge(&self, now: DateTime<Utc>) -> Vec<Transition> {
        let expired: Vec<Fingerprint> = self
            .alerts
            .iter()
            .filter(|a| a.is_resolved() && a.ends_at.is_some_and(|end| now - end >= self.resolve_retention))
            .map(|a| a.fingerprint)
            .collect();

        let mut transitions = Vec::new();
        for fp in expired {
            if let Some((_, alert)) = self.alerts.remove(&fp) {
                if let Some(mut set) = self.by_rule.get_mut(&alert.rule_id) {
                    set.remove(&fp);
                }
                transitions.push(Transition::new(TransitionKind::Purged, &alert, now));
            }
        }
        self.by_rule.retain(|_, set| !set.is_empty());
        self.log_transitions(&transitions);
        transitions
    }

    /// Closes out records whose rule is no longer in the active rule set:
    /// pending records are discarded and firing ones resolve.
    pub fn retire_rules(&self, active: &HashSet<String>, now: DateTime<Utc>) -> Vec<Transition> {
        let retired: Vec<String> = self
            .by_rule
            .iter()
            .filter(|e| !active.contains(e.key()))
            .map(|e| e.key().clone())
            .collect();

        let mut transitions = Vec::new();
        for rule_id in retired {
            let fps = self.tracked_for(&rule_id);
            for fp in fps {
                let state = self.alerts.get(&fp).map(|a| a.state);
                match state {
                    Some(AlertState::Pending) => {
                        if let Some((_, alert)) = self.alerts.remove(&fp) {
                            if let Some(mut set) = self.by_rule.get_mut(&rule_id) {
                                set.remove(&fp);
                            }
                            transitions.push(Transition::new(TransitionKind::Discarded, &alert, now));
                        }
                    }
                    Some(AlertState::Firing) => {
                        if let Some(mut alert) = self.alerts.get_mut(&fp) {
                            alert.state = AlertState::Resolved;
                            alert.ends_at = Some(now);
                            transitions.push(Transition::new(TransitionKind::Resolved, &alert, now));
                        }
                    }
                    _ => {}
                }
            }
            tracing::info!(rule_id = %rule_id, "Rule retired, closing its alerts");
        }
        self.log_transitions(&transitions);
        transitions
    }

    pub fn get(&self, fp: &Fingerprint) -> Option<Alert> {
        self.alerts.get(fp).map(|a| a.clone())
    }

    pub fn snapshot(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.alerts.iter().map(|a| a.value().clone()).collect();
        alerts.sort_by(|a, b| a.rule_id.cmp(&b.rule_id).then(a.fingerprint.cmp(&b.fingerprint)));
        alerts
    }

    /// Alerts currently firing, used as inhibition sources.
    pub fn firing(&self) -> Vec<Alert> {
        self.alerts
            .iter()
            .filter(|a| a.is_firing())
            .map(|a| a.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    pub fn violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }

    fn tracked_for(&self, rule_id: &str) -> Vec<Fingerprint> {
        self.by_rule
            .get(rule_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    fn reindex(&self, rule_id: &str, created: &[Fingerprint]) {
        let mut set = self.by_rule.entry(rule_id.to_string()).or_default();
        set.extend(created.iter().copied());
        set.retain(|fp| self.alerts.contains_key(fp));
    }

    fn report_violation(&self, violation: InvariantViolation) {
        self.violations.fetch_add(1, Ordering::Relaxed);
        counter!("oxwatch_invariant_violations_total").increment(1);
        tracing::error!(
            fingerprint = %violation.fingerprint,
            rule_id = %violation.rule_id,
            owner = %violation.owner,
            labels = %violation.labels,
            error = %violation,
            "Duplicate fingerprint, sample skipped"
        );
    }

    fn log_transitions(&self, transitions: &[Transition]) {
        for t in transitions {
            counter!("oxwatch_alert_transitions_total", "kind" => kind_label(t.kind)).increment(1);
            tracing::info!(
                rule_id = %t.alert.rule_id,
                fingerprint = %t.alert.fingerprint,
                alertname = t.alert.name(),
                value = t.alert.value,
                transition = ?t.kind,
                "Alert transition"
            );
        }
    }
}

fn fire(alert: &mut Alert, now: DateTime<Utc>) {
    alert.state = AlertState::Firing;
    alert.fired_at = Some(now);
}

fn kind_label(kind: TransitionKind) -> &'static str {
    match kind {
        TransitionKind::Pending => "pending",
        TransitionKind::Firing => "firing",
        TransitionKind::Resolved => "resolved",
        TransitionKind::Discarded => "discarded",
        TransitionKind::Purged => "purged",
    }
}
