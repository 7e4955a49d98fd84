use crate::error::EvaluationError;
use crate::evaluator::{EvaluationOutcome, RuleEvaluation, RuleEvaluator};
use crate::rule::{Rule, RuleSet};
use crate::state::{AlertStateMachine, TransitionKind};
use crate::{MetricsSource, SampleSet};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use oxwatch_common::types::{AlertState, Fingerprint, LabelSet, Severity};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

fn labels(pairs: &[(&str, &str)]) -> LabelSet {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn rule(id: &str, for_secs: u64) -> Rule {
    Rule {
        id: id.into(),
        name: "HighErrorRate".into(),
        expr: "rate(http_errors[5m]) > 0.05".into(),
        for_secs,
        interval_secs: 30,
        severity: Severity::Critical,
        labels: labels(&[("team", "payments")]),
        annotations: [("summary".to_string(), "{{ $labels.service }} at {{ $value }}".to_string())]
            .into_iter()
            .collect(),
    }
}

fn eval_true(rule: &Rule, at: DateTime<Utc>, value: f64) -> RuleEvaluation {
    let mut samples = SampleSet::new();
    samples.insert(labels(&[("service", "checkout")]), value);
    RuleEvaluation {
        rule_id: rule.id.clone(),
        at,
        elapsed: std::time::Duration::ZERO,
        outcome: EvaluationOutcome::Samples(samples),
    }
}

fn eval_false(rule: &Rule, at: DateTime<Utc>) -> RuleEvaluation {
    RuleEvaluation {
        rule_id: rule.id.clone(),
        at,
        elapsed: std::time::Duration::ZERO,
        outcome: EvaluationOutcome::Samples(SampleSet::new()),
    }
}

fn eval_failed(rule: &Rule, at: DateTime<Utc>) -> RuleEvaluation {
    RuleEvaluation {
        rule_id: rule.id.clone(),
        at,
        elapsed: std::time::Duration::ZERO,
        outcome: EvaluationOutcome::Failed(EvaluationError::Source {
            rule_id: rule.id.clone(),
            message: "connection refused".into(),
        }),
    }
}

fn kinds(transitions: &[crate::state::Transition]) -> Vec<TransitionKind> {
    transitions.iter().map(|t| t.kind).collect()
}

// ── Rules ──

#[test]
fn rule_set_rejects_duplicate_ids() {
    let err = RuleSet::new(vec![rule("a", 0), rule("a", 60)]).unwrap_err();
    assert!(err.to_string().contains("duplicate rule id 'a'"), "{err}");
}

#[test]
fn rule_set_rejects_zero_interval() {
    let mut bad = rule("a", 0);
    bad.interval_secs = 0;
    assert!(RuleSet::new(vec![bad]).is_err());
}

#[test]
fn rule_set_groups_intervals() {
    let mut slow = rule("slow", 0);
    slow.interval_secs = 60;
    let set = RuleSet::new(vec![rule("a", 0), rule("b", 0), slow]).unwrap();
    assert_eq!(set.intervals().into_iter().collect::<Vec<_>>(), vec![30, 60]);
    assert_eq!(set.with_interval(30).count(), 2);
}

#[test]
fn alert_labels_carry_identity_and_static_labels() {
    let r = rule("a", 0);
    let out = r.alert_labels(&labels(&[("service", "checkout"), ("team", "ops")]));
    assert_eq!(out["alertname"], "HighErrorRate");
    assert_eq!(out["severity"], "critical");
    // static labels win over sample labels
    assert_eq!(out["team"], "payments");
    assert_eq!(out["service"], "checkout");
}

#[test]
fn annotations_expand_value_and_labels() {
    let r = rule("a", 0);
    let rendered = r.render_annotations(&labels(&[("service", "checkout")]), 0.25);
    assert_eq!(rendered["summary"], "checkout at 0.25");
}

// ── State machine ──

#[test]
fn zero_for_fires_in_one_cycle() {
    let r = rule("errors", 0);
    let sm = AlertStateMachine::default();

    let transitions = sm.apply(&r, &eval_true(&r, t0(), 0.3));
    assert_eq!(kinds(&transitions), vec![TransitionKind::Firing]);

    let alert = &transitions[0].alert;
    assert_eq!(alert.state, AlertState::Firing);
    assert_eq!(alert.starts_at, t0());
    assert_eq!(alert.fired_at, Some(t0()));
    assert!(alert.ends_at.is_none());
}

#[test]
fn pending_never_fires_before_for_duration() {
    // for=2m evaluated every 30s: true at 0s, 30s, 60s then false at 90s
    let r = rule("errors", 120);
    let sm = AlertStateMachine::default();
    let mut all = Vec::new();
    for step in 0..3 {
        all.extend(sm.apply(&r, &eval_true(&r, t0() + Duration::seconds(30 * step), 0.2)));
    }
    all.extend(sm.apply(&r, &eval_false(&r, t0() + Duration::seconds(90))));

    assert_eq!(kinds(&all), vec![TransitionKind::Pending, TransitionKind::Discarded]);
    assert!(sm.is_empty(), "discarded record must not be kept");
}

#[test]
fn pending_promotes_once_for_elapses() {
    let r = rule("errors", 60);
    let sm = AlertStateMachine::default();

    assert_eq!(kinds(&sm.apply(&r, &eval_true(&r, t0(), 0.2))), vec![TransitionKind::Pending]);
    assert!(sm.apply(&r, &eval_true(&r, t0() + Duration::seconds(30), 0.2)).is_empty());
    let fired = sm.apply(&r, &eval_true(&r, t0() + Duration::seconds(60), 0.2));
    assert_eq!(kinds(&fired), vec![TransitionKind::Firing]);
    assert_eq!(fired[0].alert.starts_at, t0());
}

#[test]
fn firing_alert_updates_value_without_transition() {
    let r = rule("errors", 0);
    let sm = AlertStateMachine::default();
    let first = sm.apply(&r, &eval_true(&r, t0(), 0.2));
    let fp = first[0].fingerprint();

    let again = sm.apply(&r, &eval_true(&r, t0() + Duration::seconds(30), 0.9));
    assert!(again.is_empty());

    let alert = sm.get(&fp).unwrap();
    assert_eq!(alert.value, 0.9);
    assert_eq!(alert.last_evaluated_at, t0() + Duration::seconds(30));
    assert_eq!(alert.annotations["summary"], "checkout at 0.9");
}

#[test]
fn firing_resolves_then_purges_after_retention() {
    let r = rule("errors", 0);
    let sm = AlertStateMachine::new(Duration::minutes(5));
    sm.apply(&r, &eval_true(&r, t0(), 0.2));

    let resolved_at = t0() + Duration::seconds(30);
    let resolved = sm.apply(&r, &eval_false(&r, resolved_at));
    assert_eq!(kinds(&resolved), vec![TransitionKind::Resolved]);
    assert_eq!(resolved[0].alert.ends_at, Some(resolved_at));

    assert!(sm.purge(resolved_at + Duration::minutes(4)).is_empty());
    let purged = sm.purge(resolved_at + Duration::minutes(5));
    assert_eq!(kinds(&purged), vec![TransitionKind::Purged]);
    assert!(sm.is_empty());
}

#[test]
fn failed_evaluation_holds_state_and_for_timer() {
    let r = rule("errors", 120);
    let sm = AlertStateMachine::default();
    let fp = sm.apply(&r, &eval_true(&r, t0(), 0.2))[0].fingerprint();

    assert!(sm.apply(&r, &eval_failed(&r, t0() + Duration::seconds(60))).is_empty());
    let alert = sm.get(&fp).unwrap();
    assert_eq!(alert.state, AlertState::Pending);
    assert_eq!(alert.starts_at, t0());
    assert_eq!(alert.failed_evaluations, 1);

    // the original start still counts toward `for`
    let fired = sm.apply(&r, &eval_true(&r, t0() + Duration::seconds(120), 0.2));
    assert_eq!(kinds(&fired), vec![TransitionKind::Firing]);
}

#[test]
fn failed_evaluation_does_not_resolve_firing_alert() {
    let r = rule("errors", 0);
    let sm = AlertStateMachine::default();
    let fp = sm.apply(&r, &eval_true(&r, t0(), 0.2))[0].fingerprint();

    assert!(sm.apply(&r, &eval_failed(&r, t0() + Duration::seconds(30))).is_empty());
    assert_eq!(sm.get(&fp).unwrap().state, AlertState::Firing);
}

#[test]
fn resolved_alert_that_reoccurs_starts_new_lifecycle() {
    let r = rule("errors", 60);
    let sm = AlertStateMachine::default();
    sm.apply(&r, &eval_true(&r, t0(), 0.2));
    sm.apply(&r, &eval_true(&r, t0() + Duration::seconds(60), 0.2));
    sm.apply(&r, &eval_false(&r, t0() + Duration::seconds(90)));

    let again_at = t0() + Duration::seconds(120);
    let again = sm.apply(&r, &eval_true(&r, again_at, 0.4));
    assert_eq!(kinds(&again), vec![TransitionKind::Pending]);
    assert_eq!(again[0].alert.starts_at, again_at);
    assert!(again[0].alert.ends_at.is_none());
    assert_eq!(sm.len(), 1);
}

#[test]
fn identical_labels_share_one_record() {
    let r = rule("errors", 0);
    let sm = AlertStateMachine::default();
    let mut samples = SampleSet::new();
    // "team" is overridden by the rule's static label, collapsing both samples
    samples.insert(labels(&[("service", "checkout"), ("team", "a")]), 1.0);
    samples.insert(labels(&[("service", "checkout"), ("team", "b")]), 2.0);
    let eval = RuleEvaluation {
        rule_id: r.id.clone(),
        at: t0(),
        elapsed: std::time::Duration::ZERO,
        outcome: EvaluationOutcome::Samples(samples),
    };
    assert_eq!(sm.apply(&r, &eval).len(), 1);
    assert_eq!(sm.len(), 1);
}

#[test]
fn second_rule_with_same_fingerprint_is_a_violation() {
    let owner = rule("owner", 0);
    let mut intruder = rule("intruder", 0);
    intruder.expr = "other_expr".into();
    let sm = AlertStateMachine::default();

    sm.apply(&owner, &eval_true(&owner, t0(), 0.2));
    let transitions = sm.apply(&intruder, &eval_true(&intruder, t0(), 0.5));
    assert!(transitions.is_empty());
    assert_eq!(sm.violations(), 1);
    assert_eq!(sm.snapshot()[0].rule_id, "owner");
    assert_eq!(sm.snapshot()[0].value, 0.2);

    // the intruder's empty cycle must not resolve the owner's alert
    assert!(sm.apply(&intruder, &eval_false(&intruder, t0())).is_empty());
    assert_eq!(sm.snapshot()[0].state, AlertState::Firing);
}

#[test]
fn retired_rule_resolves_firing_and_discards_pending() {
    let firing = rule("firing", 0);
    let mut pending = rule("pending", 600);
    pending.name = "SlowBurn".into();
    let sm = AlertStateMachine::default();
    sm.apply(&firing, &eval_true(&firing, t0(), 1.0));
    sm.apply(&pending, &eval_true(&pending, t0(), 1.0));

    let mut transitions = sm.retire_rules(&HashSet::new(), t0() + Duration::seconds(10));
    transitions.sort_by_key(|t| t.alert.rule_id.clone());
    assert_eq!(
        kinds(&transitions),
        vec![TransitionKind::Resolved, TransitionKind::Discarded]
    );
    assert_eq!(sm.len(), 1);
}

#[test]
fn fingerprint_matches_alert_labels() {
    let r = rule("errors", 0);
    let sm = AlertStateMachine::default();
    let t = sm.apply(&r, &eval_true(&r, t0(), 0.2));
    assert_eq!(t[0].fingerprint(), Fingerprint::from_labels(&t[0].alert.labels));
}

// ── Evaluator ──

struct ScriptedSource {
    next: Mutex<Option<SampleSet>>,
}

#[async_trait]
impl MetricsSource for ScriptedSource {
    async fn evaluate(&self, _expr: &str, _at: DateTime<Utc>) -> anyhow::Result<SampleSet> {
        self.next
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("metrics backend unavailable"))
    }
}

struct HangingSource;

#[async_trait]
impl MetricsSource for HangingSource {
    async fn evaluate(&self, _expr: &str, _at: DateTime<Utc>) -> anyhow::Result<SampleSet> {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        Ok(SampleSet::new())
    }
}

#[tokio::test]
async fn evaluator_reports_source_errors_as_failures() {
    let source = Arc::new(ScriptedSource {
        next: Mutex::new(None),
    });
    let evaluator = RuleEvaluator::new(source.clone(), std::time::Duration::from_secs(1))
        .with_degraded_after(2);
    let r = rule("errors", 0);

    let first = evaluator.evaluate(&r, t0()).await;
    assert!(first.is_failed());
    assert!(!evaluator.health("errors").unwrap().degraded);

    evaluator.evaluate(&r, t0()).await;
    let health = evaluator.health("errors").unwrap();
    assert_eq!(health.consecutive_failures, 2);
    assert!(health.degraded);
    assert!(health.last_error.unwrap().contains("metrics backend unavailable"));

    *source.next.lock().unwrap() = Some(SampleSet::new());
    let ok = evaluator.evaluate(&r, t0()).await;
    assert!(!ok.is_failed());
    let health = evaluator.health("errors").unwrap();
    assert_eq!(health.consecutive_failures, 0);
    assert_eq!(health.total_failures, 2);
    assert!(!health.degraded);
}

#[tokio::test(start_paused = true)]
async fn evaluator_times_out_slow_sources() {
    let evaluator = RuleEvaluator::new(Arc::new(HangingSource), std::time::Duration::from_secs(5));
    let r = rule("errors", 0);

    let evaluation = evaluator.evaluate(&r, t0()).await;
    match evaluation.outcome {
        EvaluationOutcome::Failed(EvaluationError::Timeout { timeout_ms, .. }) => {
            assert_eq!(timeout_ms, 5000)
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn evaluator_retains_only_active_rules() {
    let source = Arc::new(ScriptedSource {
        next: Mutex::new(Some(SampleSet::new())),
    });
    let evaluator = RuleEvaluator::new(source, std::time::Duration::from_secs(1));
    evaluator.evaluate(&rule("a", 0), t0()).await;
    evaluator.evaluate(&rule("b", 0), t0()).await;

    evaluator.retain_rules(&["a".to_string()].into_iter().collect());
    let ids: Vec<String> = evaluator
        .health_snapshot()
        .into_iter()
        .map(|h| h.rule_id)
        .collect();
    assert_eq!(ids, vec!["a"]);
}
