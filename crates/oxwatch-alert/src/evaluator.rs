use crate::error::EvaluationError;
use crate::rule::Rule;
use crate::{MetricsSource, SampleSet};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_EVALUATION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DEGRADED_AFTER: u64 = 3;

#[derive(Debug, Clone)]
pub enum EvaluationOutcome {
    Samples(SampleSet),
    Failed(EvaluationError),
}

#[derive(Debug, Clone)]
pub struct RuleEvaluation {
    pub rule_id: String,
    pub at: DateTime<Utc>,
    pub elapsed: Duration,
    pub outcome: EvaluationOutcome,
}

impl RuleEvaluation {
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, EvaluationOutcome::Failed(_))
    }
}

/// Evaluation health of one rule, exported for inspection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuleHealth {
    pub rule_id: String,
    pub last_evaluated_at: Option<DateTime<Utc>>,
    pub last_duration_ms: u64,
    pub last_error: Option<String>,
    pub consecutive_failures: u64,
    pub total_failures: u64,
    pub degraded: bool,
}

pub struct RuleEvaluator {
    source: Arc<dyn MetricsSource>,
    timeout: Duration,
    degraded_after: u64,
    health: DashMap<String, RuleHealth>,
}

impl RuleEvaluator {
    pub fn new(source: Arc<dyn MetricsSource>, timeout: Duration) -> Self {
        Self {
            source,
            timeout,
            degraded_after: DEFAULT_DEGRADED_AFTER,
            health: DashMap::new(),
        }
    }

    /// Number of consecutive failed cycles after which a rule reports as
    /// degraded.
    pub fn with_degraded_after(mut self, cycles: u64) -> Self {
        self.degraded_after = cycles.max(1);
        self
    }

    pub async fn evaluate(&self, rule: &Rule, at: DateTime<Utc>) -> RuleEvaluation {
        let started = Instant::now();
        let result = tokio::time::timeout(self.timeout, self.source.evaluate(&rule.expr, at)).await;
        let elapsed = started.elapsed();

        let outcome = match result {
            Ok(Ok(samples)) => EvaluationOutcome::Samples(samples),
            Ok(Err(e)) => EvaluationOutcome::Failed(EvaluationError::Source {
                rule_id: rule.id.clone(),
                message: format!("{e:#}"),
            }),
            Err(_) => EvaluationOutcome::Failed(EvaluationError::Timeout {
                rule_id: rule.id.clone(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        };

        self.record(rule, at, elapsed, &outcome);

        RuleEvaluation {
            rule_id: rule.id.clone(),
            at,
            elapsed,
            outcome,
        }
    }

    fn record(&self, rule: &Rule, at: DateTime<Utc>, elapsed: Duration, outcome: &EvaluationOutcome) {
        counter!("oxwatch_rule_evaluations_total", "rule_id" => rule.id.clone()).increment(1);
        histogram!("oxwatch_rule_evaluation_duration_seconds", "rule_id" => rule.id.clone())
            .record(elapsed.as_secs_f64());

        let mut health = self
            .health
            .entry(rule.id.clone())
            .or_insert_with(|| RuleHealth {
                rule_id: rule.id.clone(),
                ..Default::default()
            });
        health.last_evaluated_at = Some(at);
        health.last_duration_ms = elapsed.as_millis() as u64;

        match outcome {
            EvaluationOutcome::Samples(samples) => {
                health.last_error = None;
                health.consecutive_failures = 0;
                health.degraded = false;
                tracing::debug!(
                    rule_id = %rule.id,
                    matches = samples.len(),
                    elapsed_ms = health.last_duration_ms,
                    "Rule evaluated"
                );
            }
            EvaluationOutcome::Failed(err) => {
                health.last_error = Some(err.to_string());
                health.consecutive_failures += 1;
                health.total_failures += 1;
                health.degraded = health.consecutive_failures >= self.degraded_after;
                counter!("oxwatch_rule_evaluation_failures_total", "rule_id" => rule.id.clone())
                    .increment(1);
                tracing::warn!(
                    rule_id = %rule.id,
                    consecutive_failures = health.consecutive_failures,
                    degraded = health.degraded,
                    error = %err,
                    "Rule evaluation failed"
                );
            }
        }

        gauge!("oxwatch_rule_degraded", "rule_id" => rule.id.clone())
            .set(if health.degraded { 1.0 } else { 0.0 });
    }

    pub fn health(&self, rule_id: &str) -> Option<RuleHealth> {
        self.health.get(rule_id).map(|h| h.clone())
    }

    pub fn health_snapshot(&self) -> Vec<RuleHealth> {
        let mut all: Vec<RuleHealth> = self.health.iter().map(|h| h.value().clone()).collect();
        all.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));
        all
    }

    /// Drops health entries for rules no longer in the active set.
    pub fn retain_rules(&self, active: &HashSet<String>) {
        self.health.retain(|id, _| active.contains(id));
    }
}
