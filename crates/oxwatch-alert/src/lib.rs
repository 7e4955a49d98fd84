//! Rule evaluation and per-fingerprint alert lifecycle tracking.
//!
//! A [`rule::Rule`] names an expression that the external metrics engine
//! evaluates through [`MetricsSource`]. The [`evaluator::RuleEvaluator`]
//! turns each evaluation into either a set of samples or an explicit
//! failure, and the [`state::AlertStateMachine`] folds those outcomes into
//! `pending → firing → resolved` transitions, one record per fingerprint.

pub mod error;
pub mod evaluator;
pub mod rule;
pub mod state;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oxwatch_common::types::LabelSet;
use std::collections::BTreeMap;

/// Label combinations currently satisfying an expression, each with the
/// sample value that satisfied it.
pub type SampleSet = BTreeMap<LabelSet, f64>;

/// Read-only view of the metrics storage/query engine.
///
/// Implementations must be idempotent and free of side effects: the
/// evaluator may call `evaluate` for the same timestamp more than once and
/// abandons calls that exceed its timeout.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Evaluates the boolean expression `expr` at `at`, returning every label
    /// set for which it currently holds. An empty set means "condition false
    /// everywhere"; an error means the evaluation itself failed.
    async fn evaluate(&self, expr: &str, at: DateTime<Utc>) -> anyhow::Result<SampleSet>;
}
