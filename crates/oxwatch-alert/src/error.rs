use oxwatch_common::types::Fingerprint;

/// Why a rule could not be evaluated in a cycle. Never interpreted as
/// "condition false".
#[derive(Debug, Clone, thiserror::Error)]
pub enum EvaluationError {
    #[error("Evaluate: rule '{rule_id}' timed out after {timeout_ms}ms")]
    Timeout { rule_id: String, timeout_ms: u64 },

    #[error("Evaluate: rule '{rule_id}' query failed: {message}")]
    Source { rule_id: String, message: String },
}

/// A rule definition that cannot be part of an active rule set.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("Rule: duplicate rule id '{0}'")]
    DuplicateId(String),

    #[error("Rule: '{rule_id}' is invalid: {reason}")]
    Invalid { rule_id: String, reason: String },
}

/// Two rules produced the same fingerprint. The second producer's sample is
/// dropped; the existing record is left untouched.
#[derive(Debug, Clone, thiserror::Error)]
#[error(
    "invariant violation: fingerprint {fingerprint} {labels} from rule '{rule_id}' is already owned by rule '{owner}'"
)]
pub struct InvariantViolation {
    pub fingerprint: Fingerprint,
    pub rule_id: String,
    pub owner: String,
    pub labels: String,
}
