use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Identity-bearing label set of an alert. Kept sorted by name so that
/// iteration order never depends on how the labels were collected.
pub type LabelSet = BTreeMap<String, String>;

/// Free-form annotations attached to an alert. Not part of its identity.
pub type Annotations = BTreeMap<String, String>;

pub const ALERTNAME_LABEL: &str = "alertname";
pub const SEVERITY_LABEL: &str = "severity";

/// Upper bound for any configured duration (ten years), keeping timestamp
/// arithmetic in range.
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 3600;

/// Deterministic identity of an alert, derived from its label set only.
///
/// # Examples
///
/// ```
/// use oxwatch_common::types::{Fingerprint, LabelSet};
///
/// let mut a = LabelSet::new();
/// a.insert("service".into(), "api".into());
/// a.insert("alertname".into(), "HighLatency".into());
///
/// let b: LabelSet = [("alertname", "HighLatency"), ("service", "api")]
///     .into_iter()
///     .map(|(k, v)| (k.to_string(), v.to_string()))
///     .collect();
///
/// assert_eq!(Fingerprint::from_labels(&a), Fingerprint::from_labels(&b));
/// assert_eq!(Fingerprint::from_labels(&a).to_string().len(), 16);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub fn from_labels(labels: &LabelSet) -> Self {
        let mut hasher = Sha256::new();
        for (name, value) in labels {
            hasher.update(name.as_bytes());
            hasher.update([0xff]);
            hasher.update(value.as_bytes());
            hasher.update([0xff]);
        }
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        Self(u64::from_be_bytes(prefix))
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16)
            .map(Self)
            .map_err(|e| format!("invalid fingerprint '{s}': {e}"))
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.to_string()
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Render a label set as `{a="1", b="2"}`.
///
/// # Examples
///
/// ```
/// use oxwatch_common::types::{format_labels, LabelSet};
///
/// let mut labels = LabelSet::new();
/// labels.insert("instance".into(), "db-01".into());
/// labels.insert("alertname".into(), "DiskFull".into());
/// assert_eq!(format_labels(&labels), r#"{alertname="DiskFull", instance="db-01"}"#);
/// ```
pub fn format_labels(labels: &LabelSet) -> String {
    let pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect();
    format!("{{{}}}", pairs.join(", "))
}

/// Alert severity level, ordered from lowest to highest.
///
/// # Examples
///
/// ```
/// use oxwatch_common::types::Severity;
///
/// let sev: Severity = "warning".parse().unwrap();
/// assert_eq!(sev, Severity::Warning);
/// assert_eq!(sev.to_string(), "warning");
/// assert!(Severity::Critical > Severity::Info);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    #[default]
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            _ => Err(format!("unknown severity: {s}")),
        }
    }
}

/// Lifecycle state of a tracked alert. `Inactive` has no variant: an
/// inactive fingerprint simply has no record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    Pending,
    Firing,
    Resolved,
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertState::Pending => f.write_str("pending"),
            AlertState::Firing => f.write_str("firing"),
            AlertState::Resolved => f.write_str("resolved"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub fingerprint: Fingerprint,
    pub rule_id: String,
    pub labels: LabelSet,
    pub annotations: Annotations,
    pub severity: Severity,
    pub state: AlertState,
    /// Start of the current lifecycle (first true evaluation).
    pub starts_at: DateTime<Utc>,
    /// Set once the alert resolves.
    pub ends_at: Option<DateTime<Utc>>,
    /// When the alert was promoted to firing.
    pub fired_at: Option<DateTime<Utc>>,
    pub last_evaluated_at: DateTime<Utc>,
    /// Sample value from the most recent true evaluation.
    pub value: f64,
    /// Cycles where the evaluation failed while this record was tracked.
    pub failed_evaluations: u64,
}

impl Alert {
    pub fn name(&self) -> &str {
        self.labels
            .get(ALERTNAME_LABEL)
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn is_firing(&self) -> bool {
        self.state == AlertState::Firing
    }

    pub fn is_resolved(&self) -> bool {
        self.state == AlertState::Resolved
    }
}
