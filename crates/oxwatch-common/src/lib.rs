//! Shared types for the oxwatch alerting engine: label sets, fingerprints,
//! alert records, severity levels and label matchers.

pub mod id;
pub mod matcher;
pub mod types;
