//! Label matchers shared by routes, silences and inhibition rules.
//!
//! Matchers are written as `name="value"`, `name!="value"`, `name=~"regex"`
//! or `name!~"regex"`. Regular expressions are fully anchored. A label that
//! is absent from the set is treated as the empty string, so `env=""`
//! matches alerts without an `env` label.

use crate::types::LabelSet;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Matcher {
    Equal { name: String, value: String },
    NotEqual { name: String, value: String },
    Regex { name: String, source: String, regex: Regex },
    NotRegex { name: String, source: String, regex: Regex },
}

impl Matcher {
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Equal {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn not_equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::NotEqual {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn regex(name: impl Into<String>, source: &str) -> Result<Self, String> {
        Ok(Self::Regex {
            name: name.into(),
            source: source.to_string(),
            regex: compile_anchored(source)?,
        })
    }

    pub fn not_regex(name: impl Into<String>, source: &str) -> Result<Self, String> {
        Ok(Self::NotRegex {
            name: name.into(),
            source: source.to_string(),
            regex: compile_anchored(source)?,
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Equal { name, .. }
            | Self::NotEqual { name, .. }
            | Self::Regex { name, .. }
            | Self::NotRegex { name, .. } => name,
        }
    }

    pub fn matches(&self, labels: &LabelSet) -> bool {
        let actual = labels.get(self.name()).map(String::as_str).unwrap_or("");
        match self {
            Self::Equal { value, .. } => actual == value,
            Self::NotEqual { value, .. } => actual != value,
            Self::Regex { regex, .. } => regex.is_match(actual),
            Self::NotRegex { regex, .. } => !regex.is_match(actual),
        }
    }
}

/// True when every matcher accepts the label set. An empty list matches
/// everything.
pub fn matches_all(matchers: &[Matcher], labels: &LabelSet) -> bool {
    matchers.iter().all(|m| m.matches(labels))
}

fn compile_anchored(source: &str) -> Result<Regex, String> {
    Regex::new(&format!("^(?:{source})$")).map_err(|e| format!("invalid regex '{source}': {e}"))
}

fn valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn unquote(raw: &str) -> &str {
    let raw = raw.trim();
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        &raw[1..raw.len() - 1]
    } else {
        raw
    }
}

impl FromStr for Matcher {
    type Err = String;

    /// # Examples
    ///
    /// ```
    /// use oxwatch_common::matcher::Matcher;
    ///
    /// let m: Matcher = r#"severity=~"critical|warning""#.parse().unwrap();
    /// assert_eq!(m.name(), "severity");
    /// assert_eq!(m.to_string(), r#"severity=~"critical|warning""#);
    /// assert!("=value".parse::<Matcher>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let idx = s
            .find(['=', '!'])
            .ok_or_else(|| format!("matcher '{s}' has no operator"))?;
        let name = s[..idx].trim();
        if !valid_label_name(name) {
            return Err(format!("matcher '{s}' has invalid label name '{name}'"));
        }

        let rest = &s[idx..];
        if let Some(value) = rest.strip_prefix("=~") {
            Self::regex(name, unquote(value))
        } else if let Some(value) = rest.strip_prefix("!~") {
            Self::not_regex(name, unquote(value))
        } else if let Some(value) = rest.strip_prefix("!=") {
            Ok(Self::not_equal(name, unquote(value)))
        } else if let Some(value) = rest.strip_prefix('=') {
            Ok(Self::equal(name, unquote(value)))
        } else {
            Err(format!("matcher '{s}' has unknown operator"))
        }
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equal { name, value } => write!(f, "{name}=\"{value}\""),
            Self::NotEqual { name, value } => write!(f, "{name}!=\"{value}\""),
            Self::Regex { name, source, .. } => write!(f, "{name}=~\"{source}\""),
            Self::NotRegex { name, source, .. } => write!(f, "{name}!~\"{source}\""),
        }
    }
}

impl TryFrom<String> for Matcher {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Matcher> for String {
    fn from(m: Matcher) -> Self {
        m.to_string()
    }
}
