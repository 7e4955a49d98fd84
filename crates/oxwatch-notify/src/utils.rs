//! Utility functions for notification channels

use serde_json::Value;

/// Maximum length of a response body quoted in a delivery error.
pub const MAX_BODY_LENGTH: usize = 512;

/// Truncate a string to at most `max_len` bytes, never splitting a
/// multi-byte character.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated]", &s[..end])
}

fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_lowercase();
    ["password", "token", "secret", "api_key", "apikey", "authorization", "credentials"]
        .iter()
        .any(|needle| key.contains(needle))
}

/// Replace the values of credential-like keys (passwords, tokens,
/// authorization headers) with `"***"`, recursing into nested objects and
/// arrays.
pub fn redact_sensitive_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, val)| {
                    let redacted = if is_sensitive_key(key) {
                        Value::String("***".to_string())
                    } else {
                        redact_sensitive_json(val)
                    };
                    (key.clone(), redacted)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_sensitive_json).collect()),
        _ => value.clone(),
    }
}
