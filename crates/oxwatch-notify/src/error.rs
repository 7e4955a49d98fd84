/// Errors raised while building or validating the notification pipeline.
///
/// # Examples
///
/// ```rust
/// use oxwatch_notify::error::NotifyError;
///
/// let err = NotifyError::UnknownReceiver("pager".to_string());
/// assert!(err.to_string().contains("pager"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// Channel configuration is missing a required field or contains an invalid value.
    #[error("Notify: invalid channel configuration for '{receiver}': {reason}")]
    InvalidConfig { receiver: String, reason: String },

    /// The channel type is not registered in the plugin registry.
    #[error("Notify: unknown channel type '{0}'")]
    UnknownChannelType(String),

    /// A route references a receiver that is not configured.
    #[error("Notify: unknown receiver '{0}'")]
    UnknownReceiver(String),

    #[error("Notify: receiver '{0}' is defined more than once")]
    DuplicateReceiver(String),

    /// The route tree is malformed (e.g. root without receivers).
    #[error("Notify: invalid route {route_id}: {reason}")]
    InvalidRoute { route_id: String, reason: String },

    #[error("Notify: invalid silence: {0}")]
    InvalidSilence(String),

    #[error("Notify: JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Outcome of a failed delivery attempt, as reported by a channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// Transient failure; the dispatcher retries with backoff.
    #[error("retryable delivery failure: {0}")]
    Retryable(String),

    /// Retrying the same payload cannot succeed (4xx, validation).
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Retryable(_))
    }
}

pub type Result<T> = std::result::Result<T, NotifyError>;
