//! Grouping, suppression, routing and delivery of alert notifications.
//!
//! Firing and resolved transitions from the alert state machine are
//! clustered into groups by the [`grouping::GroupingEngine`] according to the
//! route they match in the [`routing::Router`]. Group timers decide when a
//! group flushes; at flush time [`silence::Suppressor`] drops silenced and
//! inhibited alerts and the [`dispatch::Dispatcher`] delivers what remains to
//! each receiver's [`NotificationChannel`] with retry and deduplication.

pub mod channels;
pub mod dispatch;
pub mod error;
pub mod grouping;
pub mod plugin;
pub mod routing;
pub mod silence;
pub mod timer;
pub mod utils;


use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oxwatch_common::types::{Alert, Annotations, Fingerprint, LabelSet};
use serde::{Deserialize, Serialize};

pub use error::DeliveryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Firing,
    Resolved,
}

/// One alert as it appears in a notification payload.
#[derive(Debug, Clone, Serialize)]
pub struct NotifiedAlert {
    pub fingerprint: Fingerprint,
    pub status: NotificationStatus,
    pub labels: LabelSet,
    pub annotations: Annotations,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub value: f64,
}

impl NotifiedAlert {
    pub fn from_alert(alert: &Alert) -> Self {
        Self {
            fingerprint: alert.fingerprint,
            status: if alert.is_resolved() {
                NotificationStatus::Resolved
            } else {
                NotificationStatus::Firing
            },
            labels: alert.labels.clone(),
            annotations: alert.annotations.clone(),
            starts_at: alert.starts_at,
            ends_at: alert.ends_at,
            value: alert.value,
        }
    }
}

/// Payload handed to a notification channel.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    /// Stable across retries of the same delivery, usable for provider-side
    /// deduplication.
    pub batch_id: String,
    pub receiver: String,
    pub group_id: String,
    pub group_key: LabelSet,
    /// `Resolved` only when no alert in the payload is still firing.
    pub status: NotificationStatus,
    pub alerts: Vec<NotifiedAlert>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn firing(&self) -> impl Iterator<Item = &NotifiedAlert> {
        self.alerts
            .iter()
            .filter(|a| a.status == NotificationStatus::Firing)
    }

    pub fn resolved(&self) -> impl Iterator<Item = &NotifiedAlert> {
        self.alerts
            .iter()
            .filter(|a| a.status == NotificationStatus::Resolved)
    }
}

/// A delivery channel for notifications (webhook, log, ...).
///
/// Channels are created by a [`plugin::ChannelPlugin`] from receiver
/// configuration. They attempt a single delivery per call; retries,
/// backoff and timeouts belong to the dispatcher.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Delivers the notification once.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::Retryable`] for transient failures (network errors,
    /// 5xx, throttling), [`DeliveryError::Permanent`] when retrying the same
    /// payload cannot succeed.
    async fn send(&self, notification: &Notification) -> Result<(), DeliveryError>;

    /// The channel type name, e.g. `"webhook"`.
    fn channel_type(&self) -> &str;
}
