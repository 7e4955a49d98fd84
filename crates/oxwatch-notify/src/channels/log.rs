use crate::plugin::ChannelPlugin;
use crate::{DeliveryError, Notification, NotificationChannel, NotificationStatus};
use anyhow::Result;
use async_trait::async_trait;
use oxwatch_common::types::format_labels;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// Writes notifications to the process log. Never fails.
pub struct LogChannel {
    receiver: String,
    include_alerts: bool,
}

impl LogChannel {
    pub fn new(receiver: &str, include_alerts: bool) -> Self {
        Self {
            receiver: receiver.to_string(),
            include_alerts,
        }
    }
}

#[async_trait]
impl NotificationChannel for LogChannel {
    async fn send(&self, notification: &Notification) -> Result<(), DeliveryError> {
        let status = match notification.status {
            NotificationStatus::Firing => "firing",
            NotificationStatus::Resolved => "resolved",
        };
        tracing::info!(
            receiver = %self.receiver,
            batch_id = %notification.batch_id,
            group_id = %notification.group_id,
            group_key = %format_labels(&notification.group_key),
            status,
            firing = notification.firing().count(),
            resolved = notification.resolved().count(),
            "Notification"
        );
        if self.include_alerts {
            for alert in &notification.alerts {
                tracing::info!(
                    receiver = %self.receiver,
                    batch_id = %notification.batch_id,
                    fingerprint = %alert.fingerprint,
                    status = ?alert.status,
                    value = alert.value,
                    labels = %format_labels(&alert.labels),
                    "Notification alert"
                );
            }
        }
        Ok(())
    }

    fn channel_type(&self) -> &str {
        "log"
    }
}

#[derive(Deserialize)]
struct LogConfig {
    #[serde(default = "default_include_alerts")]
    include_alerts: bool,
}

fn default_include_alerts() -> bool {
    true
}

pub struct LogPlugin;

impl ChannelPlugin for LogPlugin {
    fn name(&self) -> &str {
        "log"
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        serde_json::from_value::<LogConfig>(config.clone())
            .map_err(|e| anyhow::anyhow!("Invalid log config: {e}"))?;
        Ok(())
    }

    fn create_channel(&self, receiver: &str, config: &Value) -> Result<Arc<dyn NotificationChannel>> {
        let cfg: LogConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("Invalid log config: {e}"))?;
        Ok(Arc::new(LogChannel::new(receiver, cfg.include_alerts)))
    }
}
