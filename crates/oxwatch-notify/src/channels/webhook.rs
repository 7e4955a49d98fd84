use crate::plugin::ChannelPlugin;
use crate::utils::{redact_sensitive_json, truncate_string, MAX_BODY_LENGTH};
use crate::{DeliveryError, Notification, NotificationChannel};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Posts the notification as JSON to a fixed URL.
pub struct WebhookChannel {
    receiver: String,
    client: reqwest::Client,
    url: String,
    headers: BTreeMap<String, String>,
}

impl WebhookChannel {
    pub fn new(receiver: &str, url: &str, headers: BTreeMap<String, String>) -> Self {
        Self {
            receiver: receiver.to_string(),
            client: reqwest::Client::new(),
            url: url.to_string(),
            headers,
        }
    }
}

/// Maps an HTTP response status to a delivery outcome: 2xx succeeds,
/// 429 and 5xx are worth retrying, any other status is final.
pub fn classify_status(status: StatusCode, body: &str) -> Result<(), DeliveryError> {
    if status.is_success() {
        return Ok(());
    }
    let message = format!("HTTP {status}: {}", truncate_string(body, MAX_BODY_LENGTH));
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(DeliveryError::Retryable(message))
    } else {
        Err(DeliveryError::Permanent(message))
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    async fn send(&self, notification: &Notification) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(notification)
            .map_err(|e| DeliveryError::Permanent(format!("failed to encode notification: {e}")))?;

        let mut request = self
            .client
            .post(self.url.as_str())
            .header("Content-Type", "application/json")
            .header("Idempotency-Key", notification.batch_id.as_str());
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let resp = request
            .body(body)
            .send()
            .await
            .map_err(|e| DeliveryError::Retryable(format!("webhook request failed: {e}")))?;

        let status = resp.status();
        let resp_body = match resp.text().await {
            Ok(text) => text,
            Err(e) => format!("[Failed to read response body: {e}]"),
        };
        if !status.is_success() {
            tracing::warn!(
                receiver = %self.receiver,
                status = %status,
                "Webhook returned non-success status"
            );
        }
        classify_status(status, &resp_body)
    }

    fn channel_type(&self) -> &str {
        "webhook"
    }
}

// Plugin

#[derive(Deserialize)]
struct WebhookConfig {
    url: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

impl WebhookConfig {
    fn parse(config: &Value) -> Result<Self> {
        let cfg: WebhookConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("Invalid webhook config: {e}"))?;
        if !(cfg.url.starts_with("http://") || cfg.url.starts_with("https://")) {
            anyhow::bail!("Invalid webhook config: url must start with http:// or https://");
        }
        Ok(cfg)
    }
}

pub struct WebhookPlugin;

impl ChannelPlugin for WebhookPlugin {
    fn name(&self) -> &str {
        "webhook"
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        WebhookConfig::parse(config).map(|_| ())
    }

    fn create_channel(&self, receiver: &str, config: &Value) -> Result<Arc<dyn NotificationChannel>> {
        let cfg = WebhookConfig::parse(config)?;
        Ok(Arc::new(WebhookChannel::new(receiver, &cfg.url, cfg.headers)))
    }

    fn redact_config(&self, config: &Value) -> Value {
        redact_sensitive_json(config)
    }
}
