#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use chrono::{DateTime, Duration, TimeZone, Utc};
use oxwatch_alert::{MetricsSource, SampleSet};
use oxwatch_common::types::LabelSet;
use oxwatch_notify::plugin::{ChannelPlugin, ChannelRegistry};
use oxwatch_notify::silence::SilenceStore;
use oxwatch_notify::{DeliveryError, Notification, NotificationChannel};
use oxwatch_server::app;
use oxwatch_server::config::ServerConfig;
use oxwatch_server::engine::Engine;
use oxwatch_server::snapshot::ConfigSnapshot;
use oxwatch_server::state::AppState;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tower::util::ServiceExt;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub fn at(secs: i64) -> DateTime<Utc> {
    t0() + Duration::seconds(secs)
}

pub fn labels(pairs: &[(&str, &str)]) -> LabelSet {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Metrics source whose answers are set per expression by the test.
#[derive(Default)]
pub struct ScriptedMetrics {
    answers: Mutex<HashMap<String, Result<SampleSet, String>>>,
}

impl ScriptedMetrics {
    pub fn set(&self, expr: &str, samples: Vec<(LabelSet, f64)>) {
        let set: SampleSet = samples.into_iter().collect();
        self.answers.lock().unwrap().insert(expr.to_string(), Ok(set));
    }

    pub fn clear(&self, expr: &str) {
        self.answers
            .lock()
            .unwrap()
            .insert(expr.to_string(), Ok(SampleSet::new()));
    }

    pub fn fail(&self, expr: &str, message: &str) {
        self.answers
            .lock()
            .unwrap()
            .insert(expr.to_string(), Err(message.to_string()));
    }
}

#[async_trait]
impl MetricsSource for ScriptedMetrics {
    async fn evaluate(&self, expr: &str, _at: DateTime<Utc>) -> anyhow::Result<SampleSet> {
        match self.answers.lock().unwrap().get(expr) {
            Some(Ok(samples)) => Ok(samples.clone()),
            Some(Err(message)) => Err(anyhow::anyhow!(message.clone())),
            None => Ok(SampleSet::new()),
        }
    }
}

/// Every notification delivered to any `recording` receiver.
pub type Outbox = Arc<Mutex<Vec<Notification>>>;

struct RecordingChannel {
    outbox: Outbox,
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    async fn send(&self, notification: &Notification) -> Result<(), DeliveryError> {
        self.outbox.lock().unwrap().push(notification.clone());
        Ok(())
    }

    fn channel_type(&self) -> &str {
        "recording"
    }
}

struct RecordingPlugin {
    outbox: Outbox,
}

impl ChannelPlugin for RecordingPlugin {
    fn name(&self) -> &str {
        "recording"
    }

    fn validate_config(&self, _config: &Value) -> Result<()> {
        Ok(())
    }

    fn create_channel(&self, _receiver: &str, _config: &Value) -> Result<Arc<dyn NotificationChannel>> {
        Ok(Arc::new(RecordingChannel {
            outbox: self.outbox.clone(),
        }))
    }
}

pub struct TestContext {
    pub temp_dir: TempDir,
    pub config_path: String,
    pub engine: Arc<Engine>,
    pub metrics: Arc<ScriptedMetrics>,
    pub silences: Arc<SilenceStore>,
    pub outbox: Outbox,
    pub state: AppState,
    pub app: axum::Router,
}

impl TestContext {
    pub fn sent(&self) -> Vec<Notification> {
        self.outbox.lock().unwrap().clone()
    }

    /// Runs one engine cycle at `now` and waits for the resulting deliveries.
    pub async fn step(&self, now: DateTime<Utc>) {
        self.engine.step(now).await;
        self.engine.dispatcher().wait_idle().await;
    }

    /// Steps every `every` seconds from `from` to `to`, both inclusive.
    pub async fn run(&self, from: i64, to: i64, every: i64) {
        let mut secs = from;
        while secs <= to {
            self.step(at(secs)).await;
            secs += every;
        }
    }

    pub fn write_config(&self, toml: &str) {
        std::fs::write(&self.config_path, toml).expect("config should be written");
    }
}

pub fn registry(outbox: &Outbox) -> ChannelRegistry {
    let mut registry = ChannelRegistry::default();
    registry.register(Box::new(RecordingPlugin {
        outbox: outbox.clone(),
    }));
    registry
}

/// Builds an engine (not started) and an HTTP app from a TOML config,
/// driven manually through [`TestContext::step`].
pub fn build_test_context(toml: &str) -> Result<TestContext> {
    oxwatch_common::id::init(1, 1);

    let temp_dir = tempfile::tempdir()?;
    let config_path = temp_dir.path().join("oxwatch.toml");
    std::fs::write(&config_path, toml)?;
    let config_path = config_path.to_string_lossy().to_string();

    let config = ServerConfig::load(&config_path)?;
    let outbox: Outbox = Arc::new(Mutex::new(Vec::new()));
    let registry = Arc::new(registry(&outbox));
    let snapshot = ConfigSnapshot::build(&config, &registry, 1)?;

    let metrics = Arc::new(ScriptedMetrics::default());
    let silences = Arc::new(SilenceStore::new());
    let engine = Engine::new(
        snapshot,
        metrics.clone(),
        silences.clone(),
        config.engine.clone(),
        config.dispatch.to_dispatch_config(),
    );

    let state = AppState::new(engine.clone(), silences.clone(), registry).with_config_path(&config_path);
    let app = app::build_http_app(state.clone());

    Ok(TestContext {
        temp_dir,
        config_path,
        engine,
        metrics,
        silences,
        outbox,
        state,
        app,
    })
}

/// A config with one rule on `expr`, one recording receiver and the given
/// route timing.
pub fn single_rule_config(for_secs: u64, group_wait: u64, group_interval: u64, repeat: u64) -> String {
    format!(
        r#"
[[rules]]
id = "high-error-rate"
name = "HighErrorRate"
expr = "error_rate > 0.05"
for_secs = {for_secs}
interval_secs = 15
severity = "critical"
[rules.annotations]
summary = "{{{{ $labels.service }}}} error rate {{{{ $value }}}}"

[route]
receivers = ["pager"]
group_by = ["alertname", "service"]
group_wait_secs = {group_wait}
group_interval_secs = {group_interval}
repeat_interval_secs = {repeat}

[[receivers]]
name = "pager"
type = "recording"
"#
    )
}

pub async fn request_json(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(body.unwrap_or(Value::Null).to_string()))
        .expect("request should build");
    send(app, req).await
}

pub async fn request_no_body(app: &axum::Router, method: &str, uri: &str) -> (StatusCode, Value) {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("request should build");
    send(app, req).await
}

async fn send(app: &axum::Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app
        .clone()
        .oneshot(req)
        .await
        .expect("request should be handled");
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("body should read");
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice::<Value>(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into()))
    };
    (status, json)
}
