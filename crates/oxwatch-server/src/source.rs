use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oxwatch_alert::{MetricsSource, SampleSet};
use oxwatch_common::types::LabelSet;
use serde::Deserialize;
use std::time::Duration;

/// Evaluates rule expressions as instant queries against a
/// Prometheus-compatible HTTP API (`/api/v1/query`).
pub struct PrometheusSource {
    client: reqwest::Client,
    base_url: String,
}

impl PrometheusSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default, rename = "errorType")]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryData {
    result_type: String,
    result: serde_json::Value,
}

#[derive(Deserialize)]
struct VectorSample {
    #[serde(default)]
    metric: LabelSet,
    /// `[unix seconds, "value"]`
    value: (f64, String),
}

/// Turns an instant-query response into a sample set. Only instant vectors
/// are accepted; the metric name label is dropped.
pub fn parse_query_response(body: &str) -> Result<SampleSet> {
    let response: QueryResponse = serde_json::from_str(body).context("malformed query response")?;
    if response.status != "success" {
        bail!(
            "query failed ({}): {}",
            response.error_type.as_deref().unwrap_or("unknown"),
            response.error.as_deref().unwrap_or("no error message")
        );
    }
    let Some(data) = response.data else {
        bail!("query response has no data");
    };
    if data.result_type != "vector" {
        bail!("expected an instant vector, got {}", data.result_type);
    }

    let samples: Vec<VectorSample> = serde_json::from_value(data.result).context("malformed vector result")?;
    let mut out = SampleSet::new();
    for sample in samples {
        let mut labels = sample.metric;
        labels.remove("__name__");
        let value: f64 = sample
            .value
            .1
            .parse()
            .with_context(|| format!("invalid sample value '{}'", sample.value.1))?;
        out.insert(labels, value);
    }
    Ok(out)
}

#[async_trait]
impl MetricsSource for PrometheusSource {
    async fn evaluate(&self, expr: &str, at: DateTime<Utc>) -> Result<SampleSet> {
        let time = at.timestamp().to_string();
        let resp = self
            .client
            .get(format!("{}/api/v1/query", self.base_url))
            .query(&[("query", expr), ("time", time.as_str())])
            .send()
            .await
            .context("query request failed")?;

        let status = resp.status();
        let body = resp.text().await.context("failed to read query response")?;
        match parse_query_response(&body) {
            Ok(samples) => Ok(samples),
            Err(e) if status.is_success() => Err(e),
            Err(e) => Err(e.context(format!("HTTP {status}"))),
        }
    }
}
