use crate::engine::{AlertView, EngineHealth};
use crate::logging::TraceId;
use crate::state::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use oxwatch_common::matcher::Matcher;
use oxwatch_common::types::AlertState;
use oxwatch_notify::error::NotifyError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope shared by every JSON endpoint.
#[derive(Serialize)]
pub struct ApiResponse<T>
where
    T: Serialize,
{
    /// 0 on success.
    pub err_code: i32,
    pub err_msg: String,
    pub trace_id: String,
    pub data: Option<T>,
}

pub fn success_response<T>(status: StatusCode, trace_id: &str, data: T) -> Response
where
    T: Serialize,
{
    (
        status,
        Json(ApiResponse {
            err_code: 0,
            err_msg: "success".to_string(),
            trace_id: trace_id.to_string(),
            data: Some(data),
        }),
    )
        .into_response()
}

pub fn success_empty_response(status: StatusCode, trace_id: &str, msg: &str) -> Response {
    (
        status,
        Json(ApiResponse::<Value> {
            err_code: 0,
            err_msg: msg.to_string(),
            trace_id: trace_id.to_string(),
            data: None,
        }),
    )
        .into_response()
}

fn to_custom_error_code(code: &str) -> i32 {
    match code {
        "bad_request" => 1001,
        "not_found" => 1004,
        "conflict" => 1005,
        "invalid_matcher" => 1201,
        "invalid_silence" => 1202,
        "config_rejected" => 1301,
        "internal_error" => 1500,
        _ => 1999,
    }
}

pub fn error_response(status: StatusCode, trace_id: &str, code: &str, msg: &str) -> Response {
    (
        status,
        Json(ApiResponse::<Value> {
            err_code: to_custom_error_code(code),
            err_msg: msg.to_string(),
            trace_id: trace_id.to_string(),
            data: None,
        }),
    )
        .into_response()
}

#[derive(Serialize)]
struct HealthResponse {
    version: String,
    uptime_secs: i64,
    #[serde(flatten)]
    engine: EngineHealth,
}

async fn health(Extension(trace_id): Extension<TraceId>, State(state): State<AppState>) -> impl IntoResponse {
    success_response(
        StatusCode::OK,
        &trace_id,
        HealthResponse {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: (Utc::now() - state.start_time).num_seconds(),
            engine: state.engine.health(),
        },
    )
}

#[derive(Deserialize)]
struct AlertQuery {
    state: Option<AlertState>,
    rule_id: Option<String>,
    /// `true` for suppressed alerts only, `false` for unsuppressed only.
    suppressed: Option<bool>,
}

async fn list_alerts(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Query(query): Query<AlertQuery>,
) -> impl IntoResponse {
    let alerts: Vec<AlertView> = state
        .engine
        .alerts(Utc::now())
        .await
        .into_iter()
        .filter(|a| query.state.map_or(true, |s| a.alert.state == s))
        .filter(|a| query.rule_id.as_deref().map_or(true, |id| a.alert.rule_id == id))
        .filter(|a| query.suppressed.map_or(true, |s| a.suppressed.is_some() == s))
        .collect();
    success_response(StatusCode::OK, &trace_id, alerts)
}

async fn list_groups(Extension(trace_id): Extension<TraceId>, State(state): State<AppState>) -> impl IntoResponse {
    success_response(StatusCode::OK, &trace_id, state.engine.groups())
}

async fn list_notifications(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    success_response(StatusCode::OK, &trace_id, state.engine.notification_records())
}

#[derive(Serialize)]
struct ReceiverResponse {
    name: String,
    #[serde(rename = "type")]
    channel_type: String,
    config: Value,
}

async fn list_receivers(Extension(trace_id): Extension<TraceId>, State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.engine.snapshot();
    let receivers: Vec<ReceiverResponse> = snapshot
        .receivers
        .iter()
        .map(|r| ReceiverResponse {
            name: r.name.clone(),
            channel_type: r.channel_type.clone(),
            config: state.registry.redacted(r),
        })
        .collect();
    success_response(StatusCode::OK, &trace_id, receivers)
}

async fn list_silences(Extension(trace_id): Extension<TraceId>, State(state): State<AppState>) -> impl IntoResponse {
    success_response(StatusCode::OK, &trace_id, state.silences.list())
}

#[derive(Deserialize)]
struct CreateSilenceRequest {
    /// Matcher expressions such as `service="checkout"` or `env=~"prod|staging"`.
    matchers: Vec<String>,
    /// Defaults to now.
    starts_at: Option<DateTime<Utc>>,
    ends_at: Option<DateTime<Utc>>,
    /// Alternative to `ends_at`, counted from `starts_at`.
    duration_secs: Option<u64>,
    #[serde(default)]
    created_by: String,
    #[serde(default)]
    comment: String,
}

async fn create_silence(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    body: Result<Json<CreateSilenceRequest>, JsonRejection>,
) -> impl IntoResponse {
    let req = match body {
        Ok(Json(req)) => req,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &trace_id, "bad_request", &e.body_text()),
    };

    let mut matchers = Vec::with_capacity(req.matchers.len());
    for raw in &req.matchers {
        match raw.parse::<Matcher>() {
            Ok(m) => matchers.push(m),
            Err(e) => return error_response(StatusCode::BAD_REQUEST, &trace_id, "invalid_matcher", &e),
        }
    }

    let starts_at = req.starts_at.unwrap_or_else(Utc::now);
    let ends_at = match (req.ends_at, req.duration_secs) {
        (Some(end), _) => end,
        (None, Some(secs)) => {
            let end = i64::try_from(secs)
                .ok()
                .and_then(Duration::try_seconds)
                .and_then(|d| starts_at.checked_add_signed(d));
            match end {
                Some(end) => end,
                None => {
                    return error_response(
                        StatusCode::BAD_REQUEST,
                        &trace_id,
                        "invalid_silence",
                        "duration_secs is out of range",
                    )
                }
            }
        }
        (None, None) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &trace_id,
                "invalid_silence",
                "either ends_at or duration_secs is required",
            )
        }
    };

    match state
        .silences
        .create(matchers, starts_at, ends_at, req.created_by, req.comment)
    {
        Ok(silence) => success_response(StatusCode::CREATED, &trace_id, silence),
        Err(NotifyError::InvalidSilence(msg)) => {
            error_response(StatusCode::BAD_REQUEST, &trace_id, "invalid_silence", &msg)
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &trace_id, "internal_error", &e.to_string()),
    }
}

async fn expire_silence(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if state.silences.get(&id).is_none() {
        return error_response(StatusCode::NOT_FOUND, &trace_id, "not_found", "silence not found");
    }
    if state.silences.expire(&id, Utc::now()) {
        success_empty_response(StatusCode::OK, &trace_id, "silence expired")
    } else {
        error_response(StatusCode::CONFLICT, &trace_id, "conflict", "silence already ended")
    }
}

#[derive(Serialize)]
struct ReloadResponse {
    version: u64,
}

async fn reload(Extension(trace_id): Extension<TraceId>, State(state): State<AppState>) -> impl IntoResponse {
    match state.reload().await {
        Ok(version) => success_response(StatusCode::OK, &trace_id, ReloadResponse { version }),
        Err(e) => error_response(StatusCode::UNPROCESSABLE_ENTITY, &trace_id, "config_rejected", &e.to_string()),
    }
}

async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/alerts", get(list_alerts))
        .route("/v1/groups", get(list_groups))
        .route("/v1/notifications", get(list_notifications))
        .route("/v1/receivers", get(list_receivers))
        .route("/v1/silences", get(list_silences).post(create_silence))
        .route("/v1/silences/:id", delete(expire_silence))
        .route("/v1/reload", post(reload))
        .route("/metrics", get(prometheus_metrics))
}
