mod common;

use axum::http::StatusCode;
use common::{at, build_test_context, labels, request_json, request_no_body, single_rule_config};
use serde_json::json;

const EXPR: &str = "error_rate > 0.05";

#[tokio::test]
async fn health_reports_config_version_and_receivers() {
    let ctx = build_test_context(&single_rule_config(0, 30, 300, 3600)).unwrap();

    let (status, body) = request_no_body(&ctx.app, "GET", "/v1/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["err_code"], 0);
    assert_eq!(body["data"]["config_version"], 1);
    assert_eq!(body["data"]["rules"], 1);
    assert_eq!(body["data"]["degraded"], false);
    assert_eq!(body["data"]["receivers"][0]["receiver"], "pager");
    assert!(!body["trace_id"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn alerts_and_groups_are_exported() {
    let ctx = build_test_context(&single_rule_config(0, 30, 300, 3600)).unwrap();
    ctx.metrics.set(
        EXPR,
        vec![
            (labels(&[("service", "checkout")]), 0.12),
            (labels(&[("service", "search")]), 0.07),
        ],
    );
    ctx.step(at(0)).await;

    let (status, body) = request_no_body(&ctx.app, "GET", "/v1/alerts").await;
    assert_eq!(status, StatusCode::OK);
    let alerts = body["data"].as_array().unwrap();
    assert_eq!(alerts.len(), 2);
    assert!(alerts.iter().all(|a| a["state"] == "firing"));
    assert!(alerts.iter().all(|a| a["suppressed"].is_null()));
    assert!(alerts.iter().all(|a| a["groups"].as_array().unwrap().len() == 1));
    assert_eq!(alerts[0]["fingerprint"].as_str().unwrap().len(), 16);

    let (_, body) = request_no_body(&ctx.app, "GET", "/v1/alerts?state=pending").await;
    assert!(body["data"].as_array().unwrap().is_empty());

    let (status, body) = request_no_body(&ctx.app, "GET", "/v1/groups").await;
    assert_eq!(status, StatusCode::OK);
    let groups = body["data"].as_array().unwrap();
    assert_eq!(groups.len(), 2);
    assert!(groups.iter().all(|g| g["route_id"] == "0" && g["flushed"] == false));
}

#[tokio::test]
async fn silences_can_be_created_listed_and_expired() {
    let ctx = build_test_context(&single_rule_config(0, 30, 300, 3600)).unwrap();
    ctx.metrics.set(EXPR, vec![(labels(&[("service", "checkout")]), 0.12)]);
    ctx.step(at(0)).await;

    let (status, body) = request_json(
        &ctx.app,
        "POST",
        "/v1/silences",
        Some(json!({
            "matchers": ["service=\"checkout\""],
            "duration_secs": 3600,
            "created_by": "ops",
            "comment": "maintenance"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["data"]["id"].as_str().unwrap().to_string();
    assert!(id.starts_with("silence-"));
    assert_eq!(body["data"]["matchers"][0], "service=\"checkout\"");

    let (_, body) = request_no_body(&ctx.app, "GET", "/v1/silences").await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (_, body) = request_no_body(&ctx.app, "GET", "/v1/alerts?suppressed=true").await;
    let alerts = body["data"].as_array().unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0]["suppressed"]["reason"], "silenced");
    assert_eq!(alerts[0]["suppressed"]["by"][0], id.as_str());

    let (status, _) = request_no_body(&ctx.app, "DELETE", &format!("/v1/silences/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = request_no_body(&ctx.app, "DELETE", &format!("/v1/silences/{id}")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, body) = request_no_body(&ctx.app, "DELETE", "/v1/silences/silence-0").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["err_code"], 1004);

    let (_, body) = request_no_body(&ctx.app, "GET", "/v1/alerts?suppressed=true").await;
    assert!(body["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn invalid_silences_are_rejected() {
    let ctx = build_test_context(&single_rule_config(0, 30, 300, 3600)).unwrap();

    let (status, body) = request_json(
        &ctx.app,
        "POST",
        "/v1/silences",
        Some(json!({ "matchers": ["service=~\"(\""], "duration_secs": 60 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["err_code"], 1201);

    let (status, body) = request_json(
        &ctx.app,
        "POST",
        "/v1/silences",
        Some(json!({ "matchers": [], "duration_secs": 60 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["err_code"], 1202);

    let (status, _) = request_json(
        &ctx.app,
        "POST",
        "/v1/silences",
        Some(json!({ "matchers": ["service=\"checkout\""] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn out_of_range_silence_duration_is_rejected() {
    let ctx = build_test_context(&single_rule_config(0, 30, 300, 3600)).unwrap();

    let (status, body) = request_json(
        &ctx.app,
        "POST",
        "/v1/silences",
        Some(json!({ "matchers": ["service=\"checkout\""], "duration_secs": 10_000_000_000_000u64 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["err_code"], 1202);
    assert!(ctx.silences.list().is_empty());

    let (status, _) = request_json(
        &ctx.app,
        "POST",
        "/v1/silences",
        Some(json!({ "matchers": ["service=\"checkout\""], "duration_secs": u64::MAX })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn reload_endpoint_applies_or_rejects_the_file() {
    let ctx = build_test_context(&single_rule_config(0, 30, 300, 3600)).unwrap();

    ctx.write_config(&single_rule_config(0, 10, 60, 600));
    let (status, body) = request_no_body(&ctx.app, "POST", "/v1/reload").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["version"], 2);
    assert_eq!(ctx.engine.snapshot().router.root().policy.group_wait_secs, 10);

    ctx.write_config("[route]\nreceivers = [\"nobody\"]\n");
    let (status, body) = request_no_body(&ctx.app, "POST", "/v1/reload").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["err_code"], 1301);
    assert_eq!(ctx.engine.snapshot().version, 2);
}

#[tokio::test]
async fn receivers_are_listed_with_secrets_redacted() {
    let config = format!(
        "{}\n[[receivers]]\nname = \"hooks\"\ntype = \"webhook\"\n[receivers.config]\nurl = \"https://hooks.example.com\"\n[receivers.config.headers]\nAuthorization = \"Bearer abc\"\n",
        single_rule_config(0, 30, 300, 3600)
    );
    let ctx = build_test_context(&config).unwrap();

    let (status, body) = request_no_body(&ctx.app, "GET", "/v1/receivers").await;
    assert_eq!(status, StatusCode::OK);
    let receivers = body["data"].as_array().unwrap();
    assert_eq!(receivers.len(), 2);
    let hooks = receivers.iter().find(|r| r["name"] == "hooks").unwrap();
    assert_eq!(hooks["type"], "webhook");
    assert_eq!(hooks["config"]["url"], "https://hooks.example.com");
    assert_eq!(hooks["config"]["headers"]["Authorization"], "***");
}
