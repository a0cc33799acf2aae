//! API contract tests: validation, authentication, and error mapping.

mod common;

use axum::http::StatusCode;
use serde_json::json;

#[tokio::test(flavor = "multi_thread")]
async fn missing_fields_are_rejected() {
    let app = common::spawn_app().await;

    let (status, body) = app
        .request(
            "POST",
            "/api/v1/logs",
            Some(json!({
                "agent_id": "a1",
                "step_id": 1,
                "input_data": {},
                "output": {}
                // reasoning missing entirely
            })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "serde rejects the body shape");
    let _ = body;

    let (status, body) = app
        .request(
            "POST",
            "/api/v1/logs",
            Some(json!({
                "agent_id": "   ",
                "step_id": 1,
                "input_data": {},
                "output": {},
                "reasoning": "present but the agent id is blank"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation");
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_bulk_is_rejected() {
    let app = common::spawn_app().await;

    let (status, body) = app
        .request("POST", "/api/v1/logs/bulk", Some(json!({"logs": []})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation");
}

#[tokio::test(flavor = "multi_thread")]
async fn bulk_rejects_any_invalid_entry() {
    let app = common::spawn_app().await;

    let (status, body) = app
        .request(
            "POST",
            "/api/v1/logs/bulk",
            Some(json!({
                "logs": [
                    {
                        "agent_id": "a1",
                        "step_id": 1,
                        "input_data": {},
                        "output": {},
                        "reasoning": "a perfectly fine bulk entry"
                    },
                    {
                        "agent_id": "",
                        "step_id": 2,
                        "input_data": {},
                        "output": {},
                        "reasoning": "blank agent id on the second entry"
                    }
                ]
            })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let message = body["error"]["message"].as_str().unwrap();
    assert!(message.contains("log 1"), "error names the offending index: {message}");
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_log_is_not_found() {
    let app = common::spawn_app().await;

    let (status, body) = app.request("GET", "/api/v1/logs/ghost/42", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "not_found");

    let (status, _) = app
        .request(
            "PUT",
            "/api/v1/logs/ghost/42",
            Some(json!({"reviewed": true})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_update_is_rejected() {
    let app = common::spawn_app().await;

    let (status, body) = app
        .request("PUT", "/api/v1/logs/a1/1", Some(json!({})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation");
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_search_status_is_rejected() {
    let app = common::spawn_app().await;

    let (status, body) = app
        .request("GET", "/api/v1/logs/search?status=bogus", None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation");
}

#[tokio::test(flavor = "multi_thread")]
async fn protected_routes_require_a_token() {
    let app = common::spawn_app().await;

    let (status, _) = app
        .request_with_token("GET", "/api/v1/logs/a1", None, None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .request_with_token("GET", "/api/v1/logs/a1", Some("garbage"), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .request_with_token(
            "POST",
            "/api/v1/logs",
            None,
            Some(json!({
                "agent_id": "a1",
                "step_id": 1,
                "input_data": {},
                "output": {},
                "reasoning": "valid but unauthenticated"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test(flavor = "multi_thread")]
async fn login_exchanges_credentials_for_a_working_token() {
    let app = common::spawn_app().await;

    let (status, body) = app
        .request_with_token(
            "POST",
            "/api/v1/auth/login",
            None,
            Some(json!({"username": "auditor", "password": "hunter2"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tokenType"], "Bearer");
    let token = body["token"].as_str().unwrap().to_string();

    let (status, _) = app
        .request_with_token("GET", "/api/v1/logs/anyone", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread")]
async fn login_rejects_bad_credentials() {
    let app = common::spawn_app().await;

    let (status, body) = app
        .request_with_token(
            "POST",
            "/api/v1/auth/login",
            None,
            Some(json!({"username": "auditor", "password": "wrong"})),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["kind"], "authorization");
}

#[tokio::test(flavor = "multi_thread")]
async fn health_routes_are_public() {
    let app = common::spawn_app().await;

    let (status, body) = app
        .request_with_token("GET", "/healthz", None, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = app.request_with_token("GET", "/readyz", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
}

#[tokio::test(flavor = "multi_thread")]
async fn metrics_expose_bus_and_store_counters() {
    let app = common::spawn_app().await;

    app.request(
        "POST",
        "/api/v1/logs",
        Some(json!({
            "agent_id": "m1",
            "step_id": 1,
            "input_data": {},
            "output": {},
            "reasoning": "one log so the counters move"
        })),
    )
    .await;
    app.wait_for_log("m1", 1).await;

    let request = axum::http::Request::builder()
        .method("GET")
        .uri("/metrics")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = tower::ServiceExt::oneshot(app.app.clone(), request)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("docket_store_logs_total 1"), "{text}");
    assert!(text.contains("docket_bus_subject_depth{subject=\"logs.create\"}"), "{text}");
    assert!(text.contains("docket_audit_entries_total 1"), "{text}");
}
