//! Data, policy, and health endpoint tests

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::json;

use gatehouse_core::store::Path;

use super::{app_with_policies, post_json, send};

#[tokio::test]
async fn test_put_then_get_data() {
    let (app, _state) = app_with_policies(&[]).await;

    let request = Request::builder()
        .method("PUT")
        .uri("/v1/data/roles/admins")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"["alice", "bob"]"#))
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let request = Request::builder()
        .method("GET")
        .uri("/v1/data/roles/admins")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], json!(["alice", "bob"]));
}

#[tokio::test]
async fn test_public_write_rejected_under_plugin_mount() {
    let (app, state) = app_with_policies(&[]).await;
    state
        .store
        .ownership()
        .claim(Path::parse("/plugins/users").unwrap(), "ldap.users")
        .unwrap();

    let request = Request::builder()
        .method("PUT")
        .uri("/v1/data/plugins/users/alice")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let (status, body) = send(&app, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], json!("invalid_parameter"));
    assert!(body["message"].as_str().unwrap().contains("ldap.users"));

    // The mount contents were never touched.
    let request = Request::builder()
        .method("GET")
        .uri("/v1/data/plugins/users")
        .body(Body::empty())
        .unwrap();
    let (_, body) = send(&app, request).await;
    assert!(body.get("result").is_none());
}

#[tokio::test]
async fn test_policy_install_swaps_compiler() {
    let (app, state) = app_with_policies(&[]).await;

    // Seed the prepared-query cache with a miss on the empty compiler.
    let (status, _) = post_json(
        &app,
        "/v1/batch/data/testmod/gt1",
        json!({"inputs": {"A": {"req1": 2}}}),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state.prepared.len(), 1);

    let request = Request::builder()
        .method("PUT")
        .uri("/v1/policies/gt1.rego")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from("package testmod\n\ngt1 if input.req1 > 1\n"))
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);

    // Installing the policy invalidated the prepared-query cache.
    assert!(state.prepared.is_empty());

    let (status, body) = post_json(
        &app,
        "/v1/batch/data/testmod/gt1",
        json!({"inputs": {"A": {"req1": 2}}}),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["responses"]["A"]["result"], json!(true));
}

#[tokio::test]
async fn test_policy_parse_error_is_400() {
    let (app, _state) = app_with_policies(&[]).await;
    let request = Request::builder()
        .method("PUT")
        .uri("/v1/policies/bad.rego")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from("package bad\n\np :=\n"))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], json!("invalid_parameter"));
}

#[tokio::test]
async fn test_policy_delete() {
    let (app, _state) = app_with_policies(&[(
        "gt1.rego",
        "package testmod\n\ngt1 if input.req1 > 1\n",
    )])
    .await;

    let request = Request::builder()
        .method("DELETE")
        .uri("/v1/policies/gt1.rego")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);

    // The rule is gone: evaluation is undefined now.
    let (status, body) = post_json(
        &app,
        "/v1/batch/data/testmod/gt1",
        json!({"inputs": {"A": {"req1": 2}}}),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["responses"]["A"].get("result").is_none());
}

#[tokio::test]
async fn test_get_data_merges_rules_and_raw_data() {
    let (app, _state) = app_with_policies(&[(
        "derived.rego",
        "package app\n\ntotal := count(data.app.items) if true\n",
    )])
    .await;

    let request = Request::builder()
        .method("PUT")
        .uri("/v1/data/app/items")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("[1, 2, 3]"))
        .unwrap();
    send(&app, request).await;

    let request = Request::builder()
        .method("GET")
        .uri("/v1/data/app")
        .body(Body::empty())
        .unwrap();
    let (_, body) = send(&app, request).await;
    assert_eq!(body["result"]["items"], json!([1, 2, 3]));
    assert_eq!(body["result"]["total"], json!(3));
}

#[tokio::test]
async fn test_health_and_metrics() {
    let (app, _state) = app_with_policies(&[]).await;

    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("ok"));

    let request = Request::builder()
        .method("GET")
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.0, StatusCode::OK);
}
