//! Request-authorization tests

use axum::http::StatusCode;
use serde_json::json;

use gatehouse_core::config::Config;

use super::{app_with_config_and_policies, post_json};

const AUTHZ: &str = "package system.authz\n\nallow if input.body.inputs\n";

const GT1: &str = "package testmod\n\ngt1 if input.req1 > 1\n";

#[tokio::test]
async fn test_authorized_request_reuses_parsed_body() {
    let mut config = Config::default();
    config.server.authorization = Some("data.system.authz.allow".to_string());
    let (app, _state) =
        app_with_config_and_policies(config, &[("authz.rego", AUTHZ), ("gt1.rego", GT1)]).await;

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
async fn test_unauthorized_request_rejected() {
    let mut config = Config::default();
    config.server.authorization = Some("data.system.authz.allow".to_string());
    let (app, _state) =
        app_with_config_and_policies(config, &[("authz.rego", AUTHZ), ("gt1.rego", GT1)]).await;

    // No "inputs" key in the body: the policy denies the request before it
    // reaches the handler.
    let (status, body) = post_json(
        &app,
        "/v1/batch/data/testmod/gt1",
        json!({"other": true}),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], json!("unauthorized"));
}
