//! Integration tests for the HTTP surface

mod authz_tests;
mod data_tests;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tower::ServiceExt;

use gatehouse_core::config::Config;
use gatehouse_core::policy::compiler::compile;
use gatehouse_core::policy::parser::parse_module;
use gatehouse_core::store::{Author, TxnKind};

use crate::server::{AppState, create_app};

/// Build an app with the given policy modules installed and deterministic
/// decision ids (`decision-0`, `decision-1`, ...).
pub async fn app_with_policies(sources: &[(&str, &str)]) -> (Router, AppState) {
    app_with_config_and_policies(Config::default(), sources).await
}

/// Like [`app_with_policies`], with a custom configuration.
pub async fn app_with_config_and_policies(
    config: Config,
    sources: &[(&str, &str)],
) -> (Router, AppState) {
    let mut state = AppState::new(config).expect("state");

    let counter = Arc::new(AtomicUsize::new(0));
    state.decision_ids = Arc::new(move || {
        format!("decision-{}", counter.fetch_add(1, Ordering::SeqCst))
    });

    let mut modules = Vec::new();
    let mut txn = state
        .store
        .new_transaction(TxnKind::Write, Author::System)
        .await;
    for (id, source) in sources {
        let module = Arc::new(parse_module(id, source).expect("parse module"));
        modules.push(Arc::clone(&module));
        state
            .store
            .upsert_policy(
                &mut txn,
                gatehouse_core::store::StoredPolicy {
                    id: (*id).to_string(),
                    source: (*source).to_string(),
                    module,
                },
            )
            .expect("upsert policy");
    }
    state.store.commit(txn);

    let compiled = compile(modules).expect("compile modules");
    state.swap_compiled(Arc::new(compiled)).await;

    (create_app(state.clone()), state)
}

/// POST a JSON body and decode the JSON response.
pub async fn post_json(
    app: &Router,
    uri: &str,
    body: Value,
    accept: Option<&str>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(accept) = accept {
        builder = builder.header(header::ACCEPT, accept);
    }
    let request = builder
        .body(Body::from(body.to_string()))
        .expect("request");

    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

/// Send an arbitrary request and decode the JSON response.
pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}
