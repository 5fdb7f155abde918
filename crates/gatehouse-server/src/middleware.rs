//! Request authorization
//!
//! When an authorization rule is configured, every request is checked
//! against it before reaching a handler. The middleware has to read the
//! body to make it available to the policy, so the parsed document is
//! stashed in request extensions; the batch handler reuses it instead of
//! reading the body twice.

use axum::{
    body::{Body, to_bytes},
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};

use gatehouse_core::policy::Evaluator;
use gatehouse_core::policy::ast::RefBase;
use gatehouse_core::policy::compiler::parse_ref_str;
use gatehouse_core::store::{Author, TxnKind};

use crate::body;
use crate::server::AppState;

/// The request body as parsed by the authorizer.
#[derive(Debug, Clone)]
pub struct AuthorizedBody(pub Value);

/// Evaluate the configured authorization rule against the request.
pub async fn authorize(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(rule) = state.config.server.authorization.clone() else {
        return next.run(request).await;
    };
    let Ok((RefBase::Data, rule_path)) = parse_ref_str(&rule) else {
        return deny("authorization rule must be a data reference");
    };

    let (parts, raw_body) = request.into_parts();
    let bytes = match to_bytes(raw_body, state.config.server.max_request_size).await {
        Ok(bytes) => bytes,
        Err(_) => return deny("failed to read request body"),
    };
    let parsed = body::parse(
        &parts.headers,
        &bytes,
        state.config.server.gzip_max_length,
    )
    .unwrap_or(Value::Null);

    let allowed = {
        let compiled = state.compiled_snapshot();
        let txn = state
            .store
            .new_transaction(TxnKind::Read, Author::Public)
            .await;
        let input = json!({
            "method": parts.method.as_str(),
            "path": parts
                .uri
                .path()
                .trim_matches('/')
                .split('/')
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>(),
            "body": parsed.clone(),
        });
        let mut evaluator = Evaluator::new(&compiled, txn.data(), input);
        matches!(evaluator.eval_path(&rule_path), Ok(Some(value)) if value != Value::Bool(false))
    };

    if !allowed {
        return deny("request rejected by authorization policy");
    }

    let mut request = Request::from_parts(parts, Body::from(bytes));
    request.extensions_mut().insert(AuthorizedBody(parsed));
    next.run(request).await
}

fn deny(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        axum::Json(json!({"code": "unauthorized", "message": message})),
    )
        .into_response()
}
