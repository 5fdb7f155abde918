//! Data and policy management handlers
//!
//! The minimal read/write surface of the base runtime: document reads
//! evaluate rules and raw data together; writes go through the public-API
//! author and are therefore subject to plugin mount ownership. Policy
//! upserts recompile the full module set and swap the live compiler.

use axum::{
    Json,
    body::Bytes,
    extract::{Path as UrlPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

use gatehouse_core::policy::compiler::compile;
use gatehouse_core::policy::parser::parse_module;
use gatehouse_core::policy::{Evaluator, query_path_segments};
use gatehouse_core::store::{Author, Path, StoredPolicy, TxnKind, WriteOp};

use crate::error::{ServerError, ServerResult};
use crate::server::AppState;

/// `GET /v1/data`
pub async fn get_root(state: State<AppState>) -> ServerResult<Json<Value>> {
    read_document(&state, "").await
}

/// `GET /v1/data/<path>`
pub async fn get_data(
    state: State<AppState>,
    UrlPath(path): UrlPath<String>,
) -> ServerResult<Json<Value>> {
    read_document(&state, &path).await
}

async fn read_document(state: &AppState, path: &str) -> ServerResult<Json<Value>> {
    let txn = state
        .store
        .new_transaction(TxnKind::Read, Author::Public)
        .await;
    let compiled = state.compiled_snapshot();
    let query_path = query_path_segments(path);

    let mut evaluator = Evaluator::new(&compiled, txn.data(), Value::Null);
    let result = evaluator
        .eval_path(&query_path)
        .map_err(|e| ServerError::Internal(e.to_string()))?;

    let mut body = json!({});
    if let Some(result) = result {
        body["result"] = result;
    }
    Ok(Json(body))
}

/// `PUT /v1/data`
pub async fn put_root(state: State<AppState>, raw: Bytes) -> ServerResult<Response> {
    write_document(&state, "", &raw).await
}

/// `PUT /v1/data/<path>`
pub async fn put_data(
    state: State<AppState>,
    UrlPath(path): UrlPath<String>,
    raw: Bytes,
) -> ServerResult<Response> {
    write_document(&state, &path, &raw).await
}

async fn write_document(state: &AppState, path: &str, raw: &Bytes) -> ServerResult<Response> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| ServerError::InvalidParameter(format!("invalid JSON body: {e}")))?;
    let target = Path::parse(path)?;

    let mut txn = state
        .store
        .new_transaction(TxnKind::Write, Author::Public)
        .await;
    state.store.make_dirs(&mut txn, &target)?;
    state.store.write(&mut txn, WriteOp::Add, &target, value)?;
    state.store.commit(txn);

    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `PUT /v1/policies/<id>`
pub async fn put_policy(
    state: State<AppState>,
    UrlPath(id): UrlPath<String>,
    source: String,
) -> ServerResult<Json<Value>> {
    let module = Arc::new(
        parse_module(&id, &source).map_err(|e| ServerError::Compile(e.to_string()))?,
    );

    let mut txn = state
        .store
        .new_transaction(TxnKind::Write, Author::Public)
        .await;

    let mut modules: Vec<Arc<_>> = state
        .store
        .policies(&txn)
        .into_iter()
        .filter(|policy| policy.id != id)
        .map(|policy| policy.module)
        .collect();
    modules.push(Arc::clone(&module));

    let compiled = compile(modules).map_err(|errors| {
        ServerError::Compile(
            errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        )
    })?;

    state.store.upsert_policy(
        &mut txn,
        StoredPolicy {
            id: id.clone(),
            source,
            module,
        },
    )?;
    state.store.commit(txn);
    state.swap_compiled(Arc::new(compiled)).await;

    info!(policy = %id, "policy installed");
    Ok(Json(json!({})))
}

/// `DELETE /v1/policies/<id>`
pub async fn delete_policy(
    state: State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> ServerResult<Json<Value>> {
    let mut txn = state
        .store
        .new_transaction(TxnKind::Write, Author::Public)
        .await;

    state.store.delete_policy(&mut txn, &id)?;
    let modules: Vec<Arc<_>> = state
        .store
        .policies(&txn)
        .into_iter()
        .map(|policy| policy.module)
        .collect();
    let compiled = compile(modules).map_err(|errors| {
        ServerError::Compile(
            errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        )
    })?;

    state.store.commit(txn);
    state.swap_compiled(Arc::new(compiled)).await;

    info!(policy = %id, "policy removed");
    Ok(Json(json!({})))
}
