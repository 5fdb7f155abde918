//! Batch query handler
//!
//! `POST /v1/batch/data[/<path>]` evaluates one prepared query against many
//! inputs concurrently. Workers split the inputs into balanced chunks over
//! one shared data snapshot; per-input evaluation errors never abort the
//! batch, and a pool-wide cancel cause stops remaining work when a worker
//! hits an infrastructure failure. Responses come back in deterministic
//! key order.

use axum::{
    Json,
    body::Bytes,
    extract::{Extension, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use gatehouse_core::policy::evaluator::EvalError;
use gatehouse_core::policy::{CancelFlag, PreparedQuery, query_path_segments};
use gatehouse_core::store::{Author, TxnKind};

use crate::decision_log::{CUSTOM_TYPE_BATCH, DecisionRecord, bundle_revisions};
use crate::error::ServerResult;
use crate::middleware::AuthorizedBody;
use crate::server::AppState;

use super::DecisionParams;

/// `POST /v1/batch/data`
pub async fn batch_root(
    state: State<AppState>,
    params: Query<DecisionParams>,
    headers: HeaderMap,
    pre_parsed: Option<Extension<AuthorizedBody>>,
    raw: Bytes,
) -> Response {
    handle(state, String::new(), params, headers, pre_parsed, raw).await
}

/// `POST /v1/batch/data/<path>`
pub async fn batch(
    state: State<AppState>,
    axum::extract::Path(path): axum::extract::Path<String>,
    params: Query<DecisionParams>,
    headers: HeaderMap,
    pre_parsed: Option<Extension<AuthorizedBody>>,
    raw: Bytes,
) -> Response {
    handle(state, path, params, headers, pre_parsed, raw).await
}

async fn handle(
    State(state): State<AppState>,
    path: String,
    Query(params): Query<DecisionParams>,
    headers: HeaderMap,
    pre_parsed: Option<Extension<AuthorizedBody>>,
    raw: Bytes,
) -> Response {
    match run(&state, &path, &params, &headers, pre_parsed, &raw).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

#[derive(Debug)]
enum Outcome {
    Success(Option<Value>),
    Error(String),
}

async fn run(
    state: &AppState,
    path: &str,
    params: &DecisionParams,
    headers: &HeaderMap,
    pre_parsed: Option<Extension<AuthorizedBody>>,
    raw: &Bytes,
) -> ServerResult<Response> {
    let started = Instant::now();
    state.metrics.batch_requests.inc();

    // The authorizer already read and parsed the body; don't do it twice.
    let parsed = match pre_parsed {
        Some(Extension(AuthorizedBody(value))) => value,
        None => crate::body::parse(headers, raw, state.config.server.gzip_max_length)?,
    };

    let batch_decision_id = state.decision_id();
    let query_path = query_path_segments(path);

    let Some(inputs) = parsed.get("inputs").and_then(Value::as_object).cloned() else {
        let body = json!({
            "batch_decision_id": batch_decision_id,
            "responses": {},
            "warning": {
                "code": "api_usage_warning",
                "message": "'inputs' key missing from the request"
            }
        });
        return Ok((StatusCode::OK, Json(body)).into_response());
    };
    let common_input = parsed.get("common_input").cloned();

    // One read transaction and one prepared query serve every worker.
    let txn = state
        .store
        .new_transaction(TxnKind::Read, Author::Public)
        .await;
    let data = Arc::new(txn.data().clone());
    let compiled = state.compiled_snapshot();
    let prepared = state
        .prepared
        .get_or_prepare(&compiled, &query_path, params.strict_builtins());

    let inputs: Vec<(String, Value)> = inputs.into_iter().collect();
    let input_map: BTreeMap<String, Value> = inputs.iter().cloned().collect();
    let total = inputs.len();
    state.metrics.batch_inputs.inc_by(total as u64);

    let outcomes = evaluate_all(inputs, common_input.as_ref(), &prepared, &data).await;

    // Assemble in deterministic key order.
    let ordered: BTreeMap<String, Outcome> = outcomes.into_iter().collect();
    let successes = ordered
        .values()
        .filter(|o| matches!(o, Outcome::Success(_)))
        .count();
    let failures = ordered.len() - successes;
    state.metrics.batch_failures.inc_by(failures as u64);

    let status = if total == 0 || failures == 0 {
        StatusCode::OK
    } else if successes == 0 {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::MULTI_STATUS
    };
    let mixed = successes > 0 && failures > 0;

    let revisions = bundle_revisions(&data);
    let mut responses = Map::new();
    for (key, outcome) in &ordered {
        let decision_id = state.decision_id();
        let mut entry = Map::new();
        entry.insert("decision_id".to_string(), json!(decision_id));
        match outcome {
            Outcome::Success(result) => {
                if let Some(result) = result {
                    entry.insert("result".to_string(), result.clone());
                }
                if mixed {
                    entry.insert("http_status_code".to_string(), json!("200"));
                }
            }
            Outcome::Error(message) => {
                entry.insert("code".to_string(), json!("internal_error"));
                entry.insert("message".to_string(), json!(message));
                if mixed {
                    entry.insert("http_status_code".to_string(), json!("500"));
                }
            }
        }
        responses.insert(key.clone(), Value::Object(entry));

        let mut record =
            DecisionRecord::new(CUSTOM_TYPE_BATCH, decision_id, query_path.join("/"));
        record.batch_decision_id = Some(batch_decision_id.clone());
        record.input = input_map.get(key).cloned();
        record.bundles = revisions.clone();
        match outcome {
            Outcome::Success(result) => record.result = result.clone(),
            Outcome::Error(message) => record.error = Some(message.clone()),
        }
        state.decision_log.emit(record);
    }

    let mut body = Map::new();
    body.insert("batch_decision_id".to_string(), json!(batch_decision_id));
    body.insert("responses".to_string(), Value::Object(responses));
    if params.wants_metrics() {
        body.insert(
            "metrics".to_string(),
            json!({
                "timer_server_handler_ns": started.elapsed().as_nanos() as u64,
                "counter_batch_inputs": total,
            }),
        );
    }
    debug!(
        inputs = total,
        failures,
        status = %status,
        "batch request complete"
    );
    Ok((status, Json(Value::Object(body))).into_response())
}

/// Fan the inputs out over balanced worker chunks.
async fn evaluate_all(
    inputs: Vec<(String, Value)>,
    common_input: Option<&Value>,
    prepared: &Arc<PreparedQuery>,
    data: &Arc<Value>,
) -> Vec<(String, Outcome)> {
    if inputs.is_empty() {
        return Vec::new();
    }

    let workers = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
        .min(inputs.len());
    let chunks = split_balanced(inputs, workers);

    let cancel = CancelFlag::new();
    let common = Arc::new(common_input.cloned());

    let mut handles = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let prepared = Arc::clone(prepared);
        let data = Arc::clone(data);
        let common = Arc::clone(&common);
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            let mut results = Vec::with_capacity(chunk.len());
            for (key, input) in chunk {
                // Once the pool-wide cause is latched, remaining inputs
                // answer with internal errors instead of evaluating.
                if cancel.is_cancelled() {
                    results.push((key, Outcome::Error("evaluation cancelled".to_string())));
                    continue;
                }
                let effective = merge_inputs(common.as_ref().as_ref(), &input);
                let outcome = prepared.eval(&data, effective, cancel.clone());
                let entry = match outcome.result {
                    Ok(result) => Outcome::Success(result),
                    Err(EvalError::Cancelled) => {
                        Outcome::Error("evaluation cancelled".to_string())
                    }
                    Err(err) => Outcome::Error(err.to_string()),
                };
                for line in outcome.prints {
                    debug!(key = %key, print = %line, "batch eval print");
                }
                results.push((key, entry));
            }
            results
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(results) => all.extend(results),
            Err(join_err) => {
                // A worker died: latch the cause so the remaining workers
                // stop starting new evaluations.
                cancel.cancel();
                debug!(error = %join_err, "batch worker panicked");
            }
        }
    }
    all
}

/// Split into `workers` chunks whose sizes differ by at most one.
fn split_balanced(inputs: Vec<(String, Value)>, workers: usize) -> Vec<Vec<(String, Value)>> {
    let total = inputs.len();
    let base = total / workers;
    let remainder = total % workers;
    let mut chunks = Vec::with_capacity(workers);
    let mut iter = inputs.into_iter();
    for index in 0..workers {
        let size = base + usize::from(index < remainder);
        chunks.push(iter.by_ref().take(size).collect());
    }
    chunks
}

/// Merge `common_input` under the per-query input: objects merge
/// recursively with the per-query side winning on conflicting leaves; any
/// type mismatch takes the per-query value unmodified.
fn merge_inputs(common: Option<&Value>, input: &Value) -> Value {
    match common {
        Some(common) => merge_values(common, input),
        None => input.clone(),
    }
}

fn merge_values(common: &Value, input: &Value) -> Value {
    match (common, input) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut merged = base.clone();
            for (key, value) in overlay {
                let entry = match base.get(key) {
                    Some(existing) => merge_values(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), entry);
            }
            Value::Object(merged)
        }
        _ => input.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_balanced() {
        let inputs: Vec<(String, Value)> = (0..7).map(|i| (format!("k{i}"), json!(i))).collect();
        let chunks = split_balanced(inputs, 3);
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 2, 2]);
    }

    #[test]
    fn test_split_balanced_fewer_inputs_than_workers() {
        let inputs: Vec<(String, Value)> = (0..2).map(|i| (format!("k{i}"), json!(i))).collect();
        let chunks = split_balanced(inputs, 2);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len() + chunks[1].len(), 2);
    }

    #[test]
    fn test_merge_inputs_recursive() {
        let common = json!({
            "user": {"company": "Acme", "type": "user"},
            "action": "read",
            "object": "id1"
        });
        let input = json!({
            "user": {"name": "alice", "type": "admin"},
            "action": "write"
        });
        let merged = merge_inputs(Some(&common), &input);
        assert_eq!(
            merged,
            json!({
                "user": {"name": "alice", "company": "Acme", "type": "admin"},
                "action": "write",
                "object": "id1"
            })
        );
    }

    #[test]
    fn test_merge_inputs_type_mismatch_takes_input() {
        let common = json!({"a": {"b": 1}});
        let input = json!([1, 2, 3]);
        assert_eq!(merge_inputs(Some(&common), &input), json!([1, 2, 3]));

        let common = json!({"a": {"b": 1}});
        let input = json!({"a": 7});
        assert_eq!(merge_inputs(Some(&common), &input), json!({"a": 7}));
    }
}
