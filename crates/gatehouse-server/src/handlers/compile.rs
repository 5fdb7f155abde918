//! Compile/filter handler
//!
//! `POST /v1/compile[/<path>]` partially evaluates a query against declared
//! unknowns and returns the residual in the encoding the `Accept` header
//! asks for: raw residual queries, a UCAST tree, a SQL WHERE fragment, or
//! the multi-target envelope. Residuals that cannot be expressed for the
//! chosen target come back as 400s carrying `pe_fragment_error` entries
//! with source locations.

use axum::{
    Json,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::{Map, Value, json};
use std::time::Instant;
use tracing::debug;

use gatehouse_core::filter::{
    self, SqlDialect, TableMappings, TargetKind, TargetSpec, UcastVariant,
};
use gatehouse_core::policy::ast::RefBase;
use gatehouse_core::policy::compiler::parse_ref_str;
use gatehouse_core::policy::partial::{PartialError, PartialOptions, partial_eval};
use gatehouse_core::policy::{Evaluator, query_path_segments};
use gatehouse_core::store::{Author, TxnKind};

use crate::accept::{ResponseTarget, response_target};
use crate::decision_log::{CUSTOM_TYPE_COMPILE, DecisionRecord, bundle_revisions};
use crate::error::{ServerError, ServerResult};
use crate::server::AppState;

use super::DecisionParams;

/// `POST /v1/compile`
pub async fn compile_root(
    state: State<AppState>,
    params: Query<DecisionParams>,
    headers: HeaderMap,
    raw: Bytes,
) -> Response {
    handle(state, String::new(), params, headers, raw).await
}

/// `POST /v1/compile/<path>`
pub async fn compile(
    state: State<AppState>,
    axum::extract::Path(path): axum::extract::Path<String>,
    params: Query<DecisionParams>,
    headers: HeaderMap,
    raw: Bytes,
) -> Response {
    handle(state, path, params, headers, raw).await
}

async fn handle(
    State(state): State<AppState>,
    path: String,
    Query(params): Query<DecisionParams>,
    headers: HeaderMap,
    raw: Bytes,
) -> Response {
    match run(&state, &path, &params, &headers, &raw).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Default)]
struct CompileOptions {
    dialect: Option<String>,
    disable_inlining: Vec<String>,
    nondeterministic_builtins: bool,
    mappings: TableMappings,
    mask_rule: Option<String>,
    target_dialects: Option<Vec<String>>,
}

impl CompileOptions {
    fn from_body(body: &Value) -> ServerResult<Self> {
        let Some(options) = body.get("options") else {
            return Ok(Self::default());
        };
        let mappings = match options.get("targetSQLTableMappings") {
            Some(raw) => serde_json::from_value(raw.clone()).map_err(|e| {
                ServerError::InvalidParameter(format!("invalid targetSQLTableMappings: {e}"))
            })?,
            None => TableMappings::new(),
        };
        Ok(Self {
            dialect: options
                .get("dialect")
                .and_then(Value::as_str)
                .map(str::to_string),
            disable_inlining: options
                .get("disableInlining")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            nondeterministic_builtins: options
                .get("nondeterministicBuiltins")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            mappings,
            mask_rule: options
                .get("maskRule")
                .and_then(Value::as_str)
                .map(str::to_string),
            target_dialects: options
                .get("targetDialects")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                }),
        })
    }
}

#[allow(clippy::too_many_lines)]
async fn run(
    state: &AppState,
    path: &str,
    params: &DecisionParams,
    headers: &HeaderMap,
    raw: &Bytes,
) -> ServerResult<Response> {
    let started = Instant::now();
    state.metrics.compile_requests.inc();

    let body = crate::body::parse(headers, raw, state.config.server.gzip_max_length)?;
    let options = CompileOptions::from_body(&body)?;
    let input = body.get("input").cloned().unwrap_or(Value::Null);

    let query_path = if path.is_empty() {
        let query = body
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| ServerError::InvalidParameter("missing query".to_string()))?;
        let trimmed = query.strip_prefix("data.").unwrap_or(query);
        trimmed
            .split('.')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>()
    } else {
        query_path_segments(path)
    };
    if query_path.is_empty() {
        return Err(ServerError::InvalidParameter("empty query".to_string()));
    }

    let txn = state
        .store
        .new_transaction(TxnKind::Read, Author::Public)
        .await;
    let data = txn.data().clone();
    let compiled = state.compiled_snapshot();

    // Unknowns: request body first, rule metadata second, `input` last.
    let annotations = compiled
        .rule_at(&query_path)
        .map(|rule| rule.annotations.clone())
        .unwrap_or_default();
    let raw_unknowns: Vec<String> = match body.get("unknowns").and_then(Value::as_array) {
        Some(items) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    ServerError::InvalidParameter("unknowns must be strings".to_string())
                })
            })
            .collect::<ServerResult<_>>()?,
        None if !annotations.unknowns.is_empty() => annotations.unknowns.clone(),
        None => vec!["input".to_string()],
    };
    let mut unknowns = Vec::with_capacity(raw_unknowns.len());
    for raw_unknown in &raw_unknowns {
        if raw_unknown == "input" {
            unknowns.push((RefBase::Input, Vec::new()));
            continue;
        }
        let (base, ref_path) = parse_ref_str(raw_unknown).map_err(|bad| {
            ServerError::InvalidParameter(format!(
                "unknown \"{bad}\" must be prefixed with input or data"
            ))
        })?;
        unknowns.push((base, ref_path));
    }

    let target = resolve_target(headers, options.dialect.as_deref())?;
    let nondeterministic = options.nondeterministic_builtins || target.is_some();

    let partial_options = PartialOptions {
        unknowns: unknowns.clone(),
        nondeterministic_builtins: nondeterministic,
        disable_inlining: options.disable_inlining.clone(),
    };
    let partial = partial_eval(&compiled, &data, &input, &query_path, &partial_options)
        .map_err(|err| match err {
            PartialError::Unsupported { message, location } => {
                ServerError::InvalidParameter(format!("{location}: {message}"))
            }
            PartialError::Eval(eval) => ServerError::Internal(eval.to_string()),
        })?;

    let hints = filter::hints::from_fails(&partial.fails, &unknowns);

    let result = match target {
        None => {
            let queries: Vec<Value> = partial
                .queries
                .iter()
                .map(|query| {
                    Value::Array(
                        query
                            .exprs
                            .iter()
                            .map(|expr| Value::String(expr.to_string()))
                            .collect(),
                    )
                })
                .collect();
            json!({"queries": queries})
        }
        Some(kind) => {
            let spec = TargetSpec::for_kind(kind);
            let violations = filter::check_queries(&partial.queries, &spec);
            if !violations.is_empty() {
                return Err(ServerError::Fragment(
                    violations
                        .iter()
                        .map(|violation| {
                            let mut entry = json!({
                                "code": "pe_fragment_error",
                                "message": violation.message,
                                "location": violation.location,
                            });
                            if let Some(details) = &violation.details {
                                entry["details"] = details.clone();
                            }
                            entry
                        })
                        .collect(),
                ));
            }

            let translation = filter::to_ucast(&partial.queries, &options.mappings)
                .map_err(|e| ServerError::InvalidParameter(e.to_string()))?;
            match kind {
                TargetKind::Ucast(_) => translation.to_ucast_value(),
                TargetKind::Sql(dialect) => {
                    let rendered = filter::to_sql(&translation, dialect)
                        .map_err(|e| ServerError::InvalidParameter(e.to_string()))?;
                    Value::String(rendered)
                }
                TargetKind::Multitarget => {
                    let mut envelope = Map::new();
                    for dialect in selected_dialects(options.target_dialects.as_deref()) {
                        let rendered = filter::to_sql(&translation, dialect)
                            .map_err(|e| ServerError::InvalidParameter(e.to_string()))?;
                        envelope.insert(dialect.to_string(), Value::String(rendered));
                    }
                    envelope.insert("ucast".to_string(), translation.to_ucast_value());
                    Value::Object(envelope)
                }
            }
        }
    };

    // Mask rule from the request or rule metadata, evaluated on the same
    // input.
    let mask_rule = options.mask_rule.clone().or(annotations.mask_rule);
    let masks = match mask_rule {
        Some(rule) => {
            let (base, mask_path) = parse_ref_str(&rule).map_err(|bad| {
                ServerError::InvalidParameter(format!("mask rule \"{bad}\" must be a data reference"))
            })?;
            if base != RefBase::Data {
                return Err(ServerError::InvalidParameter(format!(
                    "mask rule \"{rule}\" must be a data reference"
                )));
            }
            let mut evaluator = Evaluator::new(&compiled, &data, input.clone());
            evaluator
                .eval_path(&mask_path)
                .map_err(|e| ServerError::Internal(e.to_string()))?
        }
        None => None,
    };

    let mut response = Map::new();
    response.insert("result".to_string(), result);
    if let Some(masks) = masks {
        response.insert("masks".to_string(), masks);
    }
    if !hints.is_empty() {
        response.insert(
            "hints".to_string(),
            Value::Array(hints.into_iter().map(Value::String).collect()),
        );
    }
    if params.wants_metrics() {
        response.insert(
            "metrics".to_string(),
            json!({
                "timer_server_handler_ns": started.elapsed().as_nanos() as u64,
            }),
        );
    }

    let decision_id = state.decision_id();
    let mut record = DecisionRecord::new(
        CUSTOM_TYPE_COMPILE,
        decision_id,
        query_path.join("/"),
    );
    record.input = Some(input);
    record.bundles = bundle_revisions(&data);
    record.result = response.get("result").cloned();
    state.decision_log.emit(record);

    debug!(path = %query_path.join("/"), "compile request complete");
    Ok((StatusCode::OK, Json(Value::Object(response))).into_response())
}

/// Combine the Accept target with the `dialect` option.
fn resolve_target(
    headers: &HeaderMap,
    dialect: Option<&str>,
) -> ServerResult<Option<TargetKind>> {
    match response_target(headers)? {
        ResponseTarget::Raw => Ok(None),
        ResponseTarget::Multitarget => Ok(Some(TargetKind::Multitarget)),
        ResponseTarget::Ucast(variant) => Ok(Some(TargetKind::Ucast(variant))),
        ResponseTarget::Sql(Some(dialect)) => Ok(Some(TargetKind::Sql(dialect))),
        ResponseTarget::Sql(None) => match dialect {
            None => Ok(Some(TargetKind::Sql(SqlDialect::Postgresql))),
            Some("prisma") => Ok(Some(TargetKind::Ucast(UcastVariant::Prisma))),
            Some("linq") => Ok(Some(TargetKind::Ucast(UcastVariant::Linq))),
            Some("all") => Ok(Some(TargetKind::Ucast(UcastVariant::All))),
            Some(name) => {
                let parsed = name
                    .parse::<SqlDialect>()
                    .map_err(ServerError::InvalidParameter)?;
                Ok(Some(TargetKind::Sql(parsed)))
            }
        },
    }
}

/// The SQL dialects to emit in a multitarget envelope, honoring
/// `targetDialects` entries of the form `sql+postgresql`.
fn selected_dialects(target_dialects: Option<&[String]>) -> Vec<SqlDialect> {
    match target_dialects {
        None => SqlDialect::ALL.to_vec(),
        Some(entries) => {
            let mut dialects = Vec::new();
            for entry in entries {
                if let Some(name) = entry.strip_prefix("sql+") {
                    if let Ok(dialect) = name.parse::<SqlDialect>() {
                        if !dialects.contains(&dialect) {
                            dialects.push(dialect);
                        }
                    }
                }
            }
            if dialects.is_empty() {
                SqlDialect::ALL.to_vec()
            } else {
                dialects
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selected_dialects_filtering() {
        assert_eq!(selected_dialects(None), SqlDialect::ALL.to_vec());
        let filtered = selected_dialects(Some(&[
            "sql+postgresql".to_string(),
            "sql+sqlite".to_string(),
            "ucast+prisma".to_string(),
        ]));
        assert_eq!(filtered, vec![SqlDialect::Postgresql, SqlDialect::Sqlite]);
    }

    #[test]
    fn test_resolve_target_dialect_option() {
        let mut headers = HeaderMap::new();
        headers.insert("accept", "application/vnd.styra.sql+json".parse().unwrap());
        assert_eq!(
            resolve_target(&headers, Some("mysql")).unwrap(),
            Some(TargetKind::Sql(SqlDialect::Mysql))
        );
        assert_eq!(
            resolve_target(&headers, None).unwrap(),
            Some(TargetKind::Sql(SqlDialect::Postgresql))
        );
        assert_eq!(
            resolve_target(&headers, Some("prisma")).unwrap(),
            Some(TargetKind::Ucast(UcastVariant::Prisma))
        );
    }
}
