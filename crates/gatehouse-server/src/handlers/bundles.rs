//! Bundle activation handler
//!
//! `PUT /v1/bundles/<name>` activates one bundle from a JSON payload:
//! manifest, raw data, module files, optional WASM blobs and etag. The
//! activation is atomic; on success the live compiler is swapped, the
//! prepared-query cache dropped, and plugin transforms re-prepared.

use axum::{
    Json,
    extract::{Path as UrlPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use tracing::info;

use gatehouse_core::bundle::{
    ActivationError, ActivationInput, Bundle, DeltaPatch, Manifest, ModuleFile, WasmFile,
    activate,
};

use crate::error::{ServerError, ServerResult};
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct BundlePayload {
    manifest: Manifest,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    modules: Vec<ModulePayload>,
    #[serde(default)]
    wasm: Vec<WasmPayload>,
    #[serde(default)]
    etag: Option<String>,
    #[serde(default)]
    patches: Option<Vec<DeltaPatch>>,
}

#[derive(Debug, Deserialize)]
struct ModulePayload {
    path: String,
    source: String,
    #[serde(default)]
    rego_version: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WasmPayload {
    path: String,
    base64: String,
}

/// `PUT /v1/bundles/<name>`
pub async fn put_bundle(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
    Json(payload): Json<BundlePayload>,
) -> ServerResult<Response> {
    let mut bundle = match payload.patches {
        Some(patches) => Bundle::delta(payload.manifest, patches),
        None => Bundle::snapshot(payload.manifest),
    };
    if let Some(data) = payload.data {
        bundle.data = data;
    }
    bundle.etag = payload.etag;
    for module in payload.modules {
        bundle.modules.push(ModuleFile {
            path: module.path,
            source: module.source,
            rego_version: module.rego_version,
        });
    }
    for wasm in payload.wasm {
        let bytes = BASE64.decode(wasm.base64.as_bytes()).map_err(|_| {
            ServerError::InvalidParameter(format!("wasm module {} is not valid base64", wasm.path))
        })?;
        bundle.wasm.push(WasmFile {
            path: wasm.path,
            bytes,
        });
    }

    let mut bundles = BTreeMap::new();
    bundles.insert(name.clone(), bundle);

    let compiled = activate(
        &state.store,
        ActivationInput {
            bundles,
            extra_modules: Vec::new(),
        },
    )
    .await
    .map_err(activation_error)?;

    state.swap_compiled(compiled).await;
    info!(bundle = %name, "bundle activated");

    let mut body = Map::new();
    body.insert("activated".to_string(), json!(name));
    Ok((StatusCode::OK, Json(Value::Object(body))).into_response())
}

fn activation_error(err: ActivationError) -> ServerError {
    match err {
        ActivationError::Store(store) => ServerError::Store(store),
        ActivationError::Compile(_) | ActivationError::Parse(_) => {
            ServerError::Compile(err.to_string())
        }
        _ => ServerError::InvalidParameter(err.to_string()),
    }
}
