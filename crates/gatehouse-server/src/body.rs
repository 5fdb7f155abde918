//! Request-body decoding
//!
//! Bodies may be JSON or YAML, optionally gzipped. Decompression is bounded
//! by the configured maximum expanded size; exceeding it is a 400 with the
//! fixed message `could not decompress the body`.

use axum::http::HeaderMap;
use flate2::read::GzDecoder;
use serde_json::Value;
use std::io::Read;

use crate::error::{ServerError, ServerResult};

/// Decode a request body per its `Content-Encoding` and `Content-Type`.
///
/// # Errors
/// `ServerError::Decompression` when the gzip stream expands beyond
/// `gzip_max_length`; `ServerError::InvalidParameter` on syntax errors.
pub fn parse(headers: &HeaderMap, raw: &[u8], gzip_max_length: usize) -> ServerResult<Value> {
    let decoded;
    let bytes: &[u8] = if is_gzip(headers) {
        decoded = decompress(raw, gzip_max_length)?;
        &decoded
    } else {
        raw
    };

    if bytes.is_empty() {
        return Ok(Value::Null);
    }

    if is_yaml(headers) {
        let yaml: serde_yaml::Value = serde_yaml::from_slice(bytes)
            .map_err(|e| ServerError::InvalidParameter(format!("invalid YAML body: {e}")))?;
        serde_json::to_value(yaml)
            .map_err(|e| ServerError::InvalidParameter(format!("invalid YAML body: {e}")))
    } else {
        serde_json::from_slice(bytes)
            .map_err(|e| ServerError::InvalidParameter(format!("invalid JSON body: {e}")))
    }
}

fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get("content-encoding")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip"))
}

fn is_yaml(headers: &HeaderMap) -> bool {
    headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("yaml"))
}

fn decompress(raw: &[u8], max_length: usize) -> ServerResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(raw).take(max_length as u64 + 1);
    let mut decoded = Vec::new();
    decoder
        .read_to_end(&mut decoded)
        .map_err(|_| ServerError::Decompression)?;
    if decoded.len() > max_length {
        return Err(ServerError::Decompression);
    }
    Ok(decoded)
}
