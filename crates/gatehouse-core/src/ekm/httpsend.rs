//! Outbound-HTTP credential registry
//!
//! The EKM can attach credentials to outbound `http.send` calls on a
//! per-host basis. The registry is process-wide: `configure` swaps the
//! whole map atomically, `reset` restores the unpatched state. The
//! evaluator's `http.send` built-in routes through [`send`], which injects
//! the matching headers before handing the request to the installed
//! transport.

use once_cell::sync::Lazy;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use url::Url;

/// Headers to attach for one `scheme://host` pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostCredentials {
    /// Header name to header value
    pub headers: BTreeMap<String, String>,
}

type Transport = dyn Fn(&Value) -> Result<Value, String> + Send + Sync;

static REGISTRY: Lazy<RwLock<HashMap<String, HostCredentials>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

static TRANSPORT: Lazy<RwLock<Option<Arc<Transport>>>> = Lazy::new(|| RwLock::new(None));

/// Serializes tests that touch the process-wide registry.
#[cfg(test)]
pub(crate) static TEST_GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Replace the registry contents. Called on startup and on every
/// reconfigure; the swap is atomic with respect to concurrent sends.
pub fn configure(credentials: HashMap<String, HostCredentials>) {
    let mut registry = REGISTRY
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    *registry = credentials;
}

/// Restore the unpatched state: no credentials, no transport.
pub fn reset() {
    configure(HashMap::new());
    let mut transport = TRANSPORT
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    *transport = None;
}

/// Install the transport that performs the actual request.
pub fn set_transport<F>(transport: F)
where
    F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
{
    let mut slot = TRANSPORT
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    *slot = Some(Arc::new(transport));
}

/// Inject registered credentials for the request's host into its headers.
/// Explicit request headers win over injected ones.
pub fn inject_headers(request: &mut Map<String, Value>) {
    let Some(Value::String(raw_url)) = request.get("url") else {
        return;
    };
    let Ok(parsed) = Url::parse(raw_url) else {
        return;
    };
    let Some(host) = parsed.host_str() else {
        return;
    };
    let key = format!("{}://{}", parsed.scheme(), host);

    let registry = REGISTRY
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let Some(credentials) = registry.get(&key) else {
        return;
    };

    let headers = request
        .entry("headers".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(headers) = headers {
        for (name, value) in &credentials.headers {
            if !headers.contains_key(name) {
                headers.insert(name.clone(), Value::String(value.clone()));
            }
        }
    }
}

/// Perform an `http.send` call: inject credentials, then delegate to the
/// installed transport.
///
/// # Errors
/// Returns the transport's failure, or an error when no transport is
/// installed.
pub fn send(request: &Value) -> Result<Value, String> {
    let mut request = match request {
        Value::Object(map) => map.clone(),
        _ => return Err("request must be an object".to_string()),
    };
    inject_headers(&mut request);

    let transport = TRANSPORT
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone();
    match transport {
        Some(transport) => transport(&Value::Object(request)),
        None => Err("no transport configured".to_string()),
    }
}
