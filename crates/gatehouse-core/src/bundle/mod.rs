//! Policy/data bundles
//!
//! A bundle is a named unit of data and policy modules controlled by a
//! manifest: the manifest's `roots` are the path prefixes the bundle owns
//! exclusively. Activation (see [`activate`]) swaps bundle contents into
//! the store atomically.

mod activate;

pub use activate::{ActivationError, ActivationInput, activate};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// WASM entrypoint declaration in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WasmResolver {
    /// The decision entrypoint the module serves
    pub entrypoint: String,
    /// Bundle-relative path of the WASM module
    pub module: String,
}

/// A bundle manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Revision string, surfaced in decision logs
    #[serde(default)]
    pub revision: String,
    /// Path prefixes this bundle owns (slash-separated, empty = everything)
    #[serde(default)]
    pub roots: Vec<String>,
    /// WASM entrypoint declarations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wasm: Vec<WasmResolver>,
    /// Free-form metadata carried through to the store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Manifest {
    /// Manifest with the given roots.
    #[must_use]
    pub fn with_roots<I, S>(roots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            revision: String::new(),
            roots: roots.into_iter().map(Into::into).collect(),
            wasm: Vec::new(),
            metadata: None,
        }
    }

    /// Roots, defaulting to the catch-all root when none are declared.
    #[must_use]
    pub fn effective_roots(&self) -> Vec<String> {
        if self.roots.is_empty() {
            vec![String::new()]
        } else {
            self.roots.clone()
        }
    }
}

/// A policy module file within a bundle.
#[derive(Debug, Clone)]
pub struct ModuleFile {
    /// Bundle-relative path, e.g. `filters/include.rego`
    pub path: String,
    /// Module source text
    pub source: String,
    /// Language version tag, when it differs from the runtime default
    pub rego_version: Option<u32>,
}

/// A WASM module file within a bundle.
#[derive(Debug, Clone)]
pub struct WasmFile {
    /// Bundle-relative path
    pub path: String,
    /// Raw module bytes
    pub bytes: Vec<u8>,
}

/// JSON-patch-like operations carried by delta bundles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    /// Insert or overwrite
    Upsert,
    /// Delete
    Remove,
    /// Overwrite an existing value
    Replace,
}

/// One delta-bundle patch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaPatch {
    /// The operation
    pub op: PatchOp,
    /// Slash-separated path
    pub path: String,
    /// The value for upsert/replace
    #[serde(default)]
    pub value: Value,
}

/// A named bundle ready for activation.
#[derive(Debug, Clone)]
pub struct Bundle {
    /// The manifest
    pub manifest: Manifest,
    /// Raw data document (snapshot bundles)
    pub data: Value,
    /// Policy modules
    pub modules: Vec<ModuleFile>,
    /// WASM modules
    pub wasm: Vec<WasmFile>,
    /// ETag for cache validation
    pub etag: Option<String>,
    /// Patches; present on delta bundles
    pub patches: Option<Vec<DeltaPatch>>,
}

impl Bundle {
    /// An empty snapshot bundle with the given manifest.
    #[must_use]
    pub fn snapshot(manifest: Manifest) -> Self {
        Self {
            manifest,
            data: Value::Object(Map::new()),
            modules: Vec::new(),
            wasm: Vec::new(),
            etag: None,
            patches: None,
        }
    }

    /// A delta bundle carrying only patches.
    #[must_use]
    pub fn delta(manifest: Manifest, patches: Vec<DeltaPatch>) -> Self {
        Self {
            manifest,
            data: Value::Object(Map::new()),
            modules: Vec::new(),
            wasm: Vec::new(),
            etag: None,
            patches: Some(patches),
        }
    }

    /// Whether this is a delta bundle.
    #[must_use]
    pub const fn is_delta(&self) -> bool {
        self.patches.is_some()
    }
}
