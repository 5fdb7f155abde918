//! Bundle activation
//!
//! Installs a set of named bundles in one write transaction: erases the
//! roots being replaced, validates root disjointness and data placement,
//! compiles the resulting module set, writes data and `/system` metadata,
//! and publishes everything atomically. Any failure aborts the transaction
//! and leaves the store unchanged.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::policy::compiler::{CompileError, CompiledPolicies, compile};
use crate::policy::parser::{DEFAULT_REGO_VERSION, ParseError, parse_module};
use crate::store::{Author, Path, Store, StoreError, StoredPolicy, Transaction, TxnKind, WriteOp};

use super::{Bundle, DeltaPatch, Manifest, PatchOp};

/// Errors raised by activation. The store is unchanged when any of these
/// surface.
#[derive(Debug, thiserror::Error)]
pub enum ActivationError {
    /// Two active bundles would own overlapping roots
    #[error("bundle roots overlap across bundles: {}", .names.join(", "))]
    RootOverlap {
        /// The offending bundle names
        names: Vec<String>,
    },

    /// A delta bundle does not match the resident manifest
    #[error("delta bundle {name} does not match the activated manifest")]
    DeltaMismatch {
        /// The bundle name
        name: String,
    },

    /// Bundle content lies outside the declared roots
    #[error("bundle {name} contains path {path} outside its roots")]
    PathOutsideRoots {
        /// The bundle name
        name: String,
        /// The offending path
        path: String,
    },

    /// A data path collides with a rule path
    #[error("data path {path} conflicts with a rule path")]
    PathConflict {
        /// The colliding path
        path: String,
    },

    /// A module failed to parse
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The combined module set failed to compile
    #[error("compile failed: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Compile(Vec<CompileError>),

    /// A store operation failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Input to one activation call.
#[derive(Debug, Default)]
pub struct ActivationInput {
    /// Bundles to install, by name
    pub bundles: BTreeMap<String, Bundle>,
    /// Modules loaded outside any bundle, `(id, source)`
    pub extra_modules: Vec<(String, String)>,
}

/// Atomically activate a set of bundles.
///
/// Returns the compiled policy set now in force; callers must swap their
/// compiler handle and invalidate the prepared-query cache.
///
/// # Errors
/// See [`ActivationError`]; all of them leave the store untouched.
pub async fn activate(
    store: &Store,
    input: ActivationInput,
) -> Result<Arc<CompiledPolicies>, ActivationError> {
    let mut txn = store.new_transaction(TxnKind::Write, Author::System).await;
    match run(store, &mut txn, input) {
        Ok(compiled) => {
            store.commit(txn);
            Ok(compiled)
        }
        Err(err) => {
            store.abort(txn);
            Err(err)
        }
    }
}

fn run(
    store: &Store,
    txn: &mut Transaction,
    input: ActivationInput,
) -> Result<Arc<CompiledPolicies>, ActivationError> {
    let ActivationInput {
        bundles,
        extra_modules,
    } = input;

    // 1. Partition into snapshot and delta bundles.
    let (snapshots, deltas): (BTreeMap<_, _>, BTreeMap<_, _>) =
        bundles.into_iter().partition(|(_, b)| !b.is_delta());

    let resident = resident_manifests(store, txn);

    // 2. Erase set: union of resident roots and declared roots, per
    // incoming snapshot bundle.
    let mut erase: Vec<Path> = Vec::new();
    for (name, bundle) in &snapshots {
        for root in bundle.manifest.effective_roots() {
            erase.push(Path::parse(&root)?);
        }
        if let Some(previous) = resident.get(name) {
            for root in previous.effective_roots() {
                erase.push(Path::parse(&root)?);
            }
        }
    }
    erase.sort_by_key(Path::len);
    erase.dedup();

    // 3. Root disjointness over the resulting bundle set.
    let mut resulting: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for (name, manifest) in &resident {
        if !snapshots.contains_key(name) && !deltas.contains_key(name) {
            resulting.insert(name.as_str(), manifest.effective_roots());
        }
    }
    for (name, bundle) in snapshots.iter().chain(deltas.iter()) {
        resulting.insert(name.as_str(), bundle.manifest.effective_roots());
    }
    check_root_overlap(&resulting)?;

    // 4. Delta bundles must match the resident manifest exactly.
    for (name, bundle) in &deltas {
        let Some(previous) = resident.get(name) else {
            return Err(ActivationError::DeltaMismatch { name: name.clone() });
        };
        if previous.effective_roots() != bundle.manifest.effective_roots()
            || previous.wasm != bundle.manifest.wasm
        {
            return Err(ActivationError::DeltaMismatch { name: name.clone() });
        }
        if let Some(patches) = &bundle.patches {
            apply_patches(store, txn, patches)?;
        }
    }

    // 5. Erase replaced data and the policies beneath the erased roots.
    for path in &erase {
        if crate::store::value_at(txn.data(), path).is_some() {
            store.write(txn, WriteOp::Remove, path, Value::Null)?;
        }
    }
    let mut retained: Vec<StoredPolicy> = Vec::new();
    for policy in store.policies(txn) {
        let package_path = Path::from_keys(policy.module.package.clone());
        let replaced_bundle = snapshots
            .keys()
            .any(|name| policy.id.starts_with(&format!("{name}/")));
        let under_erased_root = erase.iter().any(|root| root.is_prefix_of(&package_path));
        if replaced_bundle || under_erased_root {
            debug!(policy = %policy.id, "removing policy during bundle activation");
            store.delete_policy(txn, &policy.id)?;
        } else {
            retained.push(policy);
        }
    }

    // 6. Validate snapshot data placement against the declared roots.
    for (name, bundle) in &snapshots {
        let roots: Vec<Path> = bundle
            .manifest
            .effective_roots()
            .iter()
            .map(|r| Path::parse(r))
            .collect::<Result<_, _>>()?;
        validate_data_in_roots(name, &bundle.data, &Path::root(), &roots)?;
        for module in &bundle.modules {
            let parsed = parse_module(&format!("{name}/{}", module.path), &module.source)?;
            let package_path = Path::from_keys(parsed.package.clone());
            if !roots.iter().any(|root| root.is_prefix_of(&package_path)) {
                return Err(ActivationError::PathOutsideRoots {
                    name: name.clone(),
                    path: package_path.to_string(),
                });
            }
        }
    }

    // 7. Compile retained + extra + incoming modules together.
    let mut modules = Vec::new();
    let mut incoming: Vec<StoredPolicy> = Vec::new();
    for policy in &retained {
        modules.push(Arc::clone(&policy.module));
    }
    for (id, source) in &extra_modules {
        let module = Arc::new(parse_module(id, source)?);
        modules.push(Arc::clone(&module));
        incoming.push(StoredPolicy {
            id: id.clone(),
            source: source.clone(),
            module,
        });
    }
    for (name, bundle) in &snapshots {
        for file in &bundle.modules {
            let id = format!("{name}/{}", file.path);
            let mut parsed = parse_module(&id, &file.source)?;
            if let Some(version) = file.rego_version {
                parsed.rego_version = version;
            }
            let module = Arc::new(parsed);
            modules.push(Arc::clone(&module));
            incoming.push(StoredPolicy {
                id,
                source: file.source.clone(),
                module,
            });
        }
    }
    let compiled = Arc::new(compile(modules).map_err(ActivationError::Compile)?);

    // 8. Write snapshot data under each root, bulk-loading per root.
    for bundle in snapshots.values() {
        let roots: Vec<Path> = bundle
            .manifest
            .effective_roots()
            .iter()
            .map(|r| Path::parse(r))
            .collect::<Result<_, _>>()?;
        let mut entries = Vec::new();
        for root in &roots {
            if let Some(value) = value_at_keys(&bundle.data, &root.keys()) {
                entries.push((root.clone(), value.clone()));
            }
        }
        store.truncate(txn, &[], entries)?;
    }

    // 9. Final data-vs-rule path conflicts.
    for rule_path in compiled.modules.iter().map(|m| &m.package) {
        let path = Path::from_keys(rule_path.clone());
        if let Some(value) = crate::store::value_at(txn.data(), &path) {
            if !value.is_object() {
                return Err(ActivationError::PathConflict {
                    path: path.to_string(),
                });
            }
        }
    }

    // 10. Write metadata: manifest, etag, WASM blobs, module versions.
    for (name, bundle) in snapshots.iter().chain(deltas.iter()) {
        write_bundle_metadata(store, txn, name, bundle)?;
    }
    for policy in &incoming {
        store.upsert_policy(txn, policy.clone())?;
        if policy.module.rego_version != DEFAULT_REGO_VERSION {
            let path = Path::from_keys(vec![
                "system".to_string(),
                "modules".to_string(),
                policy.id.clone(),
                "rego_version".to_string(),
            ]);
            store.make_dirs(txn, &path)?;
            store.write(
                txn,
                WriteOp::Add,
                &path,
                Value::Number(Number::from(policy.module.rego_version)),
            )?;
        }
    }

    info!(
        bundles = snapshots.len() + deltas.len(),
        rules = compiled.rule_count(),
        "bundle activation complete"
    );
    Ok(compiled)
}

fn resident_manifests(store: &Store, txn: &Transaction) -> BTreeMap<String, Manifest> {
    let mut resident = BTreeMap::new();
    let bundles_path = Path::from_keys(vec!["system".to_string(), "bundles".to_string()]);
    if let Ok(Value::Object(map)) = store.read(txn, &bundles_path) {
        for (name, entry) in map {
            if let Some(manifest) = entry.get("manifest") {
                if let Ok(manifest) = serde_json::from_value::<Manifest>(manifest.clone()) {
                    resident.insert(name, manifest);
                }
            }
        }
    }
    resident
}

fn check_root_overlap(bundles: &BTreeMap<&str, Vec<String>>) -> Result<(), ActivationError> {
    let entries: Vec<(&str, Vec<Path>)> = bundles
        .iter()
        .map(|(name, roots)| {
            let paths = roots
                .iter()
                .map(|r| Path::parse(r))
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, StoreError>((*name, paths))
        })
        .collect::<Result<_, _>>()?;

    for (i, (name_a, roots_a)) in entries.iter().enumerate() {
        for (name_b, roots_b) in entries.iter().skip(i + 1) {
            for a in roots_a {
                for b in roots_b {
                    if a.overlaps(b) {
                        return Err(ActivationError::RootOverlap {
                            names: vec![(*name_a).to_string(), (*name_b).to_string()],
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

fn apply_patches(
    store: &Store,
    txn: &mut Transaction,
    patches: &[DeltaPatch],
) -> Result<(), ActivationError> {
    for patch in patches {
        let path = Path::parse(&patch.path)?;
        match patch.op {
            PatchOp::Upsert => {
                store.make_dirs(txn, &path)?;
                store.write(txn, WriteOp::Add, &path, patch.value.clone())?;
            }
            PatchOp::Remove => {
                store.write(txn, WriteOp::Remove, &path, Value::Null)?;
            }
            PatchOp::Replace => {
                store.write(txn, WriteOp::Replace, &path, patch.value.clone())?;
            }
        }
    }
    Ok(())
}

/// Every nested key of a snapshot bundle's data must sit at or under one of
/// the bundle's roots (or on the path toward one).
fn validate_data_in_roots(
    name: &str,
    value: &Value,
    at: &Path,
    roots: &[Path],
) -> Result<(), ActivationError> {
    if roots.iter().any(|root| root.is_prefix_of(at)) {
        return Ok(());
    }
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                validate_data_in_roots(name, child, &at.child_key(key), roots)?;
            }
            Ok(())
        }
        _ if at.is_empty() => Ok(()),
        _ => Err(ActivationError::PathOutsideRoots {
            name: name.to_string(),
            path: at.to_string(),
        }),
    }
}

fn value_at_keys<'v>(root: &'v Value, keys: &[String]) -> Option<&'v Value> {
    let mut current = root;
    for key in keys {
        current = current.as_object()?.get(key)?;
    }
    Some(current)
}

fn write_bundle_metadata(
    store: &Store,
    txn: &mut Transaction,
    name: &str,
    bundle: &Bundle,
) -> Result<(), ActivationError> {
    let base = Path::from_keys(vec![
        "system".to_string(),
        "bundles".to_string(),
        name.to_string(),
    ]);
    let manifest_value =
        serde_json::to_value(&bundle.manifest).unwrap_or_else(|_| Value::Object(Map::new()));

    store.make_dirs(txn, &base.child_key("manifest"))?;
    store.write(txn, WriteOp::Add, &base.child_key("manifest"), manifest_value)?;
    if let Some(etag) = &bundle.etag {
        store.write(
            txn,
            WriteOp::Add,
            &base.child_key("etag"),
            Value::String(etag.clone()),
        )?;
    }
    for wasm in &bundle.wasm {
        let path = base.child_key("wasm").child_key(&wasm.path);
        store.make_dirs(txn, &path)?;
        store.write(
            txn,
            WriteOp::Add,
            &path,
            Value::String(BASE64.encode(&wasm.bytes)),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::ModuleFile;
    use serde_json::json;

    fn bundle_with_data(roots: &[&str], data: Value) -> Bundle {
        let mut bundle = Bundle::snapshot(Manifest::with_roots(roots.to_vec()));
        bundle.data = data;
        bundle
    }

    async fn read_path(store: &Store, path: &str) -> Option<Value> {
        let txn = store.new_transaction(TxnKind::Read, Author::Public).await;
        store.read(&txn, &Path::parse(path).unwrap()).ok()
    }

    #[tokio::test]
    async fn test_snapshot_activation_writes_data_and_manifest() {
        let store = Store::new();
        let mut bundle = bundle_with_data(&["roles"], json!({"roles": {"admins": ["alice"]}}));
        bundle.manifest.revision = "v1".to_string();
        bundle.etag = Some("etag-1".to_string());

        let mut bundles = BTreeMap::new();
        bundles.insert("rbac".to_string(), bundle);
        let compiled = activate(
            &store,
            ActivationInput {
                bundles,
                extra_modules: Vec::new(),
            },
        )
        .await
        .unwrap();
        assert_eq!(compiled.rule_count(), 0);

        assert_eq!(
            read_path(&store, "/roles/admins").await,
            Some(json!(["alice"]))
        );
        assert_eq!(
            read_path(&store, "/system/bundles/rbac/manifest/revision").await,
            Some(json!("v1"))
        );
        assert_eq!(
            read_path(&store, "/system/bundles/rbac/etag").await,
            Some(json!("etag-1"))
        );
    }

    #[tokio::test]
    async fn test_reactivation_erases_previous_roots() {
        let store = Store::new();
        let mut bundles = BTreeMap::new();
        bundles.insert(
            "rbac".to_string(),
            bundle_with_data(&["roles"], json!({"roles": {"admins": ["alice"]}})),
        );
        activate(
            &store,
            ActivationInput {
                bundles,
                extra_modules: Vec::new(),
            },
        )
        .await
        .unwrap();

        // Replace with a bundle rooted elsewhere; the old root is erased.
        let mut bundles = BTreeMap::new();
        bundles.insert(
            "rbac".to_string(),
            bundle_with_data(&["teams"], json!({"teams": {"eng": ["bob"]}})),
        );
        activate(
            &store,
            ActivationInput {
                bundles,
                extra_modules: Vec::new(),
            },
        )
        .await
        .unwrap();

        assert_eq!(read_path(&store, "/roles").await, None);
        assert_eq!(read_path(&store, "/teams/eng").await, Some(json!(["bob"])));
    }

    #[tokio::test]
    async fn test_root_overlap_rejected() {
        let store = Store::new();
        let mut bundles = BTreeMap::new();
        bundles.insert(
            "a".to_string(),
            bundle_with_data(&["shared"], json!({"shared": {}})),
        );
        bundles.insert(
            "b".to_string(),
            bundle_with_data(&["shared/nested"], json!({"shared": {"nested": {}}})),
        );
        let err = activate(
            &store,
            ActivationInput {
                bundles,
                extra_modules: Vec::new(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ActivationError::RootOverlap { .. }));
    }

    #[tokio::test]
    async fn test_data_outside_roots_rejected_and_store_unchanged() {
        let store = Store::new();
        let mut bundles = BTreeMap::new();
        bundles.insert(
            "rbac".to_string(),
            bundle_with_data(
                &["roles"],
                json!({"roles": {"admins": []}, "sneaky": {"x": 1}}),
            ),
        );
        let err = activate(
            &store,
            ActivationInput {
                bundles,
                extra_modules: Vec::new(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ActivationError::PathOutsideRoots { .. }));
        assert_eq!(read_path(&store, "/roles").await, None);
    }

    #[tokio::test]
    async fn test_module_package_outside_roots_rejected() {
        let store = Store::new();
        let mut bundle = bundle_with_data(&["roles"], json!({"roles": {}}));
        bundle.modules.push(ModuleFile {
            path: "other.rego".to_string(),
            source: "package other\n\nallow if true\n".to_string(),
            rego_version: None,
        });
        let mut bundles = BTreeMap::new();
        bundles.insert("rbac".to_string(), bundle);
        let err = activate(
            &store,
            ActivationInput {
                bundles,
                extra_modules: Vec::new(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ActivationError::PathOutsideRoots { .. }));
    }

    #[tokio::test]
    async fn test_modules_install_and_compile() {
        let store = Store::new();
        let mut bundle = bundle_with_data(&["app"], json!({"app": {}}));
        bundle.modules.push(ModuleFile {
            path: "authz.rego".to_string(),
            source: "package app.authz\n\nallow if input.admin == true\n".to_string(),
            rego_version: None,
        });
        let mut bundles = BTreeMap::new();
        bundles.insert("app".to_string(), bundle);
        let compiled = activate(
            &store,
            ActivationInput {
                bundles,
                extra_modules: Vec::new(),
            },
        )
        .await
        .unwrap();
        assert_eq!(compiled.rule_count(), 1);

        let txn = store.new_transaction(TxnKind::Read, Author::Public).await;
        assert_eq!(store.list_policies(&txn), vec!["app/authz.rego".to_string()]);
    }

    #[tokio::test]
    async fn test_compile_failure_leaves_store_unchanged() {
        let store = Store::new();
        let mut bundle = bundle_with_data(&["app"], json!({"app": {"x": 1}}));
        bundle.modules.push(ModuleFile {
            path: "bad.rego".to_string(),
            source: "package app\n\nr if input.a == 1\n\nr contains x if x := input.b\n"
                .to_string(),
            rego_version: None,
        });
        let mut bundles = BTreeMap::new();
        bundles.insert("app".to_string(), bundle);
        let err = activate(
            &store,
            ActivationInput {
                bundles,
                extra_modules: Vec::new(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ActivationError::Compile(_)));
        assert_eq!(read_path(&store, "/app").await, None);
    }

    #[tokio::test]
    async fn test_delta_requires_matching_manifest() {
        let store = Store::new();
        let mut bundles = BTreeMap::new();
        bundles.insert(
            "rbac".to_string(),
            bundle_with_data(&["roles"], json!({"roles": {"admins": []}})),
        );
        activate(
            &store,
            ActivationInput {
                bundles,
                extra_modules: Vec::new(),
            },
        )
        .await
        .unwrap();

        // Mismatched roots.
        let mut bundles = BTreeMap::new();
        bundles.insert(
            "rbac".to_string(),
            Bundle::delta(Manifest::with_roots(["other"]), Vec::new()),
        );
        let err = activate(
            &store,
            ActivationInput {
                bundles,
                extra_modules: Vec::new(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ActivationError::DeltaMismatch { .. }));

        // Matching manifest applies patches.
        let mut bundles = BTreeMap::new();
        bundles.insert(
            "rbac".to_string(),
            Bundle::delta(
                Manifest::with_roots(["roles"]),
                vec![DeltaPatch {
                    op: PatchOp::Upsert,
                    path: "roles/admins".to_string(),
                    value: json!(["alice"]),
                }],
            ),
        );
        activate(
            &store,
            ActivationInput {
                bundles,
                extra_modules: Vec::new(),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            read_path(&store, "/roles/admins").await,
            Some(json!(["alice"]))
        );
    }
}
