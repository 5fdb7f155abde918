//! Data-source plugin framework
//!
//! Long-lived drivers poll external systems and publish their documents
//! under a claimed store path. The framework owns the lifecycle: it claims
//! the mount on start, prepares the transform rule, and funnels every
//! polled payload through [`Ingester::ingest`], which applies the transform
//! and replaces the subtree in one write transaction.

pub mod http;
pub mod ldap;
mod transform;

pub use http::HttpDataPlugin;
pub use ldap::LdapDataPlugin;
pub use transform::{Transform, TransformSpec};

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::policy::compiler::SharedCompiledPolicies;
use crate::store::{Author, Path, Store, StoreError, TxnKind, WriteOp};

/// Errors raised by the plugin framework and its drivers.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// Store interaction failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Invalid driver configuration
    #[error("plugin configuration error: {message}")]
    Config {
        /// Description
        message: String,
    },

    /// The external source failed
    #[error("driver error: {message}")]
    Driver {
        /// Description
        message: String,
    },
}

/// Contract a data-source driver implements.
#[async_trait]
pub trait DataPlugin: Send + Sync {
    /// Instance name, unique per configuration key.
    fn name(&self) -> &str;

    /// The store path this plugin owns exclusively.
    fn path(&self) -> &Path;

    /// Start the polling loop.
    async fn start(&self, ingester: Arc<Ingester>) -> Result<(), PluginError>;

    /// Stop the polling loop.
    async fn stop(&self);

    /// Apply a new configuration; a no-op when it equals the current one.
    async fn reconfigure(
        &self,
        ingester: Arc<Ingester>,
        new_config: Value,
    ) -> Result<(), PluginError>;
}

/// Publishes polled documents into the store on behalf of one plugin.
pub struct Ingester {
    store: Arc<Store>,
    compiled: SharedCompiledPolicies,
    owner: String,
    mount: Path,
    transform: Transform,
}

impl Ingester {
    fn new(
        store: Arc<Store>,
        compiled: SharedCompiledPolicies,
        owner: String,
        mount: Path,
        transform: Transform,
    ) -> Self {
        Self {
            store,
            compiled,
            owner,
            mount,
            transform,
        }
    }

    /// The mount this ingester writes beneath.
    #[must_use]
    pub fn mount(&self) -> &Path {
        &self.mount
    }

    /// Transform and publish one polled payload, replacing the mount
    /// subtree. A transform that evaluates to nothing drops the payload.
    ///
    /// # Errors
    /// Propagates transform evaluation and store failures; the driver loop
    /// logs these and keeps polling.
    pub async fn ingest(&self, raw: Value) -> Result<(), PluginError> {
        let compiled = {
            let guard = self
                .compiled
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            Arc::clone(&guard)
        };

        let mut txn = self
            .store
            .new_transaction(TxnKind::Write, Author::Plugin(self.owner.clone()))
            .await;

        let transformed = {
            let data = txn.data();
            let previous = if self.transform.include_previous() {
                crate::store::value_at(data, &self.mount).cloned()
            } else {
                None
            };
            self.transform
                .apply(&self.owner, &compiled, data, raw, previous)
        };

        match transformed {
            Ok(Some(document)) => {
                self.store.make_dirs(&mut txn, &self.mount)?;
                self.store
                    .write(&mut txn, WriteOp::Add, &self.mount, document)?;
                self.store.commit(txn);
                Ok(())
            }
            Ok(None) => {
                debug!(plugin = %self.owner, "transform produced no document, dropping payload");
                self.store.abort(txn);
                Ok(())
            }
            Err(err) => {
                self.store.abort(txn);
                Err(PluginError::Driver {
                    message: format!("transform failed: {err}"),
                })
            }
        }
    }
}

struct Registered {
    plugin: Arc<dyn DataPlugin>,
    ingester: Arc<Ingester>,
}

/// Owns every data-plugin instance: claims mounts, prepares transforms,
/// starts and stops drivers, and re-prepares transforms on compiler swaps.
pub struct PluginManager {
    store: Arc<Store>,
    compiled: SharedCompiledPolicies,
    registered: Mutex<Vec<Registered>>,
}

impl PluginManager {
    /// Create a manager over the store and the live compiler handle.
    #[must_use]
    pub fn new(store: Arc<Store>, compiled: SharedCompiledPolicies) -> Self {
        Self {
            store,
            compiled,
            registered: Mutex::new(Vec::new()),
        }
    }

    /// Claim the plugin's mount, prepare its transform, and start it.
    ///
    /// # Errors
    /// Fails when the mount is already claimed or the driver fails to
    /// start; the claim is released on start failure.
    pub async fn register(
        &self,
        plugin: Arc<dyn DataPlugin>,
        transform: TransformSpec,
    ) -> Result<(), PluginError> {
        let name = plugin.name().to_string();
        let mount = plugin.path().clone();
        self.store.ownership().claim(mount.clone(), &name)?;

        let transform = Transform::new(transform);
        {
            let compiled = self
                .compiled
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            transform.prepare(&name, &compiled);
        }

        let ingester = Arc::new(Ingester::new(
            Arc::clone(&self.store),
            Arc::clone(&self.compiled),
            name.clone(),
            mount,
            transform,
        ));

        if let Err(err) = plugin.start(Arc::clone(&ingester)).await {
            self.store.ownership().release(&name);
            return Err(err);
        }
        info!(plugin = %name, mount = %ingester.mount(), "data plugin started");

        let mut registered = self.registered.lock().await;
        registered.push(Registered { plugin, ingester });
        Ok(())
    }

    /// Re-resolve every transform against the current compiled policies.
    /// Called after each successful bundle activation.
    pub async fn refresh_transforms(&self) {
        let compiled = {
            let guard = self
                .compiled
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            Arc::clone(&guard)
        };
        let registered = self.registered.lock().await;
        for entry in registered.iter() {
            entry
                .ingester
                .transform
                .prepare(entry.plugin.name(), &compiled);
        }
    }

    /// Reconfigure a plugin by name.
    ///
    /// # Errors
    /// Propagates driver failures; unknown names are reported as config
    /// errors.
    pub async fn reconfigure(&self, name: &str, new_config: Value) -> Result<(), PluginError> {
        let registered = self.registered.lock().await;
        for entry in registered.iter() {
            if entry.plugin.name() == name {
                return entry
                    .plugin
                    .reconfigure(Arc::clone(&entry.ingester), new_config)
                    .await;
            }
        }
        Err(PluginError::Config {
            message: format!("no plugin named {name}"),
        })
    }

    /// Stop every plugin and release its claim.
    pub async fn stop_all(&self) {
        let mut registered = self.registered.lock().await;
        for entry in registered.drain(..) {
            entry.plugin.stop().await;
            self.store.ownership().release(entry.plugin.name());
            info!(plugin = %entry.plugin.name(), "data plugin stopped");
        }
    }

    /// Names of the registered plugins.
    pub async fn plugin_names(&self) -> Vec<String> {
        let registered = self.registered.lock().await;
        registered
            .iter()
            .map(|entry| entry.plugin.name().to_string())
            .collect()
    }
}

/// Parse a `duration`-style config value: plain seconds, or a string with
/// an `s`/`m`/`h` suffix.
pub(crate) fn parse_interval(value: &Value) -> Option<std::time::Duration> {
    match value {
        Value::Number(n) => n.as_u64().map(std::time::Duration::from_secs),
        Value::String(s) => {
            let s = s.trim();
            let (digits, unit) = s.split_at(s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len()));
            let amount: u64 = digits.parse().ok()?;
            match unit {
                "" | "s" => Some(std::time::Duration::from_secs(amount)),
                "m" => Some(std::time::Duration::from_secs(amount * 60)),
                "h" => Some(std::time::Duration::from_secs(amount * 3600)),
                "ms" => Some(std::time::Duration::from_millis(amount)),
                _ => None,
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::compiler::{CompiledPolicies, compile};
    use crate::policy::parser::parse_module;
    use serde_json::json;
    use std::sync::RwLock;
    use std::time::Duration;

    struct StaticPlugin {
        name: String,
        mount: Path,
    }

    #[async_trait]
    impl DataPlugin for StaticPlugin {
        fn name(&self) -> &str {
            &self.name
        }

        fn path(&self) -> &Path {
            &self.mount
        }

        async fn start(&self, _ingester: Arc<Ingester>) -> Result<(), PluginError> {
            Ok(())
        }

        async fn stop(&self) {}

        async fn reconfigure(
            &self,
            _ingester: Arc<Ingester>,
            _new_config: Value,
        ) -> Result<(), PluginError> {
            Ok(())
        }
    }

    fn shared(compiled: CompiledPolicies) -> SharedCompiledPolicies {
        Arc::new(RwLock::new(Arc::new(compiled)))
    }

    fn manager_with(source: Option<&str>) -> (Arc<Store>, PluginManager) {
        let compiled = source.map_or_else(CompiledPolicies::default, |src| {
            compile(vec![Arc::new(parse_module("t.rego", src).unwrap())]).unwrap()
        });
        let store = Arc::new(Store::new());
        let manager = PluginManager::new(Arc::clone(&store), shared(compiled));
        (store, manager)
    }

    #[tokio::test]
    async fn test_register_claims_mount() {
        let (store, manager) = manager_with(None);
        let plugin = Arc::new(StaticPlugin {
            name: "static.users".to_string(),
            mount: Path::parse("/plugins/users").unwrap(),
        });
        manager
            .register(plugin, TransformSpec::default())
            .await
            .unwrap();

        // Public writes under the mount are rejected now.
        let mut txn = store.new_transaction(TxnKind::Write, Author::Public).await;
        let result = store.write(
            &mut txn,
            WriteOp::Add,
            &Path::parse("/plugins/users").unwrap(),
            json!({}),
        );
        assert!(matches!(result, Err(StoreError::OwnershipViolation { .. })));
        store.abort(txn);

        manager.stop_all().await;
        let mut txn = store.new_transaction(TxnKind::Write, Author::Public).await;
        store
            .write(
                &mut txn,
                WriteOp::Add,
                &Path::parse("/plugins/users").unwrap(),
                json!({}),
            )
            .unwrap();
        store.abort(txn);
    }

    #[tokio::test]
    async fn test_ingest_replaces_subtree() {
        let (store, manager) = manager_with(None);
        let plugin = Arc::new(StaticPlugin {
            name: "static.users".to_string(),
            mount: Path::parse("/plugins/users").unwrap(),
        });
        manager
            .register(Arc::clone(&plugin) as Arc<dyn DataPlugin>, TransformSpec::default())
            .await
            .unwrap();

        let registered = manager.registered.lock().await;
        let ingester = Arc::clone(&registered[0].ingester);
        drop(registered);

        ingester.ingest(json!({"alice": 1})).await.unwrap();
        ingester.ingest(json!({"bob": 2})).await.unwrap();

        let txn = store.new_transaction(TxnKind::Read, Author::Public).await;
        assert_eq!(
            store
                .read(&txn, &Path::parse("/plugins/users").unwrap())
                .unwrap(),
            json!({"bob": 2})
        );
    }

    #[tokio::test]
    async fn test_ingest_applies_transform_and_drops_undefined() {
        let source = "package transforms\n\nusers := {id: u | some i\n\tu := input.incoming[i]\n\tid := u.id} if count(input.incoming) > 0\n";
        let (store, manager) = manager_with(Some(source));
        let plugin = Arc::new(StaticPlugin {
            name: "static.users".to_string(),
            mount: Path::parse("/plugins/users").unwrap(),
        });
        manager
            .register(
                plugin,
                TransformSpec {
                    rule_ref: Some("data.transforms.users".to_string()),
                    include_previous: false,
                },
            )
            .await
            .unwrap();

        let registered = manager.registered.lock().await;
        let ingester = Arc::clone(&registered[0].ingester);
        drop(registered);

        ingester
            .ingest(json!([{"id": "u1"}, {"id": "u2"}]))
            .await
            .unwrap();
        let txn = store.new_transaction(TxnKind::Read, Author::Public).await;
        assert_eq!(
            store
                .read(&txn, &Path::parse("/plugins/users").unwrap())
                .unwrap(),
            json!({"u1": {"id": "u1"}, "u2": {"id": "u2"}})
        );

        // An empty payload leaves the previous document in place.
        ingester.ingest(json!([])).await.unwrap();
        let txn = store.new_transaction(TxnKind::Read, Author::Public).await;
        assert_eq!(
            store
                .read(&txn, &Path::parse("/plugins/users").unwrap())
                .unwrap(),
            json!({"u1": {"id": "u1"}, "u2": {"id": "u2"}})
        );
    }

    #[tokio::test]
    async fn test_overlapping_mounts_rejected() {
        let (_store, manager) = manager_with(None);
        manager
            .register(
                Arc::new(StaticPlugin {
                    name: "a".to_string(),
                    mount: Path::parse("/plugins/users").unwrap(),
                }),
                TransformSpec::default(),
            )
            .await
            .unwrap();
        let err = manager
            .register(
                Arc::new(StaticPlugin {
                    name: "b".to_string(),
                    mount: Path::parse("/plugins/users/nested").unwrap(),
                }),
                TransformSpec::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PluginError::Store(StoreError::MountConflict { .. })
        ));
    }

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval(&json!(30)), Some(Duration::from_secs(30)));
        assert_eq!(parse_interval(&json!("45s")), Some(Duration::from_secs(45)));
        assert_eq!(parse_interval(&json!("2m")), Some(Duration::from_secs(120)));
        assert_eq!(parse_interval(&json!("500ms")), Some(Duration::from_millis(500)));
        assert_eq!(parse_interval(&json!(true)), None);
    }
}
