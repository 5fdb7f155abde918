//! LDAP data-plugin driver
//!
//! Polls an LDAP directory: tries each configured URL in order, binds when
//! credentials are present, runs the search, and converts every entry into
//! a JSON object of `{attribute: [values…]}` plus a parsed `dn`. A
//! `SizeLimitExceeded` result code counts as success with truncation; an
//! empty result warns and leaves the store untouched.

use async_trait::async_trait;
use ldap3::{DerefAliases, LdapConnAsync, LdapConnSettings, Scope, SearchEntry, SearchOptions};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::time::interval;
use tracing::{debug, warn};

use crate::store::Path;

use super::http::{DEFAULT_POLLING_INTERVAL, MIN_POLLING_INTERVAL};
use super::{DataPlugin, Ingester, PluginError, parse_interval};

/// LDAP result code for a size-limited search.
const SIZE_LIMIT_EXCEEDED: u32 = 4;

/// Search scope selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LdapScope {
    /// The base object only
    #[serde(rename = "base-object")]
    BaseObject,
    /// Direct children of the base
    #[serde(rename = "single-level")]
    SingleLevel,
    /// The whole subtree
    #[serde(rename = "whole-subtree")]
    WholeSubtree,
}

impl Default for LdapScope {
    fn default() -> Self {
        Self::WholeSubtree
    }
}

impl From<LdapScope> for Scope {
    fn from(scope: LdapScope) -> Self {
        match scope {
            LdapScope::BaseObject => Self::Base,
            LdapScope::SingleLevel => Self::OneLevel,
            LdapScope::WholeSubtree => Self::Subtree,
        }
    }
}

/// Alias dereferencing selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LdapDeref {
    /// Never dereference
    Never,
    /// Dereference while searching
    Searching,
    /// Dereference when locating the base
    Finding,
    /// Always dereference
    Always,
}

impl Default for LdapDeref {
    fn default() -> Self {
        Self::Never
    }
}

impl From<LdapDeref> for DerefAliases {
    fn from(deref: LdapDeref) -> Self {
        match deref {
            LdapDeref::Never => Self::Never,
            LdapDeref::Searching => Self::Searching,
            LdapDeref::Finding => Self::Finding,
            LdapDeref::Always => Self::Always,
        }
    }
}

/// LDAP driver configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LdapDriverConfig {
    /// Directory URLs, tried in order until one answers
    pub urls: Vec<String>,
    /// Search base DN
    pub base_dn: String,
    /// Search filter
    #[serde(default = "default_filter")]
    pub filter: String,
    /// Search scope
    #[serde(default)]
    pub scope: LdapScope,
    /// Alias dereferencing
    #[serde(default)]
    pub deref: LdapDeref,
    /// Attributes to fetch; all when absent
    #[serde(default)]
    pub attributes: Option<Vec<String>>,
    /// Bind DN
    #[serde(default)]
    pub username: Option<String>,
    /// Bind password; empty only with `allow_empty_password`
    #[serde(default)]
    pub password: Option<String>,
    /// Permit a simple bind with an empty password
    #[serde(default)]
    pub allow_empty_password: bool,
    /// Polling interval (min 10s, default 30s)
    #[serde(default)]
    pub polling_interval: Option<Value>,
    /// Per-connection timeout
    #[serde(default)]
    pub timeout: Option<Value>,
    /// Skip TLS certificate verification
    #[serde(default)]
    pub tls_insecure_skip_verify: bool,
}

fn default_filter() -> String {
    "(objectClass=*)".to_string()
}

impl LdapDriverConfig {
    fn effective_interval(&self) -> Duration {
        self.polling_interval
            .as_ref()
            .and_then(parse_interval)
            .unwrap_or(DEFAULT_POLLING_INTERVAL)
            .max(MIN_POLLING_INTERVAL)
    }

    fn effective_timeout(&self) -> Duration {
        self.timeout
            .as_ref()
            .and_then(parse_interval)
            .unwrap_or(Duration::from_secs(10))
    }
}

/// The LDAP polling driver.
pub struct LdapDataPlugin {
    name: String,
    mount: Path,
    config: Mutex<LdapDriverConfig>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl LdapDataPlugin {
    /// Build a driver instance from its configuration section.
    ///
    /// # Errors
    /// Fails on missing URLs, a missing base DN, or an empty password for a
    /// non-empty bind user.
    pub fn new(name: &str, mount: Path, config: LdapDriverConfig) -> Result<Self, PluginError> {
        if config.urls.is_empty() {
            return Err(PluginError::Config {
                message: format!("plugin {name}: at least one url is required"),
            });
        }
        if config.base_dn.is_empty() {
            return Err(PluginError::Config {
                message: format!("plugin {name}: base_dn is required"),
            });
        }
        if config.username.as_deref().is_some_and(|u| !u.is_empty())
            && config.password.as_deref().is_none_or(str::is_empty)
            && !config.allow_empty_password
        {
            return Err(PluginError::Config {
                message: format!("plugin {name}: password required for bind user"),
            });
        }
        Ok(Self {
            name: name.to_string(),
            mount,
            config: Mutex::new(config),
            shutdown: Mutex::new(None),
        })
    }

    async fn spawn_loop(&self, ingester: Arc<Ingester>) -> Result<(), PluginError> {
        let config = self.config.lock().await.clone();
        let name = self.name.clone();
        let (tx, mut rx) = watch::channel(false);
        {
            let mut shutdown = self.shutdown.lock().await;
            if let Some(previous) = shutdown.replace(tx) {
                let _ = previous.send(true);
            }
        }

        tokio::spawn(async move {
            let mut ticker = interval(config.effective_interval());
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match poll_once(&config).await {
                            Ok(entries) if entries.is_empty() => {
                                warn!(plugin = %name, "search returned no entries, keeping previous document");
                            }
                            Ok(entries) => {
                                if let Err(err) = ingester.ingest(Value::Array(entries)).await {
                                    warn!(plugin = %name, error = %err, "ingest failed");
                                }
                            }
                            Err(err) => {
                                warn!(plugin = %name, error = %err, "poll failed, retrying next interval");
                            }
                        }
                    }
                    _ = rx.changed() => {
                        debug!(plugin = %name, "ldap poll loop stopping");
                        break;
                    }
                }
            }
        });
        Ok(())
    }
}

/// One search pass: first URL that answers wins.
async fn poll_once(config: &LdapDriverConfig) -> Result<Vec<Value>, PluginError> {
    let mut last_error = None;
    for url in &config.urls {
        match search_url(url, config).await {
            Ok(entries) => return Ok(entries),
            Err(err) => {
                debug!(url = %url, error = %err, "ldap url failed, trying next");
                last_error = Some(err);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| PluginError::Driver {
        message: "no ldap url configured".to_string(),
    }))
}

async fn search_url(url: &str, config: &LdapDriverConfig) -> Result<Vec<Value>, PluginError> {
    let settings = LdapConnSettings::new()
        .set_conn_timeout(config.effective_timeout())
        .set_no_tls_verify(config.tls_insecure_skip_verify);
    let (conn, mut ldap) = LdapConnAsync::with_settings(settings, url)
        .await
        .map_err(|e| PluginError::Driver {
            message: format!("connect to {url} failed: {e}"),
        })?;
    ldap3::drive!(conn);

    if let Some(username) = config.username.as_deref().filter(|u| !u.is_empty()) {
        let password = config.password.as_deref().unwrap_or_default();
        ldap.simple_bind(username, password)
            .await
            .and_then(ldap3::LdapResult::success)
            .map_err(|e| PluginError::Driver {
                message: format!("bind failed: {e}"),
            })?;
    }

    let attributes: Vec<String> = config
        .attributes
        .clone()
        .unwrap_or_else(|| vec!["*".to_string()]);
    let search = ldap
        .with_search_options(SearchOptions::new().deref(config.deref.into()))
        .search(
            &config.base_dn,
            config.scope.into(),
            &config.filter,
            attributes,
        )
        .await
        .map_err(|e| PluginError::Driver {
            message: format!("search failed: {e}"),
        })?;

    let (entries, result) = (search.0, search.1);
    match result.rc {
        0 => {}
        SIZE_LIMIT_EXCEEDED => {
            warn!(url = %url, "ldap size limit exceeded, ingesting truncated result");
        }
        rc => {
            return Err(PluginError::Driver {
                message: format!("search returned result code {rc}: {}", result.text),
            });
        }
    }

    let _ = ldap.unbind().await;

    Ok(entries
        .into_iter()
        .map(|entry| entry_to_value(SearchEntry::construct(entry)))
        .collect())
}

/// Convert one directory entry to its JSON form:
/// `{attr: [values…], dn: {rdnType: [values…], _raw: "<dn>"}}`.
fn entry_to_value(entry: SearchEntry) -> Value {
    let mut object = Map::new();
    for (attribute, values) in entry.attrs {
        object.insert(
            attribute,
            Value::Array(values.into_iter().map(Value::String).collect()),
        );
    }
    object.insert("dn".to_string(), parse_dn(&entry.dn));
    Value::Object(object)
}

fn parse_dn(dn: &str) -> Value {
    let mut object = Map::new();
    for component in dn.split(',') {
        let Some((rdn_type, value)) = component.trim().split_once('=') else {
            continue;
        };
        let slot = object
            .entry(rdn_type.trim().to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(values) = slot {
            values.push(Value::String(value.trim().to_string()));
        }
    }
    object.insert("_raw".to_string(), Value::String(dn.to_string()));
    Value::Object(object)
}

#[async_trait]
impl DataPlugin for LdapDataPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &Path {
        &self.mount
    }

    async fn start(&self, ingester: Arc<Ingester>) -> Result<(), PluginError> {
        self.spawn_loop(ingester).await
    }

    async fn stop(&self) {
        let mut shutdown = self.shutdown.lock().await;
        if let Some(tx) = shutdown.take() {
            let _ = tx.send(true);
        }
    }

    async fn reconfigure(
        &self,
        ingester: Arc<Ingester>,
        new_config: Value,
    ) -> Result<(), PluginError> {
        let parsed: LdapDriverConfig =
            serde_json::from_value(new_config).map_err(|e| PluginError::Config {
                message: format!("invalid ldap plugin configuration: {e}"),
            })?;
        {
            let mut current = self.config.lock().await;
            if *current == parsed {
                debug!(plugin = %self.name, "reconfigure with identical configuration, skipping");
                return Ok(());
            }
            *current = parsed;
        }
        self.spawn_loop(ingester).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn config(raw: Value) -> LdapDriverConfig {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let c = config(json!({
            "urls": ["ldap://dir.example.com"],
            "base_dn": "dc=example,dc=com"
        }));
        assert_eq!(c.filter, "(objectClass=*)");
        assert_eq!(c.scope, LdapScope::WholeSubtree);
        assert_eq!(c.deref, LdapDeref::Never);
        assert_eq!(c.effective_interval(), DEFAULT_POLLING_INTERVAL);
    }

    #[test]
    fn test_scope_and_deref_parse() {
        let c = config(json!({
            "urls": ["ldap://dir.example.com"],
            "base_dn": "dc=example,dc=com",
            "scope": "single-level",
            "deref": "always"
        }));
        assert_eq!(c.scope, LdapScope::SingleLevel);
        assert_eq!(c.deref, LdapDeref::Always);
    }

    #[test]
    fn test_missing_urls_rejected() {
        let err = LdapDataPlugin::new(
            "l",
            Path::parse("/plugins/l").unwrap(),
            config(json!({"urls": [], "base_dn": "dc=example,dc=com"})),
        )
        .err()
        .unwrap();
        assert!(matches!(err, PluginError::Config { .. }));
    }

    #[test]
    fn test_entry_conversion() {
        let entry = SearchEntry {
            dn: "uid=alice,ou=people,dc=example,dc=com".to_string(),
            attrs: HashMap::from([
                ("uid".to_string(), vec!["alice".to_string()]),
                ("cn".to_string(), vec!["Alice Example".to_string()]),
                (
                    "memberOf".to_string(),
                    vec![
                        "cn=app-admins,ou=groups,dc=example,dc=com".to_string(),
                        "cn=app-superadmins,ou=groups,dc=example,dc=com".to_string(),
                    ],
                ),
            ]),
            bin_attrs: HashMap::new(),
        };

        let value = entry_to_value(entry);
        assert_eq!(value["uid"], json!(["alice"]));
        assert_eq!(value["cn"], json!(["Alice Example"]));
        assert_eq!(value["memberOf"].as_array().unwrap().len(), 2);
        assert_eq!(value["dn"]["uid"], json!(["alice"]));
        assert_eq!(value["dn"]["ou"], json!(["people"]));
        assert_eq!(value["dn"]["dc"], json!(["example", "com"]));
        assert_eq!(
            value["dn"]["_raw"],
            json!("uid=alice,ou=people,dc=example,dc=com")
        );
    }

    #[test]
    fn test_dn_parse_handles_spacing() {
        let parsed = parse_dn("cn=app-admins, ou=groups, dc=example, dc=com");
        assert_eq!(parsed["cn"], json!(["app-admins"]));
        assert_eq!(parsed["ou"], json!(["groups"]));
    }

    /// Full ingest path: directory entries are converted, run through a
    /// users/groups transform, and land at the claimed mount.
    #[tokio::test]
    async fn test_directory_ingest_with_transform() {
        use crate::plugins::{DataPlugin, Ingester, PluginManager, TransformSpec};
        use crate::policy::compiler::compile;
        use crate::policy::parser::parse_module;
        use crate::store::{Author, Store, TxnKind};
        use std::sync::{Arc, RwLock};

        const TRANSFORM: &str = "package transforms.directory\n\nusers := {id: {\"name\": name} | some i\n\tentry := input.incoming[i]\n\tentry.uid\n\tid := entry.uid[0]\n\tname := entry.cn[0]} if true\n\ngroups := {name: members | some i\n\tentry := input.incoming[i]\n\tentry.memberUid\n\tname := entry.cn[0]\n\tmembers := entry.memberUid} if true\n";

        struct Inert {
            mount: Path,
        }

        #[async_trait]
        impl DataPlugin for Inert {
            fn name(&self) -> &str {
                "ldap.directory"
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

        fn person(uid: &str, name: &str) -> SearchEntry {
            SearchEntry {
                dn: format!("uid={uid},ou=people,dc=example,dc=com"),
                attrs: HashMap::from([
                    ("uid".to_string(), vec![uid.to_string()]),
                    ("cn".to_string(), vec![name.to_string()]),
                ]),
                bin_attrs: HashMap::new(),
            }
        }

        fn group(name: &str, members: &[&str]) -> SearchEntry {
            SearchEntry {
                dn: format!("cn={name},ou=groups,dc=example,dc=com"),
                attrs: HashMap::from([
                    ("cn".to_string(), vec![name.to_string()]),
                    (
                        "memberUid".to_string(),
                        members.iter().map(|m| (*m).to_string()).collect(),
                    ),
                ]),
                bin_attrs: HashMap::new(),
            }
        }

        let compiled =
            compile(vec![Arc::new(parse_module("transform.rego", TRANSFORM).unwrap())]).unwrap();
        let store = Arc::new(Store::new());
        let manager = PluginManager::new(
            Arc::clone(&store),
            Arc::new(RwLock::new(Arc::new(compiled))),
        );

        let mount = Path::parse("/ldap/directory").unwrap();
        manager
            .register(
                Arc::new(Inert {
                    mount: mount.clone(),
                }),
                TransformSpec {
                    rule_ref: Some("data.transforms.directory".to_string()),
                    include_previous: false,
                },
            )
            .await
            .unwrap();

        let entries: Vec<Value> = vec![
            person("alice", "Alice Example"),
            person("bob", "Bob Example"),
            person("admin", "Admin Example"),
            group("app-admins", &["alice", "bob"]),
            group("app-superadmins", &["alice"]),
        ]
        .into_iter()
        .map(entry_to_value)
        .collect();

        manager
            .reconfigure("ldap.directory", json!(null))
            .await
            .unwrap();
        let names = manager.plugin_names().await;
        assert_eq!(names, vec!["ldap.directory".to_string()]);

        // Feed the converted snapshot through the framework's ingest path.
        let ingester = {
            let registered = manager.registered.lock().await;
            Arc::clone(&registered[0].ingester)
        };
        ingester.ingest(Value::Array(entries)).await.unwrap();

        let txn = store.new_transaction(TxnKind::Read, Author::Public).await;
        assert_eq!(
            store.read(&txn, &mount).unwrap(),
            json!({
                "users": {
                    "alice": {"name": "Alice Example"},
                    "bob": {"name": "Bob Example"},
                    "admin": {"name": "Admin Example"}
                },
                "groups": {
                    "app-admins": ["alice", "bob"],
                    "app-superadmins": ["alice"]
                }
            })
        );
    }
}
