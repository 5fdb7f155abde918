//! Configuration types
//!
//! The configuration document is YAML or JSON. String leaves may carry
//! `${vault(...)}` placeholders which the EKM resolver replaces at load
//! time, so loading happens in two steps: parse to a raw value, resolve,
//! then deserialize into [`Config`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path as FsPath;

use crate::ekm::EkmConfig;
use crate::error::{Error, Result};
use crate::store::Path;

/// Server listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum request body size in bytes
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
    /// Maximum decompressed size for gzipped bodies, in bytes
    #[serde(default = "default_gzip_max_length")]
    pub gzip_max_length: usize,
    /// Authorization rule evaluated per request, e.g. `data.system.authz.allow`
    #[serde(default)]
    pub authorization: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    8181
}

const fn default_max_request_size() -> usize {
    32 * 1024 * 1024
}

const fn default_gzip_max_length() -> usize {
    64 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_request_size: default_max_request_size(),
            gzip_max_length: default_gzip_max_length(),
            authorization: None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// One `plugins.data.<mount>` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPluginConfig {
    /// Driver type (`http`, `ldap`, ...)
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// Transform rule reference
    #[serde(default)]
    pub rego_transform: Option<String>,
    /// Pass the previous mount contents as `input.previous`
    #[serde(default)]
    pub rego_transform_with_previous: bool,
    /// Driver-specific options
    #[serde(flatten)]
    pub options: Value,
}

/// The `plugins` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Data plugins, keyed by dotted mount path (`ldap.users`)
    #[serde(default)]
    pub data: BTreeMap<String, DataPluginConfig>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server listener settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Data-plugin sections
    #[serde(default)]
    pub plugins: PluginsConfig,
    /// External key-management settings
    #[serde(default)]
    pub ekm: EkmConfig,
}

impl Config {
    /// Read a configuration file (YAML or JSON) into its raw value form,
    /// before EKM resolution.
    ///
    /// # Errors
    /// I/O and syntax errors.
    pub fn raw_from_file(path: &FsPath) -> Result<Value> {
        let contents = std::fs::read_to_string(path)?;
        let yaml: serde_yaml::Value = serde_yaml::from_str(&contents)
            .map_err(|e| Error::Config(format!("invalid configuration file: {e}")))?;
        serde_json::to_value(yaml)
            .map_err(|e| Error::Config(format!("invalid configuration structure: {e}")))
    }

    /// Deserialize the (resolved) raw value.
    ///
    /// # Errors
    /// Structure errors.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| Error::Config(format!("invalid configuration: {e}")))
    }
}

/// Convert a dotted mount key (`ldap.users`) into its store path.
#[must_use]
pub fn mount_path(dotted: &str) -> Path {
    Path::from_keys(dotted.split('.').filter(|s| !s.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = Config::from_value(json!({})).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8181);
        assert_eq!(config.logging.level, "info");
        assert!(config.plugins.data.is_empty());
    }

    #[test]
    fn test_plugin_sections_parse() {
        let config = Config::from_value(json!({
            "plugins": {
                "data": {
                    "ldap.users": {
                        "type": "ldap",
                        "rego_transform": "data.transforms.users",
                        "urls": ["ldap://dir.example.com"],
                        "base_dn": "dc=example,dc=com"
                    }
                }
            }
        }))
        .unwrap();
        let plugin = &config.plugins.data["ldap.users"];
        assert_eq!(plugin.plugin_type, "ldap");
        assert_eq!(
            plugin.rego_transform.as_deref(),
            Some("data.transforms.users")
        );
        assert_eq!(plugin.options["base_dn"], json!("dc=example,dc=com"));
    }

    #[test]
    fn test_mount_path() {
        assert_eq!(mount_path("ldap.users").to_string(), "/ldap/users");
        assert_eq!(mount_path("single").to_string(), "/single");
    }

    #[test]
    fn test_raw_from_file_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "server:\n  port: 9999\nlogging:\n  level: debug\n",
        )
        .unwrap();
        let raw = Config::raw_from_file(&path).unwrap();
        let config = Config::from_value(raw).unwrap();
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.logging.level, "debug");
    }
}
