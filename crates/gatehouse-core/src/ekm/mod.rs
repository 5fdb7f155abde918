//! External key management (EKM)
//!
//! Rewrites the configuration document at load time, replacing
//! `${vault(path:field)}` placeholders with secrets fetched from the
//! external key store, and feeds the outbound-HTTP credential registry.
//! The connection to the key store is established once; see [`vault`].

pub mod httpsend;
mod resolver;
mod vault;

pub use resolver::{ResolveReport, resolve_placeholders, resolve_vault_section};
pub use vault::{SecretSource, VaultSource};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// EKM errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EkmError {
    /// The key store could not be reached or authenticated against
    #[error("vault connection failed: {message}")]
    Connection {
        /// Failure description
        message: String,
    },

    /// A secret reference did not resolve
    #[error("failed to resolve {reference}: {message}")]
    Resolution {
        /// The reference text
        reference: String,
        /// Failure description
        message: String,
    },

    /// A secret reference was malformed
    #[error("invalid secret reference: {reference}")]
    InvalidReference {
        /// The reference text
        reference: String,
    },
}

/// A parsed secret reference: `mount/path:field` or
/// `mount/path:field/subfield`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    /// KV mount name
    pub mount: String,
    /// Path below the mount
    pub path: String,
    /// Field within the secret
    pub field: String,
    /// Optional nested map key within the field
    pub subfield: Option<String>,
}

impl FromStr for SecretRef {
    type Err = EkmError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || EkmError::InvalidReference {
            reference: raw.to_string(),
        };
        let (location, field_part) = raw.split_once(':').ok_or_else(invalid)?;
        let (mount, path) = location.split_once('/').ok_or_else(invalid)?;
        if mount.is_empty() || path.is_empty() || field_part.is_empty() {
            return Err(invalid());
        }
        let (field, subfield) = match field_part.split_once('/') {
            Some((field, subfield)) if !field.is_empty() && !subfield.is_empty() => {
                (field.to_string(), Some(subfield.to_string()))
            }
            Some(_) => return Err(invalid()),
            None => (field_part.to_string(), None),
        };
        Ok(Self {
            mount: mount.to_string(),
            path: path.to_string(),
            field,
            subfield,
        })
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.mount, self.path, self.field)?;
        if let Some(subfield) = &self.subfield {
            write!(f, "/{subfield}")?;
        }
        Ok(())
    }
}

/// How the vault connection authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    /// Static token or token file
    #[default]
    Token,
    /// AppRole role/secret id pair
    Approle,
    /// Kubernetes service-account token
    Kubernetes,
}

/// AppRole credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppRoleAuth {
    /// The role id
    pub role_id: String,
    /// The secret id, possibly response-wrapped
    pub secret_id: String,
    /// Whether `secret_id` is a wrapping token
    #[serde(default)]
    pub wrapped: bool,
}

/// Kubernetes auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesAuth {
    /// Service-account token, or a path to one
    pub service_token: String,
    /// Vault role to log in as
    #[serde(default = "default_kubernetes_role")]
    pub role: String,
}

fn default_kubernetes_role() -> String {
    "default".to_string()
}

/// One `httpsend` override: secret-ref fields plus header templates that
/// may splice those fields in via `{field}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpSendEntry {
    /// Header name to template
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Field name to secret reference
    #[serde(flatten)]
    pub fields: BTreeMap<String, String>,
}

/// The `ekm.vault` configuration section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Key-store address; falls back to `VAULT_ADDR`
    #[serde(default)]
    pub url: Option<String>,
    /// Authentication method
    #[serde(default)]
    pub access_type: AccessType,
    /// Static token; falls back to `VAULT_TOKEN`
    #[serde(default)]
    pub token: Option<String>,
    /// File holding a token
    #[serde(default)]
    pub token_file: Option<String>,
    /// AppRole credentials
    #[serde(default)]
    pub approle: Option<AppRoleAuth>,
    /// Kubernetes auth settings
    #[serde(default)]
    pub kubernetes: Option<KubernetesAuth>,
    /// Leave unresolvable optional placeholders in place instead of failing
    #[serde(default)]
    pub lenient: bool,
    /// Service credential overrides, `"<service>.<field>": "<ref>"`
    #[serde(default)]
    pub services: BTreeMap<String, String>,
    /// Signing-key overrides, `"<key>.<field>": "<ref>"`
    #[serde(default)]
    pub keys: BTreeMap<String, String>,
    /// Outbound-HTTP credentials, `"<scheme>://<host>": entry`
    #[serde(default)]
    pub httpsend: BTreeMap<String, HttpSendEntry>,
}

/// The `ekm` configuration section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EkmConfig {
    /// Vault integration settings
    #[serde(default)]
    pub vault: Option<VaultConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_ref_parsing() {
        let r: SecretRef = "secret/app/config:api_key".parse().unwrap();
        assert_eq!(r.mount, "secret");
        assert_eq!(r.path, "app/config");
        assert_eq!(r.field, "api_key");
        assert_eq!(r.subfield, None);
        assert_eq!(r.to_string(), "secret/app/config:api_key");
    }

    #[test]
    fn test_secret_ref_with_subfield() {
        let r: SecretRef = "kv/licenses:license/key".parse().unwrap();
        assert_eq!(r.field, "license");
        assert_eq!(r.subfield.as_deref(), Some("key"));
    }

    #[test]
    fn test_malformed_refs_rejected() {
        assert!("no-colon".parse::<SecretRef>().is_err());
        assert!("nopath:field".parse::<SecretRef>().is_err());
        assert!("m/p:".parse::<SecretRef>().is_err());
        assert!("m/p:f/".parse::<SecretRef>().is_err());
    }
}
