//! Vault secret source
//!
//! One connection to the external key store, established at config load and
//! authenticated by a static token, a token file, AppRole, or a Kubernetes
//! service-account token. `VAULT_ADDR` / `VAULT_TOKEN` act as environment
//! fallbacks for the address and static token.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use vaultrs::client::{VaultClient, VaultClientSettingsBuilder};

use super::{AccessType, EkmError, SecretRef, VaultConfig};

/// Something that can fetch secret values by reference. The production
/// implementation talks to Vault; tests substitute a map-backed source.
#[async_trait]
pub trait SecretSource: Send + Sync {
    /// Fetch the scalar value a reference points at.
    async fn fetch(&self, reference: &SecretRef) -> Result<Value, EkmError>;
}

/// Vault-backed secret source.
pub struct VaultSource {
    client: VaultClient,
}

impl VaultSource {
    /// Connect and authenticate once, per the configured access type.
    ///
    /// # Errors
    /// `EkmError::Connection` when the address is missing or authentication
    /// fails.
    pub async fn connect(config: &VaultConfig) -> Result<Self, EkmError> {
        let address = config
            .url
            .clone()
            .or_else(|| std::env::var("VAULT_ADDR").ok())
            .ok_or_else(|| EkmError::Connection {
                message: "no vault address configured and VAULT_ADDR is unset".to_string(),
            })?;

        let bootstrap = |token: &str| {
            VaultClientSettingsBuilder::default()
                .address(address.as_str())
                .token(token)
                .build()
                .map_err(|e| EkmError::Connection {
                    message: format!("invalid vault client settings: {e}"),
                })
                .and_then(|settings| {
                    VaultClient::new(settings).map_err(|e| EkmError::Connection {
                        message: format!("failed to build vault client: {e}"),
                    })
                })
        };

        let client = match config.access_type {
            AccessType::Token => {
                let token = config
                    .token
                    .clone()
                    .or_else(|| {
                        config.token_file.as_ref().and_then(|path| {
                            std::fs::read_to_string(path)
                                .ok()
                                .map(|s| s.trim().to_string())
                        })
                    })
                    .or_else(|| std::env::var("VAULT_TOKEN").ok())
                    .ok_or_else(|| EkmError::Connection {
                        message: "no vault token configured and VAULT_TOKEN is unset".to_string(),
                    })?;
                bootstrap(&token)?
            }
            AccessType::Approle => {
                let approle = config.approle.as_ref().ok_or_else(|| EkmError::Connection {
                    message: "access_type approle requires an approle section".to_string(),
                })?;
                let unauthenticated = bootstrap("")?;
                let secret_id = if approle.wrapped {
                    unwrap_secret_id(&unauthenticated, &approle.secret_id).await?
                } else {
                    approle.secret_id.clone()
                };
                let login = vaultrs::auth::approle::login(
                    &unauthenticated,
                    "approle",
                    &approle.role_id,
                    &secret_id,
                )
                .await
                .map_err(|e| EkmError::Connection {
                    message: format!("approle login failed: {e}"),
                })?;
                bootstrap(&login.client_token)?
            }
            AccessType::Kubernetes => {
                let kubernetes =
                    config
                        .kubernetes
                        .as_ref()
                        .ok_or_else(|| EkmError::Connection {
                            message: "access_type kubernetes requires a kubernetes section"
                                .to_string(),
                        })?;
                let jwt = std::fs::read_to_string(&kubernetes.service_token).map_or_else(
                    |_| kubernetes.service_token.clone(),
                    |contents| contents.trim().to_string(),
                );
                let unauthenticated = bootstrap("")?;
                let login = vaultrs::auth::kubernetes::login(
                    &unauthenticated,
                    "kubernetes",
                    &kubernetes.role,
                    &jwt,
                )
                .await
                .map_err(|e| EkmError::Connection {
                    message: format!("kubernetes login failed: {e}"),
                })?;
                bootstrap(&login.client_token)?
            }
        };

        Ok(Self { client })
    }
}

async fn unwrap_secret_id(client: &VaultClient, token: &str) -> Result<String, EkmError> {
    let unwrapped: HashMap<String, Value> =
        vaultrs::sys::wrapping::unwrap(client, Some(token))
            .await
            .map_err(|e| EkmError::Connection {
                message: format!("failed to unwrap approle secret id: {e}"),
            })?;
    unwrapped
        .get("secret_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| EkmError::Connection {
            message: "wrapped response carried no secret_id".to_string(),
        })
}

#[async_trait]
impl SecretSource for VaultSource {
    async fn fetch(&self, reference: &SecretRef) -> Result<Value, EkmError> {
        let secret: HashMap<String, Value> =
            vaultrs::kv2::read(&self.client, &reference.mount, &reference.path)
                .await
                .map_err(|e| EkmError::Resolution {
                    reference: reference.to_string(),
                    message: e.to_string(),
                })?;

        let field = secret
            .get(&reference.field)
            .ok_or_else(|| EkmError::Resolution {
                reference: reference.to_string(),
                message: format!("field {} not present in secret", reference.field),
            })?;

        match &reference.subfield {
            None => Ok(field.clone()),
            Some(subfield) => field
                .get(subfield)
                .cloned()
                .ok_or_else(|| EkmError::Resolution {
                    reference: reference.to_string(),
                    message: format!("subfield {subfield} not present in secret field"),
                }),
        }
    }
}
