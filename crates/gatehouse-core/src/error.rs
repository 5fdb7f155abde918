//! Error types for Gatehouse Core

use thiserror::Error;

/// Gatehouse Core error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Store error
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    /// Policy engine error
    #[error(transparent)]
    Policy(#[from] crate::policy::PolicyError),

    /// Bundle activation error
    #[error(transparent)]
    Bundle(#[from] crate::bundle::ActivationError),

    /// EKM error
    #[error(transparent)]
    Ekm(#[from] crate::ekm::EkmError),

    /// Data-plugin error
    #[error(transparent)]
    Plugin(#[from] crate::plugins::PluginError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Gatehouse Core result type
pub type Result<T> = std::result::Result<T, Error>;
