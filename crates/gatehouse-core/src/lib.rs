//! Gatehouse core library
//!
//! The policy decision engine behind the Gatehouse server: an in-memory
//! ownership-aware document store, atomic bundle activation, a compact
//! policy language with partial evaluation, data-filter translation to
//! UCAST and SQL, an external key-management resolver for configuration
//! secrets, and a data-source plugin framework with HTTP and LDAP drivers.

pub mod bundle;
pub mod config;
pub mod ekm;
pub mod error;
pub mod filter;
pub mod logging;
pub mod metrics;
pub mod plugins;
pub mod policy;
pub mod store;

pub use error::{Error, Result};

/// Commonly used types.
pub mod prelude {
    pub use crate::bundle::{ActivationInput, Bundle, Manifest, activate};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::metrics::Metrics;
    pub use crate::plugins::{DataPlugin, PluginManager, TransformSpec};
    pub use crate::policy::compiler::SharedCompiledPolicies;
    pub use crate::policy::{CancelFlag, CompiledPolicies, PreparedQueryCache};
    pub use crate::store::{Author, Path, Store, TxnKind, WriteOp};
}
