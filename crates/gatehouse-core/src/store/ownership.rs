//! Path-ownership registry
//!
//! Data plugins claim a path prefix ("mount") as their exclusive write
//! domain. Writes arriving through the public API are rejected when they
//! touch a claimed prefix; writes by the owning plugin or by the bundle
//! activator pass through.

use dashmap::DashMap;

use super::{Author, Path, StoreError};

/// Registry of claimed path prefixes, keyed by owner id.
#[derive(Debug, Default)]
pub struct OwnershipRegistry {
    claims: DashMap<String, Path>,
}

impl OwnershipRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `prefix` for `owner`.
    ///
    /// # Errors
    /// Returns `StoreError::MountConflict` when the prefix overlaps a claim
    /// held by a different owner.
    pub fn claim(&self, prefix: Path, owner: &str) -> Result<(), StoreError> {
        for entry in &self.claims {
            if entry.key() != owner && entry.value().overlaps(&prefix) {
                return Err(StoreError::MountConflict {
                    path: prefix.to_string(),
                    owner: entry.key().clone(),
                });
            }
        }
        self.claims.insert(owner.to_string(), prefix);
        Ok(())
    }

    /// Release every claim held by `owner`.
    pub fn release(&self, owner: &str) {
        self.claims.remove(owner);
    }

    /// Check whether `author` may write at `path`.
    ///
    /// The bundle activator and the store's own system writes bypass the
    /// registry; a plugin may write inside its own mount; public writes fail
    /// when `path` lies under (or above) any claimed prefix.
    ///
    /// # Errors
    /// Returns `StoreError::OwnershipViolation` when the write is rejected.
    pub fn check_write(&self, path: &Path, author: &Author) -> Result<(), StoreError> {
        match author {
            Author::System => Ok(()),
            Author::Plugin(owner) => {
                for entry in &self.claims {
                    if entry.value().overlaps(path) && entry.key() != owner {
                        return Err(StoreError::OwnershipViolation {
                            path: path.to_string(),
                            owner: entry.key().clone(),
                        });
                    }
                }
                Ok(())
            }
            Author::Public => {
                for entry in &self.claims {
                    if entry.value().overlaps(path) {
                        return Err(StoreError::OwnershipViolation {
                            path: path.to_string(),
                            owner: entry.key().clone(),
                        });
                    }
                }
                Ok(())
            }
        }
    }

    /// The currently claimed prefixes, for diagnostics.
    #[must_use]
    pub fn claims(&self) -> Vec<(String, Path)> {
        self.claims
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}
