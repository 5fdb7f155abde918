//! In-memory document store
//!
//! The store holds one JSON document tree, the set of loaded policy modules,
//! and the `/system` metadata subtree maintained by the bundle activator.
//! Readers obtain a consistent snapshot; writers serialize on a single
//! commit lock and publish the new state atomically. Path ownership lets a
//! data plugin claim a subtree as its exclusive write domain.

mod ownership;
mod path;
mod trigger;

pub use ownership::OwnershipRegistry;
pub use path::{Path, Segment};
pub use trigger::TriggerRegistry;

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::policy::ast::Module;

/// Errors raised by store operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Path does not address an existing value
    #[error("storage path not found: {path}")]
    NotFound {
        /// The missing path
        path: String,
    },

    /// Path string failed to parse
    #[error("invalid storage path: {path}")]
    InvalidPath {
        /// The offending raw path
        path: String,
    },

    /// Write arrived through the public API under a claimed prefix
    #[error("path {path} is owned by {owner}")]
    OwnershipViolation {
        /// The rejected write path
        path: String,
        /// The plugin owning the prefix
        owner: String,
    },

    /// A plugin tried to claim a prefix already claimed by another owner
    #[error("mount {path} conflicts with existing claim by {owner}")]
    MountConflict {
        /// The conflicting prefix
        path: String,
        /// The existing owner
        owner: String,
    },

    /// Write issued through a read-only transaction
    #[error("operation requires a write transaction")]
    ReadOnly,

    /// Value at an intermediate segment has the wrong type
    #[error("cannot descend into non-collection value at {path}")]
    NotACollection {
        /// The path of the scalar that blocked descent
        path: String,
    },

    /// Policy module not present
    #[error("policy not found: {id}")]
    PolicyNotFound {
        /// The missing policy id
        id: String,
    },
}

/// Who is issuing a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Author {
    /// The public HTTP API
    Public,
    /// A data plugin, identified by its instance name
    Plugin(String),
    /// The bundle activator or other internal machinery
    System,
}

/// Transaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnKind {
    /// Snapshot reads only
    Read,
    /// Staged writes, published on commit
    Write,
}

/// Write operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert a value; parent collections must already exist
    Add,
    /// Remove the value at the path
    Remove,
    /// Replace the existing value at the path
    Replace,
}

/// One committed change, as reported to triggers.
#[derive(Debug, Clone)]
pub struct Delta {
    /// The operation applied
    pub op: WriteOp,
    /// The path it applied to
    pub path: Path,
}

/// Handle for removing a registered trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerId(pub(crate) u64);

/// A policy module resident in the store: source text plus parsed AST.
#[derive(Debug, Clone)]
pub struct StoredPolicy {
    /// Module id (activation prefixes these with `bundleName/`)
    pub id: String,
    /// Raw module source
    pub source: String,
    /// Parsed module
    pub module: Arc<Module>,
}

#[derive(Debug, Clone)]
struct State {
    data: Value,
    policies: BTreeMap<String, StoredPolicy>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            data: Value::Object(Map::new()),
            policies: BTreeMap::new(),
        }
    }
}

/// A transaction over the store.
///
/// Read transactions are cheap snapshots. Write transactions hold the
/// store's writer lock from open to commit/abort, staging changes against a
/// private copy of the state.
pub struct Transaction {
    id: u64,
    kind: TxnKind,
    author: Author,
    snapshot: Arc<State>,
    staged: Option<State>,
    deltas: Vec<Delta>,
    _guard: Option<OwnedMutexGuard<()>>,
}

impl Transaction {
    /// The transaction id, for logging.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// The author this transaction writes as.
    #[must_use]
    pub const fn author(&self) -> &Author {
        &self.author
    }

    /// The document root visible to this transaction.
    #[must_use]
    pub fn data(&self) -> &Value {
        self.staged.as_ref().map_or(&self.snapshot.data, |s| &s.data)
    }

    fn state(&self) -> &State {
        self.staged.as_ref().unwrap_or(&self.snapshot)
    }

    fn staged_mut(&mut self) -> Result<&mut State, StoreError> {
        self.staged.as_mut().ok_or(StoreError::ReadOnly)
    }
}

/// The in-memory document store.
pub struct Store {
    state: RwLock<Arc<State>>,
    writer: Arc<Mutex<()>>,
    ownership: OwnershipRegistry,
    triggers: TriggerRegistry,
    txn_counter: AtomicU64,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Arc::new(State::default())),
            writer: Arc::new(Mutex::new(())),
            ownership: OwnershipRegistry::new(),
            triggers: TriggerRegistry::new(),
            txn_counter: AtomicU64::new(0),
        }
    }

    /// The path-ownership registry.
    #[must_use]
    pub fn ownership(&self) -> &OwnershipRegistry {
        &self.ownership
    }

    /// The commit trigger registry.
    #[must_use]
    pub fn triggers(&self) -> &TriggerRegistry {
        &self.triggers
    }

    fn current(&self) -> Arc<State> {
        Arc::clone(
            &self
                .state
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }

    /// Open a transaction.
    ///
    /// Write transactions block until the single writer slot is free, then
    /// stage against a copy of the current state. Bundle activation and
    /// public writes therefore serialize; ownership checks never race a
    /// concurrent activation.
    pub async fn new_transaction(&self, kind: TxnKind, author: Author) -> Transaction {
        let id = self.txn_counter.fetch_add(1, Ordering::Relaxed) + 1;
        match kind {
            TxnKind::Read => Transaction {
                id,
                kind,
                author,
                snapshot: self.current(),
                staged: None,
                deltas: Vec::new(),
                _guard: None,
            },
            TxnKind::Write => {
                let guard = Arc::clone(&self.writer).lock_owned().await;
                let snapshot = self.current();
                let staged = (*snapshot).clone();
                Transaction {
                    id,
                    kind,
                    author,
                    snapshot,
                    staged: Some(staged),
                    deltas: Vec::new(),
                    _guard: Some(guard),
                }
            }
        }
    }

    /// Read the value at `path`.
    ///
    /// # Errors
    /// `StoreError::NotFound` when nothing exists there.
    pub fn read(&self, txn: &Transaction, path: &Path) -> Result<Value, StoreError> {
        value_at(&txn.state().data, path)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                path: path.to_string(),
            })
    }

    /// Apply a write operation at `path`.
    ///
    /// # Errors
    /// Ownership violations, missing parents for `Add`, and missing targets
    /// for `Remove`/`Replace` all abort the individual write; the
    /// transaction remains usable.
    pub fn write(
        &self,
        txn: &mut Transaction,
        op: WriteOp,
        path: &Path,
        value: Value,
    ) -> Result<(), StoreError> {
        if txn.kind != TxnKind::Write {
            return Err(StoreError::ReadOnly);
        }
        self.ownership.check_write(path, &txn.author)?;
        let staged = txn.staged_mut()?;
        apply_write(&mut staged.data, op, path, value)?;
        txn.deltas.push(Delta {
            op,
            path: path.clone(),
        });
        Ok(())
    }

    /// Create missing intermediate objects so that `Add` at `path` succeeds.
    ///
    /// # Errors
    /// Fails on ownership violations or when a scalar blocks descent.
    pub fn make_dirs(&self, txn: &mut Transaction, path: &Path) -> Result<(), StoreError> {
        if path.is_empty() {
            return Ok(());
        }
        self.ownership.check_write(path, &txn.author)?;
        let staged = txn.staged_mut()?;
        let mut current = &mut staged.data;
        for segment in &path.0[..path.len() - 1] {
            let key = segment.as_key();
            match current {
                Value::Object(map) => {
                    current = map
                        .entry(key)
                        .or_insert_with(|| Value::Object(Map::new()));
                }
                _ => {
                    return Err(StoreError::NotACollection {
                        path: path.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Bulk-ingest `(path, value)` pairs into a fresh subtree.
    ///
    /// Every path in `base_paths` is erased first (missing ones are
    /// ignored); the streamed entries are then written with intermediate
    /// objects created implicitly. Ownership checks are skipped for the
    /// `System` author, which is how bundle activation loads snapshot data.
    ///
    /// # Errors
    /// Propagates write failures; the staged state keeps partial progress
    /// but nothing is visible until commit.
    pub fn truncate<I>(
        &self,
        txn: &mut Transaction,
        base_paths: &[Path],
        entries: I,
    ) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = (Path, Value)>,
    {
        if txn.kind != TxnKind::Write {
            return Err(StoreError::ReadOnly);
        }
        for base in base_paths {
            if txn.author != Author::System {
                self.ownership.check_write(base, &txn.author)?;
            }
            let staged = txn.staged_mut()?;
            if value_at(&staged.data, base).is_some() {
                apply_write(&mut staged.data, WriteOp::Remove, base, Value::Null)?;
                txn.deltas.push(Delta {
                    op: WriteOp::Remove,
                    path: base.clone(),
                });
            }
        }
        for (path, value) in entries {
            if txn.author != Author::System {
                self.ownership.check_write(&path, &txn.author)?;
            }
            self.make_dirs(txn, &path)?;
            let staged = txn.staged_mut()?;
            apply_write(&mut staged.data, WriteOp::Add, &path, value)?;
            txn.deltas.push(Delta {
                op: WriteOp::Add,
                path,
            });
        }
        Ok(())
    }

    /// Insert or replace a policy module.
    ///
    /// # Errors
    /// `StoreError::ReadOnly` outside a write transaction.
    pub fn upsert_policy(
        &self,
        txn: &mut Transaction,
        policy: StoredPolicy,
    ) -> Result<(), StoreError> {
        let staged = txn.staged_mut()?;
        staged.policies.insert(policy.id.clone(), policy);
        Ok(())
    }

    /// Delete a policy module.
    ///
    /// # Errors
    /// `StoreError::PolicyNotFound` when absent.
    pub fn delete_policy(&self, txn: &mut Transaction, id: &str) -> Result<(), StoreError> {
        let staged = txn.staged_mut()?;
        staged
            .policies
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::PolicyNotFound { id: id.to_string() })
    }

    /// Ids of all resident policies, sorted.
    #[must_use]
    pub fn list_policies(&self, txn: &Transaction) -> Vec<String> {
        txn.state().policies.keys().cloned().collect()
    }

    /// Fetch one resident policy.
    #[must_use]
    pub fn get_policy(&self, txn: &Transaction, id: &str) -> Option<StoredPolicy> {
        txn.state().policies.get(id).cloned()
    }

    /// All resident policies, for compilation.
    #[must_use]
    pub fn policies(&self, txn: &Transaction) -> Vec<StoredPolicy> {
        txn.state().policies.values().cloned().collect()
    }

    /// Publish a write transaction.
    ///
    /// Read transactions commit as a no-op. Triggers fire after the new
    /// state becomes visible.
    pub fn commit(&self, txn: Transaction) {
        let Transaction {
            staged,
            deltas,
            _guard,
            ..
        } = txn;
        if let Some(staged) = staged {
            {
                let mut state = self
                    .state
                    .write()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                *state = Arc::new(staged);
            }
            self.triggers.fire(&deltas);
        }
        // _guard drops here, releasing the writer slot.
    }

    /// Discard a transaction without publishing.
    pub fn abort(&self, txn: Transaction) {
        drop(txn);
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("ownership", &self.ownership)
            .finish_non_exhaustive()
    }
}

/// Navigate to the value at `path`.
#[must_use]
pub fn value_at<'a>(root: &'a Value, path: &Path) -> Option<&'a Value> {
    let mut current = root;
    for segment in &path.0 {
        current = match (current, segment) {
            (Value::Object(map), seg) => map.get(&seg.as_key())?,
            (Value::Array(items), Segment::Index(i)) => items.get(*i)?,
            (Value::Array(items), Segment::Key(k)) => items.get(k.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn apply_write(
    root: &mut Value,
    op: WriteOp,
    path: &Path,
    value: Value,
) -> Result<(), StoreError> {
    if path.is_empty() {
        return match op {
            WriteOp::Add | WriteOp::Replace => {
                *root = value;
                Ok(())
            }
            WriteOp::Remove => {
                *root = Value::Object(Map::new());
                Ok(())
            }
        };
    }

    let (parent_path, last) = (Path(path.0[..path.len() - 1].to_vec()), &path.0[path.len() - 1]);
    let parent = value_at_mut(root, &parent_path).ok_or_else(|| StoreError::NotFound {
        path: parent_path.to_string(),
    })?;

    match parent {
        Value::Object(map) => {
            let key = last.as_key();
            match op {
                WriteOp::Add => {
                    map.insert(key, value);
                    Ok(())
                }
                WriteOp::Replace => {
                    if map.contains_key(&key) {
                        map.insert(key, value);
                        Ok(())
                    } else {
                        Err(StoreError::NotFound {
                            path: path.to_string(),
                        })
                    }
                }
                WriteOp::Remove => map.remove(&key).map(|_| ()).ok_or_else(|| {
                    StoreError::NotFound {
                        path: path.to_string(),
                    }
                }),
            }
        }
        Value::Array(items) => {
            let index = match last {
                Segment::Index(i) => *i,
                Segment::Key(k) => k.parse::<usize>().map_err(|_| StoreError::NotFound {
                    path: path.to_string(),
                })?,
            };
            match op {
                WriteOp::Add => {
                    if index > items.len() {
                        return Err(StoreError::NotFound {
                            path: path.to_string(),
                        });
                    }
                    items.insert(index, value);
                    Ok(())
                }
                WriteOp::Replace => {
                    if index >= items.len() {
                        return Err(StoreError::NotFound {
                            path: path.to_string(),
                        });
                    }
                    items[index] = value;
                    Ok(())
                }
                WriteOp::Remove => {
                    if index >= items.len() {
                        return Err(StoreError::NotFound {
                            path: path.to_string(),
                        });
                    }
                    items.remove(index);
                    Ok(())
                }
            }
        }
        _ => Err(StoreError::NotACollection {
            path: parent_path.to_string(),
        }),
    }
}

fn value_at_mut<'a>(root: &'a mut Value, path: &Path) -> Option<&'a mut Value> {
    let mut current = root;
    for segment in &path.0 {
        current = match (current, segment) {
            (Value::Object(map), seg) => map.get_mut(&seg.as_key())?,
            (Value::Array(items), Segment::Index(i)) => items.get_mut(*i)?,
            (Value::Array(items), Segment::Key(k)) => {
                let index = k.parse::<usize>().ok()?;
                items.get_mut(index)?
            }
            _ => return None,
        };
    }
    Some(current)
}
