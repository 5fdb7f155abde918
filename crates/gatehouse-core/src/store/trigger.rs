//! Commit triggers
//!
//! Callbacks registered against the store fire after every successful commit
//! with the list of `(op, path)` deltas the transaction produced. Data
//! plugins use these to rebuild derived views when the subtree they watch
//! changes.

use std::sync::Mutex;

use super::{Delta, TriggerId};

type TriggerFn = Box<dyn Fn(&[Delta]) + Send + Sync>;

/// Registry of commit callbacks.
#[derive(Default)]
pub struct TriggerRegistry {
    inner: Mutex<Vec<(TriggerId, TriggerFn)>>,
    next_id: Mutex<u64>,
}

impl TriggerRegistry {
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Register a callback; returns a handle for later removal.
    pub fn register<F>(&self, callback: F) -> TriggerId
    where
        F: Fn(&[Delta]) + Send + Sync + 'static,
    {
        let mut next = self.next_id.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *next += 1;
        let id = TriggerId(*next);
        drop(next);

        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.push((id, Box::new(callback)));
        id
    }

    /// Remove a previously registered callback.
    pub fn unregister(&self, id: TriggerId) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.retain(|(existing, _)| *existing != id);
    }

    pub(super) fn fire(&self, deltas: &[Delta]) {
        if deltas.is_empty() {
            return;
        }
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for (_, callback) in inner.iter() {
            callback(deltas);
        }
    }
}

impl std::fmt::Debug for TriggerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len();
        f.debug_struct("TriggerRegistry")
            .field("registered", &count)
            .finish()
    }
}
