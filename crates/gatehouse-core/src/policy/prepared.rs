//! Prepared queries and the prepared-query cache
//!
//! A prepared query pins a compiled policy set and a query path so repeated
//! evaluations skip path resolution. The cache is keyed by
//! `(query path, strict-builtin-errors)` and must be invalidated whenever
//! the compiler is replaced: entries hold `Arc`s into compiled modules that
//! belong to the old store state.

use lru::LruCache;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use super::compiler::CompiledPolicies;
use super::evaluator::{CancelFlag, EvalError, Evaluator};

/// Default cache capacity.
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// Outcome of one prepared-query evaluation.
#[derive(Debug)]
pub struct EvalOutcome {
    /// The document value, `Ok(None)` when undefined
    pub result: Result<Option<Value>, EvalError>,
    /// Print output captured during the evaluation, failures included
    pub prints: Vec<String>,
}

/// A compiled, reusable policy query.
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    path: Vec<String>,
    compiled: Arc<CompiledPolicies>,
    strict_builtins: bool,
}

impl PreparedQuery {
    /// Prepare the query at `path` against a compiled policy set.
    #[must_use]
    pub fn new(compiled: Arc<CompiledPolicies>, path: Vec<String>, strict_builtins: bool) -> Self {
        Self {
            path,
            compiled,
            strict_builtins,
        }
    }

    /// The query path segments.
    #[must_use]
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// The compiled policy set this query was prepared against.
    #[must_use]
    pub fn compiled(&self) -> &Arc<CompiledPolicies> {
        &self.compiled
    }

    /// Evaluate against one input and a data snapshot.
    pub fn eval(&self, data: &Value, input: Value, cancel: CancelFlag) -> EvalOutcome {
        let mut evaluator = Evaluator::new(&self.compiled, data, input)
            .with_cancel(cancel)
            .with_strict_builtins(self.strict_builtins);
        let result = evaluator.eval_path(&self.path);
        EvalOutcome {
            result,
            prints: evaluator.take_prints(),
        }
    }
}

/// Concurrency-safe LRU of prepared queries.
pub struct PreparedQueryCache {
    inner: Mutex<LruCache<(String, bool), Arc<PreparedQuery>>>,
}

impl Default for PreparedQueryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl PreparedQueryCache {
    /// Create a cache holding up to `capacity` prepared queries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Fetch the prepared query for `(path, strict)`, preparing and caching
    /// it on miss.
    pub fn get_or_prepare(
        &self,
        compiled: &Arc<CompiledPolicies>,
        path: &[String],
        strict_builtins: bool,
    ) -> Arc<PreparedQuery> {
        let key = (path.join("/"), strict_builtins);
        let mut cache = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(prepared) = cache.get(&key) {
            return Arc::clone(prepared);
        }
        let prepared = Arc::new(PreparedQuery::new(
            Arc::clone(compiled),
            path.to_vec(),
            strict_builtins,
        ));
        cache.put(key, Arc::clone(&prepared));
        prepared
    }

    /// Drop every entry; called on each compiler swap.
    pub fn invalidate_all(&self) {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::compiler::compile;
    use crate::policy::parser::parse_module;
    use serde_json::json;

    fn compiled() -> Arc<CompiledPolicies> {
        let module = parse_module("t.rego", "package t\n\ngt1 if input.req1 > 1\n").unwrap();
        Arc::new(compile(vec![Arc::new(module)]).unwrap())
    }

    #[test]
    fn test_prepared_eval() {
        let prepared = PreparedQuery::new(
            compiled(),
            vec!["t".to_string(), "gt1".to_string()],
            false,
        );
        let data = json!({});
        let outcome = prepared.eval(&data, json!({"req1": 2}), CancelFlag::new());
        assert_eq!(outcome.result.unwrap(), Some(json!(true)));
    }

    #[test]
    fn test_cache_reuses_and_invalidates() {
        let cache = PreparedQueryCache::new(10);
        let compiled = compiled();
        let path = vec!["t".to_string(), "gt1".to_string()];

        let first = cache.get_or_prepare(&compiled, &path, false);
        let second = cache.get_or_prepare(&compiled, &path, false);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);

        // Strictness is part of the key.
        let strict = cache.get_or_prepare(&compiled, &path, true);
        assert!(!Arc::ptr_eq(&first, &strict));
        assert_eq!(cache.len(), 2);

        cache.invalidate_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_evicts_beyond_capacity() {
        let cache = PreparedQueryCache::new(2);
        let compiled = compiled();
        for name in ["a", "b", "c"] {
            cache.get_or_prepare(&compiled, &[name.to_string()], false);
        }
        assert_eq!(cache.len(), 2);
    }
}
