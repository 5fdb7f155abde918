//! Decision-log shim
//!
//! Envelopes every decision with its ids, bundle revisions, and origin
//! marker, then hands it to the sink: a `tracing` target plus a bounded
//! in-process buffer that tests and diagnostics can read back. Shipping
//! decision logs anywhere is out of scope here.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::debug;

/// Origin marker for batch decisions.
pub const CUSTOM_TYPE_BATCH: &str = "eopa.styra.com/batch";
/// Origin marker for compile decisions.
pub const CUSTOM_TYPE_COMPILE: &str = "eopa.styra.com/compile";

const BUFFER_CAPACITY: usize = 1000;

/// One decision record.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    /// Per-decision UUID
    pub decision_id: String,
    /// The batch this decision belonged to, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_decision_id: Option<String>,
    /// When the decision was made
    pub timestamp: DateTime<Utc>,
    /// Query path
    pub path: String,
    /// The input document
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// The result document
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error message for failed decisions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Per-decision metrics
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,
    /// Trace id from the request context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Span id from the request context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    /// Single revision (legacy, exactly one bundle) or a name-to-revision map
    pub bundles: Value,
    /// Origin marker (`custom.type`)
    pub custom: Value,
}

impl DecisionRecord {
    /// A record for the given origin marker.
    #[must_use]
    pub fn new(custom_type: &str, decision_id: String, path: String) -> Self {
        Self {
            decision_id,
            batch_decision_id: None,
            timestamp: Utc::now(),
            path,
            input: None,
            result: None,
            error: None,
            metrics: None,
            trace_id: None,
            span_id: None,
            bundles: Value::Null,
            custom: json!({"type": custom_type}),
        }
    }
}

/// Bundle revisions for the log envelope: the legacy single-revision field
/// when exactly one bundle is active, otherwise a name-to-revision map.
#[must_use]
pub fn bundle_revisions(data: &Value) -> Value {
    let Some(bundles) = data.pointer("/system/bundles").and_then(Value::as_object) else {
        return Value::Null;
    };
    let mut revisions = Map::new();
    for (name, entry) in bundles {
        if let Some(revision) = entry.pointer("/manifest/revision") {
            revisions.insert(name.clone(), revision.clone());
        }
    }
    match revisions.len() {
        0 => Value::Null,
        1 => revisions
            .into_iter()
            .next()
            .map(|(_, revision)| revision)
            .unwrap_or(Value::Null),
        _ => Value::Object(revisions),
    }
}

/// The decision-log sink.
#[derive(Debug, Default)]
pub struct DecisionLog {
    buffer: Mutex<VecDeque<DecisionRecord>>,
}

impl DecisionLog {
    /// An empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one decision.
    pub fn emit(&self, record: DecisionRecord) {
        debug!(
            target: "decision_log",
            decision_id = %record.decision_id,
            path = %record.path,
            "decision"
        );
        let mut buffer = self
            .buffer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if buffer.len() == BUFFER_CAPACITY {
            buffer.pop_front();
        }
        buffer.push_back(record);
    }

    /// The most recent records, oldest first.
    #[must_use]
    pub fn recent(&self, count: usize) -> Vec<DecisionRecord> {
        let buffer = self
            .buffer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        buffer.iter().rev().take(count).rev().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_read_back() {
        let log = DecisionLog::new();
        let mut record =
            DecisionRecord::new(CUSTOM_TYPE_BATCH, "d-1".to_string(), "t/allow".to_string());
        record.batch_decision_id = Some("b-1".to_string());
        log.emit(record);

        let recent = log.recent(10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].decision_id, "d-1");
        assert_eq!(recent[0].custom["type"], json!(CUSTOM_TYPE_BATCH));
    }

    #[test]
    fn test_single_bundle_revision_is_legacy_scalar() {
        let data = json!({"system": {"bundles": {"rbac": {"manifest": {"revision": "v7"}}}}});
        assert_eq!(bundle_revisions(&data), json!("v7"));
    }

    #[test]
    fn test_multiple_bundles_map() {
        let data = json!({"system": {"bundles": {
            "a": {"manifest": {"revision": "1"}},
            "b": {"manifest": {"revision": "2"}}
        }}});
        assert_eq!(bundle_revisions(&data), json!({"a": "1", "b": "2"}));
    }

    #[test]
    fn test_no_bundles_is_null() {
        assert_eq!(bundle_revisions(&json!({})), Value::Null);
    }

    #[test]
    fn test_buffer_caps() {
        let log = DecisionLog::new();
        for i in 0..(BUFFER_CAPACITY + 5) {
            log.emit(DecisionRecord::new(
                CUSTOM_TYPE_COMPILE,
                format!("d-{i}"),
                "p".to_string(),
            ));
        }
        let recent = log.recent(BUFFER_CAPACITY + 10);
        assert_eq!(recent.len(), BUFFER_CAPACITY);
        assert_eq!(recent[0].decision_id, "d-5");
    }
}
