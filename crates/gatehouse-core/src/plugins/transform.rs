//! Transform-rule preparation and evaluation
//!
//! A data plugin may name a policy rule that reshapes every polled payload
//! before it is published. The rule is resolved against the current
//! compiled policy set at plugin start and again whenever the compiler is
//! replaced; while the rule is absent the plugin runs untransformed with a
//! warning. Print output from the transform surfaces at debug level even
//! when the evaluation fails.

use serde_json::{Map, Value};
use std::sync::RwLock;
use tracing::{debug, warn};

use crate::policy::ast::RefBase;
use crate::policy::compiler::{CompiledPolicies, parse_ref_str};
use crate::policy::evaluator::{EvalError, Evaluator};

/// Transform settings from the plugin's configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformSpec {
    /// Rule reference, e.g. `data.transforms.users`
    pub rule_ref: Option<String>,
    /// Whether the previous mount contents are passed as `input.previous`
    pub include_previous: bool,
}

/// A prepared transform, re-resolved on every compiler swap.
#[derive(Debug, Default)]
pub struct Transform {
    spec: TransformSpec,
    prepared_path: RwLock<Option<Vec<String>>>,
}

impl Transform {
    /// Build a transform from its spec; call [`Transform::prepare`] before
    /// use.
    #[must_use]
    pub fn new(spec: TransformSpec) -> Self {
        Self {
            spec,
            prepared_path: RwLock::new(None),
        }
    }

    /// Whether the plugin wants `input.previous`.
    #[must_use]
    pub fn include_previous(&self) -> bool {
        self.spec.include_previous
    }

    /// Resolve the rule reference against the compiled set. Missing rules
    /// leave the transform unprepared: ingest passes payloads through raw.
    pub fn prepare(&self, plugin: &str, compiled: &CompiledPolicies) {
        let mut prepared = self
            .prepared_path
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *prepared = None;

        let Some(rule_ref) = &self.spec.rule_ref else {
            return;
        };
        let Ok((RefBase::Data, path)) = parse_ref_str(rule_ref) else {
            warn!(plugin, rule = %rule_ref, "transform rule reference must start with data.");
            return;
        };
        if compiled.rule_at(&path).is_none() && compiled.rules_under(&path).next().is_none() {
            warn!(
                plugin,
                rule = %rule_ref,
                "transform rule not present in the compiled policies, ingesting untransformed"
            );
            return;
        }
        *prepared = Some(path);
    }

    /// Apply the transform to a polled payload.
    ///
    /// Returns `Ok(None)` when the transform evaluated to nothing (the
    /// payload is dropped), or the raw payload itself when no transform is
    /// prepared.
    ///
    /// # Errors
    /// Propagates evaluation failures; prints are logged before returning.
    pub fn apply(
        &self,
        plugin: &str,
        compiled: &CompiledPolicies,
        data: &Value,
        raw: Value,
        previous: Option<Value>,
    ) -> Result<Option<Value>, EvalError> {
        let path = {
            let prepared = self
                .prepared_path
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            prepared.clone()
        };
        let Some(path) = path else {
            return Ok(Some(raw));
        };

        let mut input = Map::new();
        input.insert("incoming".to_string(), raw);
        if self.spec.include_previous {
            input.insert(
                "previous".to_string(),
                previous.unwrap_or(Value::Null),
            );
        }

        let mut evaluator = Evaluator::new(compiled, data, Value::Object(input));
        let result = evaluator.eval_path(&path);
        for line in evaluator.take_prints() {
            debug!(plugin, print = %line, "transform print");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::compiler::compile;
    use crate::policy::parser::parse_module;
    use serde_json::json;
    use std::sync::Arc;

    fn compiled(source: &str) -> CompiledPolicies {
        compile(vec![Arc::new(parse_module("transform.rego", source).unwrap())]).unwrap()
    }

    #[test]
    fn test_missing_rule_passes_payload_through() {
        let compiled = compiled("package transforms\n\nother := 1 if true\n");
        let transform = Transform::new(TransformSpec {
            rule_ref: Some("data.transforms.users".to_string()),
            include_previous: false,
        });
        transform.prepare("test", &compiled);

        let data = json!({});
        let out = transform
            .apply("test", &compiled, &data, json!([1, 2]), None)
            .unwrap();
        assert_eq!(out, Some(json!([1, 2])));
    }

    #[test]
    fn test_transform_reshapes_payload() {
        let source = "package transforms\n\nusers := {id: u | some i\n\tu := input.incoming[i]\n\tid := u.id} if true\n";
        let compiled = compiled(source);
        let transform = Transform::new(TransformSpec {
            rule_ref: Some("data.transforms.users".to_string()),
            include_previous: false,
        });
        transform.prepare("test", &compiled);

        let data = json!({});
        let raw = json!([{"id": "u1", "name": "alice"}, {"id": "u2", "name": "bob"}]);
        let out = transform
            .apply("test", &compiled, &data, raw, None)
            .unwrap();
        assert_eq!(
            out,
            Some(json!({
                "u1": {"id": "u1", "name": "alice"},
                "u2": {"id": "u2", "name": "bob"}
            }))
        );
    }

    #[test]
    fn test_previous_state_visible_when_opted_in() {
        let source = "package transforms\n\nmerged := {\"current\": input.incoming, \"was\": input.previous} if true\n";
        let compiled = compiled(source);
        let transform = Transform::new(TransformSpec {
            rule_ref: Some("data.transforms.merged".to_string()),
            include_previous: true,
        });
        transform.prepare("test", &compiled);

        let data = json!({});
        let out = transform
            .apply("test", &compiled, &data, json!(2), Some(json!(1)))
            .unwrap();
        assert_eq!(out, Some(json!({"current": 2, "was": 1})));
    }

    #[test]
    fn test_undefined_transform_drops_payload() {
        let source = "package transforms\n\nusers := input.incoming if input.incoming != null\n";
        let compiled = compiled(source);
        let transform = Transform::new(TransformSpec {
            rule_ref: Some("data.transforms.users".to_string()),
            include_previous: false,
        });
        transform.prepare("test", &compiled);

        let data = json!({});
        let out = transform
            .apply("test", &compiled, &data, json!(null), None)
            .unwrap();
        assert_eq!(out, None);
    }
}
