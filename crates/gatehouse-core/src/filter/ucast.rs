//! UCAST condition trees
//!
//! The wire form of a translated data filter: field comparisons joined by
//! and/or compounds. Modeled as a sum type; the JSON encoding is derived.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A node of a UCAST condition tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UcastNode {
    /// A single field comparison
    Field {
        /// Comparison operator (`eq`, `lt`, `startswith`, `in`, ...)
        op: String,
        /// Qualified column, `<table>.<column>`
        field: String,
        /// Comparison value
        value: Value,
    },
    /// A boolean combination of child nodes
    Compound {
        /// `and`, `or`, or `not`
        op: String,
        /// Child nodes
        children: Vec<UcastNode>,
    },
}

impl UcastNode {
    /// AND the given nodes, collapsing the trivial cases.
    #[must_use]
    pub fn and(mut children: Vec<Self>) -> Self {
        if children.len() == 1 {
            children.remove(0)
        } else {
            Self::Compound {
                op: "and".to_string(),
                children,
            }
        }
    }

    /// OR the given nodes, collapsing the trivial cases.
    #[must_use]
    pub fn or(mut children: Vec<Self>) -> Self {
        if children.len() == 1 {
            children.remove(0)
        } else {
            Self::Compound {
                op: "or".to_string(),
                children,
            }
        }
    }

    /// Negate a node.
    #[must_use]
    pub fn not(child: Self) -> Self {
        Self::Compound {
            op: "not".to_string(),
            children: vec![child],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_serialization() {
        let node = UcastNode::Field {
            op: "eq".to_string(),
            field: "fruits.colour".to_string(),
            value: json!("orange"),
        };
        assert_eq!(
            serde_json::to_value(&node).unwrap(),
            json!({"type": "field", "op": "eq", "field": "fruits.colour", "value": "orange"})
        );
    }

    #[test]
    fn test_compound_serialization() {
        let node = UcastNode::and(vec![
            UcastNode::Field {
                op: "eq".to_string(),
                field: "t.a".to_string(),
                value: json!(1),
            },
            UcastNode::Field {
                op: "gt".to_string(),
                field: "t.b".to_string(),
                value: json!(2),
            },
        ]);
        let encoded = serde_json::to_value(&node).unwrap();
        assert_eq!(encoded["type"], "compound");
        assert_eq!(encoded["op"], "and");
        assert_eq!(encoded["children"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_single_child_collapses() {
        let field = UcastNode::Field {
            op: "eq".to_string(),
            field: "t.a".to_string(),
            value: json!(1),
        };
        assert_eq!(UcastNode::and(vec![field.clone()]), field);
        assert_eq!(UcastNode::or(vec![field.clone()]), field);
    }
}
