//! Residual-query translation
//!
//! Folds the partial-evaluation residual (queries × exprs) into a UCAST
//! tree: each residual query becomes an AND of field nodes, and the queries
//! OR together. Table mappings rewrite `<table>.<column>` pairs before the
//! tree is rendered for a SQL dialect.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::policy::ast::{Location, RefArg, RefBase, Term};
use crate::policy::partial::{ResidualExpr, ResidualQuery};

use super::sql::{SqlDialect, render_where};
use super::ucast::UcastNode;

/// Translation failure with an optional source position.
#[derive(Debug, Clone)]
pub struct TranslateError {
    /// Description
    pub message: String,
    /// Source position of the offending residual, when known
    pub location: Option<Location>,
}

impl fmt::Display for TranslateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{location}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for TranslateError {}

/// Rewrites of `table`/`column` names: `{table: {"$self": new, col: new}}`.
pub type TableMappings = BTreeMap<String, BTreeMap<String, String>>;

/// The outcome of translating a residual.
#[derive(Debug, Clone, PartialEq)]
pub enum Translation {
    /// The query holds for every row; no filter is needed
    Always,
    /// The query can never hold
    Never,
    /// A condition tree
    Node(UcastNode),
}

impl Translation {
    /// The UCAST wire value: `true`, `false`, or the tree.
    #[must_use]
    pub fn to_ucast_value(&self) -> Value {
        match self {
            Self::Always => Value::Bool(true),
            Self::Never => Value::Bool(false),
            Self::Node(node) => serde_json::to_value(node).unwrap_or(Value::Null),
        }
    }
}

/// Translate residual queries into a UCAST tree.
///
/// # Errors
/// Fails on residuals that survived the constraint check but still cannot
/// be expressed as field comparisons.
pub fn to_ucast(
    queries: &[ResidualQuery],
    mappings: &TableMappings,
) -> Result<Translation, TranslateError> {
    if queries.is_empty() {
        return Ok(Translation::Never);
    }
    if queries.iter().any(|q| q.exprs.is_empty()) {
        return Ok(Translation::Always);
    }

    let mut branches = Vec::with_capacity(queries.len());
    for query in queries {
        let mut nodes = Vec::with_capacity(query.exprs.len());
        for expr in &query.exprs {
            nodes.push(expr_to_node(expr, mappings)?);
        }
        branches.push(UcastNode::and(nodes));
    }
    Ok(Translation::Node(UcastNode::or(branches)))
}

/// Render a translation as a SQL `WHERE` fragment. `Always` renders empty;
/// `Never` renders a contradiction.
///
/// # Errors
/// Propagates rendering failures from the dialect.
pub fn to_sql(translation: &Translation, dialect: SqlDialect) -> Result<String, TranslateError> {
    match translation {
        Translation::Always => Ok(String::new()),
        Translation::Never => Ok("WHERE 1 = 0".to_string()),
        Translation::Node(node) => render_where(node, dialect),
    }
}

fn expr_to_node(
    expr: &ResidualExpr,
    mappings: &TableMappings,
) -> Result<UcastNode, TranslateError> {
    match expr {
        ResidualExpr::Compare {
            op,
            left,
            right,
            location,
        } => compare_to_node(op, left, right, location, mappings),
        ResidualExpr::Not { inner, .. } => Ok(UcastNode::not(expr_to_node(inner, mappings)?)),
        other => Err(TranslateError {
            message: format!("cannot translate expression: {other}"),
            location: Some(other.location().clone()),
        }),
    }
}

fn compare_to_node(
    op: &str,
    left: &Term,
    right: &Term,
    location: &Location,
    mappings: &TableMappings,
) -> Result<UcastNode, TranslateError> {
    let ucast_op = match op {
        "internal.member_2" => "in",
        other => other,
    };

    if let Some(field) = field_path(left) {
        let value = ground_value(right).ok_or_else(|| TranslateError {
            message: format!("operand {right} is not a constant"),
            location: Some(location.clone()),
        })?;
        return Ok(UcastNode::Field {
            op: ucast_op.to_string(),
            field: apply_mappings(&field, mappings),
            value,
        });
    }

    if let Some(field) = field_path(right) {
        let flipped = match ucast_op {
            "eq" | "neq" => ucast_op,
            "lt" => "gt",
            "lte" => "gte",
            "gt" => "lt",
            "gte" => "lte",
            other => {
                return Err(TranslateError {
                    message: format!("the unknown must be the first operand of \"{other}\""),
                    location: Some(location.clone()),
                });
            }
        };
        let value = ground_value(left).ok_or_else(|| TranslateError {
            message: format!("operand {left} is not a constant"),
            location: Some(location.clone()),
        })?;
        return Ok(UcastNode::Field {
            op: flipped.to_string(),
            field: apply_mappings(&field, mappings),
            value,
        });
    }

    Err(TranslateError {
        message: "no translatable field reference in comparison".to_string(),
        location: Some(location.clone()),
    })
}

/// The static column path of an unknown reference, without its base.
fn field_path(term: &Term) -> Option<Vec<String>> {
    let Term::Ref(r) = term else {
        return None;
    };
    if !matches!(r.base, RefBase::Input | RefBase::Data) {
        return None;
    }
    let mut keys = Vec::with_capacity(r.args.len());
    for arg in &r.args {
        match arg {
            RefArg::Key(k) => keys.push(k.clone()),
            RefArg::Index(Term::Scalar(Value::String(s), _)) => keys.push(s.clone()),
            RefArg::Index(_) => return None,
        }
    }
    if keys.is_empty() { None } else { Some(keys) }
}

fn ground_value(term: &Term) -> Option<Value> {
    match term {
        Term::Scalar(value, _) => Some(value.clone()),
        Term::Array(items, _) | Term::Set(items, _) => {
            let values: Option<Vec<Value>> = items.iter().map(ground_value).collect();
            values.map(Value::Array)
        }
        _ => None,
    }
}

fn apply_mappings(keys: &[String], mappings: &TableMappings) -> String {
    let table = &keys[0];
    let Some(table_map) = mappings.get(table) else {
        return keys.join(".");
    };
    let mapped_table = table_map.get("$self").unwrap_or(table);
    if keys.len() == 1 {
        return mapped_table.clone();
    }
    let column = keys[1..].join(".");
    let mapped_column = table_map.get(&column).unwrap_or(&column);
    format!("{mapped_table}.{mapped_column}")
}
