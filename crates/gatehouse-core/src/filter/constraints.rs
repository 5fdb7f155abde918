//! Filter-target constraint checking
//!
//! After partial evaluation, each residual expression is validated against
//! the translation target derived from the request's `Accept` media type.
//! Violations carry the source location of the offending expression and are
//! reported with code `pe_fragment_error`.

use serde::Serialize;
use serde_json::Value;

use crate::policy::ast::{Location, RefArg, RefBase, Term, infix_of};
use crate::policy::partial::{ResidualExpr, ResidualQuery};

use super::sql::SqlDialect;

/// UCAST variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UcastVariant {
    /// Prisma-compatible subset
    Prisma,
    /// LINQ-compatible subset
    Linq,
    /// The full node set
    All,
}

/// What the residual will be translated into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// UCAST JSON tree
    Ucast(UcastVariant),
    /// A SQL WHERE fragment
    Sql(SqlDialect),
    /// Every SQL dialect plus UCAST in one envelope
    Multitarget,
}

/// Operators translatable for every SQL dialect.
const SQL_OPS: &[&str] = &[
    "eq",
    "neq",
    "lt",
    "lte",
    "gt",
    "gte",
    "startswith",
    "endswith",
    "contains",
];

/// Operators translatable for UCAST targets.
const UCAST_OPS: &[&str] = &[
    "eq",
    "neq",
    "lt",
    "lte",
    "gt",
    "gte",
    "startswith",
    "endswith",
    "contains",
    "internal.member_2",
];

/// Constraint set derived from the Accept media type.
#[derive(Debug, Clone, Copy)]
pub struct TargetSpec {
    /// The target
    pub kind: TargetKind,
    /// Comparison operators the target can express
    pub allowed_ops: &'static [&'static str],
    /// Whether negation survives translation
    pub supports_not: bool,
}

impl TargetSpec {
    /// The constraint set for a target.
    #[must_use]
    pub const fn for_kind(kind: TargetKind) -> Self {
        match kind {
            TargetKind::Sql(_) => Self {
                kind,
                allowed_ops: SQL_OPS,
                supports_not: true,
            },
            TargetKind::Ucast(UcastVariant::All) => Self {
                kind,
                allowed_ops: UCAST_OPS,
                supports_not: true,
            },
            TargetKind::Ucast(_) => Self {
                kind,
                allowed_ops: UCAST_OPS,
                supports_not: false,
            },
            TargetKind::Multitarget => Self {
                kind,
                allowed_ops: SQL_OPS,
                supports_not: false,
            },
        }
    }
}

/// One constraint violation, rendered into the error body.
#[derive(Debug, Clone, Serialize)]
pub struct FragmentViolation {
    /// Description of the violation
    pub message: String,
    /// Source position
    pub location: Location,
    /// Optional structured details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Validate every residual expression against the target constraints.
#[must_use]
pub fn check_queries(queries: &[ResidualQuery], target: &TargetSpec) -> Vec<FragmentViolation> {
    let mut violations = Vec::new();
    for query in queries {
        for expr in &query.exprs {
            check_expr(expr, target, &mut violations);
        }
    }
    violations
}

fn check_expr(expr: &ResidualExpr, target: &TargetSpec, out: &mut Vec<FragmentViolation>) {
    match expr {
        ResidualExpr::With { display, location } => out.push(FragmentViolation {
            message: "invalid use of \"with\"".to_string(),
            location: location.clone(),
            details: Some(Value::String(display.clone())),
        }),
        ResidualExpr::Every { display, location } => out.push(FragmentViolation {
            message: "invalid use of \"every\"".to_string(),
            location: location.clone(),
            details: Some(Value::String(display.clone())),
        }),
        ResidualExpr::SupportRef {
            path,
            kind,
            location,
        } => out.push(FragmentViolation {
            message: format!(
                "invalid reference to {}: data.{}",
                kind.describe(),
                path.join(".")
            ),
            location: location.clone(),
            details: None,
        }),
        ResidualExpr::NakedRef { term, location } => out.push(FragmentViolation {
            message: format!(
                "invalid condition: {term} is not a comparison (did you mean \"{term} != false\"?)"
            ),
            location: location.clone(),
            details: None,
        }),
        ResidualExpr::OtherCall { call } => out.push(FragmentViolation {
            message: format!("call to \"{}\" is not supported for this target", call.op),
            location: call.location.clone(),
            details: None,
        }),
        ResidualExpr::Not { inner, location } => {
            if target.supports_not {
                check_expr(inner, target, out);
            } else {
                out.push(FragmentViolation {
                    message: "invalid use of negation for this target".to_string(),
                    location: location.clone(),
                    details: None,
                });
            }
        }
        ResidualExpr::Compare {
            op,
            left,
            right,
            location,
        } => check_compare(op, left, right, location, target, out),
    }
}

fn check_compare(
    op: &str,
    left: &Term,
    right: &Term,
    location: &Location,
    target: &TargetSpec,
    out: &mut Vec<FragmentViolation>,
) {
    if !target.allowed_ops.contains(&op) {
        let message = if op == "internal.member_2" {
            "invalid use of \"... in ...\"".to_string()
        } else {
            let rendered = infix_of(op).map_or_else(|| op.to_string(), str::to_string);
            format!("operator \"{rendered}\" is not supported for this target")
        };
        out.push(FragmentViolation {
            message,
            location: location.clone(),
            details: None,
        });
        return;
    }

    for operand in [left, right] {
        if has_nested_call(operand) {
            out.push(FragmentViolation {
                message: "nested call expressions are not supported".to_string(),
                location: location.clone(),
                details: None,
            });
            return;
        }
    }

    let left_is_unknown = is_unknown_ref(left);
    let right_is_unknown = is_unknown_ref(right);
    let left_is_ground = is_ground(left);
    let right_is_ground = is_ground(right);

    if !left_is_ground && !right_is_ground {
        out.push(FragmentViolation {
            message: "at least one operand must be a ground value".to_string(),
            location: location.clone(),
            details: None,
        });
        return;
    }

    // String and membership operators read field-first only.
    if matches!(
        op,
        "startswith" | "endswith" | "contains" | "internal.member_2"
    ) && !left_is_unknown
    {
        let rendered = infix_of(op).map_or_else(|| op.to_string(), str::to_string);
        out.push(FragmentViolation {
            message: format!("the unknown must be the first operand of \"{rendered}\""),
            location: location.clone(),
            details: None,
        });
        return;
    }

    if left_is_unknown || right_is_unknown {
        return;
    }
    out.push(FragmentViolation {
        message: "no unknown reference in comparison".to_string(),
        location: location.clone(),
        details: None,
    });
}

fn is_unknown_ref(term: &Term) -> bool {
    match term {
        Term::Ref(r) => {
            matches!(r.base, RefBase::Input | RefBase::Data)
                && r.args.iter().all(|arg| {
                    matches!(arg, RefArg::Key(_))
                        || matches!(arg, RefArg::Index(Term::Scalar(Value::String(_), _)))
                })
        }
        _ => false,
    }
}

fn is_ground(term: &Term) -> bool {
    match term {
        Term::Scalar(..) => true,
        Term::Array(items, _) | Term::Set(items, _) => items.iter().all(is_ground),
        Term::Object(pairs, _) => pairs.iter().all(|(k, v)| is_ground(k) && is_ground(v)),
        _ => false,
    }
}

fn has_nested_call(term: &Term) -> bool {
    match term {
        Term::Call(_) => true,
        Term::Array(items, _) | Term::Set(items, _) => items.iter().any(has_nested_call),
        Term::Object(pairs, _) => pairs
            .iter()
            .any(|(k, v)| has_nested_call(k) || has_nested_call(v)),
        Term::Ref(r) => r.args.iter().any(|arg| match arg {
            RefArg::Key(_) => false,
            RefArg::Index(t) => has_nested_call(t),
        }),
        _ => false,
    }
}
