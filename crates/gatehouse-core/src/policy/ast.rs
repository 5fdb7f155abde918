//! Abstract syntax tree for policy modules
//!
//! A module is a `package` declaration followed by rule clauses. Rule bodies
//! are conjunctions of statements over terms; terms cover scalars,
//! references into `input`/`data`, collections, and built-in calls.

use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Source position of a node, used in compile and translation errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Location {
    /// Module id (file name) the node came from
    pub file: String,
    /// 1-based line
    pub row: usize,
    /// 1-based column
    pub col: usize,
}

impl Location {
    /// A location for synthesized nodes.
    #[must_use]
    pub fn synthetic() -> Self {
        Self {
            file: String::new(),
            row: 0,
            col: 0,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.row, self.col)
    }
}

/// The root a reference starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefBase {
    /// The request input document
    Input,
    /// The store data document (and rules under it)
    Data,
    /// A body-local variable holding a collection
    Var(String),
}

/// One step of a reference path.
#[derive(Debug, Clone, PartialEq)]
pub enum RefArg {
    /// Static `.key` access
    Key(String),
    /// Bracketed `[term]` access; an unbound variable here iterates
    Index(Term),
}

/// A reference such as `input.users[i].name`.
#[derive(Debug, Clone, PartialEq)]
pub struct RefTerm {
    /// Where the path starts
    pub base: RefBase,
    /// The path steps
    pub args: Vec<RefArg>,
    /// Source position
    pub location: Location,
}

impl RefTerm {
    /// The leading static keys of the path, up to the first non-key arg.
    #[must_use]
    pub fn static_prefix(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for arg in &self.args {
            match arg {
                RefArg::Key(k) => keys.push(k.clone()),
                RefArg::Index(Term::Scalar(Value::String(s), _)) => keys.push(s.clone()),
                RefArg::Index(_) => break,
            }
        }
        keys
    }
}

/// A built-in or comparison call.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    /// Canonical operator name (`eq`, `lt`, `plus`, `startswith`, ...)
    pub op: String,
    /// Operands
    pub args: Vec<Term>,
    /// Source position
    pub location: Location,
}

/// Terms appearing in rule heads and bodies.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    /// A literal scalar (string, number, bool, null)
    Scalar(Value, Location),
    /// A body-local variable
    Var(String, Location),
    /// A reference into `input`, `data`, or a local collection
    Ref(RefTerm),
    /// Array constructor
    Array(Vec<Term>, Location),
    /// Object constructor
    Object(Vec<(Term, Term)>, Location),
    /// Set constructor
    Set(Vec<Term>, Location),
    /// Call expression
    Call(Call),
    /// `[head | body]`
    ArrayCompr {
        /// Element term
        head: Box<Term>,
        /// Comprehension body
        body: Vec<Stmt>,
        /// Source position
        location: Location,
    },
    /// `{head | body}`
    SetCompr {
        /// Member term
        head: Box<Term>,
        /// Comprehension body
        body: Vec<Stmt>,
        /// Source position
        location: Location,
    },
    /// `{key: value | body}`
    ObjectCompr {
        /// Key term
        key: Box<Term>,
        /// Value term
        value: Box<Term>,
        /// Comprehension body
        body: Vec<Stmt>,
        /// Source position
        location: Location,
    },
}

impl Term {
    /// Source position of the term.
    #[must_use]
    pub fn location(&self) -> &Location {
        match self {
            Self::Scalar(_, loc)
            | Self::Var(_, loc)
            | Self::Array(_, loc)
            | Self::Object(_, loc)
            | Self::Set(_, loc)
            | Self::ArrayCompr { location: loc, .. }
            | Self::SetCompr { location: loc, .. }
            | Self::ObjectCompr { location: loc, .. } => loc,
            Self::Ref(r) => &r.location,
            Self::Call(c) => &c.location,
        }
    }

    /// Whether the term is a ground scalar literal.
    #[must_use]
    pub const fn is_scalar(&self) -> bool {
        matches!(self, Self::Scalar(..))
    }
}

/// Comparison operators recognized in infix position, with their canonical
/// call names.
pub const COMPARISON_OPS: &[(&str, &str)] = &[
    ("==", "eq"),
    ("!=", "neq"),
    ("<=", "lte"),
    (">=", "gte"),
    ("<", "lt"),
    (">", "gt"),
    ("in", "internal.member_2"),
];

/// Render a canonical comparison op back to its infix form, if it has one.
#[must_use]
pub fn infix_of(op: &str) -> Option<&'static str> {
    COMPARISON_OPS
        .iter()
        .find(|(_, name)| *name == op)
        .map(|(infix, _)| *infix)
}

/// Statements forming a rule body.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// A plain expression: a comparison, a call, or a naked term
    Expr(Term),
    /// `x := term`
    Assign {
        /// Bound variable
        var: String,
        /// Bound value
        value: Term,
        /// Source position
        location: Location,
    },
    /// `some x, y`
    Some {
        /// Declared variables
        vars: Vec<String>,
        /// Source position
        location: Location,
    },
    /// `not expr`
    Not {
        /// The negated expression
        expr: Term,
        /// Source position
        location: Location,
    },
    /// `every x in xs { ... }`
    Every {
        /// Iteration variable
        var: String,
        /// Iterated collection
        domain: Term,
        /// Per-element body
        body: Vec<Stmt>,
        /// Source position
        location: Location,
    },
    /// `stmt with input.x as term`
    With {
        /// The modified statement
        inner: Box<Stmt>,
        /// The overridden reference
        target: RefTerm,
        /// The replacement value
        value: Term,
        /// Source position
        location: Location,
    },
}

impl Stmt {
    /// Source position of the statement.
    #[must_use]
    pub fn location(&self) -> &Location {
        match self {
            Self::Expr(term) => term.location(),
            Self::Assign { location, .. }
            | Self::Some { location, .. }
            | Self::Not { location, .. }
            | Self::Every { location, .. }
            | Self::With { location, .. } => location,
        }
    }
}

/// `else` continuation of a rule.
#[derive(Debug, Clone, PartialEq)]
pub struct ElseClause {
    /// Value produced when this branch fires; `None` means `true`
    pub value: Option<Term>,
    /// Branch body
    pub body: Vec<Stmt>,
    /// Source position
    pub location: Location,
}

/// Annotations attached to a rule via `# @unknowns` / `# @mask` comments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Annotations {
    /// Declared unknown references, e.g. `input.fruits`
    pub unknowns: Vec<String>,
    /// Mask rule reference, e.g. `data.filters.masks`
    pub mask_rule: Option<String>,
}

impl Annotations {
    /// Whether no annotation is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.unknowns.is_empty() && self.mask_rule.is_none()
    }
}

/// One source-level rule definition.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleClause {
    /// Rule name
    pub name: String,
    /// Partial-object key term
    pub key: Option<Term>,
    /// Produced value; `None` means `true`
    pub value: Option<Term>,
    /// Whether this is a `contains` (partial set) definition
    pub is_set: bool,
    /// Whether this is a `default` definition
    pub is_default: bool,
    /// Body statements; empty means unconditional
    pub body: Vec<Stmt>,
    /// `else` continuations
    pub elses: Vec<ElseClause>,
    /// Attached annotations
    pub annotations: Annotations,
    /// Source position
    pub location: Location,
}

/// A parsed policy module.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    /// Module id (usually the file name)
    pub id: String,
    /// Package path, e.g. `["filters"]`
    pub package: Vec<String>,
    /// Rule definitions in source order
    pub clauses: Vec<RuleClause>,
    /// Language version the module was written against
    pub rego_version: u32,
}

impl fmt::Display for RefTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.base {
            RefBase::Input => write!(f, "input")?,
            RefBase::Data => write!(f, "data")?,
            RefBase::Var(name) => write!(f, "{name}")?,
        }
        for arg in &self.args {
            match arg {
                RefArg::Key(k) => write!(f, ".{k}")?,
                RefArg::Index(term) => write!(f, "[{term}]")?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(value, _) => write!(f, "{value}"),
            Self::Var(name, _) => write!(f, "{name}"),
            Self::Ref(r) => write!(f, "{r}"),
            Self::Array(items, _) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Object(pairs, _) => {
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Self::Set(items, _) => {
                write!(f, "{{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "}}")
            }
            Self::Call(call) => write!(f, "{call}"),
            Self::ArrayCompr { head, .. } => write!(f, "[{head} | ...]"),
            Self::SetCompr { head, .. } => write!(f, "{{{head} | ...}}"),
            Self::ObjectCompr { key, value, .. } => write!(f, "{{{key}: {value} | ...}}"),
        }
    }
}

// Comparison and arithmetic calls print infix, other calls as name(args).
impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.len() == 2 {
            if let Some(infix) = infix_of(&self.op) {
                return write!(f, "{} {} {}", self.args[0], infix, self.args[1]);
            }
            match self.op.as_str() {
                "plus" => return write!(f, "{} + {}", self.args[0], self.args[1]),
                "minus" => return write!(f, "{} - {}", self.args[0], self.args[1]),
                "mul" => return write!(f, "{} * {}", self.args[0], self.args[1]),
                "div" => return write!(f, "{} / {}", self.args[0], self.args[1]),
                _ => {}
            }
        }
        write!(f, "{}(", self.op)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{arg}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expr(term) => write!(f, "{term}"),
            Self::Assign { var, value, .. } => write!(f, "{var} := {value}"),
            Self::Some { vars, .. } => write!(f, "some {}", vars.join(", ")),
            Self::Not { expr, .. } => write!(f, "not {expr}"),
            Self::Every { var, domain, .. } => write!(f, "every {var} in {domain} {{ ... }}"),
            Self::With {
                inner,
                target,
                value,
                ..
            } => write!(f, "{inner} with {target} as {value}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn loc() -> Location {
        Location::synthetic()
    }

    #[test]
    fn test_ref_display() {
        let r = RefTerm {
            base: RefBase::Input,
            args: vec![
                RefArg::Key("fruits".to_string()),
                RefArg::Key("colour".to_string()),
            ],
            location: loc(),
        };
        assert_eq!(r.to_string(), "input.fruits.colour");
    }

    #[test]
    fn test_comparison_displays_infix() {
        let call = Call {
            op: "eq".to_string(),
            args: vec![
                Term::Var("x".to_string(), loc()),
                Term::Scalar(json!("orange"), loc()),
            ],
            location: loc(),
        };
        assert_eq!(call.to_string(), "x == \"orange\"");
    }

    #[test]
    fn test_static_prefix_stops_at_var() {
        let r = RefTerm {
            base: RefBase::Input,
            args: vec![
                RefArg::Key("users".to_string()),
                RefArg::Index(Term::Var("i".to_string(), loc())),
                RefArg::Key("name".to_string()),
            ],
            location: loc(),
        };
        assert_eq!(r.static_prefix(), vec!["users".to_string()]);
    }
}
