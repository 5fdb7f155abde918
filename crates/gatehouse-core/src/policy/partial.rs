//! Partial evaluation
//!
//! Reduces a query given that some references ("unknowns") have no value
//! yet. Statements that only touch known values are evaluated away;
//! statements touching unknowns become residual expressions. Each solution
//! branch yields one residual query (a conjunction); branches OR together.
//!
//! References to rules that carry `default` values, `else` chains, or
//! multi-value heads cannot be inlined safely; they surface as support
//! references which the filter-target constraint check rejects with a
//! source location.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use super::ast::{Call, Location, RefArg, RefBase, RefTerm, Stmt, Term};
use super::compiler::{CompiledPolicies, RuleSet};
use super::evaluator::{Bindings, EvalError, Evaluator, is_nondeterministic};

/// Comparison operators that may appear in residual queries.
pub const RESIDUAL_COMPARISONS: &[&str] = &[
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

/// Options controlling a partial evaluation.
#[derive(Debug, Clone, Default)]
pub struct PartialOptions {
    /// Unknown reference prefixes
    pub unknowns: Vec<(RefBase, Vec<String>)>,
    /// Whether nondeterministic built-ins may be evaluated
    pub nondeterministic_builtins: bool,
    /// Rule paths excluded from inlining
    pub disable_inlining: Vec<String>,
}

/// Why a rule reference could not be inlined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportKind {
    /// The rule carries a `default` value
    Default,
    /// The rule carries an `else` chain
    Else,
    /// The rule builds a partial object or set
    MultiValue,
}

impl SupportKind {
    /// Human-readable source description.
    #[must_use]
    pub const fn describe(self) -> &'static str {
        match self {
            Self::Default => "a rule with a \"default\" value",
            Self::Else => "a rule with an \"else\" clause",
            Self::MultiValue => "a multi-value rule",
        }
    }
}

/// One residual expression with its source location.
#[derive(Debug, Clone)]
pub enum ResidualExpr {
    /// A comparison with at least one unknown operand
    Compare {
        /// Canonical operator
        op: String,
        /// Left operand
        left: Term,
        /// Right operand
        right: Term,
        /// Source position
        location: Location,
    },
    /// A negated residual
    Not {
        /// The negated expression
        inner: Box<ResidualExpr>,
        /// Source position
        location: Location,
    },
    /// A bare reference used as a condition
    NakedRef {
        /// The reference term
        term: Term,
        /// Source position
        location: Location,
    },
    /// A `with` statement over unknowns
    With {
        /// Rendered form for error messages
        display: String,
        /// Source position
        location: Location,
    },
    /// An `every` statement over unknowns
    Every {
        /// Rendered form for error messages
        display: String,
        /// Source position
        location: Location,
    },
    /// A non-comparison call over unknowns
    OtherCall {
        /// The call
        call: Call,
    },
    /// A reference into a rule that required a support module
    SupportRef {
        /// The referenced rule path
        path: Vec<String>,
        /// Why it could not be inlined
        kind: SupportKind,
        /// Source position
        location: Location,
    },
}

impl ResidualExpr {
    /// Source position of the expression.
    #[must_use]
    pub fn location(&self) -> &Location {
        match self {
            Self::Compare { location, .. }
            | Self::Not { location, .. }
            | Self::NakedRef { location, .. }
            | Self::With { location, .. }
            | Self::Every { location, .. }
            | Self::SupportRef { location, .. } => location,
            Self::OtherCall { call } => &call.location,
        }
    }
}

impl fmt::Display for ResidualExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compare {
                op, left, right, ..
            } => {
                let call = Call {
                    op: op.clone(),
                    args: vec![left.clone(), right.clone()],
                    location: Location::synthetic(),
                };
                write!(f, "{call}")
            }
            Self::Not { inner, .. } => write!(f, "not {inner}"),
            Self::NakedRef { term, .. } => write!(f, "{term}"),
            Self::With { display, .. } | Self::Every { display, .. } => write!(f, "{display}"),
            Self::OtherCall { call } => write!(f, "{call}"),
            Self::SupportRef { path, .. } => write!(f, "data.partial.{}", path.join(".")),
        }
    }
}

/// One residual conjunction.
#[derive(Debug, Clone, Default)]
pub struct ResidualQuery {
    /// ANDed expressions; empty means unconditionally true
    pub exprs: Vec<ResidualExpr>,
}

/// An undefined input reference observed while evaluating the known parts.
#[derive(Debug, Clone)]
pub struct FailEvent {
    /// Rendered reference, e.g. `input.fruit.colour`
    pub reference: String,
    /// Source position
    pub location: Location,
}

/// Result of a partial evaluation.
#[derive(Debug, Clone, Default)]
pub struct PartialResult {
    /// Residual queries, ORed together
    pub queries: Vec<ResidualQuery>,
    /// Fail events for hint generation
    pub fails: Vec<FailEvent>,
}

/// Errors raised during partial evaluation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PartialError {
    /// Concrete evaluation failed hard
    #[error(transparent)]
    Eval(#[from] EvalError),

    /// The query used a construct this engine cannot reduce
    #[error("{location}: {message}")]
    Unsupported {
        /// Description
        message: String,
        /// Source position
        location: Location,
    },
}

#[derive(Debug, Clone)]
enum PVal {
    Known(Value),
    Sym(Term),
}

type PBindings = BTreeMap<String, PVal>;

#[derive(Debug, Clone, Default)]
struct Branch {
    bindings: PBindings,
    residuals: Vec<ResidualExpr>,
}

/// Partially evaluate the rule at `query_path`.
///
/// # Errors
/// Propagates hard evaluation failures and unsupported constructs.
pub fn partial_eval(
    compiled: &CompiledPolicies,
    data: &Value,
    input: &Value,
    query_path: &[String],
    opts: &PartialOptions,
) -> Result<PartialResult, PartialError> {
    let mut engine = PartialEvaluator {
        compiled,
        data,
        input: input.clone(),
        opts,
        fails: Vec::new(),
        unknown_rules: BTreeMap::new(),
        inline_depth: 0,
    };
    let queries = engine.eval_query(query_path)?;
    Ok(PartialResult {
        queries,
        fails: engine.fails,
    })
}

/// Maximum rule-inlining depth before reduction gives up.
const MAX_INLINE_DEPTH: usize = 32;

struct PartialEvaluator<'a> {
    compiled: &'a CompiledPolicies,
    data: &'a Value,
    input: Value,
    opts: &'a PartialOptions,
    fails: Vec<FailEvent>,
    unknown_rules: BTreeMap<Vec<String>, bool>,
    inline_depth: usize,
}

impl PartialEvaluator<'_> {
    fn eval_query(&mut self, path: &[String]) -> Result<Vec<ResidualQuery>, PartialError> {
        let Some(rule) = self.compiled.rule_at(path).cloned() else {
            // Plain data: the query is already decided.
            let mut evaluator = Evaluator::new(self.compiled, self.data, self.input.clone());
            let value = evaluator.eval_path(path)?;
            return Ok(match value {
                Some(v) if v != Value::Bool(false) => vec![ResidualQuery::default()],
                _ => Vec::new(),
            });
        };

        if !self.rule_mentions_unknowns(&rule) {
            let mut evaluator = Evaluator::new(self.compiled, self.data, self.input.clone());
            let value = evaluator.eval_rule_set(&rule)?;
            return Ok(match value {
                Some(v) if v != Value::Bool(false) => vec![ResidualQuery::default()],
                _ => Vec::new(),
            });
        }

        if let Some(kind) = support_kind(&rule) {
            let location = rule
                .clauses
                .first()
                .map_or_else(Location::synthetic, |c| c.location.clone());
            return Ok(vec![ResidualQuery {
                exprs: vec![ResidualExpr::SupportRef {
                    path: rule.path.clone(),
                    kind,
                    location,
                }],
            }]);
        }

        let mut queries = Vec::new();
        for clause in &rule.clauses {
            for branch in self.eval_body(&clause.body)? {
                queries.push(ResidualQuery {
                    exprs: branch.residuals,
                });
            }
        }
        Ok(queries)
    }

    fn eval_body(&mut self, body: &[Stmt]) -> Result<Vec<Branch>, PartialError> {
        let mut branches = vec![Branch::default()];
        for stmt in body {
            let mut next = Vec::new();
            for branch in branches {
                next.extend(self.eval_stmt(stmt, branch)?);
            }
            branches = next;
        }
        Ok(branches)
    }

    fn eval_stmt(&mut self, stmt: &Stmt, branch: Branch) -> Result<Vec<Branch>, PartialError> {
        self.check_deterministic(stmt)?;
        let substituted = subst_stmt(stmt, &branch.bindings);

        if !self.stmt_mentions_unknowns(&substituted) {
            return self.eval_concrete(&substituted, branch);
        }

        match &substituted {
            Stmt::Some { .. } => Ok(vec![branch]),
            Stmt::Assign { var, value, .. } => {
                let mut branch = branch;
                branch
                    .bindings
                    .insert(var.clone(), PVal::Sym(value.clone()));
                Ok(vec![branch])
            }
            Stmt::Expr(term) => self.residual_expr(term, branch),
            Stmt::Not { expr, location } => {
                let mut inner_branches = self.residual_expr(expr, Branch::default())?;
                // Negation only distributes over a single residual; anything
                // richer has no faithful field-level translation.
                if inner_branches.len() != 1 || inner_branches[0].residuals.len() != 1 {
                    return Err(PartialError::Unsupported {
                        message: "cannot reduce negation of a compound expression".to_string(),
                        location: location.clone(),
                    });
                }
                let inner = inner_branches
                    .remove(0)
                    .residuals
                    .remove(0);
                let mut branch = branch;
                branch.residuals.push(ResidualExpr::Not {
                    inner: Box::new(inner),
                    location: location.clone(),
                });
                Ok(vec![branch])
            }
            Stmt::Every { location, .. } => {
                let mut branch = branch;
                branch.residuals.push(ResidualExpr::Every {
                    display: substituted.to_string(),
                    location: location.clone(),
                });
                Ok(vec![branch])
            }
            Stmt::With { location, .. } => {
                let mut branch = branch;
                branch.residuals.push(ResidualExpr::With {
                    display: substituted.to_string(),
                    location: location.clone(),
                });
                Ok(vec![branch])
            }
        }
    }

    /// Evaluate a fully-known statement, forking the branch per solution.
    fn eval_concrete(
        &mut self,
        stmt: &Stmt,
        branch: Branch,
    ) -> Result<Vec<Branch>, PartialError> {
        let known: Bindings = branch
            .bindings
            .iter()
            .filter_map(|(k, v)| match v {
                PVal::Known(value) => Some((k.clone(), value.clone())),
                PVal::Sym(_) => None,
            })
            .collect();

        let mut evaluator = Evaluator::new(self.compiled, self.data, self.input.clone());
        let stmts = [stmt.clone()];
        let solutions = match evaluator.solve(&stmts, known) {
            Ok(solutions) => solutions,
            Err(err @ (EvalError::Conflict { .. } | EvalError::Cancelled)) => {
                return Err(err.into());
            }
            Err(_) => Vec::new(),
        };

        if solutions.is_empty() {
            self.record_fails(stmt);
            return Ok(Vec::new());
        }

        Ok(solutions
            .into_iter()
            .map(|solution| {
                let mut forked = branch.clone();
                for (var, value) in solution {
                    forked.bindings.insert(var, PVal::Known(value));
                }
                forked
            })
            .collect())
    }

    /// Turn an unknown-touching expression term into residuals.
    fn residual_expr(&mut self, term: &Term, branch: Branch) -> Result<Vec<Branch>, PartialError> {
        match term {
            Term::Call(call)
                if call.args.len() == 2 && RESIDUAL_COMPARISONS.contains(&call.op.as_str()) =>
            {
                let left = self.fold_side(&call.args[0], &branch)?;
                let right = self.fold_side(&call.args[1], &branch)?;
                let mut branch = branch;
                branch.residuals.push(ResidualExpr::Compare {
                    op: call.op.clone(),
                    left,
                    right,
                    location: call.location.clone(),
                });
                Ok(vec![branch])
            }
            Term::Call(call) => {
                let mut branch = branch;
                branch
                    .residuals
                    .push(ResidualExpr::OtherCall { call: call.clone() });
                Ok(vec![branch])
            }
            Term::Ref(r) => {
                // A naked rule reference inlines (simple rules) or becomes a
                // support reference; a naked unknown stays residual for the
                // constraint check to reject with a suggestion.
                if let Some((rule, consumed)) = self.resolve_rule_ref(r) {
                    if consumed == r.args.len() {
                        if let Some(kind) = support_kind(&rule) {
                            let mut branch = branch;
                            branch.residuals.push(ResidualExpr::SupportRef {
                                path: rule.path.clone(),
                                kind,
                                location: r.location.clone(),
                            });
                            return Ok(vec![branch]);
                        }
                        if self
                            .opts
                            .disable_inlining
                            .contains(&rule.path.join("."))
                        {
                            let mut branch = branch;
                            branch.residuals.push(ResidualExpr::NakedRef {
                                term: term.clone(),
                                location: r.location.clone(),
                            });
                            return Ok(vec![branch]);
                        }
                        if self.inline_depth >= MAX_INLINE_DEPTH {
                            return Err(PartialError::Unsupported {
                                message: format!(
                                    "rule {} cannot be inlined (reference cycle?)",
                                    rule.path.join(".")
                                ),
                                location: r.location.clone(),
                            });
                        }
                        self.inline_depth += 1;
                        let mut forked = Vec::new();
                        for clause in &rule.clauses {
                            for inner in self.eval_body(&clause.body)? {
                                let mut merged = branch.clone();
                                merged.residuals.extend(inner.residuals);
                                forked.push(merged);
                            }
                        }
                        self.inline_depth -= 1;
                        return Ok(forked);
                    }
                }
                let mut branch = branch;
                branch.residuals.push(ResidualExpr::NakedRef {
                    term: term.clone(),
                    location: r.location.clone(),
                });
                Ok(vec![branch])
            }
            other => {
                let mut branch = branch;
                branch.residuals.push(ResidualExpr::NakedRef {
                    term: other.clone(),
                    location: other.location().clone(),
                });
                Ok(vec![branch])
            }
        }
    }

    /// Evaluate one comparison side to a scalar when it is fully known.
    fn fold_side(&mut self, term: &Term, branch: &Branch) -> Result<Term, PartialError> {
        if self.term_mentions_unknowns(term) || term_has_vars(term) {
            return Ok(term.clone());
        }
        let known: Bindings = branch
            .bindings
            .iter()
            .filter_map(|(k, v)| match v {
                PVal::Known(value) => Some((k.clone(), value.clone())),
                PVal::Sym(_) => None,
            })
            .collect();
        let mut evaluator = Evaluator::new(self.compiled, self.data, self.input.clone());
        match evaluator.eval_term_all(term, &known) {
            Ok(values) => values.into_iter().next().map_or_else(
                || Ok(term.clone()),
                |(value, _)| Ok(Term::Scalar(value, term.location().clone())),
            ),
            Err(_) => Ok(term.clone()),
        }
    }

    fn check_deterministic(&self, stmt: &Stmt) -> Result<(), PartialError> {
        if self.opts.nondeterministic_builtins {
            return Ok(());
        }
        if let Some(location) = find_nondeterministic(stmt) {
            return Err(PartialError::Unsupported {
                message: "nondeterministic built-ins are disabled for this request".to_string(),
                location,
            });
        }
        Ok(())
    }

    fn record_fails(&mut self, stmt: &Stmt) {
        let mut refs = Vec::new();
        collect_input_refs(stmt, &mut refs);
        for r in refs {
            if r.args.iter().all(|a| matches!(a, RefArg::Key(_))) {
                let path = r.static_prefix();
                if navigate(&self.input, &path).is_none() {
                    self.fails.push(FailEvent {
                        reference: r.to_string(),
                        location: r.location.clone(),
                    });
                }
            }
        }
    }

    fn resolve_rule_ref(&self, r: &RefTerm) -> Option<(RuleSet, usize)> {
        if r.base != RefBase::Data {
            return None;
        }
        let keys = r.static_prefix();
        for n in (1..=keys.len()).rev() {
            if let Some(rule) = self.compiled.rule_at(&keys[..n]) {
                return Some((rule.clone(), n));
            }
        }
        None
    }

    fn stmt_mentions_unknowns(&mut self, stmt: &Stmt) -> bool {
        match stmt {
            Stmt::Expr(term) | Stmt::Not { expr: term, .. } => self.term_mentions_unknowns(term),
            Stmt::Assign { value, .. } => self.term_mentions_unknowns(value),
            Stmt::Some { .. } => false,
            Stmt::Every { domain, body, .. } => {
                self.term_mentions_unknowns(domain)
                    || body.iter().any(|s| self.stmt_mentions_unknowns(s))
            }
            Stmt::With { inner, value, .. } => {
                self.term_mentions_unknowns(value) || self.stmt_mentions_unknowns(inner)
            }
        }
    }

    fn term_mentions_unknowns(&mut self, term: &Term) -> bool {
        match term {
            Term::Scalar(..) | Term::Var(..) => false,
            Term::Ref(r) => self.ref_mentions_unknowns(r),
            Term::Array(items, _) | Term::Set(items, _) => {
                items.iter().any(|t| self.term_mentions_unknowns(t))
            }
            Term::Object(pairs, _) => pairs
                .iter()
                .any(|(k, v)| self.term_mentions_unknowns(k) || self.term_mentions_unknowns(v)),
            Term::Call(call) => call.args.iter().any(|t| self.term_mentions_unknowns(t)),
            Term::ArrayCompr { head, body, .. } | Term::SetCompr { head, body, .. } => {
                self.term_mentions_unknowns(head)
                    || body.iter().any(|s| self.stmt_mentions_unknowns(s))
            }
            Term::ObjectCompr {
                key, value, body, ..
            } => {
                self.term_mentions_unknowns(key)
                    || self.term_mentions_unknowns(value)
                    || body.iter().any(|s| self.stmt_mentions_unknowns(s))
            }
        }
    }

    fn ref_mentions_unknowns(&mut self, r: &RefTerm) -> bool {
        let opts = self.opts;
        let prefix = r.static_prefix();
        for (base, path) in &opts.unknowns {
            if *base == r.base {
                let shorter = path.len().min(prefix.len());
                if path[..shorter] == prefix[..shorter] {
                    return true;
                }
            }
        }
        // Index terms may smuggle unknowns in.
        for arg in &r.args {
            if let RefArg::Index(term) = arg {
                if self.term_mentions_unknowns(term) {
                    return true;
                }
            }
        }
        // Data refs into rules that transitively touch unknowns.
        if r.base == RefBase::Data {
            if let Some((rule, _)) = self.resolve_rule_ref(r) {
                return self.rule_mentions_unknowns(&rule);
            }
        }
        false
    }

    fn rule_mentions_unknowns(&mut self, rule: &RuleSet) -> bool {
        if let Some(known) = self.unknown_rules.get(&rule.path) {
            return *known;
        }
        // Break cycles pessimistically.
        self.unknown_rules.insert(rule.path.clone(), false);

        let mut mentions = false;
        'outer: for clause in &rule.clauses {
            for stmt in &clause.body {
                if self.stmt_mentions_unknowns(stmt) {
                    mentions = true;
                    break 'outer;
                }
            }
            for term in [&clause.key, &clause.value].into_iter().flatten() {
                if self.term_mentions_unknowns(term) {
                    mentions = true;
                    break 'outer;
                }
            }
            for else_clause in &clause.elses {
                for stmt in &else_clause.body {
                    if self.stmt_mentions_unknowns(stmt) {
                        mentions = true;
                        break 'outer;
                    }
                }
            }
        }
        self.unknown_rules.insert(rule.path.clone(), mentions);
        mentions
    }
}

fn support_kind(rule: &RuleSet) -> Option<SupportKind> {
    if rule.is_multi_value() {
        Some(SupportKind::MultiValue)
    } else if rule.default_value.is_some() {
        Some(SupportKind::Default)
    } else if rule.has_else {
        Some(SupportKind::Else)
    } else {
        None
    }
}

fn subst_stmt(stmt: &Stmt, bindings: &PBindings) -> Stmt {
    match stmt {
        Stmt::Expr(term) => Stmt::Expr(subst_term(term, bindings)),
        Stmt::Assign {
            var,
            value,
            location,
        } => Stmt::Assign {
            var: var.clone(),
            value: subst_term(value, bindings),
            location: location.clone(),
        },
        Stmt::Some { .. } => stmt.clone(),
        Stmt::Not { expr, location } => Stmt::Not {
            expr: subst_term(expr, bindings),
            location: location.clone(),
        },
        Stmt::Every {
            var,
            domain,
            body,
            location,
        } => Stmt::Every {
            var: var.clone(),
            domain: subst_term(domain, bindings),
            body: body.iter().map(|s| subst_stmt(s, bindings)).collect(),
            location: location.clone(),
        },
        Stmt::With {
            inner,
            target,
            value,
            location,
        } => Stmt::With {
            inner: Box::new(subst_stmt(inner, bindings)),
            target: target.clone(),
            value: subst_term(value, bindings),
            location: location.clone(),
        },
    }
}

fn subst_term(term: &Term, bindings: &PBindings) -> Term {
    match term {
        Term::Var(name, location) => match bindings.get(name) {
            Some(PVal::Known(value)) => Term::Scalar(value.clone(), location.clone()),
            Some(PVal::Sym(symbolic)) => symbolic.clone(),
            None => term.clone(),
        },
        Term::Ref(r) => Term::Ref(RefTerm {
            base: r.base.clone(),
            args: r
                .args
                .iter()
                .map(|arg| match arg {
                    RefArg::Key(k) => RefArg::Key(k.clone()),
                    RefArg::Index(t) => RefArg::Index(subst_term(t, bindings)),
                })
                .collect(),
            location: r.location.clone(),
        }),
        Term::Array(items, location) => Term::Array(
            items.iter().map(|t| subst_term(t, bindings)).collect(),
            location.clone(),
        ),
        Term::Set(items, location) => Term::Set(
            items.iter().map(|t| subst_term(t, bindings)).collect(),
            location.clone(),
        ),
        Term::Object(pairs, location) => Term::Object(
            pairs
                .iter()
                .map(|(k, v)| (subst_term(k, bindings), subst_term(v, bindings)))
                .collect(),
            location.clone(),
        ),
        Term::Call(call) => Term::Call(Call {
            op: call.op.clone(),
            args: call.args.iter().map(|t| subst_term(t, bindings)).collect(),
            location: call.location.clone(),
        }),
        Term::ArrayCompr { .. } | Term::SetCompr { .. } | Term::ObjectCompr { .. } => {
            term.clone()
        }
        Term::Scalar(..) => term.clone(),
    }
}

fn term_has_vars(term: &Term) -> bool {
    match term {
        Term::Var(..) => true,
        Term::Scalar(..) => false,
        Term::Ref(r) => r.args.iter().any(|arg| match arg {
            RefArg::Key(_) => false,
            RefArg::Index(t) => term_has_vars(t),
        }),
        Term::Array(items, _) | Term::Set(items, _) => items.iter().any(term_has_vars),
        Term::Object(pairs, _) => pairs.iter().any(|(k, v)| term_has_vars(k) || term_has_vars(v)),
        Term::Call(call) => call.args.iter().any(term_has_vars),
        Term::ArrayCompr { .. } | Term::SetCompr { .. } | Term::ObjectCompr { .. } => true,
    }
}

fn find_nondeterministic(stmt: &Stmt) -> Option<Location> {
    fn in_term(term: &Term) -> Option<Location> {
        match term {
            Term::Call(call) => {
                if is_nondeterministic(&call.op) {
                    return Some(call.location.clone());
                }
                call.args.iter().find_map(in_term)
            }
            Term::Array(items, _) | Term::Set(items, _) => items.iter().find_map(in_term),
            Term::Object(pairs, _) => pairs
                .iter()
                .find_map(|(k, v)| in_term(k).or_else(|| in_term(v))),
            Term::Ref(r) => r.args.iter().find_map(|arg| match arg {
                RefArg::Key(_) => None,
                RefArg::Index(t) => in_term(t),
            }),
            Term::ArrayCompr { head, body, .. } | Term::SetCompr { head, body, .. } => {
                in_term(head).or_else(|| body.iter().find_map(find_nondeterministic))
            }
            Term::ObjectCompr {
                key, value, body, ..
            } => in_term(key)
                .or_else(|| in_term(value))
                .or_else(|| body.iter().find_map(find_nondeterministic)),
            _ => None,
        }
    }
    match stmt {
        Stmt::Expr(term) | Stmt::Not { expr: term, .. } => in_term(term),
        Stmt::Assign { value, .. } => in_term(value),
        Stmt::Some { .. } => None,
        Stmt::Every { domain, body, .. } => {
            in_term(domain).or_else(|| body.iter().find_map(find_nondeterministic))
        }
        Stmt::With { inner, value, .. } => {
            in_term(value).or_else(|| find_nondeterministic(inner))
        }
    }
}

fn collect_input_refs(stmt: &Stmt, out: &mut Vec<RefTerm>) {
    fn in_term(term: &Term, out: &mut Vec<RefTerm>) {
        match term {
            Term::Ref(r) => {
                if r.base == RefBase::Input {
                    out.push(r.clone());
                }
                for arg in &r.args {
                    if let RefArg::Index(t) = arg {
                        in_term(t, out);
                    }
                }
            }
            Term::Array(items, _) | Term::Set(items, _) => {
                for item in items {
                    in_term(item, out);
                }
            }
            Term::Object(pairs, _) => {
                for (k, v) in pairs {
                    in_term(k, out);
                    in_term(v, out);
                }
            }
            Term::Call(call) => {
                for arg in &call.args {
                    in_term(arg, out);
                }
            }
            _ => {}
        }
    }
    match stmt {
        Stmt::Expr(term) | Stmt::Not { expr: term, .. } => in_term(term, out),
        Stmt::Assign { value, .. } => in_term(value, out),
        Stmt::Some { .. } => {}
        Stmt::Every { domain, body, .. } => {
            in_term(domain, out);
            for s in body {
                collect_input_refs(s, out);
            }
        }
        Stmt::With { inner, value, .. } => {
            in_term(value, out);
            collect_input_refs(inner, out);
        }
    }
}

fn navigate<'v>(root: &'v Value, path: &[String]) -> Option<&'v Value> {
    let mut current = root;
    for key in path {
        current = match current {
            Value::Object(map) => map.get(key)?,
            Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::compiler::{compile, parse_ref_str};
    use crate::policy::parser::parse_module;
    use serde_json::json;
    use std::sync::Arc;

    fn run(
        source: &str,
        query: &[&str],
        unknowns: &[&str],
        input: Value,
    ) -> Result<PartialResult, PartialError> {
        let compiled =
            compile(vec![Arc::new(parse_module("filters.rego", source).unwrap())]).unwrap();
        let opts = PartialOptions {
            unknowns: unknowns
                .iter()
                .map(|u| parse_ref_str(u).unwrap())
                .collect(),
            nondeterministic_builtins: true,
            disable_inlining: Vec::new(),
        };
        let data = json!({});
        let path: Vec<String> = query.iter().map(|s| (*s).to_string()).collect();
        partial_eval(&compiled, &data, &input, &path, &opts)
    }

    #[test]
    fn test_residual_comparison() {
        let source = "package filters\n\ninclude if input.fruits.colour == \"orange\"\n";
        let result = run(
            source,
            &["filters", "include"],
            &["input.fruits"],
            json!({}),
        )
        .unwrap();
        assert_eq!(result.queries.len(), 1);
        assert_eq!(result.queries[0].exprs.len(), 1);
        match &result.queries[0].exprs[0] {
            ResidualExpr::Compare { op, left, right, .. } => {
                assert_eq!(op, "eq");
                assert_eq!(left.to_string(), "input.fruits.colour");
                assert_eq!(right.to_string(), "\"orange\"");
            }
            other => panic!("expected comparison, got {other:?}"),
        }
    }

    #[test]
    fn test_known_side_folds_to_scalar() {
        let source = "package filters\n\ninclude if input.fruits.price < input.budget\n";
        let result = run(
            source,
            &["filters", "include"],
            &["input.fruits"],
            json!({"budget": 10}),
        )
        .unwrap();
        match &result.queries[0].exprs[0] {
            ResidualExpr::Compare { right, .. } => {
                assert_eq!(right.to_string(), "10");
            }
            other => panic!("expected comparison, got {other:?}"),
        }
    }

    #[test]
    fn test_multiple_clauses_or_together() {
        let source = "package filters\n\ninclude if input.fruits.colour == \"orange\"\n\ninclude if input.fruits.colour == \"green\"\n";
        let result = run(
            source,
            &["filters", "include"],
            &["input.fruits"],
            json!({}),
        )
        .unwrap();
        assert_eq!(result.queries.len(), 2);
    }

    #[test]
    fn test_concrete_branch_pruning() {
        // The second clause fails on the known part and leaves no residual.
        let source = "package filters\n\ninclude if {\n\tinput.tenant == \"acme\"\n\tinput.fruits.colour == \"orange\"\n}\n\ninclude if {\n\tinput.tenant == \"other\"\n\tinput.fruits.colour == \"red\"\n}\n";
        let result = run(
            source,
            &["filters", "include"],
            &["input.fruits"],
            json!({"tenant": "acme"}),
        )
        .unwrap();
        assert_eq!(result.queries.len(), 1);
        match &result.queries[0].exprs[0] {
            ResidualExpr::Compare { right, .. } => assert_eq!(right.to_string(), "\"orange\""),
            other => panic!("unexpected residual {other:?}"),
        }
    }

    #[test]
    fn test_fail_events_for_undefined_input() {
        let source = "package filters\n\ninclude if {\n\tinput.fruit.colour == \"orange\"\n}\n";
        // No unknowns cover input.fruit, and the input does not define it.
        let result = run(source, &["filters", "include"], &["input.fruits"], json!({}));
        let result = result.unwrap();
        assert!(result.queries.is_empty());
        assert_eq!(result.fails.len(), 1);
        assert_eq!(result.fails[0].reference, "input.fruit.colour");
    }

    #[test]
    fn test_default_rule_becomes_support_ref() {
        let source = "package filters\n\ndefault include := false\n\ninclude if input.fruits.colour == \"orange\"\n";
        let result = run(
            source,
            &["filters", "include"],
            &["input.fruits"],
            json!({}),
        )
        .unwrap();
        match &result.queries[0].exprs[0] {
            ResidualExpr::SupportRef { kind, .. } => {
                assert_eq!(*kind, SupportKind::Default);
            }
            other => panic!("expected support ref, got {other:?}"),
        }
    }

    #[test]
    fn test_inlines_simple_helper_rule() {
        let source = "package filters\n\norange if input.fruits.colour == \"orange\"\n\ninclude if orange\n";
        let result = run(
            source,
            &["filters", "include"],
            &["input.fruits"],
            json!({}),
        )
        .unwrap();
        assert_eq!(result.queries.len(), 1);
        match &result.queries[0].exprs[0] {
            ResidualExpr::Compare { op, .. } => assert_eq!(op, "eq"),
            other => panic!("expected inlined comparison, got {other:?}"),
        }
    }

    #[test]
    fn test_membership_residual() {
        let source =
            "package filters\n\ninclude if input.fruits.colour in {\"grey\", \"orange\"}\n";
        let result = run(
            source,
            &["filters", "include"],
            &["input.fruits"],
            json!({}),
        )
        .unwrap();
        match &result.queries[0].exprs[0] {
            ResidualExpr::Compare { op, .. } => assert_eq!(op, "internal.member_2"),
            other => panic!("expected membership, got {other:?}"),
        }
    }

    #[test]
    fn test_naked_unknown_ref_stays_residual() {
        let source = "package filters\n\ninclude if input.fruits.fresh\n";
        let result = run(
            source,
            &["filters", "include"],
            &["input.fruits"],
            json!({}),
        )
        .unwrap();
        assert!(matches!(
            result.queries[0].exprs[0],
            ResidualExpr::NakedRef { .. }
        ));
    }

    #[test]
    fn test_not_residual() {
        let source = "package filters\n\ninclude if not input.fruits.discontinued == true\n";
        let result = run(
            source,
            &["filters", "include"],
            &["input.fruits"],
            json!({}),
        )
        .unwrap();
        assert!(matches!(
            result.queries[0].exprs[0],
            ResidualExpr::Not { .. }
        ));
    }
}
