//! Module compilation
//!
//! Compilation gathers parsed modules into a rule index keyed by package
//! path plus rule name, merging clauses that define the same rule and
//! rejecting definitions that mix rule kinds. The compiled set is immutable
//! and shared behind an `Arc`; bundle activation builds a new one and swaps
//! it in.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use super::ast::{
    Annotations, ElseClause, Location, Module, RefArg, RefBase, RefTerm, RuleClause, Stmt, Term,
};

/// A compile-time error with its source position.
#[derive(Debug, Clone, Serialize)]
pub struct CompileError {
    /// Human-readable description
    pub message: String,
    /// Offending position
    pub location: Location,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.location, self.message)
    }
}

impl std::error::Error for CompileError {}

/// How a rule produces its document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// Single value
    Complete,
    /// Object keyed by the head key term
    PartialObject,
    /// Set of values
    PartialSet,
}

/// All clauses defining one rule, across modules.
#[derive(Debug, Clone)]
pub struct RuleSet {
    /// Full path: package segments plus rule name
    pub path: Vec<String>,
    /// Rule kind
    pub kind: RuleKind,
    /// Default value, if a `default` definition exists
    pub default_value: Option<Term>,
    /// Location of the `default` definition
    pub default_location: Option<Location>,
    /// Non-default clauses in source order
    pub clauses: Vec<RuleClause>,
    /// Whether any clause carries an `else` chain
    pub has_else: bool,
    /// Merged annotations from all clauses
    pub annotations: Annotations,
}

impl RuleSet {
    /// Whether the rule produces multiple values (partial object or set).
    #[must_use]
    pub const fn is_multi_value(&self) -> bool {
        matches!(self.kind, RuleKind::PartialObject | RuleKind::PartialSet)
    }
}

/// Live handle to the compiled policy set; bundle activation swaps the
/// inner `Arc` and invalidates the prepared-query cache.
pub type SharedCompiledPolicies = Arc<std::sync::RwLock<Arc<CompiledPolicies>>>;

/// An immutable compiled policy set.
#[derive(Debug, Clone, Default)]
pub struct CompiledPolicies {
    /// Source modules
    pub modules: Vec<Arc<Module>>,
    rules: BTreeMap<Vec<String>, RuleSet>,
}

impl CompiledPolicies {
    /// Look up the rule at an exact path (package segments + rule name).
    #[must_use]
    pub fn rule_at(&self, path: &[String]) -> Option<&RuleSet> {
        self.rules.get(path)
    }

    /// All rules whose path starts with `prefix`.
    pub fn rules_under<'a>(
        &'a self,
        prefix: &'a [String],
    ) -> impl Iterator<Item = &'a RuleSet> + 'a {
        self.rules
            .values()
            .filter(move |rule| rule.path.len() >= prefix.len() && rule.path[..prefix.len()] == *prefix)
    }

    /// Total number of indexed rules.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

/// Compile a set of parsed modules into a rule index.
///
/// # Errors
/// Returns every conflict found: a rule defined with more than one kind,
/// or more than one `default` value.
pub fn compile(modules: Vec<Arc<Module>>) -> Result<CompiledPolicies, Vec<CompileError>> {
    // Rule names per package, for resolving bare names in bodies.
    let mut package_names: BTreeMap<Vec<String>, BTreeSet<String>> = BTreeMap::new();
    for module in &modules {
        let names = package_names.entry(module.package.clone()).or_default();
        for clause in &module.clauses {
            names.insert(clause.name.clone());
        }
    }

    let mut rules: BTreeMap<Vec<String>, RuleSet> = BTreeMap::new();
    let mut errors = Vec::new();

    for module in &modules {
        let names = &package_names[&module.package];
        for clause in &module.clauses {
            let clause = resolve_names(clause, &module.package, names);
            let mut path = module.package.clone();
            path.push(clause.name.clone());

            let kind = clause_kind(&clause);
            let entry = rules.entry(path.clone()).or_insert_with(|| RuleSet {
                path: path.clone(),
                kind,
                default_value: None,
                default_location: None,
                clauses: Vec::new(),
                has_else: false,
                annotations: Annotations::default(),
            });

            if clause.is_default {
                if entry.default_value.is_some() {
                    errors.push(CompileError {
                        message: format!(
                            "rule {} has multiple default definitions",
                            path.join(".")
                        ),
                        location: clause.location.clone(),
                    });
                    continue;
                }
                entry.default_value = clause.value.clone();
                entry.default_location = Some(clause.location.clone());
                continue;
            }

            if entry.clauses.is_empty() {
                entry.kind = kind;
            } else if entry.kind != kind {
                errors.push(CompileError {
                    message: format!(
                        "rule {} is defined with conflicting kinds",
                        path.join(".")
                    ),
                    location: clause.location.clone(),
                });
                continue;
            }

            entry.has_else |= !clause.elses.is_empty();
            if !clause.annotations.unknowns.is_empty() {
                entry
                    .annotations
                    .unknowns
                    .extend(clause.annotations.unknowns.iter().cloned());
            }
            if clause.annotations.mask_rule.is_some() {
                entry.annotations.mask_rule = clause.annotations.mask_rule.clone();
            }
            entry.clauses.push(clause);
        }
    }

    if errors.is_empty() {
        Ok(CompiledPolicies { modules, rules })
    } else {
        Err(errors)
    }
}

/// Rewrite bare rule names in a clause into `data.<package>.<name>` refs.
///
/// Body-local variables (assignment targets, `some` declarations, iteration
/// variables) shadow rule names and are left untouched.
fn resolve_names(
    clause: &RuleClause,
    package: &[String],
    names: &BTreeSet<String>,
) -> RuleClause {
    let mut locals = BTreeSet::new();
    collect_locals(&clause.body, &mut locals);
    for else_clause in &clause.elses {
        collect_locals(&else_clause.body, &mut locals);
    }

    let ctx = ResolveCtx {
        package,
        names,
        locals: &locals,
    };
    RuleClause {
        name: clause.name.clone(),
        key: clause.key.as_ref().map(|t| resolve_term(t, &ctx)),
        value: clause.value.as_ref().map(|t| resolve_term(t, &ctx)),
        is_set: clause.is_set,
        is_default: clause.is_default,
        body: clause.body.iter().map(|s| resolve_stmt(s, &ctx)).collect(),
        elses: clause
            .elses
            .iter()
            .map(|e| ElseClause {
                value: e.value.as_ref().map(|t| resolve_term(t, &ctx)),
                body: e.body.iter().map(|s| resolve_stmt(s, &ctx)).collect(),
                location: e.location.clone(),
            })
            .collect(),
        annotations: clause.annotations.clone(),
        location: clause.location.clone(),
    }
}

struct ResolveCtx<'a> {
    package: &'a [String],
    names: &'a BTreeSet<String>,
    locals: &'a BTreeSet<String>,
}

fn collect_locals(body: &[Stmt], locals: &mut BTreeSet<String>) {
    for stmt in body {
        match stmt {
            Stmt::Assign { var, value, .. } => {
                locals.insert(var.clone());
                collect_term_locals(value, locals);
            }
            Stmt::Some { vars, .. } => locals.extend(vars.iter().cloned()),
            Stmt::Every { var, body, .. } => {
                locals.insert(var.clone());
                collect_locals(body, locals);
            }
            Stmt::With { inner, .. } => collect_locals(std::slice::from_ref(inner), locals),
            Stmt::Expr(term) | Stmt::Not { expr: term, .. } => {
                collect_term_locals(term, locals);
            }
        }
    }
}

fn collect_term_locals(term: &Term, locals: &mut BTreeSet<String>) {
    match term {
        Term::ArrayCompr { body, .. } | Term::SetCompr { body, .. } => {
            collect_locals(body, locals);
        }
        Term::ObjectCompr { body, .. } => collect_locals(body, locals),
        Term::Array(items, _) | Term::Set(items, _) => {
            for item in items {
                collect_term_locals(item, locals);
            }
        }
        Term::Object(pairs, _) => {
            for (k, v) in pairs {
                collect_term_locals(k, locals);
                collect_term_locals(v, locals);
            }
        }
        Term::Call(call) => {
            for arg in &call.args {
                collect_term_locals(arg, locals);
            }
        }
        _ => {}
    }
}

fn resolve_stmt(stmt: &Stmt, ctx: &ResolveCtx<'_>) -> Stmt {
    match stmt {
        Stmt::Expr(term) => Stmt::Expr(resolve_term(term, ctx)),
        Stmt::Assign {
            var,
            value,
            location,
        } => Stmt::Assign {
            var: var.clone(),
            value: resolve_term(value, ctx),
            location: location.clone(),
        },
        Stmt::Some { .. } => stmt.clone(),
        Stmt::Not { expr, location } => Stmt::Not {
            expr: resolve_term(expr, ctx),
            location: location.clone(),
        },
        Stmt::Every {
            var,
            domain,
            body,
            location,
        } => Stmt::Every {
            var: var.clone(),
            domain: resolve_term(domain, ctx),
            body: body.iter().map(|s| resolve_stmt(s, ctx)).collect(),
            location: location.clone(),
        },
        Stmt::With {
            inner,
            target,
            value,
            location,
        } => Stmt::With {
            inner: Box::new(resolve_stmt(inner, ctx)),
            target: target.clone(),
            value: resolve_term(value, ctx),
            location: location.clone(),
        },
    }
}

fn resolve_term(term: &Term, ctx: &ResolveCtx<'_>) -> Term {
    match term {
        Term::Var(name, location)
            if !ctx.locals.contains(name) && ctx.names.contains(name) =>
        {
            Term::Ref(package_ref(ctx.package, name, &[], location.clone()))
        }
        Term::Ref(r) => {
            let args: Vec<RefArg> = r
                .args
                .iter()
                .map(|arg| match arg {
                    RefArg::Key(k) => RefArg::Key(k.clone()),
                    RefArg::Index(t) => RefArg::Index(resolve_term(t, ctx)),
                })
                .collect();
            if let RefBase::Var(name) = &r.base {
                if !ctx.locals.contains(name) && ctx.names.contains(name) {
                    return Term::Ref(package_ref(ctx.package, name, &args, r.location.clone()));
                }
            }
            Term::Ref(RefTerm {
                base: r.base.clone(),
                args,
                location: r.location.clone(),
            })
        }
        Term::Array(items, location) => Term::Array(
            items.iter().map(|t| resolve_term(t, ctx)).collect(),
            location.clone(),
        ),
        Term::Set(items, location) => Term::Set(
            items.iter().map(|t| resolve_term(t, ctx)).collect(),
            location.clone(),
        ),
        Term::Object(pairs, location) => Term::Object(
            pairs
                .iter()
                .map(|(k, v)| (resolve_term(k, ctx), resolve_term(v, ctx)))
                .collect(),
            location.clone(),
        ),
        Term::Call(call) => Term::Call(super::ast::Call {
            op: call.op.clone(),
            args: call.args.iter().map(|t| resolve_term(t, ctx)).collect(),
            location: call.location.clone(),
        }),
        Term::ArrayCompr {
            head,
            body,
            location,
        } => Term::ArrayCompr {
            head: Box::new(resolve_term(head, ctx)),
            body: body.iter().map(|s| resolve_stmt(s, ctx)).collect(),
            location: location.clone(),
        },
        Term::SetCompr {
            head,
            body,
            location,
        } => Term::SetCompr {
            head: Box::new(resolve_term(head, ctx)),
            body: body.iter().map(|s| resolve_stmt(s, ctx)).collect(),
            location: location.clone(),
        },
        Term::ObjectCompr {
            key,
            value,
            body,
            location,
        } => Term::ObjectCompr {
            key: Box::new(resolve_term(key, ctx)),
            value: Box::new(resolve_term(value, ctx)),
            body: body.iter().map(|s| resolve_stmt(s, ctx)).collect(),
            location: location.clone(),
        },
        Term::Scalar(..) | Term::Var(..) => term.clone(),
    }
}

fn package_ref(
    package: &[String],
    name: &str,
    trailing: &[RefArg],
    location: Location,
) -> RefTerm {
    let mut args: Vec<RefArg> = package.iter().map(|p| RefArg::Key(p.clone())).collect();
    args.push(RefArg::Key(name.to_string()));
    args.extend(trailing.iter().cloned());
    RefTerm {
        base: RefBase::Data,
        args,
        location,
    }
}

const fn clause_kind(clause: &RuleClause) -> RuleKind {
    if clause.key.is_some() {
        RuleKind::PartialObject
    } else if clause.is_set {
        RuleKind::PartialSet
    } else {
        RuleKind::Complete
    }
}

/// Parse a textual reference such as `input.fruits` or `data.f.masks` into
/// its base and static path.
///
/// # Errors
/// Returns the offending string when the reference is not rooted at `input`
/// or `data`.
pub fn parse_ref_str(raw: &str) -> Result<(RefBase, Vec<String>), String> {
    let mut parts = raw.split('.');
    let base = match parts.next() {
        Some("input") => RefBase::Input,
        Some("data") => RefBase::Data,
        _ => return Err(raw.to_string()),
    };
    let path: Vec<String> = parts.map(str::to_string).collect();
    if path.iter().any(String::is_empty) {
        return Err(raw.to_string());
    }
    Ok((base, path))
}

/// Split a URL-style query path (`/testmod/condfail/p` or `testmod/condfail/p`)
/// into rule-path segments.
#[must_use]
pub fn query_path_segments(raw: &str) -> Vec<String> {
    raw.trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::parser::parse_module;

    fn compile_sources(sources: &[(&str, &str)]) -> Result<CompiledPolicies, Vec<CompileError>> {
        let modules = sources
            .iter()
            .map(|(id, src)| Arc::new(parse_module(id, src).unwrap()))
            .collect();
        compile(modules)
    }

    #[test]
    fn test_compile_indexes_rules_by_path() {
        let compiled = compile_sources(&[(
            "f.rego",
            "package filters\n\ninclude if input.fruits.colour == \"orange\"\n",
        )])
        .unwrap();
        let path = vec!["filters".to_string(), "include".to_string()];
        let rule = compiled.rule_at(&path).unwrap();
        assert_eq!(rule.kind, RuleKind::Complete);
        assert_eq!(rule.clauses.len(), 1);
    }

    #[test]
    fn test_compile_merges_clauses_across_modules() {
        let compiled = compile_sources(&[
            ("a.rego", "package p\n\nallow if input.a == 1\n"),
            ("b.rego", "package p\n\nallow if input.b == 2\n"),
        ])
        .unwrap();
        let path = vec!["p".to_string(), "allow".to_string()];
        assert_eq!(compiled.rule_at(&path).unwrap().clauses.len(), 2);
    }

    #[test]
    fn test_compile_rejects_kind_conflict() {
        let errors = compile_sources(&[(
            "a.rego",
            "package p\n\nr if input.a == 1\n\nr contains x if x := input.b\n",
        )])
        .unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("conflicting kinds"));
    }

    #[test]
    fn test_compile_rejects_double_default() {
        let errors = compile_sources(&[(
            "a.rego",
            "package p\n\ndefault r := 1\n\ndefault r := 2\n",
        )])
        .unwrap_err();
        assert!(errors[0].message.contains("multiple default"));
    }

    #[test]
    fn test_bare_rule_names_resolve_to_data_refs() {
        let compiled = compile_sources(&[(
            "a.rego",
            "package p\n\nadmin if input.role == \"admin\"\n\nok if admin\n",
        )])
        .unwrap();
        let path = vec!["p".to_string(), "ok".to_string()];
        let rule = compiled.rule_at(&path).unwrap();
        match &rule.clauses[0].body[0] {
            Stmt::Expr(Term::Ref(r)) => {
                assert_eq!(r.base, RefBase::Data);
                assert_eq!(r.static_prefix(), vec!["p".to_string(), "admin".to_string()]);
            }
            other => panic!("expected resolved data ref, got {other:?}"),
        }
    }

    #[test]
    fn test_locals_shadow_rule_names() {
        let compiled = compile_sources(&[(
            "a.rego",
            "package p\n\nadmin if input.role == \"admin\"\n\nok if {\n\tadmin := input.name\n\tadmin == \"x\"\n}\n",
        )])
        .unwrap();
        let path = vec!["p".to_string(), "ok".to_string()];
        let rule = compiled.rule_at(&path).unwrap();
        match &rule.clauses[0].body[1] {
            Stmt::Expr(Term::Call(call)) => {
                assert!(matches!(call.args[0], Term::Var(..)));
            }
            other => panic!("expected comparison on local var, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_ref_str() {
        let (base, path) = parse_ref_str("input.fruits").unwrap();
        assert_eq!(base, RefBase::Input);
        assert_eq!(path, vec!["fruits".to_string()]);
        assert!(parse_ref_str("unknowns.fruits").is_err());
    }

    #[test]
    fn test_query_path_segments() {
        assert_eq!(
            query_path_segments("/testmod/condfail/p"),
            vec!["testmod", "condfail", "p"]
        );
        assert_eq!(query_path_segments("a/b"), vec!["a", "b"]);
    }
}
