//! Parser implementation that converts Pest parse trees to AST
//!
//! Annotation comments (`# @unknowns …`, `# @mask …`) are collected in a
//! separate line scan, since comments are silent in the grammar, and are
//! attached to the next rule definition below them.

use pest::Parser;
use pest::iterators::Pair;
use serde_json::{Number, Value};
use std::fmt;

use super::ast::{
    Annotations, Call, ElseClause, Location, Module, RefArg, RefBase, RefTerm, RuleClause, Stmt,
    Term, COMPARISON_OPS,
};
use super::grammar::{PolicyGrammar, Rule};

/// Default language version for modules that do not declare one.
pub const DEFAULT_REGO_VERSION: u32 = 1;

/// Errors that can occur during parsing.
#[derive(Debug, Clone)]
pub struct ParseError {
    /// Human-readable description
    pub message: String,
    /// `(line, column)` when known
    pub location: Option<(usize, usize)>,
    /// Module id the error came from
    pub file: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location {
            Some((line, col)) => {
                write!(f, "{}:{line}:{col}: parse error: {}", self.file, self.message)
            }
            None => write!(f, "{}: parse error: {}", self.file, self.message),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parse a policy module from source text.
///
/// # Errors
/// Returns a `ParseError` with the offending position when the source does
/// not conform to the grammar.
pub fn parse_module(id: &str, source: &str) -> Result<Module, ParseError> {
    let mut pairs =
        PolicyGrammar::parse(Rule::module, source).map_err(|e| pest_error(id, &e))?;
    let module_pair = pairs.next().ok_or_else(|| ParseError {
        message: "empty module".to_string(),
        location: None,
        file: id.to_string(),
    })?;

    let mut package = Vec::new();
    let mut clauses = Vec::new();

    for pair in module_pair.into_inner() {
        match pair.as_rule() {
            Rule::package_decl => {
                let dotted = pair
                    .into_inner()
                    .next()
                    .expect("package_decl contains dotted_name");
                package = dotted
                    .into_inner()
                    .map(|p| p.as_str().to_string())
                    .collect();
            }
            Rule::rule_clause => {
                clauses.push(parse_rule_clause(id, pair)?);
            }
            Rule::EOI => {}
            _ => {}
        }
    }

    attach_annotations(source, &mut clauses);

    Ok(Module {
        id: id.to_string(),
        package,
        clauses,
        rego_version: DEFAULT_REGO_VERSION,
    })
}

fn pest_error(id: &str, e: &pest::error::Error<Rule>) -> ParseError {
    let location = match e.line_col {
        pest::error::LineColLocation::Pos((line, col))
        | pest::error::LineColLocation::Span((line, col), _) => Some((line, col)),
    };
    ParseError {
        message: e.variant.message().into_owned(),
        location,
        file: id.to_string(),
    }
}

fn location_of(id: &str, pair: &Pair<Rule>) -> Location {
    let (row, col) = pair.as_span().start_pos().line_col();
    Location {
        file: id.to_string(),
        row,
        col,
    }
}

fn parse_rule_clause(id: &str, pair: Pair<Rule>) -> Result<RuleClause, ParseError> {
    let inner = pair
        .into_inner()
        .next()
        .expect("rule_clause wraps one alternative");
    match inner.as_rule() {
        Rule::default_rule => {
            let location = location_of(id, &inner);
            let mut parts = inner.into_inner();
            let name = parts.next().expect("default rule name").as_str().to_string();
            let value = parse_term(id, parts.next().expect("default rule value"))?;
            Ok(RuleClause {
                name,
                key: None,
                value: Some(value),
                is_set: false,
                is_default: true,
                body: Vec::new(),
                elses: Vec::new(),
                annotations: Annotations::default(),
                location,
            })
        }
        Rule::rule_def => parse_rule_def(id, inner),
        other => Err(ParseError {
            message: format!("unexpected rule element: {other:?}"),
            location: None,
            file: id.to_string(),
        }),
    }
}

fn parse_rule_def(id: &str, pair: Pair<Rule>) -> Result<RuleClause, ParseError> {
    let location = location_of(id, &pair);
    let mut name = String::new();
    let mut key = None;
    let mut value = None;
    let mut is_set = false;
    let mut body = Vec::new();
    let mut elses = Vec::new();

    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::ident => name = part.as_str().to_string(),
            Rule::rule_head => {
                let head = part.into_inner().next().expect("rule_head alternative");
                match head.as_rule() {
                    Rule::key_head => {
                        let mut terms = head.into_inner();
                        key = Some(parse_term(id, terms.next().expect("key term"))?);
                        if let Some(v) = terms.next() {
                            value = Some(parse_term(id, v)?);
                        }
                    }
                    Rule::contains_head => {
                        is_set = true;
                        let member = head.into_inner().next().expect("contains member");
                        value = Some(parse_term(id, member)?);
                    }
                    Rule::value_head => {
                        let v = head.into_inner().next().expect("value term");
                        value = Some(parse_term(id, v)?);
                    }
                    _ => {}
                }
            }
            Rule::rule_tail => {
                for tail in part.into_inner() {
                    match tail.as_rule() {
                        Rule::if_body => body = parse_if_body(id, tail)?,
                        Rule::brace_body => body = parse_brace_body(id, tail)?,
                        Rule::else_clause => elses.push(parse_else_clause(id, tail)?),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    Ok(RuleClause {
        name,
        key,
        value,
        is_set,
        is_default: false,
        body,
        elses,
        annotations: Annotations::default(),
        location,
    })
}

fn parse_if_body(id: &str, pair: Pair<Rule>) -> Result<Vec<Stmt>, ParseError> {
    let inner = pair.into_inner().next().expect("if body content");
    match inner.as_rule() {
        Rule::brace_body => parse_brace_body(id, inner),
        Rule::stmt => Ok(vec![parse_stmt(id, inner)?]),
        other => Err(ParseError {
            message: format!("unexpected body element: {other:?}"),
            location: None,
            file: id.to_string(),
        }),
    }
}

fn parse_brace_body(id: &str, pair: Pair<Rule>) -> Result<Vec<Stmt>, ParseError> {
    pair.into_inner()
        .filter(|p| p.as_rule() == Rule::stmt)
        .map(|p| parse_stmt(id, p))
        .collect()
}

fn parse_else_clause(id: &str, pair: Pair<Rule>) -> Result<ElseClause, ParseError> {
    let location = location_of(id, &pair);
    let mut value = None;
    let mut body = Vec::new();
    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::term => value = Some(parse_term(id, part)?),
            Rule::if_body => body = parse_if_body(id, part)?,
            _ => {}
        }
    }
    Ok(ElseClause {
        value,
        body,
        location,
    })
}

fn parse_stmt(id: &str, pair: Pair<Rule>) -> Result<Stmt, ParseError> {
    let inner = pair.into_inner().next().expect("stmt alternative");
    let location = location_of(id, &inner);
    match inner.as_rule() {
        Rule::some_stmt => {
            let vars = inner
                .into_inner()
                .map(|p| p.as_str().to_string())
                .collect();
            Ok(Stmt::Some { vars, location })
        }
        Rule::every_stmt => {
            let mut parts = inner.into_inner().filter(|p| p.as_rule() != Rule::in_kw);
            let var = parts.next().expect("every var").as_str().to_string();
            let domain = parse_term(id, parts.next().expect("every domain"))?;
            let body = parse_brace_body(id, parts.next().expect("every body"))?;
            Ok(Stmt::Every {
                var,
                domain,
                body,
                location,
            })
        }
        Rule::not_stmt => {
            let expr = parse_expr(id, inner.into_inner().next().expect("not expr"))?;
            Ok(Stmt::Not { expr, location })
        }
        Rule::basic_stmt => parse_basic_stmt(id, inner),
        other => Err(ParseError {
            message: format!("unexpected statement: {other:?}"),
            location: Some((location.row, location.col)),
            file: id.to_string(),
        }),
    }
}

fn parse_basic_stmt(id: &str, pair: Pair<Rule>) -> Result<Stmt, ParseError> {
    let location = location_of(id, &pair);
    let mut stmt = None;
    let mut withs = Vec::new();

    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::assign_stmt => {
                let loc = location_of(id, &part);
                let mut parts = part.into_inner();
                let var = parts.next().expect("assign var").as_str().to_string();
                let value = parse_expr(id, parts.next().expect("assign value"))?;
                stmt = Some(Stmt::Assign {
                    var,
                    value,
                    location: loc,
                });
            }
            Rule::expr => {
                stmt = Some(Stmt::Expr(parse_expr(id, part)?));
            }
            Rule::with_mod => {
                let loc = location_of(id, &part);
                let mut parts = part.into_inner();
                let target = parse_path_term(id, parts.next().expect("with target"))?;
                let value = parse_term(id, parts.next().expect("with value"))?;
                let target = match target {
                    Term::Ref(r) => r,
                    Term::Var(name, location) => RefTerm {
                        base: RefBase::Var(name),
                        args: Vec::new(),
                        location,
                    },
                    _ => unreachable!("with target parses as path_term"),
                };
                withs.push((target, value, loc));
            }
            _ => {}
        }
    }

    let mut result = stmt.ok_or_else(|| ParseError {
        message: "empty statement".to_string(),
        location: Some((location.row, location.col)),
        file: id.to_string(),
    })?;
    for (target, value, loc) in withs {
        result = Stmt::With {
            inner: Box::new(result),
            target,
            value,
            location: loc,
        };
    }
    Ok(result)
}

fn parse_expr(id: &str, pair: Pair<Rule>) -> Result<Term, ParseError> {
    let location = location_of(id, &pair);
    let mut parts = pair.into_inner();
    let left = parse_term(id, parts.next().expect("expr left term"))?;

    let Some(op_pair) = parts.next() else {
        return Ok(left);
    };
    let infix = op_pair.as_str().trim();
    let op = COMPARISON_OPS
        .iter()
        .find(|(symbol, _)| *symbol == infix)
        .map(|(_, name)| (*name).to_string())
        .ok_or_else(|| ParseError {
            message: format!("unknown operator: {infix}"),
            location: Some((location.row, location.col)),
            file: id.to_string(),
        })?;
    let right = parse_term(id, parts.next().expect("expr right term"))?;

    Ok(Term::Call(Call {
        op,
        args: vec![left, right],
        location,
    }))
}

fn parse_term(id: &str, pair: Pair<Rule>) -> Result<Term, ParseError> {
    // term = mul_term (add_op mul_term)*
    let location = location_of(id, &pair);
    let mut parts = pair.into_inner();
    let mut acc = parse_mul_term(id, parts.next().expect("term operand"))?;
    while let Some(op_pair) = parts.next() {
        let op = match op_pair.as_str() {
            "+" => "plus",
            "-" => "minus",
            other => {
                return Err(ParseError {
                    message: format!("unknown arithmetic operator: {other}"),
                    location: Some((location.row, location.col)),
                    file: id.to_string(),
                });
            }
        };
        let rhs = parse_mul_term(id, parts.next().expect("term rhs"))?;
        acc = Term::Call(Call {
            op: op.to_string(),
            args: vec![acc, rhs],
            location: location.clone(),
        });
    }
    Ok(acc)
}

fn parse_mul_term(id: &str, pair: Pair<Rule>) -> Result<Term, ParseError> {
    let location = location_of(id, &pair);
    let mut parts = pair.into_inner();
    let mut acc = parse_base_term(id, parts.next().expect("mul operand"))?;
    while let Some(op_pair) = parts.next() {
        let op = match op_pair.as_str() {
            "*" => "mul",
            "/" => "div",
            other => {
                return Err(ParseError {
                    message: format!("unknown arithmetic operator: {other}"),
                    location: Some((location.row, location.col)),
                    file: id.to_string(),
                });
            }
        };
        let rhs = parse_base_term(id, parts.next().expect("mul rhs"))?;
        acc = Term::Call(Call {
            op: op.to_string(),
            args: vec![acc, rhs],
            location: location.clone(),
        });
    }
    Ok(acc)
}

fn parse_base_term(id: &str, pair: Pair<Rule>) -> Result<Term, ParseError> {
    let inner = pair.into_inner().next().expect("base_term alternative");
    let location = location_of(id, &inner);
    match inner.as_rule() {
        Rule::literal => parse_literal(id, inner),
        Rule::call_expr => {
            let mut parts = inner.into_inner();
            let name = parts.next().expect("call name").as_str().to_string();
            let args = parts
                .map(|p| parse_term(id, p))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Term::Call(Call {
                op: name,
                args,
                location,
            }))
        }
        Rule::object => {
            let pairs = inner
                .into_inner()
                .map(|p| {
                    let mut kv = p.into_inner();
                    let k = parse_term(id, kv.next().expect("object key"))?;
                    let v = parse_term(id, kv.next().expect("object value"))?;
                    Ok((k, v))
                })
                .collect::<Result<Vec<_>, ParseError>>()?;
            Ok(Term::Object(pairs, location))
        }
        Rule::set => {
            let items = inner
                .into_inner()
                .map(|p| parse_term(id, p))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Term::Set(items, location))
        }
        Rule::array => {
            let items = inner
                .into_inner()
                .map(|p| parse_term(id, p))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Term::Array(items, location))
        }
        Rule::array_compr => {
            let mut parts = inner.into_inner();
            let head = parse_term(id, parts.next().expect("comprehension head"))?;
            let body = parse_compr_body(id, parts.next().expect("comprehension body"))?;
            Ok(Term::ArrayCompr {
                head: Box::new(head),
                body,
                location,
            })
        }
        Rule::set_compr => {
            let mut parts = inner.into_inner();
            let head = parse_term(id, parts.next().expect("comprehension head"))?;
            let body = parse_compr_body(id, parts.next().expect("comprehension body"))?;
            Ok(Term::SetCompr {
                head: Box::new(head),
                body,
                location,
            })
        }
        Rule::object_compr => {
            let mut parts = inner.into_inner();
            let key = parse_term(id, parts.next().expect("comprehension key"))?;
            let value = parse_term(id, parts.next().expect("comprehension value"))?;
            let body = parse_compr_body(id, parts.next().expect("comprehension body"))?;
            Ok(Term::ObjectCompr {
                key: Box::new(key),
                value: Box::new(value),
                body,
                location,
            })
        }
        Rule::paren => parse_term(id, inner.into_inner().next().expect("paren term")),
        Rule::path_term => parse_path_term(id, inner),
        other => Err(ParseError {
            message: format!("unexpected term: {other:?}"),
            location: Some((location.row, location.col)),
            file: id.to_string(),
        }),
    }
}

fn parse_compr_body(id: &str, pair: Pair<Rule>) -> Result<Vec<Stmt>, ParseError> {
    pair.into_inner()
        .filter(|p| p.as_rule() == Rule::stmt)
        .map(|p| parse_stmt(id, p))
        .collect()
}

fn parse_path_term(id: &str, pair: Pair<Rule>) -> Result<Term, ParseError> {
    let location = location_of(id, &pair);
    let mut parts = pair.into_inner();
    let head = parts.next().expect("path head").as_str().to_string();

    let mut args = Vec::new();
    for arg in parts {
        let arg = arg.into_inner().next().expect("ref_arg alternative");
        match arg.as_rule() {
            Rule::dot_arg => {
                let key = arg.into_inner().next().expect("dot key");
                args.push(RefArg::Key(key.as_str().to_string()));
            }
            Rule::bracket_arg => {
                let term = parse_term(id, arg.into_inner().next().expect("bracket term"))?;
                args.push(RefArg::Index(term));
            }
            _ => {}
        }
    }

    let base = match head.as_str() {
        "input" => RefBase::Input,
        "data" => RefBase::Data,
        _ if args.is_empty() => return Ok(Term::Var(head, location)),
        _ => RefBase::Var(head),
    };
    Ok(Term::Ref(RefTerm {
        base,
        args,
        location,
    }))
}

fn parse_literal(id: &str, pair: Pair<Rule>) -> Result<Term, ParseError> {
    let location = location_of(id, &pair);
    let inner = pair.into_inner().next().expect("literal alternative");
    let value = match inner.as_rule() {
        Rule::string => {
            let chars = inner.into_inner().next().expect("string content");
            Value::String(unescape(chars.as_str()))
        }
        Rule::number => {
            let raw = inner.as_str();
            if raw.contains('.') {
                let f: f64 = raw.parse().map_err(|_| ParseError {
                    message: format!("invalid number: {raw}"),
                    location: Some((location.row, location.col)),
                    file: id.to_string(),
                })?;
                Number::from_f64(f)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            } else {
                let i: i64 = raw.parse().map_err(|_| ParseError {
                    message: format!("invalid number: {raw}"),
                    location: Some((location.row, location.col)),
                    file: id.to_string(),
                })?;
                Value::Number(Number::from(i))
            }
        }
        Rule::boolean => Value::Bool(inner.as_str() == "true"),
        Rule::null => Value::Null,
        other => {
            return Err(ParseError {
                message: format!("unexpected literal: {other:?}"),
                location: Some((location.row, location.col)),
                file: id.to_string(),
            });
        }
    };
    Ok(Term::Scalar(value, location))
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Attach `# @unknowns` / `# @mask` annotation comments to the rule defined
/// directly below them.
fn attach_annotations(source: &str, clauses: &mut [RuleClause]) {
    for (index, line) in source.lines().enumerate() {
        let row = index + 1;
        let trimmed = line.trim();
        let annotation = if let Some(rest) = trimmed.strip_prefix("# @unknowns") {
            Some(AnnotationKind::Unknowns(
                rest.split_whitespace().map(str::to_string).collect(),
            ))
        } else {
            trimmed
                .strip_prefix("# @mask")
                .map(|rest| AnnotationKind::Mask(rest.trim().to_string()))
        };
        let Some(annotation) = annotation else {
            continue;
        };
        if let Some(clause) = clauses.iter_mut().find(|c| c.location.row > row) {
            match annotation {
                AnnotationKind::Unknowns(refs) => clause.annotations.unknowns.extend(refs),
                AnnotationKind::Mask(rule) => clause.annotations.mask_rule = Some(rule),
            }
        }
    }
}

enum AnnotationKind {
    Unknowns(Vec<String>),
    Mask(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ast::{RefArg, RefBase, Stmt, Term};

    #[test]
    fn test_parse_boolean_rule() {
        let module = parse_module("t.rego", "package t\n\ngt1 if input.req1 > 1\n").unwrap();
        assert_eq!(module.package, vec!["t".to_string()]);
        assert_eq!(module.clauses.len(), 1);
        let clause = &module.clauses[0];
        assert_eq!(clause.name, "gt1");
        assert!(clause.value.is_none());
        assert_eq!(clause.body.len(), 1);
        match &clause.body[0] {
            Stmt::Expr(Term::Call(call)) => assert_eq!(call.op, "gt"),
            other => panic!("expected comparison, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_partial_object_rule() {
        let source = "package condfail\n\np[x] := v if {\n\tsome i\n\tx := input.x[i]\n\tv := x + input.y[i]\n}\n";
        let module = parse_module("t.rego", source).unwrap();
        let clause = &module.clauses[0];
        assert_eq!(clause.name, "p");
        assert!(clause.key.is_some());
        assert_eq!(clause.body.len(), 3);
    }

    #[test]
    fn test_parse_membership_in_set() {
        let source = "package f\n\ninclude if input.fruits.colour in {\"grey\", \"orange\"}\n";
        let module = parse_module("t.rego", source).unwrap();
        match &module.clauses[0].body[0] {
            Stmt::Expr(Term::Call(call)) => {
                assert_eq!(call.op, "internal.member_2");
                assert!(matches!(call.args[1], Term::Set(..)));
            }
            other => panic!("expected membership call, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_default_and_else() {
        let source = "package a\n\ndefault allow := false\n\nallow := 1 if input.x > 0 else := 2 if input.x == 0\n";
        let module = parse_module("t.rego", source).unwrap();
        assert_eq!(module.clauses.len(), 2);
        assert!(module.clauses[0].is_default);
        assert_eq!(module.clauses[1].elses.len(), 1);
    }

    #[test]
    fn test_parse_ref_with_var_index() {
        let module =
            parse_module("t.rego", "package a\n\nfirst := input.users[i].name if true\n").unwrap();
        let value = module.clauses[0].value.as_ref().unwrap();
        match value {
            Term::Ref(r) => {
                assert_eq!(r.base, RefBase::Input);
                assert!(matches!(r.args[0], RefArg::Key(_)));
                assert!(matches!(r.args[1], RefArg::Index(Term::Var(..))));
            }
            other => panic!("expected ref, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_error_has_location() {
        let err = parse_module("bad.rego", "package a\n\np :=\n").unwrap_err();
        assert!(err.location.is_some());
        assert_eq!(err.file, "bad.rego");
    }

    #[test]
    fn test_annotations_attach_to_following_rule() {
        let source = "package f\n\n# @unknowns input.fruits\n# @mask data.f.masks\ninclude if input.fruits.colour == \"orange\"\n";
        let module = parse_module("t.rego", source).unwrap();
        let annotations = &module.clauses[0].annotations;
        assert_eq!(annotations.unknowns, vec!["input.fruits".to_string()]);
        assert_eq!(annotations.mask_rule.as_deref(), Some("data.f.masks"));
    }

    #[test]
    fn test_parse_not_and_every() {
        let source = "package a\n\nok if {\n\tnot input.banned\n\tevery x in input.items { x > 0 }\n}\n";
        let module = parse_module("t.rego", source).unwrap();
        let body = &module.clauses[0].body;
        assert!(matches!(body[0], Stmt::Not { .. }));
        assert!(matches!(body[1], Stmt::Every { .. }));
    }

    #[test]
    fn test_parse_with_modifier() {
        let source = "package a\n\nok if allow with input.role as \"admin\"\n";
        let module = parse_module("t.rego", source).unwrap();
        assert!(matches!(module.clauses[0].body[0], Stmt::With { .. }));
    }

    #[test]
    fn test_parse_object_comprehension() {
        let source = "package a\n\nby_name := {n: u | some i; u := input.users[i]; n := u.name} if true\n";
        let module = parse_module("t.rego", source).unwrap();
        let value = module.clauses[0].value.as_ref().unwrap();
        match value {
            Term::ObjectCompr { body, .. } => assert_eq!(body.len(), 3),
            other => panic!("expected object comprehension, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_contains_rule() {
        let source = "package a\n\nadmins contains u if {\n\tsome i\n\tu := input.users[i]\n}\n";
        let module = parse_module("t.rego", source).unwrap();
        assert!(module.clauses[0].is_set);
    }
}
