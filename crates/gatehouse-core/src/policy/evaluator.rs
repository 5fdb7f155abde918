//! Policy evaluation engine
//!
//! Evaluates compiled rules against an input document and a data snapshot.
//! Rule bodies are solved by enumerating variable bindings; partial rules
//! assemble objects and sets from every solution, with conflict detection.
//! Print output is collected on the evaluator and survives evaluation
//! failure so callers can surface it at debug level.

use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::ast::{RefArg, RefBase, RefTerm, Stmt, Term};
use super::compiler::{CompiledPolicies, RuleKind, RuleSet};

/// Maximum rule-reference depth before evaluation is aborted.
const MAX_DEPTH: usize = 64;

/// Errors raised during evaluation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EvalError {
    /// Two rule outputs disagreed
    #[error("{message}")]
    Conflict {
        /// e.g. `object keys must be unique`
        message: String,
    },

    /// A built-in call failed
    #[error("{op}: {message}")]
    Builtin {
        /// Offending operator
        op: String,
        /// Failure description
        message: String,
    },

    /// A variable was used before anything bound it
    #[error("var {var} is unsafe")]
    Unsafe {
        /// The unbound variable
        var: String,
    },

    /// Evaluation was cancelled externally
    #[error("evaluation cancelled")]
    Cancelled,

    /// Operand types did not fit the operator
    #[error("{message}")]
    Type {
        /// Failure description
        message: String,
    },

    /// A construct this engine does not evaluate
    #[error("{message}")]
    Unsupported {
        /// Description of the construct
        message: String,
    },
}

/// Shared cancellation latch checked between evaluation steps.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// A fresh, unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the flag; every evaluator holding it fails on its next step.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether the flag has been latched.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Variable bindings for one solution branch.
pub type Bindings = BTreeMap<String, Value>;

/// The evaluation engine.
///
/// One evaluator serves one query; prints and the input override stack are
/// per-evaluation state.
pub struct Evaluator<'a> {
    compiled: &'a CompiledPolicies,
    data: &'a Value,
    input: Value,
    cancel: CancelFlag,
    strict_builtins: bool,
    prints: Vec<String>,
    depth: usize,
}

impl<'a> Evaluator<'a> {
    /// Create an evaluator over a compiled policy set and a data snapshot.
    #[must_use]
    pub fn new(compiled: &'a CompiledPolicies, data: &'a Value, input: Value) -> Self {
        Self {
            compiled,
            data,
            input,
            cancel: CancelFlag::new(),
            strict_builtins: false,
            prints: Vec::new(),
            depth: 0,
        }
    }

    /// Attach a cancellation flag.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Turn built-in errors into hard evaluation failures.
    #[must_use]
    pub const fn with_strict_builtins(mut self, strict: bool) -> Self {
        self.strict_builtins = strict;
        self
    }

    /// Print output collected so far; available even after a failed eval.
    #[must_use]
    pub fn take_prints(&mut self) -> Vec<String> {
        std::mem::take(&mut self.prints)
    }

    /// Evaluate the document at `path` (rule, package, or raw data).
    ///
    /// Returns `None` when the path is undefined.
    ///
    /// # Errors
    /// Propagates conflicts, cancellation, and (in strict mode) built-in
    /// failures.
    pub fn eval_path(&mut self, path: &[String]) -> Result<Option<Value>, EvalError> {
        if let Some(rule) = self.compiled.rule_at(path) {
            let rule = rule.clone();
            return self.eval_rule_set(&rule);
        }

        // A rule prefix with trailing navigation into its document.
        for split in (1..path.len()).rev() {
            if let Some(rule) = self.compiled.rule_at(&path[..split]) {
                let rule = rule.clone();
                let Some(doc) = self.eval_rule_set(&rule)? else {
                    return Ok(None);
                };
                return Ok(navigate(&doc, &path[split..]).cloned());
            }
        }

        // A package prefix: assemble the virtual document.
        if self
            .compiled
            .rules_under(path)
            .next()
            .is_some()
        {
            return self.eval_package(path);
        }

        Ok(navigate(self.data, path).cloned())
    }

    /// Assemble the virtual document for a package path: raw data overlaid
    /// with every rule value beneath the prefix.
    fn eval_package(&mut self, prefix: &[String]) -> Result<Option<Value>, EvalError> {
        let mut doc = navigate(self.data, prefix)
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        if !doc.is_object() {
            doc = Value::Object(Map::new());
        }

        let rules: Vec<RuleSet> = self.compiled.rules_under(prefix).cloned().collect();
        for rule in rules {
            let relative = rule.path[prefix.len()..].to_vec();
            if relative.is_empty() {
                continue;
            }
            if let Some(value) = self.eval_rule_set(&rule)? {
                insert_at(&mut doc, &relative, value);
            }
        }

        match &doc {
            Value::Object(map) if map.is_empty() => Ok(None),
            _ => Ok(Some(doc)),
        }
    }

    /// Evaluate one rule set to its document value.
    ///
    /// # Errors
    /// `EvalError::Conflict` when complete-rule outputs disagree or partial
    /// object keys collide.
    pub fn eval_rule_set(&mut self, rule: &RuleSet) -> Result<Option<Value>, EvalError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            self.depth -= 1;
            return Err(EvalError::Unsupported {
                message: format!("max eval depth exceeded at rule {}", rule.path.join(".")),
            });
        }
        let result = match rule.kind {
            RuleKind::Complete => self.eval_complete(rule),
            RuleKind::PartialObject => self.eval_partial_object(rule),
            RuleKind::PartialSet => self.eval_partial_set(rule),
        };
        self.depth -= 1;
        result
    }

    fn eval_complete(&mut self, rule: &RuleSet) -> Result<Option<Value>, EvalError> {
        let mut result: Option<Value> = None;
        for clause in &rule.clauses {
            let solutions = self.solve(&clause.body, Bindings::new())?;
            let outputs: Vec<Value> = if solutions.is_empty() {
                let mut from_else = Vec::new();
                for else_clause in &clause.elses {
                    let esols = self.solve(&else_clause.body, Bindings::new())?;
                    if let Some(binding) = esols.first() {
                        let value = match &else_clause.value {
                            Some(term) => self.eval_one(term, binding)?,
                            None => Some(Value::Bool(true)),
                        };
                        if let Some(value) = value {
                            from_else.push(value);
                        }
                        break;
                    }
                }
                from_else
            } else {
                let mut values = Vec::new();
                for binding in &solutions {
                    let value = match &clause.value {
                        Some(term) => self.eval_one(term, binding)?,
                        None => Some(Value::Bool(true)),
                    };
                    if let Some(value) = value {
                        values.push(value);
                    }
                }
                values
            };

            for value in outputs {
                match &result {
                    Some(existing) if *existing != value => {
                        return Err(EvalError::Conflict {
                            message: "complete rules must not produce multiple outputs"
                                .to_string(),
                        });
                    }
                    Some(_) => {}
                    None => result = Some(value),
                }
            }
        }

        if result.is_none() {
            if let Some(default) = &rule.default_value {
                result = self.eval_one(default, &Bindings::new())?;
            }
        }
        Ok(result)
    }

    fn eval_partial_object(&mut self, rule: &RuleSet) -> Result<Option<Value>, EvalError> {
        let mut map = Map::new();
        for clause in &rule.clauses {
            let key_term = clause.key.as_ref().ok_or_else(|| EvalError::Unsupported {
                message: format!("rule {} has no key term", rule.path.join(".")),
            })?;
            for binding in self.solve(&clause.body, Bindings::new())? {
                let Some(key) = self.eval_one(key_term, &binding)? else {
                    continue;
                };
                let value = match &clause.value {
                    Some(term) => self.eval_one(term, &binding)?,
                    None => Some(Value::Bool(true)),
                };
                let Some(value) = value else { continue };
                let key = key_string(&key)?;
                if let Some(existing) = map.get(&key) {
                    if *existing != value {
                        return Err(EvalError::Conflict {
                            message: "object keys must be unique".to_string(),
                        });
                    }
                } else {
                    map.insert(key, value);
                }
            }
        }
        Ok(Some(Value::Object(map)))
    }

    fn eval_partial_set(&mut self, rule: &RuleSet) -> Result<Option<Value>, EvalError> {
        let mut items: Vec<Value> = Vec::new();
        for clause in &rule.clauses {
            let member = clause.value.as_ref().ok_or_else(|| EvalError::Unsupported {
                message: format!("rule {} has no member term", rule.path.join(".")),
            })?;
            for binding in self.solve(&clause.body, Bindings::new())? {
                if let Some(value) = self.eval_one(member, &binding)? {
                    if !items.contains(&value) {
                        items.push(value);
                    }
                }
            }
        }
        items.sort_by_cached_key(|v| v.to_string());
        Ok(Some(Value::Array(items)))
    }

    /// Solve a statement list, returning every binding set that satisfies it.
    pub fn solve(
        &mut self,
        stmts: &[Stmt],
        binding: Bindings,
    ) -> Result<Vec<Bindings>, EvalError> {
        if self.cancel.is_cancelled() {
            return Err(EvalError::Cancelled);
        }
        let Some((first, rest)) = stmts.split_first() else {
            return Ok(vec![binding]);
        };

        let mut out = Vec::new();
        match first {
            Stmt::Some { .. } => {
                out.extend(self.solve(rest, binding)?);
            }
            Stmt::Assign { var, value, .. } => {
                for (candidate, next_binding) in self.eval_term_all(value, &binding)? {
                    let mut bound = next_binding;
                    match bound.get(var) {
                        Some(existing) if *existing != candidate => continue,
                        Some(_) => {}
                        None => {
                            bound.insert(var.clone(), candidate);
                        }
                    }
                    out.extend(self.solve(rest, bound)?);
                }
            }
            Stmt::Expr(term) => {
                for (value, next_binding) in self.eval_term_all(term, &binding)? {
                    if value != Value::Bool(false) {
                        out.extend(self.solve(rest, next_binding)?);
                    }
                }
            }
            Stmt::Not { expr, .. } => {
                let negated = [Stmt::Expr(expr.clone())];
                if self.solve(&negated, binding.clone())?.is_empty() {
                    out.extend(self.solve(rest, binding)?);
                }
            }
            Stmt::Every {
                var, domain, body, ..
            } => {
                if let Some((collection, next_binding)) =
                    self.eval_term_all(domain, &binding)?.into_iter().next()
                {
                    let items: Vec<Value> = match collection {
                        Value::Array(items) => items,
                        Value::Object(map) => map.into_iter().map(|(_, v)| v).collect(),
                        other => {
                            return Err(EvalError::Type {
                                message: format!("every: cannot iterate over {}", type_name(&other)),
                            });
                        }
                    };
                    let mut all = true;
                    for item in items {
                        let mut inner_binding = next_binding.clone();
                        inner_binding.insert(var.clone(), item);
                        if self.solve(body, inner_binding)?.is_empty() {
                            all = false;
                            break;
                        }
                    }
                    if all {
                        out.extend(self.solve(rest, next_binding)?);
                    }
                }
            }
            Stmt::With {
                inner,
                target,
                value,
                ..
            } => {
                if !matches!(target.base, RefBase::Input) {
                    return Err(EvalError::Unsupported {
                        message: format!("with: only input targets are supported, got {target}"),
                    });
                }
                if let Some((replacement, next_binding)) =
                    self.eval_term_all(value, &binding)?.into_iter().next()
                {
                    let saved = self.input.clone();
                    override_input(&mut self.input, target, replacement);
                    let inner_stmts = [(**inner).clone()];
                    let solved = self.solve(&inner_stmts, next_binding);
                    self.input = saved;
                    for bound in solved? {
                        out.extend(self.solve(rest, bound)?);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Evaluate a term to a single value under fixed bindings, or `None`
    /// when undefined.
    fn eval_one(&mut self, term: &Term, binding: &Bindings) -> Result<Option<Value>, EvalError> {
        Ok(self
            .eval_term_all(term, binding)?
            .into_iter()
            .next()
            .map(|(value, _)| value))
    }

    /// Evaluate a term, enumerating every `(value, extended bindings)` pair
    /// it can produce. Unbound variables in reference brackets iterate.
    pub fn eval_term_all(
        &mut self,
        term: &Term,
        binding: &Bindings,
    ) -> Result<Vec<(Value, Bindings)>, EvalError> {
        match term {
            Term::Scalar(value, _) => Ok(vec![(value.clone(), binding.clone())]),
            Term::Var(name, _) => binding.get(name).map_or_else(
                || Err(EvalError::Unsafe { var: name.clone() }),
                |value| Ok(vec![(value.clone(), binding.clone())]),
            ),
            Term::Ref(r) => self.eval_ref(r, binding),
            Term::Array(items, _) => {
                let mut states = vec![(Vec::new(), binding.clone())];
                for item in items {
                    let mut next = Vec::new();
                    for (acc, bound) in states {
                        for (value, extended) in self.eval_term_all(item, &bound)? {
                            let mut acc = acc.clone();
                            acc.push(value);
                            next.push((acc, extended));
                        }
                    }
                    states = next;
                }
                Ok(states
                    .into_iter()
                    .map(|(items, bound)| (Value::Array(items), bound))
                    .collect())
            }
            Term::Object(pairs, _) => {
                let mut states = vec![(Map::new(), binding.clone())];
                for (key_term, value_term) in pairs {
                    let mut next = Vec::new();
                    for (acc, bound) in states {
                        for (key, bound_key) in self.eval_term_all(key_term, &bound)? {
                            for (value, bound_value) in
                                self.eval_term_all(value_term, &bound_key)?
                            {
                                let mut acc = acc.clone();
                                acc.insert(key_string(&key)?, value);
                                next.push((acc, bound_value));
                            }
                        }
                    }
                    states = next;
                }
                Ok(states
                    .into_iter()
                    .map(|(map, bound)| (Value::Object(map), bound))
                    .collect())
            }
            Term::Set(items, _) => {
                let mut members = Vec::new();
                let mut bound = binding.clone();
                for item in items {
                    if let Some((value, extended)) =
                        self.eval_term_all(item, &bound)?.into_iter().next()
                    {
                        bound = extended;
                        if !members.contains(&value) {
                            members.push(value);
                        }
                    } else {
                        return Ok(Vec::new());
                    }
                }
                members.sort_by_cached_key(|v| v.to_string());
                Ok(vec![(Value::Array(members), bound)])
            }
            Term::Call(call) => {
                let mut states = vec![(Vec::new(), binding.clone())];
                for arg in &call.args {
                    let mut next = Vec::new();
                    for (acc, bound) in states {
                        for (value, extended) in self.eval_term_all(arg, &bound)? {
                            let mut acc = acc.clone();
                            acc.push(value);
                            next.push((acc, extended));
                        }
                    }
                    states = next;
                }
                let mut results = Vec::new();
                for (args, bound) in states {
                    match self.apply_builtin(&call.op, &args) {
                        Ok(Some(value)) => results.push((value, bound)),
                        Ok(None) => {}
                        Err(err) => {
                            if self.strict_builtins
                                || matches!(err, EvalError::Conflict { .. } | EvalError::Cancelled)
                            {
                                return Err(err);
                            }
                        }
                    }
                }
                Ok(results)
            }
            Term::ArrayCompr { head, body, .. } => {
                let mut items = Vec::new();
                for solution in self.solve(body, binding.clone())? {
                    if let Some(value) = self.eval_one(head, &solution)? {
                        items.push(value);
                    }
                }
                Ok(vec![(Value::Array(items), binding.clone())])
            }
            Term::SetCompr { head, body, .. } => {
                let mut items: Vec<Value> = Vec::new();
                for solution in self.solve(body, binding.clone())? {
                    if let Some(value) = self.eval_one(head, &solution)? {
                        if !items.contains(&value) {
                            items.push(value);
                        }
                    }
                }
                items.sort_by_cached_key(|v| v.to_string());
                Ok(vec![(Value::Array(items), binding.clone())])
            }
            Term::ObjectCompr {
                key, value, body, ..
            } => {
                let mut map = Map::new();
                for solution in self.solve(body, binding.clone())? {
                    let Some(k) = self.eval_one(key, &solution)? else {
                        continue;
                    };
                    let Some(v) = self.eval_one(value, &solution)? else {
                        continue;
                    };
                    let k = key_string(&k)?;
                    if let Some(existing) = map.get(&k) {
                        if *existing != v {
                            return Err(EvalError::Conflict {
                                message: "object keys must be unique".to_string(),
                            });
                        }
                    } else {
                        map.insert(k, v);
                    }
                }
                Ok(vec![(Value::Object(map), binding.clone())])
            }
        }
    }

    fn eval_ref(
        &mut self,
        r: &RefTerm,
        binding: &Bindings,
    ) -> Result<Vec<(Value, Bindings)>, EvalError> {
        let (base, consumed) = match &r.base {
            RefBase::Input => (self.input.clone(), 0),
            RefBase::Var(name) => match binding.get(name) {
                Some(value) => (value.clone(), 0),
                None => return Err(EvalError::Unsafe { var: name.clone() }),
            },
            RefBase::Data => {
                let static_keys = r.static_prefix();
                let mut resolved = None;
                for n in (1..=static_keys.len()).rev() {
                    if let Some(rule) = self.compiled.rule_at(&static_keys[..n]) {
                        let rule = rule.clone();
                        match self.eval_rule_set(&rule)? {
                            Some(doc) => resolved = Some((doc, n)),
                            None => return Ok(Vec::new()),
                        }
                        break;
                    }
                }
                if resolved.is_none()
                    && self.compiled.rules_under(&static_keys).next().is_some()
                {
                    // The full static path addresses a package: assemble its
                    // document. Shorter prefixes fall through to raw data so
                    // rules navigating past their own package don't recurse
                    // into it.
                    match self.eval_package(&static_keys)? {
                        Some(doc) => resolved = Some((doc, static_keys.len())),
                        None => return Ok(Vec::new()),
                    }
                }
                resolved.unwrap_or_else(|| (self.data.clone(), 0))
            }
        };

        let mut states = vec![(base, binding.clone())];
        for arg in &r.args[consumed..] {
            let mut next = Vec::new();
            match arg {
                RefArg::Key(key) => {
                    for (value, bound) in states {
                        if let Some(child) = child_by_key(&value, key) {
                            next.push((child.clone(), bound));
                        }
                    }
                }
                RefArg::Index(term) => {
                    for (value, bound) in states {
                        // An unbound variable in bracket position iterates
                        // the collection, binding the var to each key/index.
                        if let Term::Var(name, _) = term {
                            if !bound.contains_key(name) {
                                match value {
                                    Value::Array(items) => {
                                        for (index, item) in items.into_iter().enumerate() {
                                            let mut extended = bound.clone();
                                            extended.insert(
                                                name.clone(),
                                                Value::Number(Number::from(index)),
                                            );
                                            next.push((item, extended));
                                        }
                                    }
                                    Value::Object(map) => {
                                        for (key, item) in map {
                                            let mut extended = bound.clone();
                                            extended.insert(
                                                name.clone(),
                                                Value::String(key.clone()),
                                            );
                                            next.push((item, extended));
                                        }
                                    }
                                    _ => {}
                                }
                                continue;
                            }
                        }
                        for (index, extended) in self.eval_term_all(term, &bound)? {
                            if let Some(child) = child_by_index(&value, &index) {
                                next.push((child.clone(), extended));
                            }
                        }
                    }
                }
            }
            states = next;
        }
        Ok(states)
    }

    fn apply_builtin(&mut self, op: &str, args: &[Value]) -> Result<Option<Value>, EvalError> {
        let expected = match op {
            "eq" | "neq" | "lt" | "lte" | "gt" | "gte" | "internal.member_2" | "plus"
            | "minus" | "mul" | "div" | "startswith" | "endswith" | "contains" | "concat" => {
                Some(2)
            }
            "count" | "sum" | "lower" | "upper" | "http.send" => Some(1),
            _ => None,
        };
        if let Some(expected) = expected {
            if args.len() != expected {
                return Err(EvalError::Builtin {
                    op: op.to_string(),
                    message: format!("expects {expected} arguments, got {}", args.len()),
                });
            }
        }
        match op {
            "eq" => Ok(Some(Value::Bool(args[0] == args[1]))),
            "neq" => Ok(Some(Value::Bool(args[0] != args[1]))),
            "lt" | "lte" | "gt" | "gte" => {
                let ordering = compare_values(&args[0], &args[1]).ok_or_else(|| {
                    EvalError::Type {
                        message: format!(
                            "cannot compare {} with {}",
                            type_name(&args[0]),
                            type_name(&args[1])
                        ),
                    }
                })?;
                let result = match op {
                    "lt" => ordering.is_lt(),
                    "lte" => ordering.is_le(),
                    "gt" => ordering.is_gt(),
                    _ => ordering.is_ge(),
                };
                Ok(Some(Value::Bool(result)))
            }
            "internal.member_2" => {
                let found = match &args[1] {
                    Value::Array(items) => items.contains(&args[0]),
                    Value::Object(map) => map.values().any(|v| *v == args[0]),
                    other => {
                        return Err(EvalError::Type {
                            message: format!("cannot test membership in {}", type_name(other)),
                        });
                    }
                };
                Ok(Some(Value::Bool(found)))
            }
            "plus" | "minus" | "mul" | "div" => {
                let (a, b) = (number_of(&args[0], op)?, number_of(&args[1], op)?);
                let result = match op {
                    "plus" => a + b,
                    "minus" => a - b,
                    "mul" => a * b,
                    _ => {
                        if b == 0.0 {
                            return Err(EvalError::Builtin {
                                op: op.to_string(),
                                message: "divide by zero".to_string(),
                            });
                        }
                        a / b
                    }
                };
                Ok(Some(number_value(result)))
            }
            "startswith" | "endswith" | "contains" => {
                let (Value::String(s), Value::String(sub)) = (&args[0], &args[1]) else {
                    return Err(EvalError::Type {
                        message: format!("{op} expects two strings"),
                    });
                };
                let result = match op {
                    "startswith" => s.starts_with(sub.as_str()),
                    "endswith" => s.ends_with(sub.as_str()),
                    _ => s.contains(sub.as_str()),
                };
                Ok(Some(Value::Bool(result)))
            }
            "count" => {
                let n = match &args[0] {
                    Value::Array(items) => items.len(),
                    Value::Object(map) => map.len(),
                    Value::String(s) => s.chars().count(),
                    other => {
                        return Err(EvalError::Type {
                            message: format!("count: cannot count {}", type_name(other)),
                        });
                    }
                };
                Ok(Some(Value::Number(Number::from(n))))
            }
            "sum" => {
                let Value::Array(items) = &args[0] else {
                    return Err(EvalError::Type {
                        message: "sum expects an array".to_string(),
                    });
                };
                let mut total = 0.0;
                for item in items {
                    total += number_of(item, op)?;
                }
                Ok(Some(number_value(total)))
            }
            "concat" => {
                let (Value::String(sep), Value::Array(items)) = (&args[0], &args[1]) else {
                    return Err(EvalError::Type {
                        message: "concat expects a separator and an array".to_string(),
                    });
                };
                let mut parts = Vec::with_capacity(items.len());
                for item in items {
                    let Value::String(s) = item else {
                        return Err(EvalError::Type {
                            message: "concat expects an array of strings".to_string(),
                        });
                    };
                    parts.push(s.clone());
                }
                Ok(Some(Value::String(parts.join(sep))))
            }
            "lower" | "upper" => {
                let Value::String(s) = &args[0] else {
                    return Err(EvalError::Type {
                        message: format!("{op} expects a string"),
                    });
                };
                let out = if op == "lower" {
                    s.to_lowercase()
                } else {
                    s.to_uppercase()
                };
                Ok(Some(Value::String(out)))
            }
            "print" => {
                let line = args
                    .iter()
                    .map(render_print)
                    .collect::<Vec<_>>()
                    .join(" ");
                self.prints.push(line);
                Ok(Some(Value::Bool(true)))
            }
            "http.send" => crate::ekm::httpsend::send(&args[0])
                .map(Some)
                .map_err(|message| EvalError::Builtin {
                    op: op.to_string(),
                    message,
                }),
            other => Err(EvalError::Builtin {
                op: other.to_string(),
                message: "unknown built-in".to_string(),
            }),
        }
    }
}

/// Built-in operators whose result depends on more than their arguments.
#[must_use]
pub fn is_nondeterministic(op: &str) -> bool {
    matches!(op, "http.send")
}

fn render_print(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn number_of(value: &Value, op: &str) -> Result<f64, EvalError> {
    value.as_f64().ok_or_else(|| EvalError::Type {
        message: format!("{op}: expected number, got {}", type_name(value)),
    })
}

/// Collapse an integral float back to a JSON integer.
#[must_use]
pub fn number_value(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
        #[allow(clippy::cast_possible_truncation)]
        let int = f as i64;
        Value::Number(Number::from(int))
    } else {
        Number::from_f64(f).map_or(Value::Null, Value::Number)
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn key_string(value: &Value) -> Result<String, EvalError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(EvalError::Type {
            message: format!("object key must be a scalar, got {}", type_name(other)),
        }),
    }
}

fn child_by_key<'v>(value: &'v Value, key: &str) -> Option<&'v Value> {
    match value {
        Value::Object(map) => map.get(key),
        Value::Array(items) => items.get(key.parse::<usize>().ok()?),
        _ => None,
    }
}

fn child_by_index<'v>(value: &'v Value, index: &Value) -> Option<&'v Value> {
    match (value, index) {
        (Value::Array(items), Value::Number(n)) => {
            items.get(usize::try_from(n.as_i64()?).ok()?)
        }
        (Value::Object(map), Value::String(key)) => map.get(key),
        (Value::Object(map), Value::Number(n)) => map.get(&n.to_string()),
        _ => None,
    }
}

fn navigate<'v>(root: &'v Value, path: &[String]) -> Option<&'v Value> {
    let mut current = root;
    for key in path {
        current = child_by_key(current, key)?;
    }
    Some(current)
}

fn insert_at(doc: &mut Value, path: &[String], value: Value) {
    if path.is_empty() {
        *doc = value;
        return;
    }
    if !doc.is_object() {
        *doc = Value::Object(Map::new());
    }
    if let Value::Object(map) = doc {
        if path.len() == 1 {
            map.insert(path[0].clone(), value);
        } else {
            let child = map
                .entry(path[0].clone())
                .or_insert_with(|| Value::Object(Map::new()));
            insert_at(child, &path[1..], value);
        }
    }
}

fn override_input(input: &mut Value, target: &RefTerm, replacement: Value) {
    let keys: Vec<String> = target
        .args
        .iter()
        .filter_map(|arg| match arg {
            RefArg::Key(k) => Some(k.clone()),
            RefArg::Index(Term::Scalar(Value::String(s), _)) => Some(s.clone()),
            RefArg::Index(_) => None,
        })
        .collect();
    insert_at(input, &keys, replacement);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::compiler::compile;
    use crate::policy::parser::parse_module;
    use serde_json::json;

    fn compiled(source: &str) -> CompiledPolicies {
        compile(vec![Arc::new(parse_module("test.rego", source).unwrap())]).unwrap()
    }

    fn eval(
        source: &str,
        path: &[&str],
        input: Value,
        data: &Value,
    ) -> Result<Option<Value>, EvalError> {
        let compiled = compiled(source);
        let mut evaluator = Evaluator::new(&compiled, data, input);
        let path: Vec<String> = path.iter().map(|s| (*s).to_string()).collect();
        evaluator.eval_path(&path)
    }

    #[test]
    fn test_boolean_rule() {
        let source = "package t\n\ngt1 if input.req1 > 1\n";
        let data = json!({});
        assert_eq!(
            eval(source, &["t", "gt1"], json!({"req1": 2}), &data).unwrap(),
            Some(json!(true))
        );
        assert_eq!(
            eval(source, &["t", "gt1"], json!({"req1": 1}), &data).unwrap(),
            None
        );
    }

    #[test]
    fn test_partial_object_iteration() {
        let source = "package condfail\n\np[x] := v if {\n\tsome i\n\tx := input.x[i]\n\tv := input.x[i] + input.y[i]\n}\n";
        let data = json!({});
        let result = eval(
            source,
            &["condfail", "p"],
            json!({"x": [1, 1, 3], "y": [1, 1, 1]}),
            &data,
        )
        .unwrap();
        assert_eq!(result, Some(json!({"1": 2, "3": 4})));
    }

    #[test]
    fn test_partial_object_conflict() {
        let source = "package condfail\n\np[x] := v if {\n\tsome i\n\tx := input.x[i]\n\tv := input.x[i] + input.y[i]\n}\n";
        let data = json!({});
        let err = eval(
            source,
            &["condfail", "p"],
            json!({"x": [1, 1, 3], "y": [1, 2, 1]}),
            &data,
        )
        .unwrap_err();
        assert!(matches!(err, EvalError::Conflict { .. }));
        assert_eq!(err.to_string(), "object keys must be unique");
    }

    #[test]
    fn test_default_and_else() {
        let source = "package t\n\ndefault level := 0\n\nlevel := 2 if input.x > 10 else := 1 if input.x > 5\n";
        let data = json!({});
        assert_eq!(
            eval(source, &["t", "level"], json!({"x": 20}), &data).unwrap(),
            Some(json!(2))
        );
        assert_eq!(
            eval(source, &["t", "level"], json!({"x": 7}), &data).unwrap(),
            Some(json!(1))
        );
        assert_eq!(
            eval(source, &["t", "level"], json!({"x": 1}), &data).unwrap(),
            Some(json!(0))
        );
    }

    #[test]
    fn test_complete_rule_conflict() {
        let source = "package t\n\nv := input.a if input.a > 0\n\nv := input.b if input.b > 0\n";
        let data = json!({});
        let err = eval(source, &["t", "v"], json!({"a": 1, "b": 2}), &data).unwrap_err();
        assert_eq!(
            err.to_string(),
            "complete rules must not produce multiple outputs"
        );
    }

    #[test]
    fn test_data_reference_and_rule_chaining() {
        let source =
            "package t\n\nadmin if input.user in data.roles.admins\n\nok if admin\n";
        let data = json!({"roles": {"admins": ["alice", "bob"]}});
        assert_eq!(
            eval(source, &["t", "ok"], json!({"user": "alice"}), &data).unwrap(),
            Some(json!(true))
        );
        assert_eq!(
            eval(source, &["t", "ok"], json!({"user": "carol"}), &data).unwrap(),
            None
        );
    }

    #[test]
    fn test_rule_chaining_via_explicit_data_ref() {
        let source = "package t\n\nbase := 2 if true\n\ndoubled := data.t.base * 2 if true\n";
        let data = json!({});
        assert_eq!(
            eval(source, &["t", "doubled"], json!({}), &data).unwrap(),
            Some(json!(4))
        );
    }

    #[test]
    fn test_object_comprehension_grouping() {
        let source = "package t\n\nby_id := {id: name | some i\n\tu := input.users[i]\n\tid := u.id\n\tname := u.name} if true\n";
        let data = json!({});
        let input = json!({"users": [
            {"id": "u1", "name": "alice"},
            {"id": "u2", "name": "bob"}
        ]});
        assert_eq!(
            eval(source, &["t", "by_id"], input, &data).unwrap(),
            Some(json!({"u1": "alice", "u2": "bob"}))
        );
    }

    #[test]
    fn test_set_comprehension_dedupes() {
        let source = "package t\n\nnames := {n | some i; n := input.users[i].name} if true\n";
        let data = json!({});
        let input = json!({"users": [
            {"name": "alice"}, {"name": "bob"}, {"name": "alice"}
        ]});
        assert_eq!(
            eval(source, &["t", "names"], input, &data).unwrap(),
            Some(json!(["alice", "bob"]))
        );
    }

    #[test]
    fn test_not_statement() {
        let source = "package t\n\nok if not input.banned\n";
        let data = json!({});
        assert_eq!(
            eval(source, &["t", "ok"], json!({}), &data).unwrap(),
            Some(json!(true))
        );
        assert_eq!(
            eval(source, &["t", "ok"], json!({"banned": true}), &data).unwrap(),
            None
        );
    }

    #[test]
    fn test_every_statement() {
        let source = "package t\n\nall_pos if every x in input.items { x > 0 }\n";
        let data = json!({});
        assert_eq!(
            eval(source, &["t", "all_pos"], json!({"items": [1, 2, 3]}), &data).unwrap(),
            Some(json!(true))
        );
        assert_eq!(
            eval(source, &["t", "all_pos"], json!({"items": [1, -2]}), &data).unwrap(),
            None
        );
    }

    #[test]
    fn test_with_modifier_overrides_input() {
        let source =
            "package t\n\nadmin if input.role == \"admin\"\n\nok if data.t.admin with input.role as \"admin\"\n";
        let data = json!({});
        assert_eq!(
            eval(source, &["t", "ok"], json!({"role": "viewer"}), &data).unwrap(),
            Some(json!(true))
        );
    }

    #[test]
    fn test_print_collected_on_failure() {
        let source = "package t\n\nboom[k] := v if {\n\tprint(\"checking\", input.x)\n\tsome i\n\tk := input.ks[i]\n\tv := input.vs[i]\n}\n";
        let compiled = compiled(source);
        let data = json!({});
        let mut evaluator = Evaluator::new(
            &compiled,
            &data,
            json!({"x": 1, "ks": [1, 1], "vs": [2, 3]}),
        );
        let path = vec!["t".to_string(), "boom".to_string()];
        let err = evaluator.eval_path(&path).unwrap_err();
        assert!(matches!(err, EvalError::Conflict { .. }));
        let prints = evaluator.take_prints();
        assert_eq!(prints, vec!["checking 1".to_string()]);
    }

    #[test]
    fn test_cancel_aborts_evaluation() {
        let source = "package t\n\nok if input.x > 0\n";
        let compiled = compiled(source);
        let data = json!({});
        let cancel = CancelFlag::new();
        cancel.cancel();
        let mut evaluator =
            Evaluator::new(&compiled, &data, json!({"x": 1})).with_cancel(cancel);
        let path = vec!["t".to_string(), "ok".to_string()];
        assert!(matches!(
            evaluator.eval_path(&path),
            Err(EvalError::Cancelled)
        ));
    }

    #[test]
    fn test_strict_builtin_errors() {
        let source = "package t\n\nok if input.x + 1 > 0\n";
        let compiled = compiled(source);
        let data = json!({});

        let mut lenient = Evaluator::new(&compiled, &data, json!({"x": "nope"}));
        let path = vec!["t".to_string(), "ok".to_string()];
        assert_eq!(lenient.eval_path(&path).unwrap(), None);

        let mut strict = Evaluator::new(&compiled, &data, json!({"x": "nope"}))
            .with_strict_builtins(true);
        assert!(strict.eval_path(&path).is_err());
    }

    #[test]
    fn test_package_document_assembly() {
        let source = "package t\n\na := 1 if true\n\nb := 2 if true\n";
        let data = json!({});
        assert_eq!(
            eval(source, &["t"], json!({}), &data).unwrap(),
            Some(json!({"a": 1, "b": 2}))
        );
    }
}
