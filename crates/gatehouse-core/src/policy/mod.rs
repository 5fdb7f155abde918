//! Policy language engine
//!
//! The decision engine consumes a compact rego-like module language: a
//! `package` declaration followed by rules whose bodies are conjunctions of
//! comparisons, assignments, iteration, negation, and comprehensions.
//! Modules parse with pest, compile into an indexed rule set, and evaluate
//! against an input document plus a store data snapshot.
//!
//! # Example
//!
//! ```rust
//! use gatehouse_core::policy::{compiler, parser, evaluator::Evaluator};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let module = parser::parse_module("example.rego",
//!     "package example\n\nallow if input.role == \"admin\"\n").unwrap();
//! let compiled = compiler::compile(vec![Arc::new(module)]).unwrap();
//!
//! let data = json!({});
//! let mut eval = Evaluator::new(&compiled, &data, json!({"role": "admin"}));
//! let path = vec!["example".to_string(), "allow".to_string()];
//! assert_eq!(eval.eval_path(&path).unwrap(), Some(json!(true)));
//! ```

pub mod ast;
pub mod compiler;
pub mod evaluator;
mod grammar;
pub mod parser;
pub mod partial;
pub mod prepared;

pub use ast::Module;
pub use compiler::{CompileError, CompiledPolicies, query_path_segments};
pub use evaluator::{CancelFlag, EvalError, Evaluator};
pub use parser::{ParseError, parse_module};
pub use partial::{PartialError, PartialOptions, PartialResult, partial_eval};
pub use prepared::{PreparedQuery, PreparedQueryCache};

/// Policy engine errors.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// Module source failed to parse
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Module set failed to compile
    #[error("compile error: {}", format_compile_errors(.0))]
    Compile(Vec<CompileError>),

    /// Evaluation failed
    #[error(transparent)]
    Eval(#[from] EvalError),

    /// Partial evaluation failed
    #[error(transparent)]
    Partial(#[from] PartialError),
}

impl From<Vec<CompileError>> for PolicyError {
    fn from(errors: Vec<CompileError>) -> Self {
        Self::Compile(errors)
    }
}

fn format_compile_errors(errors: &[CompileError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Policy engine result type.
pub type PolicyResult<T> = Result<T, PolicyError>;
