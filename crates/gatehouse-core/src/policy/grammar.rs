//! Pest grammar binding for the policy language

use pest_derive::Parser;

/// Pest parser generated from `grammar.pest`.
#[derive(Parser)]
#[grammar = "policy/grammar.pest"]
pub struct PolicyGrammar;
