//! Data-filter compilation
//!
//! Takes the residual of a partial evaluation and turns it into a data
//! filter: a UCAST condition tree or a SQL `WHERE` fragment, after
//! validating the residual against the translation target's constraints.

pub mod constraints;
pub mod hints;
pub mod sql;
pub mod translate;
pub mod ucast;

pub use constraints::{FragmentViolation, TargetKind, TargetSpec, UcastVariant, check_queries};
pub use sql::SqlDialect;
pub use translate::{TableMappings, TranslateError, Translation, to_sql, to_ucast};
pub use ucast::UcastNode;
