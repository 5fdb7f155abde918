//! HTTP handlers

pub mod batch;
pub mod bundles;
pub mod compile;
pub mod data;
pub mod health;

use serde::Deserialize;

/// Query parameters shared by the decision endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct DecisionParams {
    /// Pretty-print the response
    #[serde(default)]
    pub pretty: Option<String>,
    /// Include evaluation metrics
    #[serde(default)]
    pub metrics: Option<String>,
    /// Include instrumentation-level metrics
    #[serde(default)]
    pub instrument: Option<String>,
    /// Include bundle provenance
    #[serde(default)]
    pub provenance: Option<String>,
    /// Treat built-in errors as hard failures
    #[serde(default, rename = "strict-builtin-errors")]
    pub strict_builtin_errors: Option<String>,
    /// Explain mode (off, notes, fails, full, debug)
    #[serde(default)]
    pub explain: Option<String>,
}

impl DecisionParams {
    /// Whether a flag-style parameter is set (`?metrics`, `?metrics=true`).
    #[must_use]
    pub fn flag(value: Option<&str>) -> bool {
        matches!(value, Some("" | "true" | "1"))
    }

    /// `?metrics` as a bool.
    #[must_use]
    pub fn wants_metrics(&self) -> bool {
        Self::flag(self.metrics.as_deref())
    }

    /// `?strict-builtin-errors` as a bool.
    #[must_use]
    pub fn strict_builtins(&self) -> bool {
        Self::flag(self.strict_builtin_errors.as_deref())
    }

    /// `?provenance` as a bool.
    #[must_use]
    pub fn wants_provenance(&self) -> bool {
        Self::flag(self.provenance.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_parsing() {
        assert!(DecisionParams::flag(Some("")));
        assert!(DecisionParams::flag(Some("true")));
        assert!(!DecisionParams::flag(Some("false")));
        assert!(!DecisionParams::flag(None));
    }
}
