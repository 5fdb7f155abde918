//! Prometheus metrics
//!
//! One registry per server instance; handlers and the plugin framework
//! bump the counters, the `/metrics` endpoint renders the text exposition.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::error::{Error, Result};

/// Server-wide counters.
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    /// Batch requests served
    pub batch_requests: IntCounter,
    /// Individual batch inputs evaluated
    pub batch_inputs: IntCounter,
    /// Batch inputs that returned an error
    pub batch_failures: IntCounter,
    /// Compile requests served
    pub compile_requests: IntCounter,
    /// Successful data-plugin ingests, by plugin
    pub plugin_ingests: IntCounterVec,
    /// Failed data-plugin polls, by plugin
    pub plugin_errors: IntCounterVec,
    /// Bundle activations applied
    pub bundle_activations: IntCounter,
}

impl Metrics {
    /// Create and register all counters.
    ///
    /// # Errors
    /// Propagates registry collisions.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let register_err = |e: prometheus::Error| Error::Config(format!("metrics setup: {e}"));

        let batch_requests = IntCounter::with_opts(Opts::new(
            "gatehouse_batch_requests_total",
            "Batch query requests served",
        ))
        .map_err(register_err)?;
        let batch_inputs = IntCounter::with_opts(Opts::new(
            "gatehouse_batch_inputs_total",
            "Individual batch inputs evaluated",
        ))
        .map_err(register_err)?;
        let batch_failures = IntCounter::with_opts(Opts::new(
            "gatehouse_batch_input_failures_total",
            "Batch inputs that produced an error response",
        ))
        .map_err(register_err)?;
        let compile_requests = IntCounter::with_opts(Opts::new(
            "gatehouse_compile_requests_total",
            "Compile requests served",
        ))
        .map_err(register_err)?;
        let plugin_ingests = IntCounterVec::new(
            Opts::new(
                "gatehouse_plugin_ingests_total",
                "Successful data-plugin ingests",
            ),
            &["plugin"],
        )
        .map_err(register_err)?;
        let plugin_errors = IntCounterVec::new(
            Opts::new("gatehouse_plugin_errors_total", "Failed data-plugin polls"),
            &["plugin"],
        )
        .map_err(register_err)?;
        let bundle_activations = IntCounter::with_opts(Opts::new(
            "gatehouse_bundle_activations_total",
            "Bundle activations applied",
        ))
        .map_err(register_err)?;

        registry
            .register(Box::new(batch_requests.clone()))
            .map_err(register_err)?;
        registry
            .register(Box::new(batch_inputs.clone()))
            .map_err(register_err)?;
        registry
            .register(Box::new(batch_failures.clone()))
            .map_err(register_err)?;
        registry
            .register(Box::new(compile_requests.clone()))
            .map_err(register_err)?;
        registry
            .register(Box::new(plugin_ingests.clone()))
            .map_err(register_err)?;
        registry
            .register(Box::new(plugin_errors.clone()))
            .map_err(register_err)?;
        registry
            .register(Box::new(bundle_activations.clone()))
            .map_err(register_err)?;

        Ok(Self {
            registry,
            batch_requests,
            batch_inputs,
            batch_failures,
            compile_requests,
            plugin_ingests,
            plugin_errors,
            bundle_activations,
        })
    }

    /// Text exposition of every registered metric.
    #[must_use]
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        let metrics = Metrics::new().unwrap();
        metrics.batch_requests.inc();
        metrics.batch_inputs.inc_by(3);
        metrics.plugin_ingests.with_label_values(&["ldap.users"]).inc();

        let rendered = metrics.render();
        assert!(rendered.contains("gatehouse_batch_requests_total 1"));
        assert!(rendered.contains("gatehouse_batch_inputs_total 3"));
        assert!(rendered.contains("ldap.users"));
    }
}
