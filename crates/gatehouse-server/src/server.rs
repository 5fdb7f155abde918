//! Server configuration and startup

use anyhow::Result;
use axum::{
    Router,
    routing::{delete, get, post, put},
};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use gatehouse_core::config::{Config, DataPluginConfig, mount_path};
use gatehouse_core::ekm::{self, VaultSource};
use gatehouse_core::metrics::Metrics;
use gatehouse_core::plugins::{
    DataPlugin, HttpDataPlugin, LdapDataPlugin, PluginManager, TransformSpec,
};
use gatehouse_core::policy::compiler::SharedCompiledPolicies;
use gatehouse_core::policy::{CompiledPolicies, PreparedQueryCache};
use gatehouse_core::store::Store;
use serde_json::Value;

use crate::decision_log::DecisionLog;
use crate::handlers;
use crate::middleware::authorize;

/// Produces decision ids; swapped for a deterministic one in tests.
pub type DecisionIdFactory = Arc<dyn Fn() -> String + Send + Sync>;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub compiled: SharedCompiledPolicies,
    pub prepared: Arc<PreparedQueryCache>,
    pub config: Arc<Config>,
    pub metrics: Arc<Metrics>,
    pub plugins: Arc<PluginManager>,
    pub decision_log: Arc<DecisionLog>,
    pub decision_ids: DecisionIdFactory,
}

impl AppState {
    /// Build the state graph for a configuration.
    ///
    /// # Errors
    /// Fails when metrics registration fails.
    pub fn new(config: Config) -> Result<Self> {
        let store = Arc::new(Store::new());
        let compiled: SharedCompiledPolicies =
            Arc::new(RwLock::new(Arc::new(CompiledPolicies::default())));
        let plugins = Arc::new(PluginManager::new(
            Arc::clone(&store),
            Arc::clone(&compiled),
        ));
        Ok(Self {
            store,
            compiled,
            prepared: Arc::new(PreparedQueryCache::default()),
            config: Arc::new(config),
            metrics: Arc::new(Metrics::new()?),
            plugins,
            decision_log: Arc::new(DecisionLog::new()),
            decision_ids: Arc::new(|| Uuid::new_v4().to_string()),
        })
    }

    /// The compiled policies currently in force.
    #[must_use]
    pub fn compiled_snapshot(&self) -> Arc<CompiledPolicies> {
        let guard = self
            .compiled
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Swap the compiler and drop every prepared query; the cache holds
    /// handles into the old module set.
    pub async fn swap_compiled(&self, new: Arc<CompiledPolicies>) {
        {
            let mut guard = self
                .compiled
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *guard = new;
        }
        self.prepared.invalidate_all();
        self.metrics.bundle_activations.inc();
        self.plugins.refresh_transforms().await;
    }

    /// A fresh decision id.
    #[must_use]
    pub fn decision_id(&self) -> String {
        (self.decision_ids)()
    }
}

/// Create the Axum application with all routes
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/metrics", get(handlers::health::metrics))
        .route("/v1/batch/data", post(handlers::batch::batch_root))
        .route("/v1/batch/data/*path", post(handlers::batch::batch))
        .route("/v1/compile", post(handlers::compile::compile_root))
        .route("/v1/compile/*path", post(handlers::compile::compile))
        .route(
            "/v1/data",
            get(handlers::data::get_root).put(handlers::data::put_root),
        )
        .route(
            "/v1/data/*path",
            get(handlers::data::get_data).put(handlers::data::put_data),
        )
        .route("/v1/policies/:id", put(handlers::data::put_policy))
        .route("/v1/policies/:id", delete(handlers::data::delete_policy))
        .route("/v1/bundles/:name", put(handlers::bundles::put_bundle))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            authorize,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Resolve configuration secrets and start every configured data plugin,
/// then serve until shutdown.
///
/// # Errors
/// Startup failures: EKM resolution at required sites, invalid plugin
/// configuration, bind errors.
pub async fn run(raw_config: Value) -> Result<()> {
    let config = resolve_config(raw_config).await?;
    let state = AppState::new(config)?;

    start_plugins(&state).await?;

    let addr = SocketAddr::from((
        state
            .config
            .server
            .host
            .parse::<std::net::IpAddr>()
            .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1))),
        state.config.server.port,
    ));
    let app = create_app(state);

    info!("Starting gatehouse server on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Apply the EKM pass to the raw configuration document.
async fn resolve_config(mut raw: Value) -> Result<Config> {
    let parsed = Config::from_value(raw.clone())?;
    if let Some(vault) = &parsed.ekm.vault {
        info!("Resolving configuration secrets");
        let source = VaultSource::connect(vault).await?;
        ekm::resolve_vault_section(&mut raw, vault, &source).await?;
        let report = ekm::resolve_placeholders(&mut raw, &source, vault.lenient).await?;
        if !report.warnings.is_empty() {
            warn!(
                unresolved = report.warnings.len(),
                "configuration loaded with unresolved placeholders"
            );
        }
        return Ok(Config::from_value(raw)?);
    }
    Ok(parsed)
}

/// Instantiate and register every `plugins.data` section.
async fn start_plugins(state: &AppState) -> Result<()> {
    for (dotted, section) in &state.config.plugins.data {
        let plugin = build_plugin(dotted, section)?;
        let transform = TransformSpec {
            rule_ref: section.rego_transform.clone(),
            include_previous: section.rego_transform_with_previous,
        };
        state.plugins.register(plugin, transform).await?;
    }
    Ok(())
}

fn build_plugin(dotted: &str, section: &DataPluginConfig) -> Result<Arc<dyn DataPlugin>> {
    let mount = mount_path(dotted);
    let plugin: Arc<dyn DataPlugin> = match section.plugin_type.as_str() {
        "http" => Arc::new(HttpDataPlugin::new(
            dotted,
            mount,
            serde_json::from_value(section.options.clone())?,
        )?),
        "ldap" => Arc::new(LdapDataPlugin::new(
            dotted,
            mount,
            serde_json::from_value(section.options.clone())?,
        )?),
        other => anyhow::bail!("unknown data plugin type: {other}"),
    };
    Ok(plugin)
}
