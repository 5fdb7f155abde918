//! HTTP data-plugin driver
//!
//! Polls an HTTP endpoint on a fixed interval, decodes the JSON body, and
//! hands it to the framework's ingester. Poll failures log and wait for the
//! next tick; there is no extra back-off beyond the interval.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::time::interval;
use tracing::{debug, warn};

use crate::store::Path;

use super::{DataPlugin, Ingester, PluginError, parse_interval};

/// Floor for the polling interval.
pub const MIN_POLLING_INTERVAL: Duration = Duration::from_secs(10);
/// Default polling interval.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(30);
/// Default per-request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// A header value: single or multi-valued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    /// One value
    Single(String),
    /// Repeated header
    Many(Vec<String>),
}

/// HTTP driver configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpDriverConfig {
    /// Endpoint to poll
    pub url: String,
    /// Request method
    #[serde(default = "default_method")]
    pub method: String,
    /// Inline request body
    #[serde(default)]
    pub body: Option<Value>,
    /// File whose contents become the request body
    #[serde(default)]
    pub file: Option<String>,
    /// Request headers, single or multi-valued
    #[serde(default)]
    pub headers: BTreeMap<String, HeaderValue>,
    /// Per-request timeout
    #[serde(default)]
    pub timeout: Option<Value>,
    /// Polling interval (min 10s, default 30s)
    #[serde(default)]
    pub polling_interval: Option<Value>,
    /// Follow redirects (default true)
    #[serde(default = "default_true")]
    pub follow_redirects: bool,
    /// Skip TLS certificate verification
    #[serde(default)]
    pub tls_insecure_skip_verify: bool,
}

fn default_method() -> String {
    "GET".to_string()
}

const fn default_true() -> bool {
    true
}

impl HttpDriverConfig {
    fn effective_interval(&self) -> Duration {
        let configured = self
            .polling_interval
            .as_ref()
            .and_then(parse_interval)
            .unwrap_or(DEFAULT_POLLING_INTERVAL);
        configured.max(MIN_POLLING_INTERVAL)
    }

    fn effective_timeout(&self) -> Duration {
        self.timeout
            .as_ref()
            .and_then(parse_interval)
            .unwrap_or(DEFAULT_TIMEOUT)
    }
}

/// The HTTP polling driver.
pub struct HttpDataPlugin {
    name: String,
    mount: Path,
    config: Mutex<HttpDriverConfig>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl HttpDataPlugin {
    /// Build a driver instance from its configuration section.
    ///
    /// # Errors
    /// Fails on an empty URL.
    pub fn new(name: &str, mount: Path, config: HttpDriverConfig) -> Result<Self, PluginError> {
        if config.url.is_empty() {
            return Err(PluginError::Config {
                message: format!("plugin {name}: url is required"),
            });
        }
        Ok(Self {
            name: name.to_string(),
            mount,
            config: Mutex::new(config),
            shutdown: Mutex::new(None),
        })
    }

    async fn spawn_loop(&self, ingester: Arc<Ingester>) -> Result<(), PluginError> {
        let config = self.config.lock().await.clone();
        let name = self.name.clone();
        let (tx, mut rx) = watch::channel(false);
        {
            let mut shutdown = self.shutdown.lock().await;
            if let Some(previous) = shutdown.replace(tx) {
                let _ = previous.send(true);
            }
        }

        let client = build_client(&config)?;
        tokio::spawn(async move {
            let mut ticker = interval(config.effective_interval());
            // interval() fires immediately; the loop sleeps one full
            // interval before the first request.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match poll_once(&client, &config).await {
                            Ok(document) => {
                                if let Err(err) = ingester.ingest(document).await {
                                    warn!(plugin = %name, error = %err, "ingest failed");
                                }
                            }
                            Err(err) => {
                                warn!(plugin = %name, error = %err, "poll failed, retrying next interval");
                            }
                        }
                    }
                    _ = rx.changed() => {
                        debug!(plugin = %name, "http poll loop stopping");
                        break;
                    }
                }
            }
        });
        Ok(())
    }
}

fn build_client(config: &HttpDriverConfig) -> Result<reqwest::Client, PluginError> {
    let mut builder = reqwest::Client::builder().timeout(config.effective_timeout());
    if !config.follow_redirects {
        builder = builder.redirect(reqwest::redirect::Policy::none());
    }
    if config.tls_insecure_skip_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }
    builder.build().map_err(|e| PluginError::Config {
        message: format!("failed to build http client: {e}"),
    })
}

async fn poll_once(
    client: &reqwest::Client,
    config: &HttpDriverConfig,
) -> Result<Value, PluginError> {
    let method = reqwest::Method::from_bytes(config.method.to_uppercase().as_bytes())
        .map_err(|_| PluginError::Config {
            message: format!("invalid method {}", config.method),
        })?;

    let mut request = client.request(method, &config.url);
    for (header, value) in &config.headers {
        match value {
            HeaderValue::Single(v) => request = request.header(header, v),
            HeaderValue::Many(values) => {
                for v in values {
                    request = request.header(header, v);
                }
            }
        }
    }
    if let Some(body) = &config.body {
        request = request.json(body);
    } else if let Some(file) = &config.file {
        let contents = tokio::fs::read(file).await.map_err(|e| PluginError::Driver {
            message: format!("failed to read body file {file}: {e}"),
        })?;
        request = request.body(contents);
    }

    let response = request.send().await.map_err(|e| PluginError::Driver {
        message: format!("request failed: {e}"),
    })?;
    let status = response.status();
    if !status.is_success() {
        return Err(PluginError::Driver {
            message: format!("unexpected status {status}"),
        });
    }
    response.json().await.map_err(|e| PluginError::Driver {
        message: format!("invalid JSON body: {e}"),
    })
}

#[async_trait]
impl DataPlugin for HttpDataPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &Path {
        &self.mount
    }

    async fn start(&self, ingester: Arc<Ingester>) -> Result<(), PluginError> {
        self.spawn_loop(ingester).await
    }

    async fn stop(&self) {
        let mut shutdown = self.shutdown.lock().await;
        if let Some(tx) = shutdown.take() {
            let _ = tx.send(true);
        }
    }

    async fn reconfigure(
        &self,
        ingester: Arc<Ingester>,
        new_config: Value,
    ) -> Result<(), PluginError> {
        let parsed: HttpDriverConfig =
            serde_json::from_value(new_config).map_err(|e| PluginError::Config {
                message: format!("invalid http plugin configuration: {e}"),
            })?;
        {
            let mut current = self.config.lock().await;
            if *current == parsed {
                debug!(plugin = %self.name, "reconfigure with identical configuration, skipping");
                return Ok(());
            }
            *current = parsed;
        }
        self.spawn_loop(ingester).await
    }
}
