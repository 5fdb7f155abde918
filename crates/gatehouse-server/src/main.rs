//! Gatehouse HTTP Server
//!
//! Policy decision endpoint server: batch evaluation, compile-to-filter
//! translation, and pluggable data sources.

use anyhow::Result;
use clap::Parser;
use serde_json::{Value, json};
use std::path::PathBuf;
use tracing::info;

use gatehouse_core::config::Config;
use gatehouse_core::logging::init_tracing;
use gatehouse_server::server;

/// Gatehouse HTTP Server
#[derive(Parser, Debug)]
#[command(name = "gatehouse-server")]
#[command(about = "Policy decision engine server")]
#[command(version)]
struct Args {
    /// Configuration file path (YAML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Server port to bind to
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

fn load_raw_configuration(args: &Args) -> Result<Value> {
    let mut raw = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Config::raw_from_file(path)?
        }
        None => json!({}),
    };

    if let Some(host) = &args.host {
        raw["server"]["host"] = json!(host);
    }
    if let Some(port) = args.port {
        raw["server"]["port"] = json!(port);
    }
    if let Some(level) = &args.log_level {
        raw["logging"]["level"] = json!(level);
    }
    Ok(raw)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let raw = load_raw_configuration(&args)?;

    // Logging comes up before EKM resolution so resolution warnings land
    // somewhere visible.
    let pre_config = Config::from_value(raw.clone())?;
    init_tracing(&pre_config.logging)?;

    server::run(raw).await
}
