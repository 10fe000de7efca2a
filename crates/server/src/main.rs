//! keepsake server binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use keepsake_core::SystemClock;
use keepsake_core::config::AppConfig;
use keepsake_server::bootstrap::open_state;
use keepsake_server::create_router;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// keepsake - resumable uploads and tiered asset storage
#[derive(Parser, Debug)]
#[command(name = "keepsake-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "KEEPSAKE_CONFIG",
        default_value = "config/server.toml"
    )]
    config: String,
}

/// Merge the optional TOML file and `KEEPSAKE_` environment variables over the defaults.
fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if Path::new(path).exists() {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::info!(config_path = %path, "No config file found, using defaults and environment");
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("KEEPSAKE_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("keepsake v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;
    if config.auth.tokens.is_empty() {
        tracing::warn!("No tokens configured in auth.tokens, every API request will be rejected");
    }

    keepsake_server::metrics::register_metrics();

    let state = open_state(config.clone(), Arc::new(SystemClock)).await?;

    if let Err(e) = state.sweeper.run_once().await {
        tracing::warn!(error = %e, "Startup expiry sweep failed");
    }
    let _sweep_handle = state.sweeper.clone().spawn();

    let arena = state.arena.clone();
    let app = create_router(state);

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    arena.sync().context("failed to flush arena")?;
    tracing::info!("Arena flushed, exiting");
    Ok(())
}
