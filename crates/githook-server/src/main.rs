//! githook-server binary.

use anyhow::{Context, Result};
use clap::Parser;
use githook_server::{build_router, AppState, ServerConfig};
use githook_store::{DriverRecord, ProviderInstanceRecord, RuleRecord};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

/// Webhook-to-broker routing server.
#[derive(Parser, Debug)]
#[command(name = "githook-server", version, about)]
struct Args {
    /// HTTP listen port.
    #[arg(long, env = "GITHOOK_PORT", default_value = "8080")]
    port: u16,

    /// Seed file with rules, drivers, and provider instances (JSON).
    #[arg(long, env = "GITHOOK_CONFIG_PATH")]
    config: Option<std::path::PathBuf>,

    /// Log in JSON.
    #[arg(long, env = "GITHOOK_LOG_JSON", default_value = "false")]
    log_json: bool,
}

/// Bootstrap seed: the declarative part of the control plane.
#[derive(Debug, Default, Deserialize)]
struct Seed {
    #[serde(default)]
    rules: Vec<RuleRecord>,
    #[serde(default)]
    drivers: Vec<DriverRecord>,
    #[serde(default)]
    provider_instances: Vec<ProviderInstanceRecord>,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = ServerConfig::default();
    config.port = args.port;
    config.log_json = config.log_json || args.log_json;
    init_tracing(config.log_json);

    let seed: Seed = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading seed file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing seed file {}", path.display()))?
        }
        None => Seed::default(),
    };
    info!(
        rules = seed.rules.len(),
        drivers = seed.drivers.len(),
        instances = seed.provider_instances.len(),
        "loaded seed configuration"
    );

    // A strict-mode rule error is fatal here, before the listener opens.
    let (state, _hub) = AppState::in_memory(config.clone(), seed.rules, seed.drivers)
        .context("compiling rule set")?;
    for instance in seed.provider_instances {
        state
            .instances
            .upsert(instance)
            .await
            .map_err(|e| anyhow::anyhow!("seeding provider instance: {e}"))?;
    }

    let router = build_router(state.clone());
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, "githook server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(config.shutdown_grace_secs))
        .await
        .context("http server error")?;

    // Listeners are down; drain publishers, then the stores go with the
    // process.
    state
        .publishers
        .close()
        .await
        .map_err(|e| anyhow::anyhow!("closing publishers: {e}"))?;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal(grace_secs: u64) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("install ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("install sigterm handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!(grace_secs, "shutdown signal received, draining requests");
}
