//! Stowage Metadata Daemon
//!
//! Serves the task metadata directory to storage daemons, job runners and
//! the CLI over the authenticated RPC protocol.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use stowage_common::{MetamanConfig, load_config};
use stowage_meta_store::JsonDirStore;
use stowage_rpc::MetaRpcServer;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "stowage-metaman")]
#[command(about = "Stowage Metadata Service")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/stowage/metaman.toml")]
    config: PathBuf,

    /// Listen address (overrides the config file)
    #[arg(short, long)]
    listen: Option<String>,

    /// Metadata directory (overrides the config file)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Shared secret (overrides the config file)
    #[arg(long, env = "STOWAGE_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Check the configuration and exit
    #[arg(long)]
    test: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn resolve_config(args: &Args) -> Result<MetamanConfig> {
    let mut config: MetamanConfig = load_config(&args.config)?;
    if let Some(listen) = &args.listen {
        config.listen.clone_from(listen);
    }
    if let Some(root) = &args.root {
        config.root.clone_from(root);
    }
    if let Some(secret) = &args.secret {
        config.secret.clone_from(secret);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = resolve_config(&args)?;
    let store = JsonDirStore::open(&config.root)?;
    if args.test {
        println!("Config OK: {}", args.config.display());
        return Ok(());
    }

    info!("Starting Stowage Metadata Service");
    info!("Metadata directory: {}", store.root().display());
    let existing = store.keys().await?.len();
    info!("{existing} task records on disk");

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("cannot listen on {}", config.listen))?;
    let server = Arc::new(MetaRpcServer::new(
        Arc::new(store),
        &config.secret,
        config.auth_timeout(),
    ));

    tokio::select! {
        () = server.serve(listener) => {}
        _ = tokio::signal::ctrl_c() => info!("Shutting down..."),
    }

    info!("Metadata Service shut down");
    Ok(())
}
