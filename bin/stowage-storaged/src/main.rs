//! Stowage Storage Daemon
//!
//! Receives backup files from job scripts, records them through the
//! metadata service and periodically deletes expired tasks.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use stowage_common::{StorageConfig, load_config};
use stowage_meta_store::MetaManager;
use stowage_rpc::MetaClient;
use stowage_storage::{IngestServer, ShutdownStatus, sweep_loop};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "stowage-storaged")]
#[command(about = "Stowage Storage Service")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/stowage/storage.toml")]
    config: PathBuf,

    /// Listen address (overrides the config file)
    #[arg(short, long)]
    listen: Option<String>,

    /// Storage root directory (overrides the config file)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Metadata service address (overrides the config file)
    #[arg(long)]
    metadata_addr: Option<String>,

    /// Shared secret for the metadata service (overrides the config file)
    #[arg(long, env = "STOWAGE_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Check the configuration and exit
    #[arg(long)]
    test: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn resolve_config(args: &Args) -> Result<StorageConfig> {
    let mut config: StorageConfig = load_config(&args.config)?;
    if let Some(listen) = &args.listen {
        config.listen.clone_from(listen);
    }
    if let Some(root) = &args.root {
        config.root.clone_from(root);
    }
    if let Some(addr) = &args.metadata_addr {
        config.metadata_addr.clone_from(addr);
    }
    if let Some(secret) = &args.secret {
        config.secret.clone_from(secret);
    }
    Ok(config)
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!("Cannot install SIGTERM handler: {e}");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.ok();
}

async fn run(args: Args) -> Result<ShutdownStatus> {
    let config = resolve_config(&args)?;
    if !config.root.is_dir() {
        anyhow::bail!("storage root {} is not a directory", config.root.display());
    }
    if args.test {
        println!("Config OK: {}", args.config.display());
        return Ok(ShutdownStatus::Drained);
    }

    info!("Starting Stowage Storage Service");
    info!("Storage root: {}", config.root.display());
    info!("Metadata service: {}", config.metadata_addr);

    let meta: Arc<dyn MetaManager> = Arc::new(MetaClient::new(
        config.metadata_addr.clone(),
        &config.secret,
    ));
    let server = Arc::new(
        IngestServer::new(config.root.clone(), meta).with_header_timeout(config.header_timeout()),
    );

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("cannot listen on {}", config.listen))?;
    let accept = tokio::spawn(Arc::clone(&server).serve(listener));
    let sweep = tokio::spawn(sweep_loop(Arc::clone(&server), config.sweep_interval()));

    wait_for_signal().await;
    info!("Shutting down...");
    let status = server.shutdown(config.shutdown_timeout()).await;

    accept.await.ok();
    sweep.await.ok();
    Ok(status)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(args).await? {
        ShutdownStatus::Drained => {
            info!("Storage Service shut down gracefully");
            Ok(ExitCode::SUCCESS)
        }
        ShutdownStatus::TimedOut { in_flight } => {
            error!("Storage Service stopped with {in_flight} transfers cut off");
            Ok(ExitCode::FAILURE)
        }
    }
}
