//! Stowage CLI - inspect and prune task metadata
//!
//! Talks to the metadata daemon over RPC, or reads a metadata directory
//! directly with `--local`.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use stowage_common::{Metadata, TaskId};
use stowage_meta_store::{JsonDirStore, MetaManager};
use stowage_rpc::MetaClient;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "stowage")]
#[command(about = "Stowage metadata CLI")]
#[command(version)]
struct Args {
    /// Metadata service address
    #[arg(short, long, default_value = "127.0.0.1:19876")]
    addr: String,

    /// Shared secret for the metadata service
    #[arg(long, env = "STOWAGE_SECRET", hide_env_values = true, default_value = "")]
    secret: String,

    /// Read this metadata directory instead of contacting the service
    #[arg(long)]
    local: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List task ids
    Keys,
    /// Show task records, oldest first (all tasks if none given)
    Show {
        /// Task IDs
        task_ids: Vec<String>,
    },
    /// Delete a task record (stored files are left to the sweep)
    Remove {
        /// Task ID
        task_id: String,
    },
}

/// Format bytes as a human-readable size string.
#[allow(clippy::cast_precision_loss)]
fn format_size(bytes: u64) -> String {
    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;
    const KIB: u64 = 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

fn render(md: &Metadata) -> String {
    let mut out = String::new();
    let end = md
        .end_time
        .map_or_else(|| "running".to_string(), |t| t.to_rfc3339());
    let _ = writeln!(out, "==> {}", md.task_id);
    let _ = writeln!(out, "==> Job: {}", md.job_name);
    let _ = writeln!(out, "==> Success: {}", md.success);
    let _ = writeln!(out, "==> Message: {}", md.message);
    let _ = writeln!(out, "==> Command: {}", md.command);
    let _ = writeln!(out, "==> PID: {}", md.pid);
    let _ = writeln!(out, "==> Start: {}", md.start_time.to_rfc3339());
    let _ = writeln!(out, "==> End: {end}");
    let _ = writeln!(out, "==> Expire: {}", md.expire_time.to_rfc3339());
    let _ = writeln!(out, "==> Duration: {}s", md.duration().num_seconds());
    let _ = writeln!(out, "==> Files:");
    for file in &md.files {
        let _ = writeln!(out, "    {file}");
    }
    let _ = writeln!(
        out,
        "==> Size: {} ({}/s)",
        format_size(md.total_size),
        format_size(md.avg_speed())
    );
    let _ = writeln!(out, "==> Output:\n{}", String::from_utf8_lossy(&md.output));
    let _ = writeln!(out, "==> Errput:\n{}", String::from_utf8_lossy(&md.errput));
    out.push_str("==================================");
    out
}

async fn show(meta: &dyn MetaManager, task_ids: Vec<String>) -> Result<()> {
    let ids = if task_ids.is_empty() {
        meta.keys().await?
    } else {
        task_ids
            .into_iter()
            .map(TaskId::parse)
            .collect::<Result<Vec<_>, _>>()?
    };

    let mut records = Vec::with_capacity(ids.len());
    for id in ids {
        match meta.view(&id).await {
            Ok(md) => records.push(md),
            Err(e) => eprintln!("[warning] {id}: {e}"),
        }
    }
    if records.is_empty() {
        println!("[warning] no valid metadata found");
        return Ok(());
    }

    records.sort_by_key(|md| md.start_time);
    for md in &records {
        println!("{}", render(md));
    }
    Ok(())
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

    let meta: Arc<dyn MetaManager> = match &args.local {
        Some(dir) => {
            debug!("Reading metadata directory {}", dir.display());
            Arc::new(JsonDirStore::open(dir)?)
        }
        None => {
            debug!("Using metadata service at {}", args.addr);
            Arc::new(MetaClient::new(args.addr.clone(), &args.secret))
        }
    };

    match args.command {
        Commands::Keys => {
            for id in meta.keys().await? {
                println!("{id}");
            }
        }
        Commands::Show { task_ids } => show(meta.as_ref(), task_ids).await?,
        Commands::Remove { task_id } => {
            let id = TaskId::parse(task_id)?;
            meta.remove(&id).await?;
            println!("Task '{id}' removed");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KiB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MiB");
    }

    #[test]
    fn test_render_unfinished_task() {
        let mut md = Metadata::new(TaskId::generate(), Utc::now(), TimeDelta::days(1));
        md.job_name = "etc-backup".to_string();
        md.output = b"tar: removing leading '/'".to_vec();

        let text = render(&md);
        assert!(text.starts_with(&format!("==> {}\n", md.task_id)));
        assert!(text.contains("==> Job: etc-backup"));
        assert!(text.contains("==> End: running"));
        assert!(text.contains("==> Duration: 0s"));
        assert!(text.contains("tar: removing leading '/'"));
    }
}
