//! Expiry sweep
//!
//! Deletes the files of every task past its expire time, then the task's
//! metadata. A record is only removed once all of its files are gone, so a
//! failed delete is retried on the next pass.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use stowage_common::{Metadata, Result};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::server::IngestServer;

/// Counters from one sweep pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: usize,
    /// Expired tasks whose files and record are now gone
    pub removed: usize,
    /// Records that could not be read and were left alone
    pub skipped_corrupt: usize,
    /// File deletes that failed and will be retried
    pub file_failures: usize,
}

/// Run one pass over every task known to the server's metadata manager
///
/// Failing to list the tasks is the only error; everything else is logged
/// and counted.
pub async fn sweep_expired(server: &IngestServer, now: DateTime<Utc>) -> Result<SweepReport> {
    let meta = server.meta();
    let mut report = SweepReport::default();

    for task_id in meta.keys().await? {
        report.scanned += 1;
        let md = match meta.view(&task_id).await {
            Ok(md) => md,
            Err(e) if e.is_not_found() => {
                debug!("Task {} vanished during sweep", task_id);
                continue;
            }
            Err(e) => {
                warn!("Sweep: cannot read metadata for task {}: {}", task_id, e);
                report.skipped_corrupt += 1;
                continue;
            }
        };
        if !md.is_expired_at(now) {
            continue;
        }

        report.expired += 1;
        let failures = remove_files(server, &md).await;
        if failures > 0 {
            report.file_failures += failures;
            warn!(
                "Sweep: task {} keeps its metadata, {} files could not be removed",
                task_id, failures
            );
            continue;
        }

        match meta.remove(&task_id).await {
            Ok(()) => {
                info!("Sweep: removed expired task {} ({})", task_id, md.job_name);
                report.removed += 1;
            }
            Err(e) => warn!("Sweep: cannot remove metadata for task {}: {}", task_id, e),
        }
    }

    Ok(report)
}

async fn remove_files(server: &IngestServer, md: &Metadata) -> usize {
    let mut failures = 0;
    for file in &md.files {
        match server.remove_file(&md.namespace, &file.name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!("Sweep: {}/{} already gone", md.namespace, file.name);
            }
            Err(e) => {
                warn!("Sweep: cannot remove {}/{}: {}", md.namespace, file.name, e);
                failures += 1;
            }
        }
    }
    failures
}

/// Sweep every `period` until the server shuts down
pub async fn sweep_loop(server: Arc<IngestServer>, period: Duration) {
    let stop = server.stop_token();
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = interval.tick() => {}
        }
        match sweep_expired(&server, Utc::now()).await {
            Ok(report) if report.expired > 0 || report.skipped_corrupt > 0 => {
                info!("Sweep finished: {report:?}");
            }
            Ok(report) => debug!("Sweep finished: {report:?}"),
            Err(e) => error!("Sweep failed: {e}"),
        }
    }
    debug!("Sweep loop stopped");
}
