//! Ingest TCP server
//!
//! One spawned task per connection. Errors end only the connection they
//! happened on. Shutdown stops accepting and waits for running transfers.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use stowage_common::{Error, Result};
use stowage_meta_store::MetaManager;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::conn::{Filename, IngestConn, resolve};
use crate::transfers::{ActiveTransfers, ShutdownStatus};

const DEFAULT_HEADER_TIMEOUT: Duration = Duration::from_secs(30);

pub struct IngestServer {
    root: PathBuf,
    meta: Arc<dyn MetaManager>,
    header_timeout: Duration,
    transfers: ActiveTransfers,
    stop: CancellationToken,
}

impl IngestServer {
    pub fn new(root: impl Into<PathBuf>, meta: Arc<dyn MetaManager>) -> Self {
        Self {
            root: root.into(),
            meta,
            header_timeout: DEFAULT_HEADER_TIMEOUT,
            transfers: ActiveTransfers::new(),
            stop: CancellationToken::new(),
        }
    }

    /// Limit the time a client may take to send the task id and filename
    #[must_use]
    pub fn with_header_timeout(mut self, timeout: Duration) -> Self {
        self.header_timeout = timeout;
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn meta(&self) -> &dyn MetaManager {
        self.meta.as_ref()
    }

    #[must_use]
    pub const fn transfers(&self) -> &ActiveTransfers {
        &self.transfers
    }

    /// Fires once shutdown has begun
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Accept connections until shutdown
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!("Storage listening on {addr}, root {}", self.root.display());
        }
        loop {
            let accepted = tokio::select! {
                () = self.stop.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_client(stream, peer).await {
                            warn!("Ingest: client {peer} error: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("Ingest: accept error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!("Storage stopped accepting connections");
    }

    async fn handle_client(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        debug!("Ingest: client {peer} connected");
        let mut conn = IngestConn::new(stream, peer.to_string(), &self.root, self.meta.as_ref());

        let header = async {
            conn.read_task_id().await?;
            conn.read_filename().await
        };
        let filename = tokio::time::timeout(self.header_timeout, header)
            .await
            .map_err(|_| Error::Timeout)??;

        if filename == Filename::JobFinished {
            return Ok(());
        }

        let Some(_transfer) = self.transfers.begin() else {
            return Err(Error::protocol("server is shutting down"));
        };
        let entry = conn.receive().await?;
        info!("Ingest: received {} ({} bytes) from {peer}", entry.name, entry.size);
        Ok(())
    }

    /// Stop accepting and wait up to `timeout` for running transfers
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownStatus {
        info!("Storage shutting down, waiting up to {timeout:?} for transfers");
        self.stop.cancel();
        let status = self.transfers.close_and_wait(timeout).await;
        match status {
            ShutdownStatus::Drained => info!("All transfers finished"),
            ShutdownStatus::TimedOut { in_flight } => {
                warn!("Shutdown timed out with {in_flight} transfers still running");
            }
        }
        status
    }

    /// Delete one stored file of a namespace
    pub async fn remove_file(&self, namespace: &str, name: &str) -> Result<()> {
        let path = resolve(&self.root, namespace, name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Removed {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
