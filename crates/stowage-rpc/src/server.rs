//! Metadata RPC server
//!
//! Serves a [`JsonDirStore`] to authenticated TCP clients. Each connection
//! may hold at most one update lease; the lease table is keyed by
//! connection id and cleared when the connection ends for any reason.

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use stowage_common::{AUTH_DIGEST_LEN, Error, Result, TaskId};
use stowage_meta_store::{JsonDirStore, UpdateLease};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

use crate::proto::{
    Call, ConnId, Reply, Request, Response, WireError, constant_time_eq, decode, encode,
    secret_digest,
};

pub struct MetaRpcServer {
    store: Arc<JsonDirStore>,
    expected_digest: String,
    auth_timeout: Duration,
    /// Open update leases: connection id -> lease
    leases: Mutex<HashMap<ConnId, UpdateLease>>,
}

impl MetaRpcServer {
    pub fn new(store: Arc<JsonDirStore>, secret: &str, auth_timeout: Duration) -> Self {
        Self {
            store,
            expected_digest: secret_digest(secret),
            auth_timeout,
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// Number of connections currently holding a lease
    #[must_use]
    pub fn lease_count(&self) -> usize {
        self.leases.lock().len()
    }

    /// Accept connections forever
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!("Metadata RPC listening on {addr}");
        }
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_client(stream, peer).await {
                            warn!("RPC: client {peer} error: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("RPC: accept error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn handle_client(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let conn_id = self.authenticate(&mut stream, peer).await?;
        debug!("RPC: client {peer} authenticated as {conn_id}");

        let _session = Session {
            server: &self,
            conn_id: conn_id.clone(),
        };
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

        while let Some(frame) = framed.next().await {
            let frame = frame?;
            let request: Request = decode(&frame)?;
            let method = request.call.name();
            let result = self.dispatch(&conn_id, request.call).await;
            if let Err(ref e) = result {
                debug!("RPC: {method} from {peer} failed: {e}");
            }
            let response = Response {
                id: request.id,
                result: result.map_err(|e| WireError::from(&e)),
            };
            framed.send(encode(&response)?).await?;
        }

        debug!("RPC: client {peer} disconnected");
        Ok(())
    }

    async fn authenticate(&self, stream: &mut TcpStream, peer: SocketAddr) -> Result<ConnId> {
        let mut digest = [0u8; AUTH_DIGEST_LEN];
        match tokio::time::timeout(self.auth_timeout, stream.read_exact(&mut digest)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(Error::Timeout),
        }

        if !constant_time_eq(&digest, self.expected_digest.as_bytes()) {
            warn!("RPC: client {peer} sent a bad secret");
            stream.write_all(ConnId::rejected().as_str().as_bytes()).await?;
            stream.shutdown().await?;
            return Err(Error::AuthenticationFailed);
        }

        let conn_id = ConnId::generate();
        stream.write_all(conn_id.as_str().as_bytes()).await?;
        Ok(conn_id)
    }

    async fn dispatch(&self, conn: &ConnId, call: Call) -> Result<Reply> {
        match call {
            Call::Keys => Ok(Reply::Keys(self.store.keys().await?)),
            Call::View { task_id } => Ok(Reply::Record(Box::new(self.store.view(&task_id).await?))),
            Call::Add { record } => {
                let task_id = record.task_id.clone();
                self.store.add(&task_id, record).await?;
                Ok(Reply::Done)
            }
            Call::GetForUpdate { conn_id, task_id } => {
                check_caller(conn, &conn_id)?;
                let held = self.leases.lock().get(conn).map(|l| l.task_id().clone());
                if let Some(held) = held {
                    return Err(Error::lock_conflict(format!(
                        "connection {conn} already holds an update lease on task {held}"
                    )));
                }
                let lease = self.store.get_for_update(&task_id).await?;
                let record = lease.metadata().clone();
                self.leases.lock().insert(conn.clone(), lease);
                Ok(Reply::Record(Box::new(record)))
            }
            Call::Save { conn_id, record } => {
                check_caller(conn, &conn_id)?;
                let lease = self.take_lease(conn)?;
                self.store.save(lease, &record).await?;
                Ok(Reply::Done)
            }
            Call::CancelUpdate { conn_id } => {
                check_caller(conn, &conn_id)?;
                let lease = self.take_lease(conn)?;
                self.store.cancel_update(lease);
                Ok(Reply::Done)
            }
            Call::Remove { task_id } => {
                self.store.remove(&task_id).await?;
                Ok(Reply::Done)
            }
            Call::AddFile {
                conn_id,
                task_id,
                entry,
            } => {
                check_caller(conn, &conn_id)?;
                // Waiting on our own lease would never finish.
                self.ensure_not_leased_by(conn, &task_id)?;
                self.store.add_file(&task_id, entry).await?;
                Ok(Reply::Done)
            }
        }
    }

    fn take_lease(&self, conn: &ConnId) -> Result<UpdateLease> {
        self.leases
            .lock()
            .remove(conn)
            .ok_or_else(|| Error::lock_conflict(format!("connection {conn} holds no update lease")))
    }

    fn ensure_not_leased_by(&self, conn: &ConnId, task_id: &TaskId) -> Result<()> {
        match self.leases.lock().get(conn) {
            Some(lease) if lease.task_id() == task_id => Err(Error::lock_conflict(format!(
                "connection {conn} holds the update lease on task {task_id}"
            ))),
            _ => Ok(()),
        }
    }

    fn release(&self, conn: &ConnId) {
        if let Some(lease) = self.leases.lock().remove(conn) {
            info!(
                "RPC: connection {conn} went away holding task {}, releasing",
                lease.task_id()
            );
        }
    }
}

fn check_caller(conn: &ConnId, claimed: &ConnId) -> Result<()> {
    if conn == claimed {
        Ok(())
    } else {
        Err(Error::lock_conflict(format!(
            "connection id {claimed} does not belong to this connection"
        )))
    }
}

/// Releases the connection's lease however the handler exits
struct Session<'a> {
    server: &'a MetaRpcServer,
    conn_id: ConnId,
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.server.release(&self.conn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};
    use stowage_common::{AUTH_FAILED_CONN_ID, Metadata, TASK_ID_LEN};

    async fn start(store: Arc<JsonDirStore>, secret: &str) -> (Arc<MetaRpcServer>, SocketAddr) {
        let server = Arc::new(MetaRpcServer::new(store, secret, Duration::from_millis(500)));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::clone(&server).serve(listener));
        (server, addr)
    }

    async fn raw_session(addr: SocketAddr, secret: &str) -> (Framed<TcpStream, LengthDelimitedCodec>, ConnId) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(secret_digest(secret).as_bytes()).await.unwrap();
        let mut id = [0u8; TASK_ID_LEN];
        stream.read_exact(&mut id).await.unwrap();
        let conn_id = ConnId::from_bytes(&id).unwrap();
        assert!(!conn_id.is_rejected());
        (Framed::new(stream, LengthDelimitedCodec::new()), conn_id)
    }

    async fn call(framed: &mut Framed<TcpStream, LengthDelimitedCodec>, id: u64, call: Call) -> Result<Reply> {
        framed.send(encode(&Request { id, call }).unwrap()).await.unwrap();
        let frame = framed.next().await.unwrap().unwrap();
        let response: Response = decode(&frame).unwrap();
        assert_eq!(response.id, id);
        response.result.map_err(Error::from)
    }

    async fn seeded_store() -> (tempfile::TempDir, Arc<JsonDirStore>, TaskId) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonDirStore::open(dir.path()).unwrap());
        let id = TaskId::generate();
        store
            .add(&id, Metadata::new(id.clone(), Utc::now(), TimeDelta::days(1)))
            .await
            .unwrap();
        (dir, store, id)
    }

    #[tokio::test]
    async fn test_bad_secret_gets_sentinel_and_close() {
        let (_dir, store, _) = seeded_store().await;
        let (_server, addr) = start(store, "right").await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(secret_digest("wrong").as_bytes()).await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, AUTH_FAILED_CONN_ID.as_bytes());
    }

    #[tokio::test]
    async fn test_silent_client_is_dropped_after_auth_timeout() {
        let (_dir, store, _) = seeded_store().await;
        let (_server, addr) = start(store, "s").await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut reply = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn test_lease_rules() {
        let (_dir, store, id) = seeded_store().await;
        let other = TaskId::generate();
        store
            .add(&other, Metadata::new(other.clone(), Utc::now(), TimeDelta::days(1)))
            .await
            .unwrap();
        let (server, addr) = start(store, "s").await;
        let (mut framed, conn_id) = raw_session(addr, "s").await;

        // Save without a lease
        let record = Metadata::new(id.clone(), Utc::now(), TimeDelta::days(1));
        let err = call(&mut framed, 1, Call::Save { conn_id: conn_id.clone(), record })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockConflict(_)));

        // Someone else's connection id
        let err = call(
            &mut framed,
            2,
            Call::GetForUpdate { conn_id: ConnId::generate(), task_id: id.clone() },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::LockConflict(_)));

        let mut record = call(
            &mut framed,
            3,
            Call::GetForUpdate { conn_id: conn_id.clone(), task_id: id.clone() },
        )
        .await
        .unwrap()
        .into_record()
        .unwrap();
        assert_eq!(server.lease_count(), 1);

        // One lease per connection
        let err = call(
            &mut framed,
            4,
            Call::GetForUpdate { conn_id: conn_id.clone(), task_id: other.clone() },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::LockConflict(_)));

        record.message = "saved".to_string();
        call(&mut framed, 5, Call::Save { conn_id: conn_id.clone(), record })
            .await
            .unwrap()
            .into_done()
            .unwrap();
        assert_eq!(server.lease_count(), 0);

        let viewed = call(&mut framed, 6, Call::View { task_id: id.clone() })
            .await
            .unwrap()
            .into_record()
            .unwrap();
        assert_eq!(viewed.message, "saved");

        // Cancel path
        call(&mut framed, 7, Call::GetForUpdate { conn_id: conn_id.clone(), task_id: other })
            .await
            .unwrap();
        call(&mut framed, 8, Call::CancelUpdate { conn_id: conn_id.clone() })
            .await
            .unwrap();
        let err = call(&mut framed, 9, Call::CancelUpdate { conn_id })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockConflict(_)));
    }

    #[tokio::test]
    async fn test_add_file_on_own_lease_is_rejected() {
        let (_dir, store, id) = seeded_store().await;
        let (_server, addr) = start(store, "s").await;
        let (mut framed, conn_id) = raw_session(addr, "s").await;

        call(&mut framed, 1, Call::GetForUpdate { conn_id: conn_id.clone(), task_id: id.clone() })
            .await
            .unwrap();
        let now = Utc::now();
        let entry = stowage_common::MetadataFileEntry {
            name: "x".to_string(),
            size: 1,
            source_address: "127.0.0.1:1".to_string(),
            start_time: now,
            end_time: now,
        };
        let err = call(&mut framed, 2, Call::AddFile { conn_id, task_id: id, entry })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockConflict(_)));
    }

    #[tokio::test]
    async fn test_lease_released_on_disconnect() {
        let (_dir, store, id) = seeded_store().await;
        let (server, addr) = start(Arc::clone(&store), "s").await;
        let (mut framed, conn_id) = raw_session(addr, "s").await;

        call(&mut framed, 1, Call::GetForUpdate { conn_id, task_id: id.clone() })
            .await
            .unwrap();
        assert_eq!(server.lease_count(), 1);
        drop(framed);

        // The key becomes free again once the server notices the hangup
        let lease = tokio::time::timeout(Duration::from_secs(5), store.get_for_update(&id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(server.lease_count(), 0);
        assert!(lease.metadata().message.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_connection() {
        let (_dir, store, _) = seeded_store().await;
        let (_server, addr) = start(store, "s").await;
        let (mut framed, _) = raw_session(addr, "s").await;

        framed.send(bytes::Bytes::from_static(b"{not json")).await.unwrap();
        assert!(framed.next().await.is_none());
    }
}
