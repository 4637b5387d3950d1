//! Metadata RPC client
//!
//! Dials lazily and keeps a small pool of idle authenticated connections.
//! Every call in flight has a connection to itself, so a call parked on one
//! task's lease never holds up calls for other tasks. A call that fails
//! because its connection broke is retried once on a fresh connection;
//! errors reported by the server are returned as they are.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::time::Duration;
use stowage_common::{Error, Metadata, MetadataFileEntry, Result, TASK_ID_LEN, TaskId};
use stowage_meta_store::{MetaManager, UpdateFn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::proto::{Call, ConnId, Reply, Request, Response, decode, encode, secret_digest};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_IDLE: usize = 4;

/// One authenticated connection
struct Connection {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    conn_id: ConnId,
    next_id: u64,
}

impl Connection {
    async fn open(addr: &str, digest: &str, timeout: Duration) -> Result<Self> {
        let handshake = async {
            let mut stream = TcpStream::connect(addr).await?;
            stream.write_all(digest.as_bytes()).await?;
            let mut id = [0u8; TASK_ID_LEN];
            stream.read_exact(&mut id).await?;
            Ok::<_, std::io::Error>((stream, id))
        };
        let (stream, id) = match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => return Err(Error::ConnectionFailed(format!("{addr}: {e}"))),
            Err(_) => return Err(Error::Timeout),
        };

        let conn_id = ConnId::from_bytes(&id)?;
        if conn_id.is_rejected() {
            return Err(Error::AuthenticationFailed);
        }
        debug!("Connected to metadata service {addr} as {conn_id}");
        Ok(Self {
            framed: Framed::new(stream, LengthDelimitedCodec::new()),
            conn_id,
            next_id: 0,
        })
    }

    /// Send one call and wait for its response
    ///
    /// The outer error means the connection is unusable; the inner one is
    /// what the server answered.
    async fn roundtrip(&mut self, call: Call) -> Result<Result<Reply>> {
        self.next_id += 1;
        let id = self.next_id;
        let frame = encode(&Request { id, call })?;

        self.framed.send(frame).await.map_err(broken)?;
        let frame = match self.framed.next().await {
            Some(frame) => frame.map_err(broken)?,
            None => return Err(Error::ConnectionFailed("connection closed by server".to_string())),
        };
        let response: Response = decode(&frame)?;
        if response.id != id {
            return Err(Error::protocol(format!(
                "response id {} does not match request {id}",
                response.id
            )));
        }
        Ok(response.result.map_err(Error::from))
    }
}

fn broken(e: std::io::Error) -> Error {
    Error::ConnectionFailed(e.to_string())
}

/// Remote [`MetaManager`]
pub struct MetaClient {
    addr: String,
    digest: String,
    connect_timeout: Duration,
    max_idle: usize,
    /// Connections between calls, ready for reuse
    idle: Mutex<Vec<Connection>>,
}

impl MetaClient {
    /// Create a client; nothing is dialed until the first call
    pub fn new(addr: impl Into<String>, secret: &str) -> Self {
        Self {
            addr: addr.into(),
            digest: secret_digest(secret),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_idle: DEFAULT_MAX_IDLE,
            idle: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Keep at most `max_idle` connections open between calls
    #[must_use]
    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Number of connections waiting for reuse
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    async fn checkout(&self) -> Result<(Connection, bool)> {
        let reused = self.idle.lock().pop();
        match reused {
            Some(conn) => Ok((conn, true)),
            None => Ok((
                Connection::open(&self.addr, &self.digest, self.connect_timeout).await?,
                false,
            )),
        }
    }

    fn checkin(&self, conn: Connection) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(conn);
        }
    }

    /// Run a call on a connection of its own, reconnecting once if it broke
    ///
    /// The connection stays checked out while the call runs, so a call
    /// that is cancelled halfway never hands a half-read connection to
    /// anyone else.
    async fn call_on(
        &self,
        make: impl Fn(&ConnId) -> Call + Send,
    ) -> Result<(Connection, Reply)> {
        let mut retried = false;
        loop {
            let (mut conn, reused) = self.checkout().await?;
            let call = make(&conn.conn_id);
            let method = call.name();
            match conn.roundtrip(call).await {
                Ok(Ok(reply)) => return Ok((conn, reply)),
                Ok(Err(e)) => {
                    self.checkin(conn);
                    return Err(e);
                }
                Err(e) => {
                    if retried || !e.is_retryable() {
                        return Err(e);
                    }
                    if reused {
                        debug!(
                            "Idle metadata connection to {} went stale during {method}",
                            self.addr
                        );
                    } else {
                        warn!(
                            "Metadata connection to {} lost during {method}: {e}, reconnecting",
                            self.addr
                        );
                    }
                    retried = true;
                }
            }
        }
    }

    async fn call(&self, make: impl Fn(&ConnId) -> Call + Send) -> Result<Reply> {
        let (conn, reply) = self.call_on(make).await?;
        self.checkin(conn);
        Ok(reply)
    }

    /// Check out a record for exclusive update
    ///
    /// The lease owns its connection until it is saved, cancelled or
    /// dropped. Dropping it closes the connection, which makes the server
    /// release the lock.
    pub async fn get_for_update(&self, id: &TaskId) -> Result<RemoteLease<'_>> {
        let task_id = id.clone();
        let (conn, reply) = self
            .call_on(|conn_id| Call::GetForUpdate {
                conn_id: conn_id.clone(),
                task_id: task_id.clone(),
            })
            .await?;
        // On a malformed reply the connection is dropped, which releases
        // any lease the server took for it.
        let record = reply.into_record()?;
        Ok(RemoteLease {
            client: self,
            conn: Some(conn),
            record,
        })
    }
}

/// A remote update lease held over a dedicated connection
pub struct RemoteLease<'a> {
    client: &'a MetaClient,
    /// `None` once settled
    conn: Option<Connection>,
    record: Metadata,
}

impl RemoteLease<'_> {
    #[must_use]
    pub const fn metadata(&self) -> &Metadata {
        &self.record
    }

    pub const fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.record
    }

    /// Commit the (possibly modified) record and release the lease
    pub async fn save(mut self) -> Result<Metadata> {
        let record = self.record.clone();
        self.finish(|conn_id| Call::Save {
            conn_id,
            record: record.clone(),
        })
        .await?;
        Ok(record)
    }

    /// Release the lease without writing
    pub async fn cancel(mut self) -> Result<()> {
        self.finish(|conn_id| Call::CancelUpdate { conn_id }).await
    }

    async fn finish(&mut self, make: impl FnOnce(ConnId) -> Call + Send) -> Result<()> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(Error::ConnectionFailed("lease connection is gone".to_string()));
        };
        let call = make(conn.conn_id.clone());
        // The lease died with the connection if this fails; nothing to retry.
        let result = conn.roundtrip(call).await?;
        if let Some(conn) = self.conn.take() {
            self.client.checkin(conn);
        }
        result?.into_done()
    }
}

impl Drop for RemoteLease<'_> {
    fn drop(&mut self) {
        if self.conn.take().is_some() {
            debug!("Dropping unsettled lease on task {}, closing connection", self.record.task_id);
        }
    }
}

#[async_trait]
impl MetaManager for MetaClient {
    async fn keys(&self) -> Result<Vec<TaskId>> {
        self.call(|_| Call::Keys).await?.into_keys()
    }

    async fn view(&self, id: &TaskId) -> Result<Metadata> {
        self.call(|_| Call::View { task_id: id.clone() })
            .await?
            .into_record()
    }

    async fn add(&self, id: &TaskId, mut record: Metadata) -> Result<()> {
        record.task_id = id.clone();
        self.call(|_| Call::Add {
            record: record.clone(),
        })
        .await?
        .into_done()
    }

    async fn update(&self, id: &TaskId, f: UpdateFn) -> Result<Metadata> {
        let mut lease = self.get_for_update(id).await?;
        f(lease.metadata_mut());
        lease.metadata_mut().task_id = id.clone();
        lease.save().await
    }

    async fn add_file(&self, id: &TaskId, entry: MetadataFileEntry) -> Result<()> {
        self.call(|conn_id| Call::AddFile {
            conn_id: conn_id.clone(),
            task_id: id.clone(),
            entry: entry.clone(),
        })
        .await?
        .into_done()
    }

    async fn remove(&self, id: &TaskId) -> Result<()> {
        self.call(|_| Call::Remove { task_id: id.clone() })
            .await?
            .into_done()
    }
}
