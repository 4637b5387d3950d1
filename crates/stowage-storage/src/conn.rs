//! Per-connection ingest protocol
//!
//! ```text
//! task id (36 bytes) | filename length (4 ASCII digits) | filename | content ... EOF
//! ```
//!
//! Each step is only valid in one state. Calling a step out of order fails
//! with a protocol error before anything is read from the stream.

use async_compression::tokio::write::GzipEncoder;
use chrono::Utc;
use std::path::{Component, Path, PathBuf};
use stowage_common::{
    Error, FILENAME_LEN_LEN, JOB_FINISH, Metadata, MetadataFileEntry, Result, TASK_ID_LEN, TaskId,
};
use stowage_meta_store::MetaManager;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

/// Where a connection is in the protocol
#[derive(Debug)]
pub enum ConnState {
    WaitingForTaskId,
    WaitingForFilename {
        task: Box<Metadata>,
    },
    WaitingForData {
        task: Box<Metadata>,
        filename: String,
    },
    Receiving {
        task_id: TaskId,
        filename: String,
    },
    Done,
}

impl ConnState {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::WaitingForTaskId => "WaitingForTaskId",
            Self::WaitingForFilename { .. } => "WaitingForFilename",
            Self::WaitingForData { .. } => "WaitingForData",
            Self::Receiving { .. } => "Receiving",
            Self::Done => "Done",
        }
    }
}

/// Result of reading the filename header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filename {
    Named(String),
    /// Legacy end-of-job marker; no file follows
    JobFinished,
}

/// One ingest connection
pub struct IngestConn<'a, S> {
    stream: S,
    peer: String,
    root: &'a Path,
    meta: &'a dyn MetaManager,
    state: ConnState,
}

impl<'a, S> IngestConn<'a, S>
where
    S: AsyncRead + Unpin + Send,
{
    pub fn new(stream: S, peer: impl Into<String>, root: &'a Path, meta: &'a dyn MetaManager) -> Self {
        Self {
            stream,
            peer: peer.into(),
            root,
            meta,
            state: ConnState::WaitingForTaskId,
        }
    }

    #[must_use]
    pub const fn state(&self) -> &ConnState {
        &self.state
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Take the current state if `wanted` accepts it, otherwise leave it
    /// in place and fail
    fn advance<T>(
        &mut self,
        step: &str,
        wanted: impl FnOnce(ConnState) -> std::result::Result<T, ConnState>,
    ) -> Result<T> {
        let current = std::mem::replace(&mut self.state, ConnState::Done);
        match wanted(current) {
            Ok(taken) => Ok(taken),
            Err(current) => {
                let err = Error::protocol(format!("cannot {step} in state {}", current.name()));
                self.state = current;
                Err(err)
            }
        }
    }

    /// Task this connection is delivering for, once known
    #[must_use]
    pub fn task(&self) -> Option<&Metadata> {
        match &self.state {
            ConnState::WaitingForFilename { task } | ConnState::WaitingForData { task, .. } => {
                Some(&**task)
            }
            _ => None,
        }
    }

    /// Read the task id and check the task can still accept files
    pub async fn read_task_id(&mut self) -> Result<TaskId> {
        self.advance("read task id", |state| match state {
            ConnState::WaitingForTaskId => Ok(()),
            other => Err(other),
        })?;

        let mut raw = [0u8; TASK_ID_LEN];
        self.stream.read_exact(&mut raw).await?;
        let task_id = TaskId::from_bytes(&raw)?;

        let task = self.meta.view(&task_id).await?;
        if task.is_finished() {
            return Err(Error::TaskFinished(task_id.to_string()));
        }
        debug!("Ingest {}: task {} ({})", self.peer, task_id, task.job_name);

        self.state = ConnState::WaitingForFilename {
            task: Box::new(task),
        };
        Ok(task_id)
    }

    /// Read the length-prefixed filename
    pub async fn read_filename(&mut self) -> Result<Filename> {
        let task = self.advance("read filename", |state| match state {
            ConnState::WaitingForFilename { task } => Ok(task),
            other => Err(other),
        })?;

        let mut len = [0u8; FILENAME_LEN_LEN];
        self.stream.read_exact(&mut len).await?;
        let len = parse_len(&len)?;

        let mut raw = vec![0u8; len];
        self.stream.read_exact(&mut raw).await?;
        let name = String::from_utf8(raw)
            .map_err(|_| Error::protocol("filename is not valid UTF-8"))?;

        if name == JOB_FINISH {
            warn!(
                "Ingest {}: task {} sent the deprecated end-of-job marker, ignoring",
                self.peer, task.task_id
            );
            return Ok(Filename::JobFinished);
        }
        validate_relative(&name, "filename")?;

        self.state = ConnState::WaitingForData {
            task,
            filename: name.clone(),
        };
        Ok(Filename::Named(name))
    }

    /// Stream the content to disk and record it in the task's metadata
    pub async fn receive(&mut self) -> Result<MetadataFileEntry> {
        let (task, filename) = self.advance("receive data", |state| match state {
            ConnState::WaitingForData { task, filename } => Ok((task, filename)),
            other => Err(other),
        })?;

        let stored_name = if task.gzip {
            format!("{filename}.gz")
        } else {
            filename.clone()
        };
        let path = resolve(self.root, &task.namespace, &stored_name)?;
        self.state = ConnState::Receiving {
            task_id: task.task_id.clone(),
            filename,
        };

        let start_time = Utc::now();
        let size = match self.write_file(&path, task.gzip).await {
            Ok(size) => size,
            Err(e) => {
                discard(&path).await;
                self.state = ConnState::Done;
                return Err(e);
            }
        };

        let entry = MetadataFileEntry {
            name: stored_name,
            size,
            source_address: self.peer.clone(),
            start_time,
            end_time: Utc::now(),
        };
        if let Err(e) = self.meta.add_file(&task.task_id, entry.clone()).await {
            discard(&path).await;
            self.state = ConnState::Done;
            return Err(e);
        }

        debug!(
            "Ingest {}: stored {} ({} bytes) for task {}",
            self.peer,
            path.display(),
            size,
            task.task_id
        );
        self.state = ConnState::Done;
        Ok(entry)
    }

    async fn write_file(&mut self, path: &Path, gzip: bool) -> Result<u64> {
        if let Some(parent) = path.parent() {
            create_dirs(parent).await?;
        }
        let file = BufWriter::new(tokio::fs::File::create(path).await?);
        let mut sink: Box<dyn AsyncWrite + Unpin + Send> = if gzip {
            Box::new(GzipEncoder::new(file))
        } else {
            Box::new(file)
        };
        let size = tokio::io::copy(&mut self.stream, &mut sink).await?;
        sink.shutdown().await?;
        Ok(size)
    }
}

fn parse_len(raw: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(raw)
        .ok()
        .filter(|s| s.bytes().all(|b| b.is_ascii_digit()))
        .ok_or_else(|| {
            Error::protocol(format!(
                "filename length {:?} is not a decimal number",
                String::from_utf8_lossy(raw)
            ))
        })?;
    text.parse()
        .map_err(|e| Error::protocol(format!("filename length {text:?}: {e}")))
}

/// Reject paths that could leave the directory they are joined onto
pub(crate) fn validate_relative(raw: &str, what: &str) -> Result<()> {
    if raw.is_empty() {
        return Err(Error::protocol(format!("{what} is empty")));
    }
    let escapes = Path::new(raw)
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(Error::protocol(format!("{what} {raw:?} escapes the storage root")));
    }
    Ok(())
}

/// Location of a stored file under `root`
pub(crate) fn resolve(root: &Path, namespace: &str, name: &str) -> Result<PathBuf> {
    if !namespace.is_empty() {
        validate_relative(namespace, "namespace")?;
    }
    validate_relative(name, "filename")?;
    Ok(root.join(namespace).join(name))
}

async fn create_dirs(dir: &Path) -> std::io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o750);
    builder.create(dir).await
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial file {}: {}", path.display(), e),
    }
}
