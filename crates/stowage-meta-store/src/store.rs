//! Directory-backed metadata store
//!
//! Each task is one JSON file named after its task id. Writes land in
//! `<id>.inpr` first and are renamed over the record, so a reader sees
//! either the previous committed record or the new one.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use stowage_common::{Error, IN_PROGRESS_SUFFIX, Metadata, MetadataFileEntry, Result, TaskId};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::lock::{KeyGuard, KeyLocks};

/// Metadata store rooted at one directory
pub struct JsonDirStore {
    root: PathBuf,
    locks: KeyLocks,
}

/// Exclusive right to replace one task's record
///
/// Carries the record as it was read at check-out. Dropping the lease
/// without calling [`JsonDirStore::save`] abandons the update.
#[derive(Debug)]
pub struct UpdateLease {
    metadata: Metadata,
    guard: KeyGuard,
}

impl UpdateLease {
    #[must_use]
    pub const fn task_id(&self) -> &TaskId {
        self.guard.task_id()
    }

    /// Record as read when the lease was taken
    #[must_use]
    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub const fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

impl JsonDirStore {
    /// Create a store over `root` without checking the directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: KeyLocks::new(),
        }
    }

    /// Create a store over an existing directory
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::configuration(format!(
                "metadata directory {} does not exist",
                root.display()
            )));
        }
        Ok(Self::new(root))
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub const fn locks(&self) -> &KeyLocks {
        &self.locks
    }

    fn record_path(&self, id: &TaskId) -> PathBuf {
        self.root.join(id.as_str())
    }

    fn in_progress_path(&self, id: &TaskId) -> PathBuf {
        self.root.join(format!("{id}{IN_PROGRESS_SUFFIX}"))
    }

    /// List every committed record
    pub async fn keys(&self) -> Result<Vec<TaskId>> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::configuration(format!(
                    "metadata directory {} does not exist",
                    self.root.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                debug!("Skipping non UTF-8 entry in {}", self.root.display());
                continue;
            };
            if name.ends_with(IN_PROGRESS_SUFFIX) {
                continue;
            }
            match TaskId::parse(name) {
                Ok(id) => keys.push(id),
                Err(_) => debug!("Skipping foreign file '{}' in {}", name, self.root.display()),
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Read the committed record for `id`
    pub async fn view(&self, id: &TaskId) -> Result<Metadata> {
        let raw = match tokio::fs::read(self.record_path(id)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::not_found(format!("metadata for task {id}")));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw).map_err(|e| Error::CorruptRecord(format!("{id}: {e}")))
    }

    /// Persist a new record, failing if one already exists for `id`
    pub async fn add(&self, id: &TaskId, mut record: Metadata) -> Result<()> {
        let _guard = self.locks.acquire(id).await;
        if tokio::fs::try_exists(self.record_path(id)).await? {
            return Err(Error::AlreadyExists(format!("metadata for task {id}")));
        }
        record.task_id = id.clone();
        self.write_record(id, &record).await?;
        debug!("Added metadata for task {}", id);
        Ok(())
    }

    /// Check out the record for `id`, waiting for any other updater
    pub async fn get_for_update(&self, id: &TaskId) -> Result<UpdateLease> {
        let guard = self.locks.acquire(id).await;
        // On error the guard drops here and the key is free again.
        let metadata = self.view(id).await?;
        Ok(UpdateLease { metadata, guard })
    }

    /// Commit `record` under `lease` and release it
    ///
    /// The lease is released even if the write fails.
    pub async fn save(&self, lease: UpdateLease, record: &Metadata) -> Result<()> {
        let id = lease.task_id();
        if record.task_id != *id {
            return Err(Error::lock_conflict(format!(
                "record for task {} does not match lease for task {id}",
                record.task_id
            )));
        }
        let result = self.write_record(id, record).await;
        drop(lease);
        result
    }

    /// Abandon an update without writing
    pub fn cancel_update(&self, lease: UpdateLease) {
        debug!("Cancelled update of task {}", lease.task_id());
    }

    /// Check out, mutate and commit in one step
    ///
    /// The closure cannot change the record's task id.
    pub async fn update<F>(&self, id: &TaskId, f: F) -> Result<Metadata>
    where
        F: FnOnce(&mut Metadata),
    {
        let mut lease = self.get_for_update(id).await?;
        f(lease.metadata_mut());
        lease.metadata_mut().task_id = id.clone();
        let record = lease.metadata().clone();
        self.save(lease, &record).await?;
        Ok(record)
    }

    /// Append a received file to the task's inventory
    pub async fn add_file(&self, id: &TaskId, entry: MetadataFileEntry) -> Result<()> {
        self.update(id, |md| md.add_file(entry)).await.map(|_| ())
    }

    /// Delete the record for `id`; deleting an absent record succeeds
    pub async fn remove(&self, id: &TaskId) -> Result<()> {
        match tokio::fs::remove_file(self.record_path(id)).await {
            Ok(()) => {
                debug!("Removed metadata for task {}", id);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_record(&self, id: &TaskId, record: &Metadata) -> Result<()> {
        let data = serde_json::to_vec(record).map_err(|e| Error::Serialization(e.to_string()))?;
        let tmp = self.in_progress_path(id);

        let written = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, self.record_path(id)).await
        }
        .await;

        if let Err(e) = written {
            match tokio::fs::remove_file(&tmp).await {
                Err(cleanup) if cleanup.kind() != ErrorKind::NotFound => {
                    warn!("Failed to remove {}: {}", tmp.display(), cleanup);
                }
                _ => {}
            }
            return Err(e.into());
        }
        Ok(())
    }
}
