//! Metadata manager abstraction
//!
//! The ingest server, sweep and job runner talk to metadata through this
//! trait so they work the same against a local [`JsonDirStore`] or a remote
//! one behind the RPC client.

use async_trait::async_trait;
use stowage_common::{Metadata, MetadataFileEntry, Result, TaskId};

use crate::store::JsonDirStore;

/// Mutation applied to a checked-out record
pub type UpdateFn = Box<dyn FnOnce(&mut Metadata) + Send>;

/// Task metadata operations
#[async_trait]
pub trait MetaManager: Send + Sync {
    /// All task ids with a committed record
    async fn keys(&self) -> Result<Vec<TaskId>>;

    async fn view(&self, id: &TaskId) -> Result<Metadata>;

    /// Create the record; fails with `AlreadyExists` if present
    async fn add(&self, id: &TaskId, record: Metadata) -> Result<()>;

    /// Exclusively apply `f` to the record and commit it
    async fn update(&self, id: &TaskId, f: UpdateFn) -> Result<Metadata>;

    async fn add_file(&self, id: &TaskId, entry: MetadataFileEntry) -> Result<()>;

    async fn remove(&self, id: &TaskId) -> Result<()>;
}

#[async_trait]
impl MetaManager for JsonDirStore {
    async fn keys(&self) -> Result<Vec<TaskId>> {
        Self::keys(self).await
    }

    async fn view(&self, id: &TaskId) -> Result<Metadata> {
        Self::view(self, id).await
    }

    async fn add(&self, id: &TaskId, record: Metadata) -> Result<()> {
        Self::add(self, id, record).await
    }

    async fn update(&self, id: &TaskId, f: UpdateFn) -> Result<Metadata> {
        Self::update(self, id, f).await
    }

    async fn add_file(&self, id: &TaskId, entry: MetadataFileEntry) -> Result<()> {
        Self::add_file(self, id, entry).await
    }

    async fn remove(&self, id: &TaskId) -> Result<()> {
        Self::remove(self, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_store_through_trait_object() {
        let dir = tempfile::tempdir().unwrap();
        let manager: Arc<dyn MetaManager> = Arc::new(JsonDirStore::open(dir.path()).unwrap());
        let id = TaskId::generate();

        manager
            .add(&id, Metadata::new(id.clone(), Utc::now(), TimeDelta::hours(2)))
            .await
            .unwrap();
        let updated = manager
            .update(&id, Box::new(|md: &mut Metadata| md.pid = 4242))
            .await
            .unwrap();
        assert_eq!(updated.pid, 4242);
        assert_eq!(manager.keys().await.unwrap(), vec![id.clone()]);

        manager.remove(&id).await.unwrap();
        assert!(manager.keys().await.unwrap().is_empty());
    }
}
