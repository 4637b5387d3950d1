//! Per-task exclusive locks
//!
//! A lock entry exists only while somebody holds or waits for it. The map
//! itself is guarded by a short synchronous mutex; the per-task locks are
//! async so a waiting updater parks its task instead of a thread.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use stowage_common::TaskId;
use tokio::sync::OwnedMutexGuard;

type LockMap = HashMap<TaskId, Arc<tokio::sync::Mutex<()>>>;

/// Lazily populated map of task id to exclusive lock
#[derive(Clone, Default)]
pub struct KeyLocks {
    inner: Arc<Mutex<LockMap>>,
}

impl KeyLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `id` is free and take it
    pub async fn acquire(&self, id: &TaskId) -> KeyGuard {
        let lock = {
            let mut map = self.inner.lock();
            Arc::clone(map.entry(id.clone()).or_default())
        };
        let mut waiting = Waiting {
            task_id: id,
            locks: &self.inner,
            armed: true,
        };
        let guard = lock.lock_owned().await;
        waiting.armed = false;
        KeyGuard {
            task_id: id.clone(),
            guard: Some(guard),
            locks: Arc::clone(&self.inner),
        }
    }

    /// Take `id` only if nobody holds it right now
    #[must_use]
    pub fn try_acquire(&self, id: &TaskId) -> Option<KeyGuard> {
        let mut map = self.inner.lock();
        let lock = Arc::clone(map.entry(id.clone()).or_default());
        match lock.try_lock_owned() {
            Ok(guard) => Some(KeyGuard {
                task_id: id.clone(),
                guard: Some(guard),
                locks: Arc::clone(&self.inner),
            }),
            Err(_) => {
                // The failed attempt consumed our clone.
                prune(&mut map, id);
                None
            }
        }
    }

    /// Number of tasks that currently have a holder or waiter
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

fn prune(map: &mut LockMap, id: &TaskId) {
    if map.get(id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
        map.remove(id);
    }
}

/// Prunes the entry of a waiter that gave up before getting the lock
///
/// Declared before the pending `lock_owned` future, so that future and its
/// `Arc` are gone by the time this runs.
struct Waiting<'a> {
    task_id: &'a TaskId,
    locks: &'a Mutex<LockMap>,
    armed: bool,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        if self.armed {
            prune(&mut self.locks.lock(), self.task_id);
        }
    }
}

/// Exclusive hold on one task id, released on drop
pub struct KeyGuard {
    task_id: TaskId,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<Mutex<LockMap>>,
}

impl KeyGuard {
    #[must_use]
    pub const fn task_id(&self) -> &TaskId {
        &self.task_id
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // The map lock is held across the release so a concurrent acquire
        // either sees the entry with our count still in it or not at all.
        let mut map = self.locks.lock();
        drop(self.guard.take());
        prune(&mut map, &self.task_id);
    }
}

impl std::fmt::Debug for KeyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGuard").field("task_id", &self.task_id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_entry_pruned_after_release() {
        let locks = KeyLocks::new();
        let id = TaskId::generate();

        let guard = locks.acquire(&id).await;
        assert_eq!(locks.len(), 1);
        assert_eq!(guard.task_id(), &id);
        drop(guard);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_second_acquire_waits_for_release() {
        let locks = KeyLocks::new();
        let id = TaskId::generate();
        let first = locks.acquire(&id).await;

        let waiter = {
            let locks = locks.clone();
            let id = id.clone();
            tokio::spawn(async move { locks.acquire(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        // Entry survives while the second holder has it.
        assert_eq!(locks.len(), 1);
        drop(second);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_waiter_leaves_no_entry() {
        let locks = KeyLocks::new();
        let id = TaskId::generate();
        let holder = locks.acquire(&id).await;

        let mut waiter = Box::pin(locks.acquire(&id));
        assert!(futures::poll!(&mut waiter).is_pending());

        // The holder leaves while the waiter still counts, then the waiter
        // is cancelled before it ever runs again.
        drop(holder);
        assert_eq!(locks.len(), 1);
        drop(waiter);
        assert!(locks.is_empty());

        // A cancelled waiter behind a live holder is cleaned up too.
        let holder = locks.acquire(&id).await;
        let timed_out = tokio::time::timeout(Duration::from_millis(20), locks.acquire(&id)).await;
        assert!(timed_out.is_err());
        drop(holder);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_try_acquire() {
        let locks = KeyLocks::new();
        let id = TaskId::generate();
        let other = TaskId::generate();

        let held = locks.try_acquire(&id).unwrap();
        assert!(locks.try_acquire(&id).is_none());
        assert_eq!(locks.len(), 1);

        let unrelated = locks.try_acquire(&other).unwrap();
        assert_eq!(locks.len(), 2);
        drop(unrelated);
        drop(held);
        assert!(locks.is_empty());
    }
}
