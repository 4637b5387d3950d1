//! In-flight transfer accounting for graceful shutdown

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Outcome of waiting for transfers to finish
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownStatus {
    /// Every transfer completed
    Drained,
    /// The deadline passed with transfers still running
    TimedOut { in_flight: usize },
}

#[derive(Default)]
struct Inner {
    count: AtomicUsize,
    closed: AtomicBool,
    idle: Notify,
}

/// Counts file transfers that are streaming or recording metadata
#[derive(Clone, Default)]
pub struct ActiveTransfers {
    inner: Arc<Inner>,
}

impl ActiveTransfers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transfer, unless shutdown has begun
    #[must_use]
    pub fn begin(&self) -> Option<TransferGuard> {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        let guard = TransferGuard {
            inner: Arc::clone(&self.inner),
        };
        if self.inner.closed.load(Ordering::SeqCst) {
            return None;
        }
        Some(guard)
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Refuse new transfers and wait up to `timeout` for running ones
    pub async fn close_and_wait(&self, timeout: Duration) -> ShutdownStatus {
        self.inner.closed.store(true, Ordering::SeqCst);

        let drained = async {
            loop {
                let notified = self.inner.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };

        match tokio::time::timeout(timeout, drained).await {
            Ok(()) => ShutdownStatus::Drained,
            Err(_) => ShutdownStatus::TimedOut {
                in_flight: self.in_flight(),
            },
        }
    }
}

/// Marks one transfer as running until dropped
pub struct TransferGuard {
    inner: Arc<Inner>,
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}
