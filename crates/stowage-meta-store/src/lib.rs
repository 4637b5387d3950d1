//! Stowage Metadata Store - one JSON record per task
//!
//! Records live in a single directory, one file per task id. Every write
//! goes to a temporary sibling file that is then renamed into place, and
//! mutations of one task are serialized by a per-task lock.

pub mod lock;
pub mod manager;
pub mod store;

// Re-exports
pub use lock::{KeyGuard, KeyLocks};
pub use manager::{MetaManager, UpdateFn};
pub use store::{JsonDirStore, UpdateLease};
