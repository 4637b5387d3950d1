//! Stowage Job - runs one backup job against the metadata store
//!
//! The script source, the executor and the notification channels are
//! traits so deployments can plug in their own transport (SSH, local
//! shell, mail, webhooks).

pub mod components;
pub mod runner;
pub mod scripts;

pub use components::{ExecutionOutcome, Executor, Notificator, ScriptPool};
pub use runner::{JobRunner, JobSpec};
pub use scripts::DirectoryScriptPool;
