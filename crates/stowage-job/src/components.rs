//! Collaborator contracts used by the job runner

use async_trait::async_trait;
use stowage_common::{Error, Metadata, Result};

/// What running a backup script produced
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Process id of the script, 0 if it never started
    pub pid: u32,
    pub output: Vec<u8>,
    pub errput: Vec<u8>,
    /// `Err` carries the failure text recorded as the task message
    pub result: std::result::Result<(), String>,
}

impl ExecutionOutcome {
    /// Outcome of a script that never ran
    pub fn not_started(reason: impl Into<String>) -> Self {
        Self {
            pid: 0,
            output: Vec::new(),
            errput: Vec::new(),
            result: Err(reason.into()),
        }
    }
}

/// Runs a backup script somewhere
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, script: &[u8]) -> ExecutionOutcome;
}

/// Source of backup scripts by name
#[async_trait]
pub trait ScriptPool: Send + Sync {
    async fn backup_script(&self, name: &str) -> Result<Vec<u8>>;
}

/// Receives job lifecycle events
#[async_trait]
pub trait Notificator: Send + Sync {
    fn name(&self) -> &str;

    async fn job_finished(&self, md: &Metadata) -> Result<()>;

    /// The runner could not read or write the task's metadata
    async fn metadata_access_failed(&self, err: &Error) -> Result<()>;
}
