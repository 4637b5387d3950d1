//! Stowage Common - Shared types and utilities
//!
//! This crate provides the task metadata model, error definitions, wire
//! constants, and configuration structures used across all Stowage
//! components.

pub mod config;
pub mod error;
pub mod types;

pub use config::{MetamanConfig, StorageConfig, load_config};
pub use error::{Error, Result};
pub use types::*;

/// Length of a task id on the wire and on disk
pub const TASK_ID_LEN: usize = 36;

/// Width of the zero-padded decimal filename length header
pub const FILENAME_LEN_LEN: usize = 4;

/// Legacy end-of-job marker sent by old job scripts in place of a filename
pub const JOB_FINISH: &str = "_@!_JOB_FINISH_!@_";

/// Length of the hex-encoded SHA-256 secret digest sent by RPC clients
pub const AUTH_DIGEST_LEN: usize = 64;

/// Connection id returned to RPC clients that fail authentication
pub const AUTH_FAILED_CONN_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Suffix of a metadata record that is still being written
pub const IN_PROGRESS_SUFFIX: &str = ".inpr";
