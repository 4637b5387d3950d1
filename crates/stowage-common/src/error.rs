//! Error types for Stowage
//!
//! This module defines the common error type used throughout the system,
//! along with a serializable [`ErrorKind`] so errors can cross the RPC
//! boundary without losing their classification.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Common result type for Stowage operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Stowage
#[derive(Debug, Error)]
pub enum Error {
    // Metadata errors
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("lock conflict: {0}")]
    LockConflict(String),

    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    #[error("task already finished: {0}")]
    TaskFinished(String),

    #[error("invalid task id: {0}")]
    InvalidTaskId(String),

    // Protocol errors
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    // Storage errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Network/RPC errors
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timeout")]
    Timeout,

    #[error("remote error: {0}")]
    Remote(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Serializable classification of an [`Error`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    LockConflict,
    CorruptRecord,
    TaskFinished,
    InvalidTaskId,
    Protocol,
    AuthenticationFailed,
    Io,
    ConnectionFailed,
    Timeout,
    Remote,
    Configuration,
    Serialization,
}

impl Error {
    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a lock conflict error
    pub fn lock_conflict(msg: impl Into<String>) -> Self {
        Self::LockConflict(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::ConnectionFailed(_))
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Classification of this error for the wire
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::LockConflict(_) => ErrorKind::LockConflict,
            Self::CorruptRecord(_) => ErrorKind::CorruptRecord,
            Self::TaskFinished(_) => ErrorKind::TaskFinished,
            Self::InvalidTaskId(_) => ErrorKind::InvalidTaskId,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::AuthenticationFailed => ErrorKind::AuthenticationFailed,
            Self::Io(_) => ErrorKind::Io,
            Self::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            Self::Timeout => ErrorKind::Timeout,
            Self::Remote(_) => ErrorKind::Remote,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// The message carried by this error, without the variant prefix
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::NotFound(m)
            | Self::AlreadyExists(m)
            | Self::LockConflict(m)
            | Self::CorruptRecord(m)
            | Self::TaskFinished(m)
            | Self::InvalidTaskId(m)
            | Self::Protocol(m)
            | Self::ConnectionFailed(m)
            | Self::Remote(m)
            | Self::Configuration(m)
            | Self::Serialization(m) => m.clone(),
            Self::Io(e) => e.to_string(),
            Self::AuthenticationFailed | Self::Timeout => String::new(),
        }
    }

    /// Rebuild an error from its wire classification and message
    #[must_use]
    pub fn from_kind(kind: ErrorKind, detail: String) -> Self {
        match kind {
            ErrorKind::NotFound => Self::NotFound(detail),
            ErrorKind::AlreadyExists => Self::AlreadyExists(detail),
            ErrorKind::LockConflict => Self::LockConflict(detail),
            ErrorKind::CorruptRecord => Self::CorruptRecord(detail),
            ErrorKind::TaskFinished => Self::TaskFinished(detail),
            ErrorKind::InvalidTaskId => Self::InvalidTaskId(detail),
            ErrorKind::Protocol => Self::Protocol(detail),
            ErrorKind::AuthenticationFailed => Self::AuthenticationFailed,
            ErrorKind::Io => Self::Io(std::io::Error::other(detail)),
            ErrorKind::ConnectionFailed => Self::ConnectionFailed(detail),
            ErrorKind::Timeout => Self::Timeout,
            ErrorKind::Remote => Self::Remote(detail),
            ErrorKind::Configuration => Self::Configuration(detail),
            ErrorKind::Serialization => Self::Serialization(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::ConnectionFailed("refused".into()).is_retryable());
        assert!(!Error::AuthenticationFailed.is_retryable());
    }

    #[test]
    fn test_error_not_found() {
        assert!(Error::not_found("task").is_not_found());
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(Error::Io(io).is_not_found());
        assert!(!Error::AlreadyExists("task".into()).is_not_found());
    }

    #[test]
    fn test_error_kind_preserved() {
        let err = Error::lock_conflict("task abc not locked by this connection");
        let rebuilt = Error::from_kind(err.kind(), err.detail());
        assert!(matches!(rebuilt, Error::LockConflict(_)));
        assert_eq!(rebuilt.to_string(), err.to_string());

        let rebuilt = Error::from_kind(ErrorKind::AuthenticationFailed, String::new());
        assert!(matches!(rebuilt, Error::AuthenticationFailed));
    }
}
