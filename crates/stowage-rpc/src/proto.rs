//! Wire types for the metadata RPC
//!
//! Handshake: the client sends 64 bytes of lowercase hex
//! SHA-256 of the shared secret; the server answers with a 36 byte
//! connection id, or [`AUTH_FAILED_CONN_ID`] before closing.
//!
//! After the handshake every frame is one JSON [`Request`] or [`Response`]
//! behind a 4 byte big-endian length prefix.

use bytes::Bytes;
use derive_more::Display;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use stowage_common::error::ErrorKind;
use stowage_common::{
    AUTH_FAILED_CONN_ID, Error, Metadata, MetadataFileEntry, Result, TASK_ID_LEN,
    TaskId,
};
use uuid::Uuid;

/// Identity of one authenticated RPC connection
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct ConnId(String);

impl ConnId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The id sent to a client that failed authentication
    #[must_use]
    pub fn rejected() -> Self {
        Self(AUTH_FAILED_CONN_ID.to_string())
    }

    #[must_use]
    pub fn is_rejected(&self) -> bool {
        self.0 == AUTH_FAILED_CONN_ID
    }

    /// Parse the id written by the server during the handshake
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() != TASK_ID_LEN {
            return Err(Error::protocol(format!(
                "connection id must be {TASK_ID_LEN} bytes, got {}",
                raw.len()
            )));
        }
        let id = std::str::from_utf8(raw)
            .map_err(|_| Error::protocol("connection id is not UTF-8"))?;
        Ok(Self(id.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Hex SHA-256 of the shared secret, as sent in the handshake
#[must_use]
pub fn secret_digest(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Compare two digests without short-circuiting on the first difference
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b) {
        result |= x ^ y;
    }
    result == 0
}

/// Remote procedures
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Call {
    Keys,
    View {
        task_id: TaskId,
    },
    Add {
        record: Metadata,
    },
    GetForUpdate {
        conn_id: ConnId,
        task_id: TaskId,
    },
    Save {
        conn_id: ConnId,
        record: Metadata,
    },
    CancelUpdate {
        conn_id: ConnId,
    },
    Remove {
        task_id: TaskId,
    },
    AddFile {
        conn_id: ConnId,
        task_id: TaskId,
        entry: MetadataFileEntry,
    },
}

impl Call {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Keys => "Keys",
            Self::View { .. } => "View",
            Self::Add { .. } => "Add",
            Self::GetForUpdate { .. } => "GetForUpdate",
            Self::Save { .. } => "Save",
            Self::CancelUpdate { .. } => "CancelUpdate",
            Self::Remove { .. } => "Remove",
            Self::AddFile { .. } => "AddFile",
        }
    }
}

/// Successful results
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Reply {
    Keys(Vec<TaskId>),
    Record(Box<Metadata>),
    Done,
}

impl Reply {
    pub fn into_keys(self) -> Result<Vec<TaskId>> {
        match self {
            Self::Keys(keys) => Ok(keys),
            other => Err(unexpected("Keys", &other)),
        }
    }

    pub fn into_record(self) -> Result<Metadata> {
        match self {
            Self::Record(record) => Ok(*record),
            other => Err(unexpected("Record", &other)),
        }
    }

    pub fn into_done(self) -> Result<()> {
        match self {
            Self::Done => Ok(()),
            other => Err(unexpected("Done", &other)),
        }
    }
}

fn unexpected(wanted: &str, got: &Reply) -> Error {
    let got = match got {
        Reply::Keys(_) => "Keys",
        Reply::Record(_) => "Record",
        Reply::Done => "Done",
    };
    Error::protocol(format!("expected {wanted} reply, got {got}"))
}

/// Error as carried on the wire
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for WireError {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.detail(),
        }
    }
}

impl From<WireError> for Error {
    fn from(err: WireError) -> Self {
        Self::from_kind(err.kind, err.message)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub call: Call,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: std::result::Result<Reply, WireError>,
}

/// Serialize a message into one frame body
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes> {
    serde_json::to_vec(message)
        .map(Bytes::from)
        .map_err(|e| Error::Serialization(e.to_string()))
}

/// Parse one frame body
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    serde_json::from_slice(frame).map_err(|e| Error::protocol(format!("malformed frame: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};
    use stowage_common::AUTH_DIGEST_LEN;

    #[test]
    fn test_secret_digest_is_hex_sha256() {
        let digest = secret_digest("s3cr3t");
        assert_eq!(digest.len(), AUTH_DIGEST_LEN);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(
            secret_digest(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"hello", b"hello!"));
    }

    #[test]
    fn test_conn_id() {
        let id = ConnId::generate();
        assert_eq!(id.as_str().len(), TASK_ID_LEN);
        assert!(!id.is_rejected());
        assert_eq!(ConnId::from_bytes(id.as_str().as_bytes()).unwrap(), id);
        assert!(ConnId::from_bytes(AUTH_FAILED_CONN_ID.as_bytes()).unwrap().is_rejected());
        assert!(ConnId::from_bytes(b"short").is_err());
    }

    #[test]
    fn test_response_carries_error_kind() {
        let response = Response {
            id: 7,
            result: Err(WireError::from(&Error::lock_conflict("not locked"))),
        };
        let back: Response = decode(&encode(&response).unwrap()).unwrap();
        assert_eq!(back.id, 7);
        let err = Error::from(back.result.unwrap_err());
        assert!(matches!(err, Error::LockConflict(ref m) if m == "not locked"));
    }

    #[test]
    fn test_request_shape() {
        let id = TaskId::generate();
        let request = Request {
            id: 1,
            call: Call::Add {
                record: Metadata::new(id.clone(), Utc::now(), TimeDelta::days(1)),
            },
        };
        let value: serde_json::Value = serde_json::from_slice(&encode(&request).unwrap()).unwrap();
        assert_eq!(value["call"]["method"], "Add");
        assert_eq!(value["call"]["params"]["record"]["task_id"], id.as_str());
    }

    #[test]
    fn test_reply_mismatch_is_protocol_error() {
        assert!(matches!(Reply::Done.into_keys(), Err(Error::Protocol(_))));
        assert!(Reply::Keys(Vec::new()).into_keys().unwrap().is_empty());
    }
}
