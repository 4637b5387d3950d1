//! Core type definitions for Stowage
//!
//! This module defines the task identifier and the metadata record that
//! describes one execution of a backup job and the files it produced.

use chrono::{DateTime, TimeDelta, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::TASK_ID_LEN;
use crate::error::Error;

/// Unique identifier for one execution of a job
///
/// Always exactly [`TASK_ID_LEN`] characters drawn from `[0-9A-Za-z-]`.
/// Task ids double as metadata filenames, so the character set is closed.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(try_from = "String", into = "String")]
#[display("{_0}")]
pub struct TaskId(String);

impl TaskId {
    /// Generate a new random task ID
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Parse and validate a task ID
    pub fn parse(id: impl Into<String>) -> Result<Self, Error> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Parse a task ID received as raw bytes
    pub fn from_bytes(raw: &[u8]) -> Result<Self, Error> {
        let id = std::str::from_utf8(raw)
            .map_err(|_| Error::InvalidTaskId(String::from_utf8_lossy(raw).into_owned()))?;
        Self::parse(id)
    }

    /// Get the task ID as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<(), Error> {
        if id.len() != TASK_ID_LEN {
            return Err(Error::InvalidTaskId(format!(
                "{id:?}: expected {TASK_ID_LEN} characters, got {}",
                id.len()
            )));
        }
        if let Some(c) = id.chars().find(|c| !c.is_ascii_alphanumeric() && *c != '-') {
            return Err(Error::InvalidTaskId(format!("{id:?}: invalid character {c:?}")));
        }
        Ok(())
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

impl FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TaskId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One file received for a task
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataFileEntry {
    /// Path relative to the task namespace, as stored (including `.gz`)
    pub name: String,
    /// Bytes received from the client
    pub size: u64,
    /// Address of the connection that delivered the file
    pub source_address: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl fmt::Display for MetadataFileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{name: {:?}, size: {}, start_time: {}, end_time: {}}}",
            self.name, self.size, self.start_time, self.end_time
        )
    }
}

/// Durable description of one task execution and its file inventory
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub task_id: TaskId,
    #[serde(default)]
    pub job_name: String,
    /// Storage sub-path under the storage root
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub gzip: bool,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub total_size: u64,
    pub start_time: DateTime<Utc>,
    /// `None` while the task is still accepting files
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub expire_time: DateTime<Utc>,
    #[serde(default)]
    pub files: Vec<MetadataFileEntry>,
    #[serde(default)]
    pub pid: u32,
    #[serde(default, with = "base64_bytes")]
    pub script: Vec<u8>,
    #[serde(default, with = "base64_bytes")]
    pub output: Vec<u8>,
    #[serde(default, with = "base64_bytes")]
    pub errput: Vec<u8>,
}

impl Metadata {
    /// Create a record for a task starting at `start_time`, kept for `max_age`
    #[must_use]
    pub fn new(task_id: TaskId, start_time: DateTime<Utc>, max_age: TimeDelta) -> Self {
        Self {
            task_id,
            job_name: String::new(),
            namespace: String::new(),
            command: String::new(),
            gzip: false,
            success: false,
            message: String::new(),
            total_size: 0,
            start_time,
            end_time: None,
            expire_time: start_time + max_age,
            files: Vec::new(),
            pid: 0,
            script: Vec::new(),
            output: Vec::new(),
            errput: Vec::new(),
        }
    }

    /// Whether the task has completed (successfully or not)
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    /// Whether the retention window has passed at `now`
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expire_time <= now
    }

    /// Append a received file and recompute the total size
    pub fn add_file(&mut self, entry: MetadataFileEntry) {
        self.files.push(entry);
        self.recompute_total_size();
    }

    /// Recompute `total_size` from the file inventory
    pub fn recompute_total_size(&mut self) {
        self.total_size = self.files.iter().map(|f| f.size).sum();
    }

    /// Record the outcome of the task
    pub fn finish(&mut self, outcome: std::result::Result<(), String>, at: DateTime<Utc>) {
        match outcome {
            Ok(()) => {
                self.success = true;
                self.message = "OK".to_string();
            }
            Err(message) => {
                self.success = false;
                self.message = message;
            }
        }
        self.end_time = Some(at);
    }

    /// Wall-clock duration of the task, zero if unfinished or inconsistent
    #[must_use]
    pub fn duration(&self) -> TimeDelta {
        match self.end_time {
            Some(end) if end >= self.start_time => end - self.start_time,
            _ => TimeDelta::zero(),
        }
    }

    /// Average throughput in bytes per second over whole seconds
    #[must_use]
    pub fn avg_speed(&self) -> u64 {
        match u64::try_from(self.duration().num_seconds()) {
            Ok(0) | Err(_) => 0,
            Ok(secs) => self.total_size / secs,
        }
    }
}

/// Byte buffers are stored base64-encoded in the JSON record
mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, size: u64) -> MetadataFileEntry {
        let now = Utc::now();
        MetadataFileEntry {
            name: name.to_string(),
            size,
            source_address: "127.0.0.1:4242".to_string(),
            start_time: now,
            end_time: now,
        }
    }

    #[test]
    fn test_task_id_generate_is_valid() {
        let id = TaskId::generate();
        assert_eq!(id.as_str().len(), TASK_ID_LEN);
        assert_eq!(TaskId::parse(id.as_str()).unwrap(), id);
    }

    #[test]
    fn test_task_id_rejects_bad_shape() {
        assert!(TaskId::parse("short").is_err());
        assert!(TaskId::parse("../../../../etc/passwd/aaaaaaaaaaaaaa").is_err());
        assert!(TaskId::from_bytes(&[0xff; TASK_ID_LEN]).is_err());
        assert!(TaskId::parse("a2f1c3e4-0000-4000-8000-00000000000b").is_ok());
    }

    #[test]
    fn test_task_id_serde_validates() {
        let json = serde_json::to_string(&TaskId::generate()).unwrap();
        assert!(serde_json::from_str::<TaskId>(&json).is_ok());
        assert!(serde_json::from_str::<TaskId>("\"nope\"").is_err());
    }

    #[test]
    fn test_expire_time_from_max_age() {
        let start = Utc::now();
        let md = Metadata::new(TaskId::generate(), start, TimeDelta::days(3));
        assert_eq!(md.expire_time, start + TimeDelta::days(3));
        assert!(!md.is_finished());
        assert!(!md.is_expired_at(start));
        assert!(md.is_expired_at(start + TimeDelta::days(3)));
    }

    #[test]
    fn test_add_file_recomputes_total_size() {
        let mut md = Metadata::new(TaskId::generate(), Utc::now(), TimeDelta::days(1));
        md.add_file(entry("db.sql", 100));
        md.add_file(entry("etc.tar", 23));
        assert_eq!(md.total_size, 123);
        assert_eq!(md.files[0].name, "db.sql");
        assert_eq!(md.files[1].name, "etc.tar");
    }

    #[test]
    fn test_finish_and_duration() {
        let start = Utc::now();
        let mut md = Metadata::new(TaskId::generate(), start, TimeDelta::days(1));
        assert_eq!(md.duration(), TimeDelta::zero());

        md.total_size = 1000;
        md.finish(Ok(()), start + TimeDelta::seconds(10));
        assert!(md.success);
        assert_eq!(md.message, "OK");
        assert_eq!(md.duration(), TimeDelta::seconds(10));
        assert_eq!(md.avg_speed(), 100);

        md.finish(Err("exit status 1".into()), start - TimeDelta::seconds(1));
        assert!(!md.success);
        assert_eq!(md.message, "exit status 1");
        assert_eq!(md.duration(), TimeDelta::zero());
        assert_eq!(md.avg_speed(), 0);
    }

    #[test]
    fn test_metadata_json_shape() {
        let mut md = Metadata::new(TaskId::generate(), Utc::now(), TimeDelta::hours(1));
        md.output = b"\x00binary\xff".to_vec();
        md.add_file(entry("a", 1));

        let value = serde_json::to_value(&md).unwrap();
        assert_eq!(value["task_id"], md.task_id.as_str());
        assert!(value["end_time"].is_null());
        assert!(value["output"].is_string());

        let back: Metadata = serde_json::from_value(value).unwrap();
        assert_eq!(back, md);
    }
}
