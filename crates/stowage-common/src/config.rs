//! Configuration types for Stowage
//!
//! Both daemons read a TOML file. Every field has a default so a partial
//! file (or none at all) yields a usable configuration; command-line flags
//! override file values in the binaries.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Metadata RPC daemon configuration
#[derive(Clone, Debug, Deserialize)]
pub struct MetamanConfig {
    /// Address the RPC server listens on
    #[serde(default = "default_metaman_listen")]
    pub listen: String,
    /// Directory holding one JSON record per task
    #[serde(default = "default_metadata_root")]
    pub root: PathBuf,
    /// Shared secret clients must present
    #[serde(default)]
    pub secret: String,
    /// Seconds a client has to send its authentication digest
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
}

impl Default for MetamanConfig {
    fn default() -> Self {
        Self {
            listen: default_metaman_listen(),
            root: default_metadata_root(),
            secret: String::new(),
            auth_timeout_secs: default_auth_timeout_secs(),
        }
    }
}

impl MetamanConfig {
    #[must_use]
    pub const fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }
}

/// Storage (ingest) daemon configuration
#[derive(Clone, Debug, Deserialize)]
pub struct StorageConfig {
    /// Address the ingest server listens on
    #[serde(default = "default_storage_listen")]
    pub listen: String,
    /// Root directory for received files
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    /// Address of the metadata RPC daemon
    #[serde(default = "default_metadata_addr")]
    pub metadata_addr: String,
    /// Shared secret for the metadata RPC daemon
    #[serde(default)]
    pub secret: String,
    /// Seconds between expiry sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Seconds to wait for in-flight transfers on shutdown
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Seconds a client has to send the task id and filename
    #[serde(default = "default_header_timeout_secs")]
    pub header_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            listen: default_storage_listen(),
            root: default_storage_root(),
            metadata_addr: default_metadata_addr(),
            secret: String::new(),
            sweep_interval_secs: default_sweep_interval_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            header_timeout_secs: default_header_timeout_secs(),
        }
    }
}

impl StorageConfig {
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    #[must_use]
    pub const fn header_timeout(&self) -> Duration {
        Duration::from_secs(self.header_timeout_secs)
    }
}

fn default_metaman_listen() -> String {
    "0.0.0.0:19876".to_string()
}

fn default_metadata_root() -> PathBuf {
    PathBuf::from("/var/lib/stowage/metadata")
}

fn default_auth_timeout_secs() -> u64 {
    30
}

fn default_storage_listen() -> String {
    "0.0.0.0:19875".to_string()
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("/var/lib/stowage/storage")
}

fn default_metadata_addr() -> String {
    "127.0.0.1:19876".to_string()
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_shutdown_timeout_secs() -> u64 {
    60
}

fn default_header_timeout_secs() -> u64 {
    30
}

/// Load a TOML configuration file
///
/// A missing file yields the default configuration; a file that exists but
/// cannot be read or parsed is a configuration error.
pub fn load_config<T>(path: impl AsRef<Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let path = path.as_ref();
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::configuration(format!("cannot read {}: {e}", path.display())))?;
    toml::from_str(&raw)
        .map_err(|e| Error::configuration(format!("cannot parse {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config: StorageConfig = load_config(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(60));
        assert_eq!(config.metadata_addr, "127.0.0.1:19876");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metaman.toml");
        std::fs::write(&path, "root = \"/srv/meta\"\nsecret = \"s3cr3t\"\n").unwrap();

        let config: MetamanConfig = load_config(&path).unwrap();
        assert_eq!(config.root, PathBuf::from("/srv/meta"));
        assert_eq!(config.secret, "s3cr3t");
        assert_eq!(config.listen, default_metaman_listen());
        assert_eq!(config.auth_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.toml");
        std::fs::write(&path, "listen = [unterminated").unwrap();

        let err = load_config::<StorageConfig>(&path).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
