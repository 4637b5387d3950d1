//! Script pool backed by a directory of files

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use stowage_common::{Error, Result};
use tracing::debug;

use crate::components::ScriptPool;

/// Resolves a script name to `<root>/<name>`
pub struct DirectoryScriptPool {
    root: PathBuf,
}

impl DirectoryScriptPool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ScriptPool for DirectoryScriptPool {
    async fn backup_script(&self, name: &str) -> Result<Vec<u8>> {
        let inside = !name.is_empty()
            && Path::new(name)
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !inside {
            return Err(Error::configuration(format!("invalid script name {name:?}")));
        }

        let path = self.root.join(name);
        debug!("Reading backup script {}", path.display());
        match tokio::fs::read(&path).await {
            Ok(script) => Ok(script),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(format!("script {}", path.display())))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_script_by_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("db")).unwrap();
        std::fs::write(dir.path().join("db/pg.sh"), b"pg_dumpall | send db.sql\n").unwrap();

        let pool = DirectoryScriptPool::new(dir.path());
        assert_eq!(
            pool.backup_script("db/pg.sh").await.unwrap(),
            b"pg_dumpall | send db.sql\n"
        );
        assert!(pool.backup_script("absent.sh").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_rejects_names_outside_root() {
        let pool = DirectoryScriptPool::new("/etc/stowage/commands");
        for name in ["", "../passwd", "/etc/shadow"] {
            assert!(matches!(
                pool.backup_script(name).await,
                Err(Error::Configuration(_))
            ));
        }
    }
}
