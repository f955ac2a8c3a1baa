//! Durable staging of upload payloads
//!
//! Uploads are written here before their task is queued, so a payload is
//! never held in memory between `push_task` and decoding.

use async_trait::async_trait;
use keeper_common::{KeeperError, Result};
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncRead;
use tracing::debug;

/// Readable handle on a staged payload.
pub type StagedPayload = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait StagingStore: Send + Sync {
    async fn write(&self, name: &str, payload: &[u8]) -> Result<()>;

    async fn open(&self, name: &str) -> Result<StagedPayload>;

    async fn remove(&self, name: &str) -> Result<()>;
}

/// Staging store backed by a local directory
#[derive(Debug, Clone)]
pub struct FsStagingStore {
    root: PathBuf,
}

impl FsStagingStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a staging name to a file directly under the root.
    fn path(&self, name: &str) -> Result<PathBuf> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(name)),
            _ => Err(KeeperError::validation(format!(
                "staging name '{name}' must be a single path segment"
            ))),
        }
    }
}

#[async_trait]
impl StagingStore for FsStagingStore {
    async fn write(&self, name: &str, payload: &[u8]) -> Result<()> {
        let path = self.path(name)?;
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(&path, payload).await?;
        debug!(path = %path.display(), bytes = payload.len(), "Staged payload");
        Ok(())
    }

    async fn open(&self, name: &str) -> Result<StagedPayload> {
        let file = tokio::fs::File::open(self.path(name)?).await?;
        Ok(Box::new(file))
    }

    async fn remove(&self, name: &str) -> Result<()> {
        tokio::fs::remove_file(self.path(name)?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_write_open_remove() {
        let dir = TempDir::new().unwrap();
        let store = FsStagingStore::new(dir.path().join("queueCache"));

        store.write("L1abcdef-1", b"part name,value\n").await.unwrap();

        let mut staged = store.open("L1abcdef-1").await.unwrap();
        let mut contents = String::new();
        staged.read_to_string(&mut contents).await.unwrap();
        assert_eq!(contents, "part name,value\n");

        store.remove("L1abcdef-1").await.unwrap();
        assert!(matches!(
            store.open("L1abcdef-1").await,
            Err(KeeperError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_nested_names() {
        let dir = TempDir::new().unwrap();
        let store = FsStagingStore::new(dir.path());

        for name in ["../escape", "a/b", ""] {
            assert!(matches!(
                store.write(name, b"x").await,
                Err(KeeperError::Validation(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_write_failure_is_io() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let store = FsStagingStore::new(&blocker);
        assert!(matches!(
            store.write("L1", b"x").await,
            Err(KeeperError::Io(_))
        ));
    }
}
