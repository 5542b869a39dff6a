use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{ContainerStorage, StorageError};

/// Local filesystem storage for `file://` uris and plain paths, resolved
/// under `root`.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, uri: &str) -> Result<PathBuf, StorageError> {
        let path = match uri.split_once("://") {
            Some(("file", path)) => path,
            Some(_) => return Err(StorageError::unsupported_uri(uri)),
            None => uri,
        };
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(StorageError::unsupported_uri(uri));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ContainerStorage for LocalStorage {
    async fn delete(&self, uri: &str) -> Result<(), StorageError> {
        let path = self.resolve(uri)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(uri, "🗑️ Removed file");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(uri, e)),
        }
    }

    async fn exists(&self, uri: &str) -> Result<bool, StorageError> {
        let path = self.resolve(uri)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StorageError::io(uri, e))
    }

    async fn write(&self, uri: &str, contents: &[u8]) -> Result<(), StorageError> {
        let path = self.resolve(uri)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(uri, e))?;
        }
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| StorageError::io(uri, e))
    }
}
