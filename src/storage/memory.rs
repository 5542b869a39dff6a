use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use super::{ContainerStorage, StorageError};

/// Storage keeping objects in memory, keyed by uri.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    objects: DashMap<String, Vec<u8>>,
    failing: DashSet<String>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        uris.sort();
        uris
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.objects.contains_key(uri)
    }

    /// Every later operation on `uri` fails with an I/O error.
    pub fn fail_on(&self, uri: impl Into<String>) {
        self.failing.insert(uri.into());
    }

    pub fn heal(&self, uri: &str) {
        self.failing.remove(uri);
    }

    fn check(&self, uri: &str) -> Result<(), StorageError> {
        if self.failing.contains(uri) {
            return Err(StorageError::io(uri, "simulated failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerStorage for InMemoryStorage {
    async fn delete(&self, uri: &str) -> Result<(), StorageError> {
        self.check(uri)?;
        self.objects.remove(uri);
        Ok(())
    }

    async fn exists(&self, uri: &str) -> Result<bool, StorageError> {
        self.check(uri)?;
        Ok(self.objects.contains_key(uri))
    }

    async fn write(&self, uri: &str, contents: &[u8]) -> Result<(), StorageError> {
        self.check(uri)?;
        self.objects.insert(uri.to_string(), contents.to_vec());
        Ok(())
    }
}
