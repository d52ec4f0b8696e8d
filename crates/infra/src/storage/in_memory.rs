use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::{BlobError, BlobStore};

/// In-memory blob store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    objects: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn contains(&self, bucket: &str, path: &str) -> bool {
        self.read().contains_key(&(bucket.to_string(), path.to_string()))
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<(String, String), Vec<u8>>> {
        self.objects.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<(String, String), Vec<u8>>> {
        self.objects.write().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, bucket: &str, path: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
        self.write().insert((bucket.to_string(), path.to_string()), bytes);
        Ok(())
    }

    async fn get(&self, bucket: &str, path: &str) -> Result<Option<Vec<u8>>, BlobError> {
        Ok(self.read().get(&(bucket.to_string(), path.to_string())).cloned())
    }

    async fn delete(&self, bucket: &str, path: &str) -> Result<bool, BlobError> {
        Ok(self.write().remove(&(bucket.to_string(), path.to_string())).is_some())
    }
}
