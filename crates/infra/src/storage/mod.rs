//! Blob storage for staged uploads and processed variants.

mod in_memory;

use async_trait::async_trait;

pub use in_memory::InMemoryBlobStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlobError {
    #[error("blob store unavailable: {0}")]
    Unavailable(String),
    #[error("blob write rejected: {0}")]
    Rejected(String),
}

/// Object store addressed by `(bucket, path)`.
#[async_trait]
pub trait BlobStore: Send + Sync + core::fmt::Debug {
    async fn put(&self, bucket: &str, path: &str, bytes: Vec<u8>) -> Result<(), BlobError>;

    async fn get(&self, bucket: &str, path: &str) -> Result<Option<Vec<u8>>, BlobError>;

    /// Returns whether an object was removed.
    async fn delete(&self, bucket: &str, path: &str) -> Result<bool, BlobError>;
}
