//! # Blob Store
//!
//! Opaque location-addressed byte storage used for formatted inputs, raw job
//! outputs and consolidated run outputs.
//!
//! ## Feature Flags
//!
//! - `local-blob`: enables [`LocalBlobStore`], rooted at a filesystem directory
//!
//! [`MemoryBlobStore`] is always available and backs the test suite.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::BlobError;

#[cfg_attr(docsrs, doc(cfg(feature = "local-blob")))]
#[cfg(feature = "local-blob")]
mod local;

#[cfg(feature = "local-blob")]
pub use local::LocalBlobStore;

/// Storage for batch input and output files.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read the full contents at `location`.
    async fn read(&self, location: &str) -> Result<Vec<u8>, BlobError>;

    /// Create or replace the contents at `location`.
    async fn write(&self, location: &str, bytes: Vec<u8>) -> Result<(), BlobError>;
}

/// Process-local blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locations currently stored, sorted.
    pub async fn locations(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn read(&self, location: &str) -> Result<Vec<u8>, BlobError> {
        self.objects
            .read()
            .await
            .get(location)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(location.to_string()))
    }

    async fn write(&self, location: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
        if location.is_empty() {
            return Err(BlobError::InvalidLocation(location.to_string()));
        }
        self.objects.write().await.insert(location.to_string(), bytes);
        Ok(())
    }
}

/// Join blob path segments with a single `/`.
pub fn join_location(prefix: &str, rest: &str) -> String {
    format!(
        "{}/{}",
        prefix.trim_end_matches('/'),
        rest.trim_start_matches('/')
    )
}

/// Memory store that refuses writes to locations ending in a suffix.
#[cfg(test)]
pub(crate) struct RefusingBlobStore {
    inner: std::sync::Arc<MemoryBlobStore>,
    suffix: String,
}

#[cfg(test)]
impl RefusingBlobStore {
    pub(crate) fn new(inner: std::sync::Arc<MemoryBlobStore>, suffix: &str) -> Self {
        Self {
            inner,
            suffix: suffix.to_string(),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl BlobStore for RefusingBlobStore {
    async fn read(&self, location: &str) -> Result<Vec<u8>, BlobError> {
        self.inner.read(location).await
    }

    async fn write(&self, location: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
        if location.ends_with(&self.suffix) {
            return Err(BlobError::Io(std::io::Error::other("write refused")));
        }
        self.inner.write(location, bytes).await
    }
}
