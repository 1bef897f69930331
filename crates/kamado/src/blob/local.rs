use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use super::BlobStore;
use crate::error::BlobError;

/// Blob store backed by a directory on the local filesystem.
///
/// Locations are relative paths beneath the root; an optional `file://`
/// scheme is accepted. Locations escaping the root are rejected.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, location: &str) -> Result<PathBuf, BlobError> {
        let relative = location.strip_prefix("file://").unwrap_or(location);
        let relative = relative.trim_start_matches('/');
        if relative.is_empty() {
            return Err(BlobError::InvalidLocation(location.to_string()));
        }
        let path = Path::new(relative);
        if path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(BlobError::InvalidLocation(location.to_string()));
        }
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn read(&self, location: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.resolve(location)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(location.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, location: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
        let path = self.resolve(location)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }
}
