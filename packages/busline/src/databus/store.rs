//! Byte stores backing the data bus.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::error::BusError;

/// Key/value blob storage.
///
/// Keys are generated by the data bus; a store may keep them as given or
/// return its own.
#[async_trait]
pub trait DataBusStore: Send + Sync + 'static {
    /// Store `bytes` under `key`, returning the key to reference them by.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String>;

    /// Fetch the bytes stored under `key`.
    ///
    /// Fails with [`BusError::DataBusBlobMissing`] for unknown keys.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
}

// =============================================================================
// In-Memory
// =============================================================================

/// Store keeping blobs in process memory.
#[derive(Debug, Default)]
pub struct InMemoryDataBus {
    blobs: DashMap<String, Vec<u8>>,
}

impl InMemoryDataBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Drop a blob, e.g. to simulate data loss.
    pub fn remove(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.remove(key).map(|(_, bytes)| bytes)
    }

    /// Overwrite a blob in place.
    pub fn overwrite(&self, key: &str, bytes: Vec<u8>) {
        self.blobs.insert(key.to_string(), bytes);
    }
}

#[async_trait]
impl DataBusStore for InMemoryDataBus {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String> {
        self.blobs.insert(key.to_string(), bytes);
        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        match self.blobs.get(key) {
            Some(bytes) => Ok(bytes.clone()),
            None => Err(BusError::DataBusBlobMissing {
                key: key.to_string(),
            }
            .into()),
        }
    }
}

// =============================================================================
// File Share
// =============================================================================

/// Store writing each blob to a file under a shared base directory.
///
/// A key maps to the relative path `<base>/<key>`; keys of the form
/// `YYYY-MM-DD_HH/<uuid>` spread blobs over hourly directories.
#[derive(Debug, Clone)]
pub struct FileShareDataBus {
    base: PathBuf,
}

impl FileShareDataBus {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// The base directory.
    pub fn base(&self) -> &Path {
        &self.base
    }

    fn path_of(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let well_formed = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !well_formed {
            anyhow::bail!("data bus key '{}' is not a relative path", key);
        }
        Ok(self.base.join(relative))
    }
}

#[async_trait]
impl DataBusStore for FileShareDataBus {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String> {
        let path = self.path_of(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        debug!(key, size = bytes.len(), "blob written");
        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_of(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BusError::DataBusBlobMissing {
                    key: key.to_string(),
                }
                .into())
            }
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }
}
