//! Persistent certificate storage used by certificate managers.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache miss")]
    Miss,

    #[error("invalid cache key {0:?}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Key/value store for certificates and keys.
///
/// Implementations must be safe for concurrent use.
#[async_trait]
pub trait CertCache: Send + Sync {
    /// Value stored under `key`, or [`CacheError::Miss`]
    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError>;

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), CacheError>;

    /// Removing a missing key is not an error
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// File-per-key cache inside a directory.
///
/// The directory is created with mode 0700 on the first `put`, never at
/// construction.
#[derive(Debug, Clone)]
pub struct DirCache {
    dir: PathBuf,
}

impl DirCache {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> Result<PathBuf, CacheError> {
        if key.is_empty()
            || key.starts_with('.')
            || key.contains(['/', '\\'])
            || key.contains("..")
        {
            return Err(CacheError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(key))
    }

    async fn ensure_dir(&self) -> io::Result<()> {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o700);
        builder.create(&self.dir).await
    }
}

#[async_trait]
impl CertCache for DirCache {
    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        let path = self.path(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CacheError::Miss),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), CacheError> {
        let path = self.path(key)?;
        self.ensure_dir().await?;

        // Write to a temporary file first, then rename over the target
        let temp_path = self.dir.join(format!(".{key}.tmp"));
        tokio::fs::write(&temp_path, data).await?;
        tokio::fs::rename(&temp_path, &path).await?;

        debug!(key, dir = %self.dir.display(), "Stored cache entry");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let path = self.path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory cache, mainly for tests
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CertCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        self.entries
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or(CacheError::Miss)
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), CacheError> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
