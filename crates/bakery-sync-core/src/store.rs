use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::StorageError;

/// Metadata about a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Last modification time as reported by the backend.
    pub modified_at: DateTime<Utc>,
    pub size_bytes: u64,
    /// Strong version tag (ETag, generation) if the backend exposes one.
    pub version: Option<String>,
}

/// Object content together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedObject {
    pub data: Vec<u8>,
    pub version: String,
}

/// Condition attached to a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Only write if the key does not exist yet.
    DoesNotExist,
    /// Only write if the current version equals the given one.
    MatchesVersion(String),
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    PreconditionFailed,
}

/// SHA-256 hex digest of some bytes, used as a content version.
pub fn content_version(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Uniform key/bytes access to a storage backend.
///
/// Every call is independently visible to all participants sharing the
/// backend. There is no isolation between calls: `append` in particular is a
/// read followed by a write and can lose updates under true concurrency.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Returns the backend identifier (e.g., "memory", "local", "s3").
    fn backend_name(&self) -> &'static str;

    /// Read an object. `None` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Create or overwrite an object.
    async fn set(&self, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Object metadata. `None` if the key does not exist.
    async fn stat(&self, key: &str) -> Result<Option<ObjectMeta>, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.stat(key).await?.is_some())
    }

    /// Append bytes to an object, creating it if missing.
    async fn append(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let mut current = self.get(key).await?.unwrap_or_default();
        current.extend_from_slice(data);
        self.set(key, &current).await
    }

    /// Copy an object to a local file, replacing the file atomically.
    async fn download(&self, key: &str, local_path: &Path) -> Result<(), StorageError> {
        let data = self
            .get(key)
            .await?
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        replace_file(local_path, &data).await
    }

    /// Copy a local file to an object.
    async fn upload(&self, local_path: &Path, key: &str) -> Result<(), StorageError> {
        let data = tokio::fs::read(local_path)
            .await
            .map_err(|e| StorageError::io(format!("Failed to read {}", local_path.display()), e))?;
        self.set(key, &data).await
    }

    /// Whether `get_versioned` and `put_conditional` are available.
    fn supports_conditional_writes(&self) -> bool {
        false
    }

    /// Read an object together with the version a conditional write can match.
    async fn get_versioned(&self, _key: &str) -> Result<Option<VersionedObject>, StorageError> {
        Err(StorageError::Unsupported {
            backend: self.backend_name(),
            operation: "get_versioned",
        })
    }

    /// Write an object only if `precondition` holds at write time.
    async fn put_conditional(
        &self,
        _key: &str,
        _data: &[u8],
        _precondition: &WritePrecondition,
    ) -> Result<WriteOutcome, StorageError> {
        Err(StorageError::Unsupported {
            backend: self.backend_name(),
            operation: "put_conditional",
        })
    }
}

/// Path of the temporary file used while replacing `path`.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp", name))
}

/// Write `data` to a temp file next to `path`, then rename it into place.
///
/// Readers never observe a partially written file. Parent directories are
/// created as needed.
pub async fn replace_file(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StorageError::io(format!("Failed to create dir {}", parent.display()), e)
            })?;
        }
    }

    let temp = temp_path_for(path);
    tokio::fs::write(&temp, data)
        .await
        .map_err(|e| StorageError::io(format!("Failed to write {}", temp.display()), e))?;
    tokio::fs::rename(&temp, path)
        .await
        .map_err(|e| StorageError::io(format!("Failed to replace {}", path.display()), e))?;
    Ok(())
}
