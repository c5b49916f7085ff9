use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bakery_sync_core::{
    content_version, replace_file, temp_path_for, ObjectMeta, ObjectStore, StorageError,
    VersionedObject, WriteOutcome, WritePrecondition,
};
use tokio::fs;
use tracing::{debug, instrument};

use crate::lock::SidecarLock;

/// Local filesystem object store.
///
/// Keys are relative paths under the root directory:
/// ```text
/// {root}/
///   instance.db
///   exclusion/
///     priorities
///     .priorities.lock       # held during conditional writes
///     numbers/{participant}
///     entering/{participant}
/// ```
///
/// Plain writes go to a temp file renamed into place. Conditional writes hold
/// an exclusive lock on the target's sidecar and compare the SHA-256 of the
/// current content, which works across processes sharing the filesystem.
/// `stat` reports no version: file caches fall back to mtime comparison.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create a new LocalStore rooted at the given directory.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a path under the root, rejecting keys that escape it.
    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StorageError::InvalidArgument(format!(
                "Invalid object key {:?}: must be a relative path without '.' or '..'",
                key
            )));
        }
        Ok(self.root.join(relative))
    }

    async fn ensure_parent(path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                StorageError::io(format!("Failed to create dir {}", parent.display()), e)
            })?;
        }
        Ok(())
    }

    /// Copy `from` over `to` through a temp file next to `to`.
    async fn copy_replace(from: &Path, to: &Path) -> Result<u64, StorageError> {
        Self::ensure_parent(to).await?;
        let temp = temp_path_for(to);
        let bytes = fs::copy(from, &temp).await.map_err(|e| {
            StorageError::io(format!("Failed to copy {} to {}", from.display(), temp.display()), e)
        })?;
        fs::rename(&temp, to)
            .await
            .map_err(|e| StorageError::io(format!("Failed to replace {}", to.display()), e))?;
        Ok(bytes)
    }
}

/// Synchronous read returning `None` for missing files.
fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
    match std::fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::io(format!("Failed to read {}", path.display()), e)),
    }
}

/// Synchronous counterpart of `replace_file`, used under the sidecar lock.
fn replace_file_blocking(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let temp = temp_path_for(path);
    std::fs::write(&temp, data)
        .map_err(|e| StorageError::io(format!("Failed to write {}", temp.display()), e))?;
    std::fs::rename(&temp, path)
        .map_err(|e| StorageError::io(format!("Failed to replace {}", path.display()), e))
}

fn put_conditional_blocking(
    path: &Path,
    data: &[u8],
    precondition: &WritePrecondition,
) -> Result<WriteOutcome, StorageError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            StorageError::io(format!("Failed to create dir {}", parent.display()), e)
        })?;
    }

    let _guard = SidecarLock::acquire(path)?;
    let current = read_if_exists(path)?.map(|d| content_version(&d));
    let holds = match (precondition, current) {
        (WritePrecondition::DoesNotExist, None) => true,
        (WritePrecondition::MatchesVersion(expected), Some(actual)) => *expected == actual,
        _ => false,
    };
    if !holds {
        return Ok(WriteOutcome::PreconditionFailed);
    }

    replace_file_blocking(path, data)?;
    Ok(WriteOutcome::Written)
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    #[instrument(skip(self), level = "debug")]
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.object_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(format!("Failed to read {}", path.display()), e)),
        }
    }

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn set(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = self.object_path(key)?;
        replace_file(&path, data).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn stat(&self, key: &str) -> Result<Option<ObjectMeta>, StorageError> {
        let path = self.object_path(key)?;
        let metadata = match fs::metadata(&path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StorageError::io(format!("Failed to stat {}", path.display()), e))
            }
        };
        let modified = metadata
            .modified()
            .map_err(|e| StorageError::io(format!("Failed to read mtime of {}", path.display()), e))?;

        Ok(Some(ObjectMeta {
            modified_at: chrono::DateTime::from(modified),
            size_bytes: metadata.len(),
            version: None,
        }))
    }

    #[instrument(skip(self), level = "debug")]
    async fn download(&self, key: &str, local_path: &Path) -> Result<(), StorageError> {
        let path = self.object_path(key)?;
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Err(StorageError::NotFound(key.to_string()));
        }
        let bytes = Self::copy_replace(&path, local_path).await?;
        debug!("Downloaded {} to {} ({} bytes)", key, local_path.display(), bytes);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn upload(&self, local_path: &Path, key: &str) -> Result<(), StorageError> {
        let path = self.object_path(key)?;
        let bytes = Self::copy_replace(local_path, &path).await?;
        debug!("Uploaded {} to {} ({} bytes)", local_path.display(), key, bytes);
        Ok(())
    }

    fn supports_conditional_writes(&self) -> bool {
        true
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_versioned(&self, key: &str) -> Result<Option<VersionedObject>, StorageError> {
        Ok(self.get(key).await?.map(|data| {
            let version = content_version(&data);
            VersionedObject { data, version }
        }))
    }

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn put_conditional(
        &self,
        key: &str,
        data: &[u8],
        precondition: &WritePrecondition,
    ) -> Result<WriteOutcome, StorageError> {
        let path = self.object_path(key)?;
        let data = data.to_vec();
        let precondition = precondition.clone();

        let outcome = tokio::task::spawn_blocking(move || {
            put_conditional_blocking(&path, &data, &precondition)
        })
        .await
        .map_err(|e| StorageError::Io(format!("Conditional write task failed: {}", e)))??;

        debug!("Conditional write of {}: {:?}", key, outcome);
        Ok(outcome)
    }
}
