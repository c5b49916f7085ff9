//! Local mirror of one remote file.
//!
//! Coherence is driven by the remote object's metadata. After every pull or
//! push the local file's mtime is stamped with the remote modification time,
//! and a `<file>.sync.json` sidecar records the remote version tag:
//!
//! - remote and sidecar both carry a version: stale iff they differ
//! - otherwise: stale iff `remote.mtime > local.mtime`
//!
//! The mtime fallback is only as precise as the backend's clock (often whole
//! seconds for object stores). Two writers landing within that window are
//! indistinguishable; the bakery lock, not the timestamps, keeps them apart.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::StorageError;
use crate::store::{replace_file, ObjectMeta, ObjectStore};

/// Remote state observed at the last pull or push of a local file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStamp {
    pub remote_key: String,
    #[serde(default)]
    pub version: Option<String>,
    pub modified_at: DateTime<Utc>,
}

/// What `pull_if_stale` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// The remote file was copied over the local one.
    Downloaded,
    /// The local file already reflected the remote one.
    Fresh,
}

/// Keeps local copies of remote files coherent with a store.
#[derive(Clone)]
pub struct FileCache {
    store: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for FileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCache")
            .field("backend", &self.store.backend_name())
            .finish()
    }
}

impl FileCache {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Path of the sidecar holding the sync stamp of `local`.
    pub fn stamp_path(local: &Path) -> PathBuf {
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        local.with_file_name(format!("{}.sync.json", name))
    }

    /// Read the sync stamp of `local`. Unreadable stamps count as missing.
    pub async fn read_stamp(local: &Path) -> Option<SyncStamp> {
        let path = Self::stamp_path(local);
        let raw = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice(&raw) {
            Ok(stamp) => Some(stamp),
            Err(e) => {
                warn!("Ignoring unreadable sync stamp {}: {}", path.display(), e);
                None
            }
        }
    }

    async fn write_stamp(local: &Path, remote: &str, meta: &ObjectMeta) -> Result<(), StorageError> {
        let stamp = SyncStamp {
            remote_key: remote.to_string(),
            version: meta.version.clone(),
            modified_at: meta.modified_at,
        };
        let json = serde_json::to_vec_pretty(&stamp).map_err(|e| {
            StorageError::Serialization(format!("Failed to serialize sync stamp: {}", e))
        })?;
        replace_file(&Self::stamp_path(local), &json).await?;

        set_local_modified_at(local, meta.modified_at)
    }

    async fn remote_meta(&self, remote: &str) -> Result<ObjectMeta, StorageError> {
        self.store
            .stat(remote)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("Remote file {}", remote)))
    }

    /// Whether `local` lags behind `remote`.
    pub async fn is_stale(&self, remote: &str, local: &Path) -> Result<bool, StorageError> {
        let meta = self.remote_meta(remote).await?;
        self.is_stale_against(remote, local, &meta).await
    }

    async fn is_stale_against(
        &self,
        remote: &str,
        local: &Path,
        meta: &ObjectMeta,
    ) -> Result<bool, StorageError> {
        let Some(local_mtime) = local_modified_at(local)? else {
            return Ok(true);
        };

        let stamp = Self::read_stamp(local)
            .await
            .filter(|stamp| stamp.remote_key == remote);
        let stamped_version = stamp.as_ref().and_then(|s| s.version.as_ref());

        let stale = match (&meta.version, stamped_version) {
            (Some(remote_version), Some(local_version)) => remote_version != local_version,
            _ => micros(meta.modified_at) > micros(local_mtime),
        };
        Ok(stale)
    }

    /// Download `remote` into `local` unless `local` already mirrors it.
    #[instrument(skip(self), level = "debug")]
    pub async fn pull_if_stale(
        &self,
        remote: &str,
        local: &Path,
    ) -> Result<PullOutcome, StorageError> {
        let meta = self.remote_meta(remote).await?;

        let exists = local_modified_at(local)?.is_some();
        if exists && !self.is_stale_against(remote, local, &meta).await? {
            debug!("{} is up to date with {}", local.display(), remote);
            return Ok(PullOutcome::Fresh);
        }

        if exists && self.has_unpushed_edits(remote, local).await? {
            warn!(
                "Discarding local edits to {}: {} was published by another writer in the meantime",
                local.display(),
                remote
            );
        }

        self.store.download(remote, local).await?;
        Self::write_stamp(local, remote, &meta).await?;
        info!(
            "Pulled {} into {} ({} bytes, modified {})",
            remote,
            local.display(),
            meta.size_bytes,
            meta.modified_at
        );
        Ok(PullOutcome::Downloaded)
    }

    /// Upload `local` to `remote` and re-stamp `local` with the new remote state.
    #[instrument(skip(self), level = "debug")]
    pub async fn push(&self, remote: &str, local: &Path) -> Result<ObjectMeta, StorageError> {
        if local_modified_at(local)?.is_none() {
            return Err(StorageError::NotFound(format!(
                "Local file {}",
                local.display()
            )));
        }

        self.store.upload(local, remote).await?;
        let meta = self.remote_meta(remote).await?;
        Self::write_stamp(local, remote, &meta).await?;
        info!(
            "Pushed {} to {} ({} bytes, modified {})",
            local.display(),
            remote,
            meta.size_bytes,
            meta.modified_at
        );
        Ok(meta)
    }

    /// Warn if `local` was edited after the remote's last modification.
    ///
    /// Such an edit is lost as soon as another writer publishes and this copy
    /// gets pulled again. Returns whether the warning fired.
    pub async fn warn_if_local_newer(
        &self,
        remote: &str,
        local: &Path,
    ) -> Result<bool, StorageError> {
        let Some(local_mtime) = local_modified_at(local)? else {
            return Ok(false);
        };
        let Some(meta) = self.store.stat(remote).await? else {
            return Ok(false);
        };

        if micros(local_mtime) > micros(meta.modified_at) {
            warn!(
                "{} was modified at {} after {} ({}), but never pushed",
                local.display(),
                local_mtime,
                remote,
                meta.modified_at
            );
            return Ok(true);
        }
        Ok(false)
    }

    /// Whether `local` changed since its last pull or push.
    async fn has_unpushed_edits(&self, remote: &str, local: &Path) -> Result<bool, StorageError> {
        let Some(local_mtime) = local_modified_at(local)? else {
            return Ok(false);
        };
        Ok(match Self::read_stamp(local).await {
            Some(stamp) if stamp.remote_key == remote => {
                micros(local_mtime) > micros(stamp.modified_at)
            }
            _ => false,
        })
    }
}

fn micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

/// Modification time of a local file, `None` if it does not exist.
pub(crate) fn local_modified_at(path: &Path) -> Result<Option<DateTime<Utc>>, StorageError> {
    match std::fs::metadata(path) {
        Ok(meta) => {
            let modified = meta.modified().map_err(|e| {
                StorageError::io(format!("Failed to read mtime of {}", path.display()), e)
            })?;
            Ok(Some(DateTime::<Utc>::from(modified)))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::io(format!("Failed to stat {}", path.display()), e)),
    }
}

pub(crate) fn set_local_modified_at(path: &Path, ts: DateTime<Utc>) -> Result<(), StorageError> {
    let file = std::fs::File::options()
        .write(true)
        .open(path)
        .map_err(|e| StorageError::io(format!("Failed to open {}", path.display()), e))?;
    file.set_modified(SystemTime::from(ts))
        .map_err(|e| StorageError::io(format!("Failed to set mtime of {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use async_trait::async_trait;
    use tempfile::TempDir;

    const REMOTE: &str = "instances/main/instance.db";

    fn setup() -> (FileCache, Arc<MemoryStore>, TempDir, PathBuf) {
        let store = Arc::new(MemoryStore::new());
        let cache = FileCache::new(store.clone());
        let temp = TempDir::new().unwrap();
        let local = temp.path().join("cache/instance.db");
        (cache, store, temp, local)
    }

    fn downloads(store: &MemoryStore) -> usize {
        let op = format!("get {}", REMOTE);
        store.journal().iter().filter(|o| **o == op).count()
    }

    fn edit_locally(local: &Path, data: &[u8]) {
        std::fs::write(local, data).unwrap();
        set_local_modified_at(local, Utc::now() + chrono::Duration::seconds(1)).unwrap();
    }

    /// Store that hides version tags, forcing the mtime comparison.
    struct Unversioned(MemoryStore);

    #[async_trait]
    impl ObjectStore for Unversioned {
        fn backend_name(&self) -> &'static str {
            "unversioned"
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            self.0.get(key).await
        }

        async fn set(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
            self.0.set(key, data).await
        }

        async fn stat(&self, key: &str) -> Result<Option<ObjectMeta>, StorageError> {
            Ok(self.0.stat(key).await?.map(|m| ObjectMeta { version: None, ..m }))
        }
    }

    #[tokio::test]
    async fn test_pull_is_idempotent() {
        let (cache, store, _temp, local) = setup();
        store.set(REMOTE, b"v1").await.unwrap();

        assert_eq!(cache.pull_if_stale(REMOTE, &local).await.unwrap(), PullOutcome::Downloaded);
        assert_eq!(cache.pull_if_stale(REMOTE, &local).await.unwrap(), PullOutcome::Fresh);
        assert_eq!(cache.pull_if_stale(REMOTE, &local).await.unwrap(), PullOutcome::Fresh);

        assert_eq!(downloads(&store), 1);
        assert_eq!(std::fs::read(&local).unwrap(), b"v1");
    }

    #[tokio::test]
    async fn test_pull_stamps_remote_mtime_and_version() {
        let (cache, store, _temp, local) = setup();
        store.set(REMOTE, b"v1").await.unwrap();
        let t0 = store.stat(REMOTE).await.unwrap().unwrap();

        cache.pull_if_stale(REMOTE, &local).await.unwrap();

        let local_mtime = local_modified_at(&local).unwrap().unwrap();
        assert_eq!(micros(local_mtime), micros(t0.modified_at));

        let stamp = FileCache::read_stamp(&local).await.unwrap();
        assert_eq!(stamp.remote_key, REMOTE);
        assert_eq!(stamp.version, t0.version);
    }

    #[tokio::test]
    async fn test_remote_update_triggers_pull() {
        let (cache, store, _temp, local) = setup();
        store.set(REMOTE, b"v1").await.unwrap();
        cache.pull_if_stale(REMOTE, &local).await.unwrap();

        store.set(REMOTE, b"v2 from another writer").await.unwrap();
        assert!(cache.is_stale(REMOTE, &local).await.unwrap());
        assert_eq!(cache.pull_if_stale(REMOTE, &local).await.unwrap(), PullOutcome::Downloaded);
        assert_eq!(std::fs::read(&local).unwrap(), b"v2 from another writer");
    }

    #[tokio::test]
    async fn test_edit_push_scenario() {
        let (cache, store, _temp, local) = setup();
        store.set(REMOTE, b"v1").await.unwrap();
        let t0 = store.stat(REMOTE).await.unwrap().unwrap().modified_at;

        cache.pull_if_stale(REMOTE, &local).await.unwrap();
        edit_locally(&local, b"v1 + local edit");
        assert!(cache.warn_if_local_newer(REMOTE, &local).await.unwrap());

        let pushed = cache.push(REMOTE, &local).await.unwrap();
        let t1 = pushed.modified_at;
        assert!(t1 > t0);
        assert_eq!(store.get_text(REMOTE).unwrap(), "v1 + local edit");
        assert_eq!(micros(local_modified_at(&local).unwrap().unwrap()), micros(t1));

        assert!(!cache.warn_if_local_newer(REMOTE, &local).await.unwrap());
        store.clear_journal();
        assert_eq!(cache.pull_if_stale(REMOTE, &local).await.unwrap(), PullOutcome::Fresh);
        assert_eq!(downloads(&store), 0);
    }

    #[tokio::test]
    async fn test_unpushed_edit_is_overwritten_by_newer_remote() {
        let (cache, store, _temp, local) = setup();
        store.set(REMOTE, b"v1").await.unwrap();
        cache.pull_if_stale(REMOTE, &local).await.unwrap();

        edit_locally(&local, b"never pushed");
        store.set(REMOTE, b"v2").await.unwrap();

        assert_eq!(cache.pull_if_stale(REMOTE, &local).await.unwrap(), PullOutcome::Downloaded);
        assert_eq!(std::fs::read(&local).unwrap(), b"v2");
    }

    #[tokio::test]
    async fn test_mtime_fallback_without_versions() {
        let store = Arc::new(Unversioned(MemoryStore::new()));
        let cache = FileCache::new(store.clone());
        let temp = TempDir::new().unwrap();
        let local = temp.path().join("instance.db");

        store.set(REMOTE, b"v1").await.unwrap();
        assert_eq!(cache.pull_if_stale(REMOTE, &local).await.unwrap(), PullOutcome::Downloaded);
        assert_eq!(cache.pull_if_stale(REMOTE, &local).await.unwrap(), PullOutcome::Fresh);
        assert_eq!(FileCache::read_stamp(&local).await.unwrap().version, None);

        store.set(REMOTE, b"v2").await.unwrap();
        assert_eq!(cache.pull_if_stale(REMOTE, &local).await.unwrap(), PullOutcome::Downloaded);

        // A local edit newer than the remote is kept and reported.
        edit_locally(&local, b"local");
        assert_eq!(cache.pull_if_stale(REMOTE, &local).await.unwrap(), PullOutcome::Fresh);
        assert!(cache.warn_if_local_newer(REMOTE, &local).await.unwrap());
        assert_eq!(std::fs::read(&local).unwrap(), b"local");
    }

    #[tokio::test]
    async fn test_missing_remote_or_local() {
        let (cache, _store, _temp, local) = setup();

        let err = cache.pull_if_stale(REMOTE, &local).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));

        let err = cache.push(REMOTE, &local).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));

        assert!(!cache.warn_if_local_newer(REMOTE, &local).await.unwrap());
    }

    #[tokio::test]
    async fn test_stamp_for_other_remote_is_ignored() {
        let (cache, store, _temp, local) = setup();
        store.set(REMOTE, b"v1").await.unwrap();
        store.set("other.db", b"other").await.unwrap();

        cache.pull_if_stale("other.db", &local).await.unwrap();
        // Same local path, different remote: the version stamp does not apply.
        store.set(REMOTE, b"v2").await.unwrap();
        assert_eq!(cache.pull_if_stale(REMOTE, &local).await.unwrap(), PullOutcome::Downloaded);
        assert_eq!(std::fs::read(&local).unwrap(), b"v2");
    }
}
