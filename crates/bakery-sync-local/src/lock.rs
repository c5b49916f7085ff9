use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use bakery_sync_core::StorageError;
use fs2::FileExt;
use tracing::{debug, warn};

/// Exclusive OS-level lock on the `.{name}.lock` sidecar of a file.
///
/// Uses flock on Unix and LockFile on Windows. The lock is held while the
/// guard lives; dropping it (or the process dying) releases it.
#[derive(Debug)]
pub(crate) struct SidecarLock {
    file: File,
    path: PathBuf,
}

impl SidecarLock {
    /// Path of the lock sidecar guarding `target`.
    pub(crate) fn lock_path(target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        target.with_file_name(format!(".{}.lock", name))
    }

    /// Block until the lock guarding `target` is held.
    ///
    /// The parent directory of `target` must exist.
    pub(crate) fn acquire(target: &Path) -> Result<Self, StorageError> {
        let path = Self::lock_path(target);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StorageError::io(format!("Failed to open lock file {}", path.display()), e))?;

        file.lock_exclusive()
            .map_err(|e| StorageError::io(format!("Failed to lock {}", path.display()), e))?;
        debug!("Locked {}", path.display());
        Ok(Self { file, path })
    }
}

impl Drop for SidecarLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to unlock {}: {}", self.path.display(), e);
        } else {
            debug!("Unlocked {}", self.path.display());
        }
    }
}
