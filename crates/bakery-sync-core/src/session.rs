use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tracing::{debug, error, info};

use crate::bakery::{BakeryLock, TicketGuard};
use crate::cache::FileCache;
use crate::error::StorageError;
use crate::store::content_version;

/// Lifecycle of a coordinated session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Acquiring,
    Syncing,
    Active,
    Publishing,
    Released,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Acquiring => "acquiring",
            SessionState::Syncing => "syncing",
            SessionState::Active => "active",
            SessionState::Publishing => "publishing",
            SessionState::Released => "released",
        };
        f.write_str(name)
    }
}

/// Exclusive, synchronized access to one shared remote file.
///
/// `run` acquires the bakery lock, pulls the remote file if the local copy is
/// stale, hands the local path to the caller, pushes if the file changed and
/// releases the lock. The lock is released on every exit path, including
/// errors from any step, a panic in the caller's work and the `run` future
/// being dropped. A session runs once; it ends in `Released`.
pub struct CoordinatedSession {
    lock: BakeryLock,
    cache: FileCache,
    remote: String,
    local: PathBuf,
    progress: Arc<Mutex<Progress>>,
}

#[derive(Debug)]
struct Progress {
    state: SessionState,
    history: Vec<SessionState>,
}

impl Progress {
    fn enter(&mut self, next: SessionState) {
        self.state = next;
        self.history.push(next);
    }
}

impl fmt::Debug for CoordinatedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatedSession")
            .field("participant", &self.lock.participant())
            .field("remote", &self.remote)
            .field("local", &self.local)
            .field("state", &self.state())
            .finish()
    }
}

/// Held from `Acquiring` until the lock is released. Dropped while armed, it
/// withdraws the ticket and marks the session released.
struct ReleaseGuard {
    ticket: TicketGuard,
    progress: Arc<Mutex<Progress>>,
}

impl ReleaseGuard {
    fn disarm(&mut self) {
        self.ticket.disarm();
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if self.ticket.is_armed() {
            let mut progress = self.progress.lock().unwrap();
            if progress.state != SessionState::Released {
                progress.enter(SessionState::Released);
            }
        }
    }
}

impl CoordinatedSession {
    pub fn new(
        lock: BakeryLock,
        cache: FileCache,
        remote: impl Into<String>,
        local: impl Into<PathBuf>,
    ) -> Self {
        Self {
            lock,
            cache,
            remote: remote.into(),
            local: local.into(),
            progress: Arc::new(Mutex::new(Progress {
                state: SessionState::Idle,
                history: vec![SessionState::Idle],
            })),
        }
    }

    pub fn state(&self) -> SessionState {
        self.progress.lock().unwrap().state
    }

    /// Every state the session went through, starting with `Idle`.
    pub fn history(&self) -> Vec<SessionState> {
        self.progress.lock().unwrap().history.clone()
    }

    pub fn local_path(&self) -> &Path {
        &self.local
    }

    fn transition(&self, next: SessionState) {
        let mut progress = self.progress.lock().unwrap();
        debug!(
            "Session of {} on {}: {} -> {}",
            self.lock.participant(),
            self.remote,
            progress.state,
            next
        );
        progress.enter(next);
    }

    /// Run `work` against the synchronized local file while holding the lock.
    pub async fn run<F, Fut, T, E>(&mut self, work: F) -> Result<T, E>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<StorageError>,
    {
        if self.state() != SessionState::Idle {
            return Err(StorageError::SessionReleased.into());
        }

        let mut guard = ReleaseGuard {
            ticket: TicketGuard::new(self.lock.namespace(), self.lock.participant()),
            progress: Arc::clone(&self.progress),
        };

        self.transition(SessionState::Acquiring);
        if let Err(e) = self.lock.acquire().await {
            let _ = self.release_lock(&mut guard).await;
            return Err(e.into());
        }

        self.transition(SessionState::Syncing);
        let before = match self.sync().await {
            Ok(digest) => digest,
            Err(e) => {
                let _ = self.release_lock(&mut guard).await;
                return Err(e.into());
            }
        };

        self.transition(SessionState::Active);
        let outcome = match AssertUnwindSafe(work(self.local.clone()))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                error!(
                    "Work of {} on {} panicked, releasing lock without pushing",
                    self.lock.participant(),
                    self.remote
                );
                let _ = self.release_lock(&mut guard).await;
                std::panic::resume_unwind(panic);
            }
        };

        let push_result = match file_digest(&self.local).await {
            Ok(after) if after != before => {
                self.transition(SessionState::Publishing);
                self.cache.push(&self.remote, &self.local).await.map(|_| ())
            }
            Ok(_) => {
                debug!("{} unchanged, nothing to push", self.local.display());
                Ok(())
            }
            Err(e) => Err(e),
        };
        let release_result = self.release_lock(&mut guard).await;

        match outcome {
            Err(e) => {
                match (push_result, release_result) {
                    (Ok(()), Ok(())) => {}
                    (Err(push_err), Ok(())) => {
                        error!("Push after failed work also failed: {}", push_err);
                    }
                    (Ok(()), Err(release_err)) => {
                        error!(
                            "Release after failed work also failed, other writers stay blocked: {}",
                            release_err
                        );
                    }
                    (Err(push_err), Err(release_err)) => {
                        error!(
                            "Push after failed work failed ({}) and release failed ({}), other writers stay blocked",
                            push_err, release_err
                        );
                    }
                }
                Err(e)
            }
            Ok(value) => {
                push_result?;
                release_result?;
                Ok(value)
            }
        }
    }

    async fn sync(&self) -> Result<Option<String>, StorageError> {
        self.cache
            .warn_if_local_newer(&self.remote, &self.local)
            .await?;
        self.cache.pull_if_stale(&self.remote, &self.local).await?;
        file_digest(&self.local).await
    }

    async fn release_lock(&self, guard: &mut ReleaseGuard) -> Result<(), StorageError> {
        let result = self.lock.release().await;
        guard.disarm();
        if let Err(e) = &result {
            error!(
                "Failed to release lock of {}: {}; other writers stay blocked until it is released",
                self.lock.participant(),
                e
            );
        } else {
            info!("{} released {}", self.lock.participant(), self.remote);
        }
        self.transition(SessionState::Released);
        result
    }
}

/// Content digest of a local file, `None` if it does not exist.
async fn file_digest(path: &Path) -> Result<Option<String>, StorageError> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(content_version(&data))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::io(format!("Failed to read {}", path.display()), e)),
    }
}
