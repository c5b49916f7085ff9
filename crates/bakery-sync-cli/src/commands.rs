use std::path::PathBuf;
use std::process::ExitStatus;

use anyhow::{bail, Context};
use bakery_sync_core::{
    release, AcquireOptions, BakeryLock, CoordinatedSession, FileCache, PullOutcome,
};
use tracing::{info, warn};

use crate::target::Target;

/// Environment variable carrying the synchronized local path to `exec`.
pub const LOCAL_PATH_ENV: &str = "BAKERY_LOCAL_PATH";

pub async fn join(target: &Target, participant: &str) -> anyhow::Result<()> {
    let lock = BakeryLock::new(target.namespace.clone(), participant)?;
    let priority = lock.join().await?;
    println!("{} joined with priority {}", participant, priority);
    Ok(())
}

pub async fn pull(target: &Target) -> anyhow::Result<()> {
    let cache = FileCache::new(target.store.clone());
    match cache
        .pull_if_stale(&target.remote_key, &target.local_path)
        .await?
    {
        PullOutcome::Downloaded => println!("pulled {}", target.local_path.display()),
        PullOutcome::Fresh => println!("{} is up to date", target.local_path.display()),
    }
    Ok(())
}

/// Upload the local copy while holding the lock, so no session is
/// overwritten mid-flight.
pub async fn push(
    target: &Target,
    participant: &str,
    options: AcquireOptions,
) -> anyhow::Result<()> {
    let lock = BakeryLock::new(target.namespace.clone(), participant)?.with_options(options);
    let cache = FileCache::new(target.store.clone());
    let meta = lock
        .hold(|| cache.push(&target.remote_key, &target.local_path))
        .await?;
    println!(
        "pushed {} ({} bytes, modified {})",
        target.remote_key, meta.size_bytes, meta.modified_at
    );
    Ok(())
}

/// Upload the local copy without taking the lock.
pub async fn force_push(target: &Target) -> anyhow::Result<()> {
    warn!(
        "Pushing {} without the lock; a writer holding it may lose its changes",
        target.remote_key
    );
    let cache = FileCache::new(target.store.clone());
    let meta = cache.push(&target.remote_key, &target.local_path).await?;
    println!(
        "force-pushed {} ({} bytes, modified {})",
        target.remote_key, meta.size_bytes, meta.modified_at
    );
    Ok(())
}

pub async fn status(target: &Target) -> anyhow::Result<()> {
    let namespace = &target.namespace;
    let participants = namespace.participants().await?;

    println!("namespace: '{}'", namespace.prefix());
    if participants.is_empty() {
        println!("participants: none");
    } else {
        println!("participants:");
        for (priority, id) in participants.iter().enumerate() {
            let ticket = namespace.read_number(id).await?;
            let entering = namespace.read_entering(id).await?;
            let state = match (ticket, entering) {
                (0, false) => "idle".to_string(),
                (0, true) => "choosing".to_string(),
                (ticket, _) => format!("ticket {}", ticket),
            };
            println!("  [{}] {}: {}", priority, id, state);
        }
    }

    let cache = FileCache::new(target.store.clone());
    match target.store.stat(&target.remote_key).await? {
        None => println!("remote: {} does not exist", target.remote_key),
        Some(meta) => {
            println!(
                "remote: {} ({} bytes, modified {}, version {})",
                target.remote_key,
                meta.size_bytes,
                meta.modified_at,
                meta.version.as_deref().unwrap_or("-")
            );
            if !target.local_path.exists() {
                println!("local: {} not cached", target.local_path.display());
            } else if cache
                .is_stale(&target.remote_key, &target.local_path)
                .await?
            {
                println!("local: {} is stale", target.local_path.display());
            } else {
                println!("local: {} is up to date", target.local_path.display());
            }
        }
    }
    Ok(())
}

/// Reset a ticket to idle. Releasing another participant is a recovery
/// action for a writer that died while holding the lock.
pub async fn release_ticket(target: &Target, participant: &str) -> anyhow::Result<()> {
    release(&target.namespace, participant).await?;
    println!("released {}", participant);
    Ok(())
}

pub async fn exec(
    target: &Target,
    participant: &str,
    options: AcquireOptions,
    command: &[String],
) -> anyhow::Result<()> {
    let (program, args) = command
        .split_first()
        .context("exec needs a command to run")?;
    let program = program.clone();
    let args = args.to_vec();

    let lock = BakeryLock::new(target.namespace.clone(), participant)?.with_options(options);
    let cache = FileCache::new(target.store.clone());
    let mut session =
        CoordinatedSession::new(lock, cache, &target.remote_key, &target.local_path);

    session
        .run(|local: PathBuf| async move {
            info!("Running {} on {}", program, local.display());
            let status: ExitStatus = tokio::process::Command::new(&program)
                .args(&args)
                .env(LOCAL_PATH_ENV, &local)
                .status()
                .await
                .with_context(|| format!("Failed to start {}", program))?;
            if !status.success() {
                bail!("{} exited with {}", program, status);
            }
            Ok(())
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use bakery_sync_core::{LockNamespace, ObjectStore, StorageError};
    use bakery_sync_local::LocalStore;
    use tempfile::TempDir;

    async fn local_target(shared: &TempDir, cache: &TempDir) -> Target {
        let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(shared.path()));
        store.set("instance.db", b"v0\n").await.unwrap();
        Target {
            namespace: LockNamespace::new(Arc::clone(&store), ""),
            remote_key: "instance.db".into(),
            local_path: cache.path().join("instance.db"),
            store,
        }
    }

    fn fast() -> AcquireOptions {
        AcquireOptions::default()
            .with_backoff(Duration::from_millis(5), Duration::from_millis(20))
            .with_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_pull_then_push() {
        let shared = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let target = local_target(&shared, &cache).await;

        pull(&target).await.unwrap();
        assert_eq!(tokio::fs::read(&target.local_path).await.unwrap(), b"v0\n");

        tokio::fs::write(&target.local_path, b"v1\n").await.unwrap();
        push(&target, "alice", fast()).await.unwrap();
        assert_eq!(
            tokio::fs::read(shared.path().join("instance.db")).await.unwrap(),
            b"v1\n"
        );
        assert_eq!(target.namespace.read_number("alice").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_push_waits_for_lock_holder() {
        let shared = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let target = local_target(&shared, &cache).await;
        join(&target, "alice").await.unwrap();
        join(&target, "bob").await.unwrap();

        pull(&target).await.unwrap();
        tokio::fs::write(&target.local_path, b"bob\n").await.unwrap();

        let alice = BakeryLock::new(target.namespace.clone(), "alice").unwrap();
        alice.acquire().await.unwrap();

        let short = fast().with_timeout(Duration::from_millis(100));
        let err = push(&target, "bob", short).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::LockTimeout { .. })
        ));
        assert_eq!(
            tokio::fs::read(shared.path().join("instance.db")).await.unwrap(),
            b"v0\n"
        );
        assert_eq!(target.namespace.read_number("bob").await.unwrap(), 0);

        alice.release().await.unwrap();
        push(&target, "bob", fast()).await.unwrap();
        assert_eq!(
            tokio::fs::read(shared.path().join("instance.db")).await.unwrap(),
            b"bob\n"
        );
    }

    #[tokio::test]
    async fn test_force_push_ignores_lock() {
        let shared = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let target = local_target(&shared, &cache).await;
        join(&target, "alice").await.unwrap();
        join(&target, "bob").await.unwrap();
        pull(&target).await.unwrap();
        tokio::fs::write(&target.local_path, b"forced\n").await.unwrap();

        let alice = BakeryLock::new(target.namespace.clone(), "alice").unwrap();
        alice.acquire().await.unwrap();

        force_push(&target).await.unwrap();
        assert_eq!(
            tokio::fs::read(shared.path().join("instance.db")).await.unwrap(),
            b"forced\n"
        );
        assert_eq!(target.namespace.read_number("alice").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_release_override_clears_ticket() {
        let shared = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let target = local_target(&shared, &cache).await;

        join(&target, "alice").await.unwrap();
        target.namespace.write_number("alice", 7).await.unwrap();

        release_ticket(&target, "alice").await.unwrap();
        assert_eq!(target.namespace.read_number("alice").await.unwrap(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_publishes_changes() {
        let shared = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let target = local_target(&shared, &cache).await;
        join(&target, "alice").await.unwrap();
        join(&target, "bob").await.unwrap();

        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("echo v1 >> \"${}\"", LOCAL_PATH_ENV),
        ];
        let options = AcquireOptions::default()
            .with_backoff(Duration::from_millis(5), Duration::from_millis(20))
            .with_timeout(Duration::from_secs(5));
        exec(&target, "alice", options, &command).await.unwrap();

        assert_eq!(
            tokio::fs::read(shared.path().join("instance.db")).await.unwrap(),
            b"v0\nv1\n"
        );
        assert_eq!(target.namespace.read_number("alice").await.unwrap(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_failure_still_releases() {
        let shared = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let target = local_target(&shared, &cache).await;
        join(&target, "alice").await.unwrap();
        join(&target, "bob").await.unwrap();

        let command = vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()];
        let err = exec(&target, "alice", AcquireOptions::default(), &command)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("exited"));
        assert_eq!(target.namespace.read_number("alice").await.unwrap(), 0);
    }
}
