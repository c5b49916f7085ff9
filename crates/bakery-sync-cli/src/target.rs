use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use bakery_sync_core::{content_version, LockNamespace, ObjectStore};
use bakery_sync_local::LocalStore;
use bakery_sync_s3::{parse_uri, S3Store};
use tracing::info;

/// Where the shared file lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteLocation {
    /// A file on a shared filesystem; keys are relative to its directory.
    Local { root: PathBuf, key: String },
    S3 { bucket: String, key: String },
}

impl RemoteLocation {
    pub fn parse(remote: &str) -> anyhow::Result<Self> {
        if remote.starts_with("s3://") || remote.starts_with("r2://") {
            let (bucket, key) =
                parse_uri(remote).with_context(|| format!("Invalid object URI: {}", remote))?;
            if key.is_empty() || key.ends_with('/') {
                bail!("Object URI {} does not name a file", remote);
            }
            return Ok(RemoteLocation::S3 { bucket, key });
        }
        if remote.contains("://") {
            bail!("Unsupported remote scheme: {}", remote);
        }

        let path = Path::new(remote);
        let key = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("Remote path {} does not name a file", remote))?;
        let root = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Ok(RemoteLocation::Local { root, key })
    }

    pub fn key(&self) -> &str {
        match self {
            RemoteLocation::Local { key, .. } | RemoteLocation::S3 { key, .. } => key,
        }
    }

    /// Directory part of the key, used as the default namespace prefix.
    pub fn default_namespace(&self) -> String {
        self.key()
            .rsplit_once('/')
            .map(|(dir, _)| dir.to_string())
            .unwrap_or_default()
    }

    /// Path of the local copy under `cache_dir`.
    ///
    /// Local remotes are keyed by a digest of their directory so that two
    /// shared files with the same name do not share a copy.
    pub fn cache_path(&self, cache_dir: &Path) -> PathBuf {
        match self {
            RemoteLocation::Local { root, key } => {
                let root_id = content_version(root.to_string_lossy().as_bytes());
                cache_dir.join("local").join(&root_id[..16]).join(key)
            }
            RemoteLocation::S3 { bucket, key } => cache_dir.join("s3").join(bucket).join(key),
        }
    }

    pub async fn open_store(&self, s3_endpoint: Option<String>) -> Arc<dyn ObjectStore> {
        match self {
            RemoteLocation::Local { root, .. } => {
                info!("  Backend: local ({})", root.display());
                Arc::new(LocalStore::new(root))
            }
            RemoteLocation::S3 { bucket, .. } => {
                info!("  Backend: s3 (bucket {})", bucket);
                Arc::new(S3Store::from_env(bucket.clone(), s3_endpoint).await)
            }
        }
    }
}

/// Everything a command needs to reach the shared file.
pub struct Target {
    pub store: Arc<dyn ObjectStore>,
    pub namespace: LockNamespace,
    pub remote_key: String,
    pub local_path: PathBuf,
}

impl Target {
    pub async fn resolve(
        remote: &str,
        namespace: Option<&str>,
        cache_dir: &Path,
        s3_endpoint: Option<String>,
    ) -> anyhow::Result<Self> {
        let location = RemoteLocation::parse(remote)?;
        let store = location.open_store(s3_endpoint).await;
        let prefix = namespace
            .map(str::to_string)
            .unwrap_or_else(|| location.default_namespace());

        Ok(Self {
            namespace: LockNamespace::new(Arc::clone(&store), prefix),
            remote_key: location.key().to_string(),
            local_path: location.cache_path(cache_dir),
            store,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_local_path() {
        let location = RemoteLocation::parse("/shared/lab/instance.db").unwrap();
        assert_eq!(
            location,
            RemoteLocation::Local {
                root: PathBuf::from("/shared/lab"),
                key: "instance.db".into()
            }
        );
        assert_eq!(location.default_namespace(), "");

        let bare = RemoteLocation::parse("instance.db").unwrap();
        assert_eq!(
            bare,
            RemoteLocation::Local {
                root: PathBuf::from("."),
                key: "instance.db".into()
            }
        );
    }

    #[test]
    fn test_parse_object_uri() {
        let location = RemoteLocation::parse("s3://bucket/labs/main/instance.db").unwrap();
        assert_eq!(
            location,
            RemoteLocation::S3 {
                bucket: "bucket".into(),
                key: "labs/main/instance.db".into()
            }
        );
        assert_eq!(location.default_namespace(), "labs/main");

        let r2 = RemoteLocation::parse("r2://bucket/instance.db").unwrap();
        assert_eq!(r2.default_namespace(), "");
    }

    #[test]
    fn test_parse_rejects_bad_remotes() {
        assert!(RemoteLocation::parse("s3://bucket").is_err());
        assert!(RemoteLocation::parse("s3://bucket/dir/").is_err());
        assert!(RemoteLocation::parse("s3:///key").is_err());
        assert!(RemoteLocation::parse("gs://bucket/key").is_err());
        assert!(RemoteLocation::parse("/").is_err());
    }

    #[test]
    fn test_cache_paths() {
        let cache = Path::new("/cache");
        let s3 = RemoteLocation::parse("s3://bucket/labs/instance.db").unwrap();
        assert_eq!(
            s3.cache_path(cache),
            PathBuf::from("/cache/s3/bucket/labs/instance.db")
        );

        let a = RemoteLocation::parse("/mnt/a/instance.db").unwrap();
        let b = RemoteLocation::parse("/mnt/b/instance.db").unwrap();
        assert_ne!(a.cache_path(cache), b.cache_path(cache));
        assert!(a.cache_path(cache).ends_with("instance.db"));
        assert!(a.cache_path(cache).starts_with("/cache/local"));
    }

    #[tokio::test]
    async fn test_resolve_local_target() {
        let shared = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let remote = shared.path().join("instance.db");

        let target = Target::resolve(remote.to_str().unwrap(), Some("locks"), cache.path(), None)
            .await
            .unwrap();

        assert_eq!(target.store.backend_name(), "local");
        assert_eq!(target.remote_key, "instance.db");
        assert_eq!(target.namespace.prefix(), "locks");
        assert_eq!(
            target.namespace.priorities_key(),
            "locks/exclusion/priorities"
        );
        assert!(target.local_path.starts_with(cache.path()));
    }
}
