use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::store::{ObjectMeta, ObjectStore, VersionedObject, WriteOutcome, WritePrecondition};

#[derive(Debug, Clone)]
struct Entry {
    data: Vec<u8>,
    modified_at: DateTime<Utc>,
    generation: u64,
}

#[derive(Debug, Default)]
struct Inner {
    objects: HashMap<String, Entry>,
    generation: u64,
    last_modified: Option<DateTime<Utc>>,
    journal: Vec<String>,
}

impl Inner {
    /// Next modification time, strictly after the previous one by at least 1ms.
    fn next_modified_at(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_modified {
            Some(last) if now < last + chrono::Duration::milliseconds(1) => {
                last + chrono::Duration::milliseconds(1)
            }
            _ => now,
        };
        self.last_modified = Some(ts);
        ts
    }

    fn write(&mut self, key: &str, data: &[u8]) {
        self.generation += 1;
        let entry = Entry {
            data: data.to_vec(),
            modified_at: self.next_modified_at(),
            generation: self.generation,
        };
        self.objects.insert(key.to_string(), entry);
    }
}

/// In-process object store.
///
/// Every operation takes a single mutex, so the store is linearizable: this
/// is the strongest consistency a backend can offer and makes it suitable for
/// simulating many participants inside one test process. Versions are a
/// global generation counter, and modification times are strictly increasing.
///
/// Each call is recorded in a journal (`"get exclusion/priorities"`, ...)
/// so tests can assert which keys an algorithm touched.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    conditional_writes: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store with conditional write support.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            conditional_writes: true,
        }
    }

    /// Create an empty store that behaves like a backend without
    /// conditional writes.
    pub fn without_conditional_writes() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            conditional_writes: false,
        }
    }

    /// Read an object as UTF-8 text without journaling the access.
    pub fn get_text(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .objects
            .get(key)
            .map(|e| String::from_utf8_lossy(&e.data).into_owned())
    }

    /// All keys and their contents.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner
            .objects
            .iter()
            .map(|(k, e)| (k.clone(), e.data.clone()))
            .collect()
    }

    /// Operations performed so far, oldest first.
    pub fn journal(&self) -> Vec<String> {
        self.inner.lock().unwrap().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.inner.lock().unwrap().journal.clear();
    }

    fn record(inner: &mut Inner, op: &str, key: &str) {
        inner.journal.push(format!("{} {}", op, key));
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        Self::record(&mut inner, "get", key);
        Ok(inner.objects.get(key).map(|e| e.data.clone()))
    }

    async fn set(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        Self::record(&mut inner, "set", key);
        inner.write(key, data);
        Ok(())
    }

    async fn stat(&self, key: &str) -> Result<Option<ObjectMeta>, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        Self::record(&mut inner, "stat", key);
        Ok(inner.objects.get(key).map(|e| ObjectMeta {
            modified_at: e.modified_at,
            size_bytes: e.data.len() as u64,
            version: Some(e.generation.to_string()),
        }))
    }

    fn supports_conditional_writes(&self) -> bool {
        self.conditional_writes
    }

    async fn get_versioned(&self, key: &str) -> Result<Option<VersionedObject>, StorageError> {
        if !self.conditional_writes {
            return Err(StorageError::Unsupported {
                backend: self.backend_name(),
                operation: "get_versioned",
            });
        }
        let mut inner = self.inner.lock().unwrap();
        Self::record(&mut inner, "get_versioned", key);
        Ok(inner.objects.get(key).map(|e| VersionedObject {
            data: e.data.clone(),
            version: e.generation.to_string(),
        }))
    }

    async fn put_conditional(
        &self,
        key: &str,
        data: &[u8],
        precondition: &WritePrecondition,
    ) -> Result<WriteOutcome, StorageError> {
        if !self.conditional_writes {
            return Err(StorageError::Unsupported {
                backend: self.backend_name(),
                operation: "put_conditional",
            });
        }
        let mut inner = self.inner.lock().unwrap();
        Self::record(&mut inner, "put_conditional", key);

        let current = inner.objects.get(key).map(|e| e.generation.to_string());
        let holds = match (precondition, current) {
            (WritePrecondition::DoesNotExist, None) => true,
            (WritePrecondition::MatchesVersion(expected), Some(actual)) => *expected == actual,
            _ => false,
        };
        if !holds {
            return Ok(WriteOutcome::PreconditionFailed);
        }

        inner.write(key, data);
        Ok(WriteOutcome::Written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set_stat() {
        let store = MemoryStore::new();
        assert!(store.get("k").await.unwrap().is_none());
        assert!(!store.exists("k").await.unwrap());

        store.set("k", b"v1").await.unwrap();
        let first = store.stat("k").await.unwrap().unwrap();
        store.set("k", b"v22").await.unwrap();
        let second = store.stat("k").await.unwrap().unwrap();

        assert_eq!(store.get("k").await.unwrap().unwrap(), b"v22");
        assert_eq!(second.size_bytes, 3);
        assert!(second.modified_at > first.modified_at);
        assert_ne!(first.version, second.version);
    }

    #[tokio::test]
    async fn test_append_creates_and_extends() {
        let store = MemoryStore::new();
        store.append("list", b"alice").await.unwrap();
        store.append("list", b"*bob").await.unwrap();
        assert_eq!(store.get_text("list").unwrap(), "alice*bob");
    }

    #[tokio::test]
    async fn test_conditional_writes() {
        let store = MemoryStore::new();

        let outcome = store
            .put_conditional("k", b"a", &WritePrecondition::DoesNotExist)
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Written);

        let again = store
            .put_conditional("k", b"b", &WritePrecondition::DoesNotExist)
            .await
            .unwrap();
        assert_eq!(again, WriteOutcome::PreconditionFailed);

        let current = store.get_versioned("k").await.unwrap().unwrap();
        let stale = WritePrecondition::MatchesVersion("0".to_string());
        assert_eq!(
            store.put_conditional("k", b"c", &stale).await.unwrap(),
            WriteOutcome::PreconditionFailed
        );

        let fresh = WritePrecondition::MatchesVersion(current.version);
        assert_eq!(
            store.put_conditional("k", b"c", &fresh).await.unwrap(),
            WriteOutcome::Written
        );
        assert_eq!(store.get_text("k").unwrap(), "c");
    }

    #[tokio::test]
    async fn test_without_conditional_writes() {
        let store = MemoryStore::without_conditional_writes();
        assert!(!store.supports_conditional_writes());
        let err = store
            .put_conditional("k", b"a", &WritePrecondition::DoesNotExist)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_journal_records_operations() {
        let store = MemoryStore::new();
        store.set("a", b"1").await.unwrap();
        store.get("b").await.unwrap();
        assert_eq!(store.journal(), vec!["set a", "get b"]);
        store.clear_journal();
        assert!(store.journal().is_empty());
    }
}
