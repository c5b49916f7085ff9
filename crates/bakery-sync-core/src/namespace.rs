use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::error::StorageError;
use crate::store::ObjectStore;

/// Separator between participant ids in the priorities list.
pub(crate) const PRIORITY_SEPARATOR: char = '*';

/// The shared keys of one lock's participant pool.
///
/// Layout under `prefix`:
/// ```text
/// exclusion/priorities                -> "alice*bob*carol"
/// exclusion/numbers/{participant}     -> ticket, "0" when idle
/// exclusion/entering/{participant}    -> "0" | "1"
/// ```
///
/// A namespace is a plain value: every lock operation takes it explicitly,
/// nothing about the participant pool is cached between calls.
#[derive(Clone)]
pub struct LockNamespace {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl fmt::Debug for LockNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockNamespace")
            .field("backend", &self.store.backend_name())
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl LockNamespace {
    /// Create a namespace rooted at `prefix` (may be empty).
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_matches('/').to_string();
        Self { store, prefix }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, suffix: &str) -> String {
        if self.prefix.is_empty() {
            format!("exclusion/{}", suffix)
        } else {
            format!("{}/exclusion/{}", self.prefix, suffix)
        }
    }

    pub fn priorities_key(&self) -> String {
        self.key("priorities")
    }

    pub fn number_key(&self, participant: &str) -> String {
        self.key(&format!("numbers/{}", participant))
    }

    pub fn entering_key(&self, participant: &str) -> String {
        self.key(&format!("entering/{}", participant))
    }

    /// Read the current participant list. Empty if nobody joined yet.
    pub async fn participants(&self) -> Result<Participants, StorageError> {
        let participants = match self.store.get(&self.priorities_key()).await? {
            Some(raw) => Participants::parse(&String::from_utf8_lossy(&raw)),
            None => Participants::default(),
        };

        let duplicates = participants.duplicates();
        if !duplicates.is_empty() {
            warn!(
                "Priorities list in namespace '{}' has duplicate entries {:?}; concurrent joins raced",
                self.prefix, duplicates
            );
        }
        Ok(participants)
    }

    /// Read a participant's ticket. A missing key counts as idle.
    pub async fn read_number(&self, participant: &str) -> Result<u64, StorageError> {
        let key = self.number_key(participant);
        match self.store.get(&key).await? {
            None => Ok(0),
            Some(raw) => {
                let text = String::from_utf8_lossy(&raw);
                text.trim()
                    .parse::<u64>()
                    .map_err(|_| StorageError::CorruptState {
                        key,
                        value: text.into_owned(),
                    })
            }
        }
    }

    pub async fn write_number(&self, participant: &str, ticket: u64) -> Result<(), StorageError> {
        self.store
            .set(&self.number_key(participant), ticket.to_string().as_bytes())
            .await
    }

    /// Read a participant's entering flag. A missing key counts as false.
    pub async fn read_entering(&self, participant: &str) -> Result<bool, StorageError> {
        let key = self.entering_key(participant);
        match self.store.get(&key).await? {
            None => Ok(false),
            Some(raw) => match String::from_utf8_lossy(&raw).trim() {
                "0" => Ok(false),
                "1" => Ok(true),
                other => Err(StorageError::CorruptState {
                    key,
                    value: other.to_string(),
                }),
            },
        }
    }

    pub async fn write_entering(
        &self,
        participant: &str,
        entering: bool,
    ) -> Result<(), StorageError> {
        let flag: &[u8] = if entering { b"1" } else { b"0" };
        self.store.set(&self.entering_key(participant), flag).await
    }
}

/// Check that a participant id can be stored in the namespace layout.
pub(crate) fn validate_participant(participant: &str) -> Result<(), StorageError> {
    if participant.is_empty()
        || participant.contains(PRIORITY_SEPARATOR)
        || participant.contains('/')
        || participant.trim() != participant
    {
        return Err(StorageError::InvalidArgument(format!(
            "Invalid participant id {:?}: must be non-empty without '*', '/' or surrounding spaces",
            participant
        )));
    }
    Ok(())
}

/// Ordered participant ids; the index of an id is its priority.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Participants {
    ids: Vec<String>,
}

impl Participants {
    /// Parse a `*`-delimited priorities list.
    pub fn parse(raw: &str) -> Self {
        let ids = raw
            .split(PRIORITY_SEPARATOR)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Self { ids }
    }

    pub fn encode(&self) -> String {
        self.ids.join(&PRIORITY_SEPARATOR.to_string())
    }

    /// The list with `participant` appended.
    pub fn with_appended(&self, participant: &str) -> Self {
        let mut ids = self.ids.clone();
        ids.push(participant.to_string());
        Self { ids }
    }

    /// Priority (first index) of a participant.
    pub fn priority_of(&self, participant: &str) -> Option<usize> {
        self.ids.iter().position(|id| id == participant)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Ids in priority order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }

    /// Ids that appear more than once.
    pub fn duplicates(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        let mut dups = Vec::new();
        for id in &self.ids {
            if !seen.insert(id.as_str()) && !dups.contains(&id.as_str()) {
                dups.push(id.as_str());
            }
        }
        dups
    }
}
