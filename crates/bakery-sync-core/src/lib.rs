//! Core types for coordinating multiple writers of one shared file.
//!
//! The shared file lives in a storage backend that may offer no locking at
//! all, so coordination is built from plain object reads and writes:
//! - `ObjectStore`: uniform key/bytes access to a backend
//! - `LockNamespace` + `BakeryLock`: Lamport's bakery algorithm over the store
//! - `FileCache`: keeps a local copy of the remote file coherent
//! - `CoordinatedSession`: lock, sync, mutate, publish, release

mod bakery;
mod cache;
mod error;
mod memory;
mod namespace;
mod session;
mod store;

pub use bakery::{acquire, join, release, AcquireOptions, BakeryLock};
pub use cache::{FileCache, PullOutcome, SyncStamp};
pub use error::StorageError;
pub use memory::MemoryStore;
pub use namespace::{LockNamespace, Participants};
pub use session::{CoordinatedSession, SessionState};
pub use store::{
    content_version, replace_file, temp_path_for, ObjectMeta, ObjectStore, VersionedObject,
    WriteOutcome, WritePrecondition,
};
