//! Filesystem backend for bakery-sync.
//!
//! Object keys map to files under a root directory, so a shared network
//! mount (or a plain local directory for a single machine) can host both the
//! shared file and its lock namespace.

mod lock;
mod storage;

pub use storage::LocalStore;
