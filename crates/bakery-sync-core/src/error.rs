use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to a store or coordinating writers.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The backend could not be reached (network or credentials).
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported by {backend} backend: {operation}")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    /// A lock key holds a value that is not a ticket or flag.
    #[error("Corrupt lock state at {key}: {value:?}")]
    CorruptState { key: String, value: String },

    /// Two first-time participants raced on the priorities list.
    #[error("Join race in namespace {namespace}: {message}")]
    JoinRace { namespace: String, message: String },

    #[error("Lock wait for {participant} timed out after {waited:?}")]
    LockTimeout {
        participant: String,
        waited: Duration,
    },

    #[error("Lock wait for {0} cancelled")]
    Cancelled(String),

    #[error("Session already released")]
    SessionReleased,
}

impl StorageError {
    /// Wrap a local filesystem error with context.
    pub fn io(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        StorageError::Io(format!("{}: {}", context, err))
    }
}
