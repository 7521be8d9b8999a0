//! # KV Store Errors

use thiserror::Error;

/// Result type for KV store operations
pub type KvResult<T> = Result<T, KvError>;

/// KV store errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    /// Expire or lookup on a key that is not stored
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// A bucket lock was poisoned by a panicking writer
    #[error("lock poisoned: {0}")]
    Poisoned(&'static str),
}
