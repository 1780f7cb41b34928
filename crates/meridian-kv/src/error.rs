//! KV store errors (§7 "KV errors").

use thiserror::Error;

/// Errors raised by a [`crate::KvStore`] implementation.
#[derive(Error, Debug)]
pub enum KvError {
    /// An operation was attempted before [`crate::KvStore::connect`] succeeded.
    #[error("kv store not connected")]
    NotConnected,

    /// `create_only` put failed because the key already existed.
    #[error("key already exists: {key}")]
    KeyAlreadyExists { key: String },

    /// `update_only` or a revision-checked put/delete did not match the
    /// stored revision.
    #[error("revision mismatch for key {key}: expected {expected}, found {found}")]
    RevisionMismatch {
        key: String,
        expected: u64,
        found: u64,
    },

    /// `update_only` was requested but the key does not exist.
    #[error("key does not exist for update_only: {key}")]
    KeyNotFound { key: String },

    /// A per-message TTL was requested against a bucket/backend that does
    /// not support it.
    #[error("per-message TTL is not supported by this kv backend")]
    TtlNotSupported,

    /// `watch` was called with both `key` and `prefix` set.
    #[error("watch accepts a key or a prefix, not both")]
    WatchKeyAndPrefix,

    /// The underlying bus/bucket rejected the operation.
    #[error("kv backend error: {0}")]
    Backend(String),

    /// A value could not be serialized or deserialized.
    #[error("kv value (de)serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias for results bounded by [`KvError`].
pub type Result<T> = std::result::Result<T, KvError>;
