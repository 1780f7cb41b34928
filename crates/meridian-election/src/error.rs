//! Election errors.

use thiserror::Error;

/// Errors raised by [`crate::ElectionRepository`] and
/// [`crate::ElectionCoordinator`].
#[derive(Error, Debug)]
pub enum ElectionError {
    /// The underlying KV store rejected an operation.
    #[error("election kv error during {operation}: {source}")]
    Kv {
        operation: &'static str,
        #[source]
        source: meridian_kv::KvError,
    },

    /// A stored leader record or election-state aggregate failed to deserialize.
    #[error("election record for {key} is corrupt: {source}")]
    CorruptRecord {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// `release_leadership` or `update_leadership` was attempted by an
    /// instance that does not currently hold the leader key.
    #[error("instance '{instance_id}' does not hold leadership for service '{service}' group '{group}'")]
    NotLeader {
        service: String,
        group: String,
        instance_id: String,
    },

    /// [`crate::ElectionCoordinator::start_election`] exhausted its retry
    /// budget without acquiring leadership.
    #[error("election for service '{service}' group '{group}' failed after {attempts} attempts")]
    ElectionFailed {
        service: String,
        group: String,
        attempts: u32,
    },

    /// The registry update that should accompany an election outcome failed.
    #[error("registry update after election outcome failed: {0}")]
    Registry(#[from] meridian_registry::RegistryError),
}

/// Convenience alias for results bounded by [`ElectionError`].
pub type Result<T> = std::result::Result<T, ElectionError>;
