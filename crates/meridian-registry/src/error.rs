//! Service registry errors.

use thiserror::Error;

/// Errors raised by [`crate::ServiceRegistry`] operations.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The underlying KV store rejected an operation.
    #[error("registry kv error during {operation}: {source}")]
    Kv {
        operation: &'static str,
        #[source]
        source: meridian_kv::KvError,
    },

    /// A stored registry record failed to deserialize.
    #[error("registry record for {key} is corrupt: {source}")]
    CorruptRecord {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// The instance's `service_name` field is not a valid [`meridian_types::ServiceName`].
    #[error("instance carries an invalid service name '{0}'")]
    InvalidServiceName(String),
}

/// Convenience alias for results bounded by [`RegistryError`].
pub type Result<T> = std::result::Result<T, RegistryError>;
