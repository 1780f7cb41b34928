//! Service discovery errors.

use thiserror::Error;

/// Errors raised by [`crate::ServiceDiscovery`] implementations.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// The registry lookup backing discovery failed.
    #[error("registry lookup failed: {0}")]
    Registry(#[from] meridian_registry::RegistryError),

    /// `select_instance` was asked to choose among zero candidates.
    #[error("no healthy instances available for service '{0}'")]
    NoInstancesAvailable(String),
}

/// Convenience alias for results bounded by [`DiscoveryError`].
pub type Result<T> = std::result::Result<T, DiscoveryError>;
