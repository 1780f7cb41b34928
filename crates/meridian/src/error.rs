//! Errors raised by the service base (C12) and the single-active wrapper (C13).

use meridian_types::{IllegalLifecycleTransition, LifecycleState, ValidationError};
use thiserror::Error;

/// Errors raised constructing, starting, stopping, or calling through a
/// [`crate::Service`] or [`crate::SingleActiveService`].
#[derive(Error, Debug)]
pub enum ServiceError {
    /// An illegal `LifecycleState` transition was attempted.
    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] IllegalLifecycleTransition),

    /// A handler was registered after the service left `INITIALIZING`/`STARTING`.
    #[error("cannot register a handler while the service is {0:?}; handlers may only be added during INITIALIZING or STARTING")]
    HandlerRegistrationAfterStart(LifecycleState),

    /// A constructed message (RPC request, event, or command) failed field validation.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The underlying bus rejected an operation.
    #[error("bus error: {0}")]
    Bus(#[from] meridian_bus::BusError),

    /// The underlying KV store rejected an operation.
    #[error("kv error: {0}")]
    Kv(#[from] meridian_kv::KvError),

    /// The service registry rejected an operation.
    #[error("registry error: {0}")]
    Registry(#[from] meridian_registry::RegistryError),

    /// Service discovery rejected a lookup.
    #[error("discovery error: {0}")]
    Discovery(#[from] meridian_discovery::DiscoveryError),

    /// Leader election rejected an operation.
    #[error("election error: {0}")]
    Election(#[from] meridian_election::ElectionError),

    /// [`crate::Service::call_rpc`] was asked to route to a named service
    /// with no healthy instance registered.
    #[error("service '{0}' is unavailable: no healthy instance registered")]
    ServiceUnavailable(String),

    /// `start()` was called on a service with no bus/registry wiring that
    /// the requested operation depends on.
    #[error("{0} requires discovery to be configured")]
    DiscoveryNotConfigured(&'static str),
}

/// Convenience alias for results bounded by [`ServiceError`].
pub type Result<T> = std::result::Result<T, ServiceError>;
