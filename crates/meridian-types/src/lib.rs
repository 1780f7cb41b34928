//! Core value objects, wire message DTOs, and subject vocabulary shared by
//! every layer of the Meridian runtime.
//!
//! Nothing in this crate touches I/O: it is the leaf of the dependency
//! graph, imported by every other `meridian-*` crate.

pub mod election;
pub mod error;
pub mod kv;
pub mod lifecycle;
pub mod messages;
pub mod patterns;
pub mod registry;
pub mod value_objects;

pub use election::{ElectionEvent, ElectionStatus, IllegalTransition, LeaderRecord, StickyActiveElection};
pub use error::{Result, ValidationError};
pub use kv::{KvEntry, KvOperation, KvOptions, KvWatchEvent};
pub use lifecycle::{IllegalLifecycleTransition, LifecycleState};
pub use messages::{Command, Envelope, Event, RpcErrorCode, RpcRequest, RpcResponse};
pub use registry::{ServiceInstance, ServiceStatus, StickyActiveStatus};
pub use value_objects::{
    is_valid_semver, EventType, InstanceId, MethodName, Priority, SanitizedKey, ServiceName,
    KV_INVALID_CHARS,
};
