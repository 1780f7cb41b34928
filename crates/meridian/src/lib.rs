//! # Meridian
//!
//! Microservice runtime SDK over a subject-addressed message bus.
//!
//! Meridian gives a service process lifecycle management, RPC/event/command
//! messaging, service registration and discovery, and sticky-active leader
//! election, all over a shared bus and KV store. This provides:
//!
//! - **One messaging fabric** — RPC, events, and commands share one codec,
//!   one metrics namespace, and one subscription lifecycle
//! - **Self-healing registry** — a lost heartbeat record re-registers rather
//!   than failing the next heartbeat
//! - **Sticky-active election** — exactly one instance per group is active;
//!   RPC handlers can gate on it without touching election internals
//! - **Layered configuration** — defaults, project file, local override,
//!   environment, in one precedence order
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                             Service                                │
//! │  ┌────────────┐   ┌───────────────┐   ┌───────────────────────┐  │
//! │  │  Lifecycle │ → │ MessagingFabric│ → │  Registry / Discovery │  │
//! │  │ (state m.) │   │ (rpc/event/cmd)│   │  (heartbeat, select)  │  │
//! │  └────────────┘   └───────┬───────┘   └───────────┬───────────┘  │
//! │                           │                        │              │
//! │                    ┌──────┴──────┐          ┌──────┴───────┐     │
//! │                    │  MessageBus │          │    KvStore   │     │
//! │                    │ (NATS/mem)  │          │ (NATS KV/mem)│     │
//! │                    └─────────────┘          └──────┬───────┘     │
//! │                                                     │              │
//! │                                         ┌───────────┴──────────┐  │
//! │                                         │  ElectionCoordinator │  │
//! │                                         │  + HeartbeatMonitor  │  │
//! │                                         └──────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use meridian::{Service, ServiceBuilder, ServiceName, InstanceId, MethodName};
//!
//! let service = ServiceBuilder::new(
//!     ServiceName::new("orders")?,
//!     InstanceId::new("orders-1")?,
//!     bus,
//!     metrics,
//! )
//! .with_registry(registry)
//! .build();
//!
//! service.register_rpc_handler(
//!     MethodName::new("get_order")?,
//!     std::sync::Arc::new(|request| Box::pin(async move {
//!         Ok(serde_json::json!({ "order_id": request.params.get("id") }))
//!     })),
//! )?;
//!
//! service.start().await?;
//! ```
//!
//! # Modules
//!
//! - **Service base**: [`Service`], [`ServiceBuilder`], [`ServiceConfig`] — lifecycle, handlers, heartbeat
//! - **Sticky-active**: [`SingleActiveService`] — election-gated exclusive RPC
//! - **Re-exported ports**: messaging, KV, registry, discovery, election, metrics, wire codec

mod error;
mod service;
mod single_active;

// SDK Layer - Main API
pub use error::{Result, ServiceError};
pub use service::{Service, ServiceBuilder, ServiceConfig};
pub use single_active::SingleActiveService;

// Re-export value objects and messages from meridian-types
pub use meridian_types::{
    Command, Event, EventType, InstanceId, IllegalLifecycleTransition, LifecycleState, MethodName, Priority,
    RpcErrorCode, RpcRequest, RpcResponse, ServiceInstance, ServiceName, ServiceStatus, StickyActiveStatus,
};

// Re-export election domain types
pub use meridian_election::{ElectionCoordinator, ElectionRepository, FailoverPolicy, HeartbeatMonitor, MonitorConfig};
pub use meridian_types::{ElectionEvent, ElectionStatus, LeaderRecord, StickyActiveElection};

// Re-export messaging fabric and bus port
pub use meridian_bus::{CommandHandler, DeliveryMode, EventHandler, JetStreamSubscribeOptions, MessageBus, MessagingFabric, RpcHandler};

// Re-export registry and discovery
pub use meridian_discovery::{BasicDiscovery, CachedDiscovery, SelectionStrategy, ServiceDiscovery, WatchableCachedDiscovery};
pub use meridian_registry::ServiceRegistry;

// Re-export the KV port
pub use meridian_kv::{KvStatus, KvStore};
pub use meridian_types::{KvEntry, KvOperation, KvOptions, KvWatchEvent};

// Re-export metrics
pub use meridian_metrics::{InMemoryMetrics, MetricsSink, MetricsSnapshot, SummaryStats};

// Re-export the wire codec
pub use meridian_wire::{Format, WireError};
