//! Sticky-active leader election (C9/C10/C11): an atomic-CAS repository
//! over the leader key, a coordinator that runs bounded jittered election
//! attempts and keeps the registry in sync, and a heartbeat monitor that
//! watches for a stale leader and triggers re-election.

pub mod coordinator;
pub mod error;
pub mod monitor;
pub mod repository;

pub use coordinator::{ElectionCoordinator, FailoverPolicy};
pub use error::{ElectionError, Result};
pub use monitor::{HeartbeatMonitor, MonitorConfig};
pub use repository::{ElectionRepository, LeadershipEvent, LeadershipEventKind, LeadershipWatchStream};
