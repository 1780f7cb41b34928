//! Service discovery (C8): query the registry, apply a selection strategy,
//! and optionally wrap the result in a TTL cache with KV-watch invalidation.

pub mod cache;
pub mod error;
pub mod watch;

pub use cache::CachedDiscovery;
pub use error::{DiscoveryError, Result};
pub use watch::{WatchableCachedDiscovery, WatchableConfig};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use meridian_registry::ServiceRegistry;
use meridian_types::{ServiceInstance, ServiceName};
use rand::Rng;

/// How [`ServiceDiscovery::select_instance`] picks among healthy candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// A per-service monotonic counter, mod the candidate count.
    RoundRobin,
    /// A uniformly-random candidate.
    Random,
    /// The candidate matching `preferred_id`, falling back to the first.
    Sticky,
}

/// The narrow port application code calls to find a healthy instance of a
/// service.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Lists instances of `service`, optionally filtered to healthy ones
    /// (§3's `is_healthy` rule).
    async fn discover_instances(&self, service: &ServiceName, only_healthy: bool) -> Result<Vec<ServiceInstance>>;

    /// Picks one instance of `service` using `strategy`.
    ///
    /// Returns `Ok(None)` if no healthy instance exists; callers that need
    /// an error (e.g. an RPC client) should use [`require`] on the result.
    async fn select_instance(
        &self,
        service: &ServiceName,
        strategy: SelectionStrategy,
        preferred_id: Option<&str>,
    ) -> Result<Option<ServiceInstance>>;
}

/// Converts a `select_instance` miss into [`DiscoveryError::NoInstancesAvailable`].
pub fn require(found: Option<ServiceInstance>, service: &ServiceName) -> Result<ServiceInstance> {
    found.ok_or_else(|| DiscoveryError::NoInstancesAvailable(service.as_str().to_string()))
}

/// Applies `strategy` to `instances`, advancing `round_robin_counter` as a
/// side effect when `strategy` is [`SelectionStrategy::RoundRobin`].
///
/// Shared by [`BasicDiscovery`] and [`cache::CachedDiscovery`] so both keep
/// their own per-service counter state but agree on the selection rule.
pub fn select(
    instances: &[ServiceInstance],
    strategy: SelectionStrategy,
    preferred_id: Option<&str>,
    round_robin_counter: &mut usize,
) -> Option<ServiceInstance> {
    if instances.is_empty() {
        return None;
    }
    match strategy {
        SelectionStrategy::RoundRobin => {
            let idx = *round_robin_counter % instances.len();
            *round_robin_counter = round_robin_counter.wrapping_add(1);
            Some(instances[idx].clone())
        }
        SelectionStrategy::Random => {
            let idx = rand::thread_rng().gen_range(0..instances.len());
            Some(instances[idx].clone())
        }
        SelectionStrategy::Sticky => Some(
            preferred_id
                .and_then(|pref| instances.iter().find(|i| i.instance_id == pref))
                .cloned()
                .unwrap_or_else(|| instances[0].clone()),
        ),
    }
}

/// Discovery backed directly by the [`ServiceRegistry`], with no caching.
pub struct BasicDiscovery {
    registry: Arc<ServiceRegistry>,
    heartbeat_timeout: Duration,
    round_robin: Mutex<HashMap<String, usize>>,
}

impl BasicDiscovery {
    /// Builds a discovery port over `registry`, treating an instance as
    /// unhealthy once its heartbeat is older than `heartbeat_timeout`
    /// (default 30s, §3).
    pub fn new(registry: Arc<ServiceRegistry>, heartbeat_timeout: Duration) -> Self {
        Self {
            registry,
            heartbeat_timeout,
            round_robin: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ServiceDiscovery for BasicDiscovery {
    async fn discover_instances(&self, service: &ServiceName, only_healthy: bool) -> Result<Vec<ServiceInstance>> {
        let instances = self.registry.list_instances(service).await?;
        if !only_healthy {
            return Ok(instances);
        }
        let now = chrono::Utc::now();
        let timeout = chrono::Duration::from_std(self.heartbeat_timeout).unwrap_or(chrono::Duration::seconds(30));
        Ok(instances.into_iter().filter(|i| i.is_healthy(now, timeout)).collect())
    }

    async fn select_instance(
        &self,
        service: &ServiceName,
        strategy: SelectionStrategy,
        preferred_id: Option<&str>,
    ) -> Result<Option<ServiceInstance>> {
        let instances = self.discover_instances(service, true).await?;
        let mut round_robin = self.round_robin.lock().expect("round robin lock poisoned");
        let counter = round_robin.entry(service.as_str().to_string()).or_insert(0);
        Ok(select(&instances, strategy, preferred_id, counter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_kv::InMemoryKvStore;

    async fn discovery_with(instances: &[(&str, &str)]) -> BasicDiscovery {
        let kv = InMemoryKvStore::new();
        kv.connect("discovery-test").await.unwrap();
        let registry = Arc::new(ServiceRegistry::new(Arc::new(kv)));
        for (service, instance) in instances {
            registry
                .register(&ServiceInstance::new(*service, *instance), 30)
                .await
                .unwrap();
        }
        BasicDiscovery::new(registry, Duration::from_secs(30))
    }

    fn svc() -> ServiceName {
        ServiceName::new("svc1").unwrap()
    }

    #[tokio::test]
    async fn discover_instances_finds_healthy_members() {
        let d = discovery_with(&[("svc1", "a"), ("svc1", "b")]).await;
        let found = d.discover_instances(&svc(), true).await.unwrap();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn round_robin_cycles_through_instances() {
        let d = discovery_with(&[("svc1", "a"), ("svc1", "b")]).await;
        let first = d.select_instance(&svc(), SelectionStrategy::RoundRobin, None).await.unwrap().unwrap();
        let second = d.select_instance(&svc(), SelectionStrategy::RoundRobin, None).await.unwrap().unwrap();
        let third = d.select_instance(&svc(), SelectionStrategy::RoundRobin, None).await.unwrap().unwrap();
        assert_ne!(first.instance_id, second.instance_id);
        assert_eq!(first.instance_id, third.instance_id);
    }

    #[tokio::test]
    async fn sticky_prefers_named_instance() {
        let d = discovery_with(&[("svc1", "a"), ("svc1", "b")]).await;
        let chosen = d
            .select_instance(&svc(), SelectionStrategy::Sticky, Some("b"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chosen.instance_id, "b");
    }

    #[tokio::test]
    async fn select_instance_on_empty_service_returns_none() {
        let d = discovery_with(&[]).await;
        let chosen = d.select_instance(&svc(), SelectionStrategy::Random, None).await.unwrap();
        assert!(chosen.is_none());
        assert!(require(chosen, &svc()).is_err());
    }
}
