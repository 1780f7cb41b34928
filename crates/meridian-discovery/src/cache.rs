//! A TTL-and-LRU cache wrapping any [`ServiceDiscovery`].
//!
//! Discovery is on the hot path of every RPC call, so a registry round trip
//! per call is wasteful. Results are cached per `(service, only_healthy)`
//! key for a short TTL; on a backend failure, a stale cached entry is served
//! rather than propagating the error (§4.8: stale-but-alive beats unavailable).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use meridian_types::{ServiceInstance, ServiceName};
use tracing::warn;

use crate::{select, Result, SelectionStrategy, ServiceDiscovery};

/// Defaults per §6 `discovery.cache`.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

struct CacheEntry {
    instances: Vec<ServiceInstance>,
    cached_at: Instant,
}

/// Wraps an inner [`ServiceDiscovery`] with a TTL cache keyed by
/// `(service, only_healthy)`, evicting the least-recently-refreshed entry
/// once `max_entries` is exceeded.
pub struct CachedDiscovery {
    inner: Arc<dyn ServiceDiscovery>,
    ttl: Duration,
    max_entries: usize,
    cache: Mutex<HashMap<(String, bool), CacheEntry>>,
    round_robin: Mutex<HashMap<String, usize>>,
}

impl CachedDiscovery {
    /// Wraps `inner` with a cache of `ttl` freshness and room for
    /// `max_entries` distinct `(service, only_healthy)` pairs.
    pub fn new(inner: Arc<dyn ServiceDiscovery>, ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner,
            ttl,
            max_entries,
            cache: Mutex::new(HashMap::new()),
            round_robin: Mutex::new(HashMap::new()),
        }
    }

    /// Wraps `inner` with the §6 defaults (ttl=10s, max_entries=1000).
    pub fn with_defaults(inner: Arc<dyn ServiceDiscovery>) -> Self {
        Self::new(inner, DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }

    /// Drops every cached entry for `service`, regardless of the
    /// `only_healthy` flag. Called by [`crate::watch::WatchableCachedDiscovery`]
    /// when a registry watch observes a change.
    pub fn invalidate(&self, service: &str) {
        let mut cache = self.cache.lock().expect("discovery cache lock poisoned");
        cache.retain(|(cached_service, _), _| cached_service != service);
    }

    fn fresh(&self, entry: &CacheEntry) -> bool {
        entry.cached_at.elapsed() < self.ttl
    }

    fn evict_oldest_if_full(&self, cache: &mut HashMap<(String, bool), CacheEntry>) {
        if cache.len() < self.max_entries {
            return;
        }
        if let Some(oldest_key) = cache
            .iter()
            .min_by_key(|(_, entry)| entry.cached_at)
            .map(|(key, _)| key.clone())
        {
            cache.remove(&oldest_key);
        }
    }
}

#[async_trait]
impl ServiceDiscovery for CachedDiscovery {
    async fn discover_instances(&self, service: &ServiceName, only_healthy: bool) -> Result<Vec<ServiceInstance>> {
        let cache_key = (service.as_str().to_string(), only_healthy);

        if let Some(entry) = self.cache.lock().expect("discovery cache lock poisoned").get(&cache_key) {
            if self.fresh(entry) {
                return Ok(entry.instances.clone());
            }
        }

        match self.inner.discover_instances(service, only_healthy).await {
            Ok(instances) => {
                let mut cache = self.cache.lock().expect("discovery cache lock poisoned");
                self.evict_oldest_if_full(&mut cache);
                cache.insert(
                    cache_key,
                    CacheEntry {
                        instances: instances.clone(),
                        cached_at: Instant::now(),
                    },
                );
                Ok(instances)
            }
            Err(err) => {
                let cache = self.cache.lock().expect("discovery cache lock poisoned");
                if let Some(entry) = cache.get(&cache_key) {
                    warn!(service = %service, error = %err, "discovery backend failed, serving stale cache entry");
                    return Ok(entry.instances.clone());
                }
                Err(err)
            }
        }
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
    use meridian_registry::ServiceRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDiscovery {
        inner: crate::BasicDiscovery,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ServiceDiscovery for CountingDiscovery {
        async fn discover_instances(&self, service: &ServiceName, only_healthy: bool) -> Result<Vec<ServiceInstance>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.discover_instances(service, only_healthy).await
        }

        async fn select_instance(
            &self,
            service: &ServiceName,
            strategy: SelectionStrategy,
            preferred_id: Option<&str>,
        ) -> Result<Option<ServiceInstance>> {
            self.inner.select_instance(service, strategy, preferred_id).await
        }
    }

    async fn counting_discovery() -> Arc<CountingDiscovery> {
        let kv = InMemoryKvStore::new();
        kv.connect("cache-test").await.unwrap();
        let registry = Arc::new(ServiceRegistry::new(Arc::new(kv)));
        registry.register(&ServiceInstance::new("svc1", "a"), 30).await.unwrap();
        Arc::new(CountingDiscovery {
            inner: crate::BasicDiscovery::new(registry, Duration::from_secs(30)),
            calls: AtomicUsize::new(0),
        })
    }

    fn svc() -> ServiceName {
        ServiceName::new("svc1").unwrap()
    }

    #[tokio::test]
    async fn repeated_lookups_within_ttl_hit_the_cache() {
        let inner = counting_discovery().await;
        let cache = CachedDiscovery::new(inner.clone(), Duration::from_secs(60), 1000);
        cache.discover_instances(&svc(), true).await.unwrap();
        cache.discover_instances(&svc(), true).await.unwrap();
        cache.discover_instances(&svc(), true).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_a_fresh_lookup() {
        let inner = counting_discovery().await;
        let cache = CachedDiscovery::new(inner.clone(), Duration::from_secs(60), 1000);
        cache.discover_instances(&svc(), true).await.unwrap();
        cache.invalidate("svc1");
        cache.discover_instances(&svc(), true).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }
}
