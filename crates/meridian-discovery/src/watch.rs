//! A [`CachedDiscovery`] kept fresh by a background KV watch instead of
//! waiting out its TTL, per §4.8's watch-driven invalidation.

use std::sync::Arc;
use std::time::Duration;

use meridian_kv::{KvStore, WatchTarget};
use meridian_types::patterns::parse_registry_key;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::cache::CachedDiscovery;
use crate::ServiceDiscovery;

/// Reconnect policy for the background watch task (§6
/// `discovery.watch`).
#[derive(Debug, Clone, Copy)]
pub struct WatchableConfig {
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for WatchableConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 10,
        }
    }
}

/// A [`CachedDiscovery`] with a background task that watches the
/// `service-instances` prefix and invalidates the affected service's cache
/// entries as soon as a change lands, rather than waiting for the TTL to
/// lapse.
///
/// The watch task is spawned on construction and aborted on drop.
pub struct WatchableCachedDiscovery {
    cache: Arc<CachedDiscovery>,
    watch_task: JoinHandle<()>,
}

impl WatchableCachedDiscovery {
    /// Wraps `inner` in a [`CachedDiscovery`] and spawns a task that watches
    /// `kv`'s `service-instances` prefix to invalidate on change.
    pub fn new(inner: Arc<dyn ServiceDiscovery>, kv: Arc<dyn KvStore>, config: WatchableConfig) -> Self {
        let cache = Arc::new(CachedDiscovery::with_defaults(inner));
        let watch_task = tokio::spawn(run_watch_loop(cache.clone(), kv, config));
        Self { cache, watch_task }
    }

    /// Exposes the wrapped cache for lookups.
    pub fn discovery(&self) -> Arc<CachedDiscovery> {
        self.cache.clone()
    }
}

impl Drop for WatchableCachedDiscovery {
    fn drop(&mut self) {
        self.watch_task.abort();
    }
}

async fn run_watch_loop(cache: Arc<CachedDiscovery>, kv: Arc<dyn KvStore>, config: WatchableConfig) {
    let mut attempt = 0u32;
    loop {
        match kv.watch(WatchTarget::Prefix("service-instances".to_string())).await {
            Ok(mut stream) => {
                attempt = 0;
                use futures::StreamExt;
                while let Some(event) = stream.next().await {
                    match event {
                        Ok(event) => {
                            if let Some((service, _instance)) = parse_registry_key(&event.key) {
                                debug!(service = %service, operation = ?event.operation, "discovery cache invalidated by registry watch");
                                cache.invalidate(&service);
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "discovery watch stream errored, reconnecting");
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                attempt += 1;
                if attempt > config.max_reconnect_attempts {
                    error!(error = %err, attempts = attempt, "discovery watch giving up after repeated failures");
                    return;
                }
                warn!(error = %err, attempt, "discovery watch failed to open, retrying");
            }
        }
        tokio::time::sleep(config.reconnect_delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_kv::InMemoryKvStore;
    use meridian_registry::ServiceRegistry;
    use meridian_types::{ServiceInstance, ServiceName};

    #[tokio::test]
    async fn watch_invalidates_on_new_registration() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        kv.connect("watchable-test").await.unwrap();
        let registry = Arc::new(ServiceRegistry::new(kv.clone()));
        let basic: Arc<dyn ServiceDiscovery> =
            Arc::new(crate::BasicDiscovery::new(registry.clone(), Duration::from_secs(30)));

        let watchable = WatchableCachedDiscovery::new(basic, kv.clone(), WatchableConfig::default());
        let service = ServiceName::new("svc1").unwrap();

        // Empty before anything is registered, and now cached.
        let found = watchable.discovery().discover_instances(&service, true).await.unwrap();
        assert!(found.is_empty());

        registry.register(&ServiceInstance::new("svc1", "a"), 30).await.unwrap();
        // Give the watch task a moment to observe the put and invalidate.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let found = watchable.discovery().discover_instances(&service, true).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn watch_invalidates_on_deregistration() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        kv.connect("watchable-test").await.unwrap();
        let registry = Arc::new(ServiceRegistry::new(kv.clone()));
        let basic: Arc<dyn ServiceDiscovery> =
            Arc::new(crate::BasicDiscovery::new(registry.clone(), Duration::from_secs(30)));

        let watchable = WatchableCachedDiscovery::new(basic, kv.clone(), WatchableConfig::default());
        let service = ServiceName::new("svc1").unwrap();

        registry.register(&ServiceInstance::new("svc1", "a"), 30).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let found = watchable.discovery().discover_instances(&service, true).await.unwrap();
        assert_eq!(found.len(), 1);

        registry.deregister(&service, "a").await.unwrap();
        // The removal carries no entry, only a key; the cache must still invalidate on it.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let found = watchable.discovery().discover_instances(&service, true).await.unwrap();
        assert!(found.is_empty());
    }
}
