//! Election coordinator (C10): runs a bounded, jittered election attempt
//! loop over the [`ElectionRepository`], keeps the registry in sync, and
//! fires `on_elected`/`on_lost` callbacks.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use meridian_registry::ServiceRegistry;
use meridian_types::{ServiceName, StickyActiveStatus};
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::Result;
use crate::repository::ElectionRepository;

/// Tuning knobs for [`ElectionCoordinator::start_election`] (§7
/// `failover_policy`).
#[derive(Debug, Clone, Copy)]
pub struct FailoverPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_election_time: Duration,
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_election_time: Duration::from_secs(30),
        }
    }
}

type ElectedCallback = Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;
type LostCallback = Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Runs elections for one `(service, instance, group)` identity over an
/// [`ElectionRepository`], updating the [`ServiceRegistry`] and invoking
/// callbacks as leadership changes.
pub struct ElectionCoordinator {
    repository: Arc<ElectionRepository>,
    registry: Option<Arc<ServiceRegistry>>,
    service: ServiceName,
    instance_id: String,
    group: String,
    ttl_seconds: u64,
    policy: FailoverPolicy,
    election_in_progress: Mutex<bool>,
    on_elected: Option<ElectedCallback>,
    on_lost: Option<LostCallback>,
}

impl ElectionCoordinator {
    /// Builds a coordinator for one identity triple.
    pub fn new(
        repository: Arc<ElectionRepository>,
        registry: Option<Arc<ServiceRegistry>>,
        service: ServiceName,
        instance_id: impl Into<String>,
        group: impl Into<String>,
        ttl_seconds: u64,
        policy: FailoverPolicy,
    ) -> Self {
        Self {
            repository,
            registry,
            service,
            instance_id: instance_id.into(),
            group: group.into(),
            ttl_seconds,
            policy,
            election_in_progress: Mutex::new(false),
            on_elected: None,
            on_lost: None,
        }
    }

    /// Registers a callback fired after a successful election.
    pub fn on_elected<F, Fut>(&mut self, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_elected = Some(Box::new(move || Box::pin(callback())));
    }

    /// Registers a callback fired after leadership is released or lost.
    pub fn on_lost<F, Fut>(&mut self, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_lost = Some(Box::new(move || Box::pin(callback())));
    }

    /// Checks whether we already hold, or can atomically acquire,
    /// leadership. Does not retry — that's [`Self::start_election`]'s job.
    pub async fn try_acquire_leadership(&self) -> Result<bool> {
        if let Some(current) = self.repository.get_current_leader(&self.service, &self.group).await? {
            if current.instance_id == self.instance_id {
                return Ok(true);
            }
            return Ok(false);
        }
        self.repository
            .attempt_leadership(&self.service, &self.instance_id, &self.group, self.ttl_seconds, None)
            .await
    }

    /// Runs the bounded, jittered election attempt loop. Idempotent: a
    /// concurrent call while an election is already in progress returns
    /// `Ok(false)` immediately rather than racing its own retries.
    pub async fn start_election(&self) -> Result<bool> {
        {
            let mut in_progress = self.election_in_progress.lock().await;
            if *in_progress {
                return Ok(false);
            }
            *in_progress = true;
        }
        let result = self.run_election_attempts().await;
        *self.election_in_progress.lock().await = false;
        result
    }

    async fn run_election_attempts(&self) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + self.policy.max_election_time;
        for attempt in 1..=self.policy.max_attempts {
            if attempt > 1 {
                let backoff = self.policy.base_delay * 2u32.pow(attempt - 1);
                let jitter_ceiling_ms = (self.policy.base_delay.as_millis() / 2).max(1) as u64;
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ceiling_ms));
                tokio::time::sleep(backoff + jitter).await;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(service = %self.service, group = %self.group, attempt, "election exceeded max_election_time");
                break;
            }
            match self.try_acquire_leadership().await {
                Ok(true) => {
                    self.on_elected_internal().await?;
                    return Ok(true);
                }
                Ok(false) => continue,
                Err(err) => {
                    warn!(service = %self.service, group = %self.group, attempt, error = %err, "election attempt errored");
                    continue;
                }
            }
        }
        Ok(false)
    }

    async fn on_elected_internal(&self) -> Result<()> {
        info!(service = %self.service, instance = %self.instance_id, group = %self.group, "won election");
        if let Some(registry) = &self.registry {
            if let Some(mut instance) = registry.get_instance(&self.service, &self.instance_id).await? {
                instance.sticky_active_status = Some(StickyActiveStatus::Active);
                registry.update_heartbeat(&instance, self.ttl_seconds).await?;
            }
        }
        if let Some(callback) = &self.on_elected {
            callback().await;
        }
        Ok(())
    }

    /// Releases leadership if held, updates the registry to `Standby`, and
    /// fires `on_lost`.
    pub async fn release_leadership(&self) -> Result<()> {
        self.repository
            .release_leadership(&self.service, &self.instance_id, &self.group)
            .await?;
        if let Some(registry) = &self.registry {
            if let Some(mut instance) = registry.get_instance(&self.service, &self.instance_id).await? {
                instance.sticky_active_status = Some(StickyActiveStatus::Standby);
                let _ = registry.update_heartbeat(&instance, self.ttl_seconds).await;
            }
        }
        if let Some(callback) = &self.on_lost {
            callback().await;
        }
        Ok(())
    }

    /// True iff we currently hold the leader key (a single repository read,
    /// not cached).
    pub async fn is_active(&self) -> Result<bool> {
        Ok(self
            .repository
            .get_current_leader(&self.service, &self.group)
            .await?
            .is_some_and(|leader| leader.instance_id == self.instance_id))
    }

    /// Refreshes the leader key's heartbeat if we hold it.
    pub async fn refresh_leadership(&self) -> Result<bool> {
        self.repository
            .update_leadership(&self.service, &self.instance_id, &self.group, self.ttl_seconds)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_kv::InMemoryKvStore;
    use meridian_types::ServiceInstance;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn shared_setup() -> (Arc<dyn meridian_kv::KvStore>, Arc<ServiceRegistry>) {
        let kv = InMemoryKvStore::new();
        kv.connect("coordinator-test").await.unwrap();
        let kv: Arc<dyn meridian_kv::KvStore> = Arc::new(kv);
        let registry = Arc::new(ServiceRegistry::new(kv.clone()));
        (kv, registry)
    }

    fn coordinator_for(
        kv: Arc<dyn meridian_kv::KvStore>,
        registry: Arc<ServiceRegistry>,
        instance_id: &str,
    ) -> ElectionCoordinator {
        let repo = Arc::new(ElectionRepository::new(kv));
        ElectionCoordinator::new(
            repo,
            Some(registry),
            ServiceName::new("svc1").unwrap(),
            instance_id,
            "default",
            10,
            FailoverPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(5),
                max_election_time: Duration::from_secs(5),
            },
        )
    }

    #[tokio::test]
    async fn first_coordinator_wins_immediately() {
        let (kv, registry) = shared_setup().await;
        registry.register(&ServiceInstance::new("svc1", "a"), 30).await.unwrap();
        let coord = coordinator_for(kv, registry, "a");
        assert!(coord.start_election().await.unwrap());
        assert!(coord.is_active().await.unwrap());
    }

    #[tokio::test]
    async fn second_coordinator_loses_to_the_first() {
        let (kv, registry) = shared_setup().await;
        registry.register(&ServiceInstance::new("svc1", "a"), 30).await.unwrap();
        registry.register(&ServiceInstance::new("svc1", "b"), 30).await.unwrap();
        let a = coordinator_for(kv.clone(), registry.clone(), "a");
        let b = coordinator_for(kv, registry, "b");
        assert!(a.start_election().await.unwrap());
        assert!(!b.start_election().await.unwrap());
        assert!(!b.is_active().await.unwrap());
    }

    #[tokio::test]
    async fn on_elected_callback_fires_once() {
        let (kv, registry) = shared_setup().await;
        registry.register(&ServiceInstance::new("svc1", "a"), 30).await.unwrap();
        let mut coord = coordinator_for(kv, registry, "a");
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        coord.on_elected(move || {
            let fired = fired_clone.clone();
            async move {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });
        coord.start_election().await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn release_then_lose_active_status() {
        let (kv, registry) = shared_setup().await;
        registry.register(&ServiceInstance::new("svc1", "a"), 30).await.unwrap();
        let coord = coordinator_for(kv, registry, "a");
        coord.start_election().await.unwrap();
        coord.release_leadership().await.unwrap();
        assert!(!coord.is_active().await.unwrap());
    }
}
