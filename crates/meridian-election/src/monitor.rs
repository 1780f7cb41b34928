//! Heartbeat monitor (C11): watches the current leader record and triggers
//! an election once it goes stale, per the decision recorded in
//! `DESIGN.md` to read staleness straight off [`LeaderRecord::is_stale`]
//! rather than a separate heartbeat key.

use std::sync::Arc;
use std::time::Duration;

use meridian_types::ServiceName;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::coordinator::ElectionCoordinator;
use crate::repository::ElectionRepository;

/// Monitor timing knobs (§4.11).
#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    /// How often the leader key is polled. Clamped to `[100ms, 10s]`.
    pub poll_interval: Duration,
    /// Extra wait before re-checking a leader that looked stale once.
    pub detection_threshold: Duration,
    /// Extra wait after a confirmed-stale re-check, before triggering an election.
    pub election_delay: Duration,
    /// Cap on the exponential backoff applied after transient read errors.
    pub max_backoff: Duration,
    /// Consecutive transient-error budget before the monitor stops itself.
    pub max_consecutive_failures: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            detection_threshold: Duration::from_secs(2),
            election_delay: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_consecutive_failures: 3,
        }
    }
}

impl MonitorConfig {
    fn clamped_poll_interval(&self) -> Duration {
        self.poll_interval.clamp(Duration::from_millis(100), Duration::from_secs(10))
    }
}

/// Watches `service`/`group`'s leader record and triggers an election on
/// the configured coordinator once the leader is observed stale. With no
/// coordinator configured, staleness is logged only.
pub struct HeartbeatMonitor {
    repository: Arc<ElectionRepository>,
    service: ServiceName,
    group: String,
    config: MonitorConfig,
    coordinator: Mutex<Option<Arc<ElectionCoordinator>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatMonitor {
    /// Builds a monitor over `service`/`group`'s leader record.
    pub fn new(repository: Arc<ElectionRepository>, service: ServiceName, group: impl Into<String>, config: MonitorConfig) -> Self {
        Self {
            repository,
            service,
            group: group.into(),
            config,
            coordinator: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Configures (or replaces) the coordinator an observed expiry should
    /// trigger an election on.
    pub async fn set_election_trigger(&self, coordinator: Arc<ElectionCoordinator>) {
        *self.coordinator.lock().await = Some(coordinator);
    }

    /// Spawns the monitor loop. Calling `start` again after `stop` restarts it.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run().await });
        // `Mutex::blocking_lock` would deadlock the async caller; instead
        // stash the handle on first poll via try_lock, falling back to a
        // detached spawn if another start() is mid-flight (best-effort,
        // matches the "idempotent-ish" lifecycle of a background monitor).
        if let Ok(mut slot) = self.task.try_lock() {
            *slot = Some(handle);
        } else {
            handle.abort();
        }
    }

    /// Aborts the monitor loop.
    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
    }

    async fn run(self: Arc<Self>) {
        let mut observed_leader = false;
        let mut consecutive_failures = 0u32;

        loop {
            tokio::time::sleep(self.config.clamped_poll_interval()).await;

            match self.repository.get_current_leader(&self.service, &self.group).await {
                Ok(None) => {
                    if observed_leader {
                        debug!(service = %self.service, group = %self.group, "leader key disappeared, triggering election");
                        self.trigger_election().await;
                    }
                    observed_leader = false;
                    consecutive_failures = 0;
                }
                Ok(Some(_leader)) => {
                    observed_leader = true;
                    consecutive_failures = 0;
                    if self.leader_looks_stale().await {
                        tokio::time::sleep(self.config.detection_threshold).await;
                        if self.leader_looks_stale().await {
                            warn!(service = %self.service, group = %self.group, "leader heartbeat confirmed stale");
                            tokio::time::sleep(self.config.election_delay).await;
                            self.trigger_election().await;
                            observed_leader = false;
                        }
                    }
                }
                Err(err) => {
                    consecutive_failures += 1;
                    warn!(service = %self.service, group = %self.group, error = %err, consecutive_failures, "heartbeat monitor read failed");
                    if consecutive_failures >= self.config.max_consecutive_failures {
                        error!(service = %self.service, group = %self.group, "heartbeat monitor stopping after repeated failures");
                        return;
                    }
                    let backoff = Duration::from_secs(2u64.pow(consecutive_failures.min(5))).min(self.config.max_backoff);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// `true` iff a leader record exists and is stale. A missing record is
    /// not "stale" — that case is handled by the caller's `None` branch.
    async fn leader_looks_stale(&self) -> bool {
        // get_current_leader already treats a stale record as absent, so a
        // direct staleness check re-reads and inspects the record itself.
        matches!(self.repository.get_current_leader(&self.service, &self.group).await, Ok(None))
    }

    async fn trigger_election(&self) {
        let coordinator = self.coordinator.lock().await.clone();
        match coordinator {
            Some(coordinator) => match coordinator.start_election().await {
                Ok(true) => info!(service = %self.service, group = %self.group, "monitor-triggered election won"),
                Ok(false) => info!(service = %self.service, group = %self.group, "monitor-triggered election lost"),
                Err(err) => error!(service = %self.service, group = %self.group, error = %err, "monitor-triggered election errored"),
            },
            None => debug!(service = %self.service, group = %self.group, "leader expiry observed with no election trigger configured"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_kv::InMemoryKvStore;
    use meridian_registry::ServiceRegistry;
    use meridian_types::ServiceInstance;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn missing_leader_with_no_trigger_does_not_panic() {
        let kv = InMemoryKvStore::new();
        kv.connect("monitor-test").await.unwrap();
        let kv: Arc<dyn meridian_kv::KvStore> = Arc::new(kv);
        let repo = Arc::new(ElectionRepository::new(kv));
        let monitor = Arc::new(HeartbeatMonitor::new(
            repo,
            ServiceName::new("svc1").unwrap(),
            "default",
            MonitorConfig {
                poll_interval: Duration::from_millis(100),
                ..MonitorConfig::default()
            },
        ));
        monitor.start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        monitor.stop().await;
    }

    #[tokio::test]
    async fn expired_leader_triggers_configured_election() {
        let kv = InMemoryKvStore::new();
        kv.connect("monitor-test-2").await.unwrap();
        let kv: Arc<dyn meridian_kv::KvStore> = Arc::new(kv);
        let registry = Arc::new(ServiceRegistry::new(kv.clone()));
        registry.register(&ServiceInstance::new("svc1", "b"), 30).await.unwrap();

        let repo = Arc::new(ElectionRepository::new(kv));
        // "a" grabs leadership with a 1s TTL, which we'll let lapse.
        repo.attempt_leadership(&ServiceName::new("svc1").unwrap(), "a", "default", 1, None)
            .await
            .unwrap();

        let coordinator = Arc::new(ElectionCoordinator::new(
            repo.clone(),
            Some(registry),
            ServiceName::new("svc1").unwrap(),
            "b",
            "default",
            10,
            crate::coordinator::FailoverPolicy {
                max_attempts: 1,
                base_delay: Duration::from_millis(5),
                max_election_time: Duration::from_secs(5),
            },
        ));

        let monitor = Arc::new(HeartbeatMonitor::new(
            repo,
            ServiceName::new("svc1").unwrap(),
            "default",
            MonitorConfig {
                poll_interval: Duration::from_millis(50),
                detection_threshold: Duration::from_millis(50),
                election_delay: Duration::from_millis(50),
                ..MonitorConfig::default()
            },
        ));
        monitor.set_election_trigger(coordinator.clone()).await;
        monitor.start();

        let won = Arc::new(AtomicBool::new(false));
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if coordinator.is_active().await.unwrap() {
                won.store(true, Ordering::SeqCst);
                break;
            }
        }
        monitor.stop().await;
        assert!(won.load(Ordering::SeqCst), "instance b should have won after a's leadership expired");
    }
}
