//! Single-active wrapper (C13): layers sticky-active election over a
//! [`Service`], gating designated RPC handlers on current leadership.
//!
//! Grounded on `meridian-election`'s coordinator/monitor pair — this module
//! wires the two together and exposes the `exclusive_rpc` gate the
//! distilled surface calls for, rather than reimplementing any election
//! logic of its own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use meridian_election::{ElectionCoordinator, ElectionRepository, FailoverPolicy, HeartbeatMonitor, MonitorConfig};
use meridian_kv::KvStore;
use meridian_types::{LeaderRecord, RpcErrorCode, RpcRequest};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::error::Result;
use crate::service::Service;

/// A [`Service`] plus the single-leader-per-group election machinery
/// layered over it. Exactly one instance of a sticky-active group is
/// `is_active()` at a time; RPC handlers registered through
/// [`Self::register_exclusive_rpc_handler`] only run on that instance.
pub struct SingleActiveService {
    base: Arc<Service>,
    group: String,
    leader_ttl_seconds: u64,
    repository: Arc<ElectionRepository>,
    coordinator: Arc<ElectionCoordinator>,
    monitor: Arc<HeartbeatMonitor>,
    is_active: Arc<AtomicBool>,
    leader_refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl SingleActiveService {
    /// Wraps `base` with sticky-active election over `group`, backed by `kv`
    /// for the leader key. The election coordinator and monitor are fully
    /// constructed here; `start()` only kicks off their background loops.
    pub fn new(base: Arc<Service>, kv: Arc<dyn KvStore>, group: impl Into<String>, leader_ttl_seconds: u64, policy: FailoverPolicy) -> Arc<Self> {
        let group = group.into();
        let repository = Arc::new(ElectionRepository::new(kv));
        let is_active = Arc::new(AtomicBool::new(false));

        let mut coordinator = ElectionCoordinator::new(
            repository.clone(),
            base.registry.clone(),
            base.service_name().clone(),
            base.instance_id().to_string(),
            group.clone(),
            leader_ttl_seconds,
            policy,
        );
        {
            let flag = is_active.clone();
            coordinator.on_elected(move || {
                let flag = flag.clone();
                async move {
                    flag.store(true, Ordering::SeqCst);
                }
            });
        }
        {
            let flag = is_active.clone();
            coordinator.on_lost(move || {
                let flag = flag.clone();
                async move {
                    flag.store(false, Ordering::SeqCst);
                }
            });
        }
        let coordinator = Arc::new(coordinator);

        let monitor_config = MonitorConfig {
            poll_interval: Duration::from_secs_f64((leader_ttl_seconds as f64 / 3.0).max(0.5))
                .clamp(Duration::from_millis(100), Duration::from_secs(10)),
            ..MonitorConfig::default()
        };
        let monitor = Arc::new(HeartbeatMonitor::new(repository.clone(), base.service_name().clone(), group.clone(), monitor_config));

        Arc::new(Self {
            base,
            group,
            leader_ttl_seconds,
            repository,
            coordinator,
            monitor,
            is_active,
            leader_refresh_task: Mutex::new(None),
        })
    }

    /// The underlying service base.
    pub fn base(&self) -> &Arc<Service> {
        &self.base
    }

    /// Whether this instance currently holds the group's leader key.
    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::SeqCst)
    }

    /// The group's current leader record, if any (including one held by a
    /// different instance).
    pub async fn current_leader(&self) -> Result<Option<LeaderRecord>> {
        Ok(self.repository.get_current_leader(self.base.service_name(), &self.group).await?)
    }

    /// Wraps `handler` so it only runs while this instance is the active
    /// leader; otherwise it fails fast with `NOT_ACTIVE` rather than running
    /// on standby instances.
    pub fn exclusive_rpc(self: &Arc<Self>, handler: meridian_bus::RpcHandler) -> meridian_bus::RpcHandler {
        let is_active = self.is_active.clone();
        let metrics = self.base.metrics().clone();
        Arc::new(move |request: RpcRequest| {
            let is_active = is_active.clone();
            let metrics = metrics.clone();
            let handler = handler.clone();
            Box::pin(async move {
                if !is_active.load(Ordering::SeqCst) {
                    metrics.increment("sticky_active.rpc.not_active", 1);
                    return Err(RpcErrorCode::NotActive.as_str().to_string());
                }
                metrics.increment("sticky_active.rpc.processed", 1);
                handler(request).await
            })
        })
    }

    /// Registers `handler` as an exclusive RPC method: queued like any other
    /// handler, but gated by [`Self::exclusive_rpc`] once wired up.
    pub fn register_exclusive_rpc_handler(self: &Arc<Self>, method: meridian_types::MethodName, handler: meridian_bus::RpcHandler) -> Result<()> {
        self.base.register_rpc_handler(method, self.exclusive_rpc(handler))
    }

    /// Starts the underlying service, then runs an initial election attempt
    /// and spawns the heartbeat monitor and leader-refresh loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.base.start().await?;

        self.monitor.set_election_trigger(self.coordinator.clone()).await;
        self.monitor.start();

        self.coordinator.start_election().await?;

        let task = tokio::spawn(run_leader_refresh(self.clone()));
        *self.leader_refresh_task.lock().expect("leader refresh task lock poisoned") = Some(task);
        Ok(())
    }

    /// Stops the monitor and refresh loop, releases leadership if held, and
    /// stops the underlying service.
    pub async fn stop(self: &Arc<Self>) -> Result<()> {
        self.monitor.stop().await;
        if let Some(task) = self.leader_refresh_task.lock().expect("leader refresh task lock poisoned").take() {
            task.abort();
        }
        if self.is_active.load(Ordering::SeqCst) {
            self.coordinator.release_leadership().await?;
        }
        self.is_active.store(false, Ordering::SeqCst);
        self.base.stop().await?;
        Ok(())
    }
}

async fn run_leader_refresh(service: Arc<SingleActiveService>) {
    let interval = Duration::from_secs_f64((service.leader_ttl_seconds as f64 / 3.0).max(0.5));
    loop {
        tokio::time::sleep(interval).await;
        if !service.is_active.load(Ordering::SeqCst) {
            continue;
        }
        match service.coordinator.refresh_leadership().await {
            Ok(true) => {}
            Ok(false) => {
                warn!(service = %service.base.service_name(), group = %service.group, "lost leadership during refresh");
                service.is_active.store(false, Ordering::SeqCst);
                return;
            }
            Err(err) => {
                error!(service = %service.base.service_name(), group = %service.group, error = %err, "leader refresh failed, stepping down");
                service.is_active.store(false, Ordering::SeqCst);
                return;
            }
        }
    }
}
