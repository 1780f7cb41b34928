//! Service base (C12): lifecycle state machine, handler registration,
//! background heartbeat, and RPC/event/command plumbing shared by every
//! service built on the runtime.
//!
//! Grounded on `meridian-election`'s coordinator/monitor split — a thin
//! `Arc`-wrapped handle with a background `tokio::spawn`ed loop aborted on
//! `stop()` — and on `meridian-registry`'s self-healing heartbeat pattern.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use meridian_bus::{CommandHandler, DeliveryMode, EventHandler, MessageBus, MessagingFabric, RpcHandler};
use meridian_discovery::ServiceDiscovery;
use meridian_metrics::MetricsSink;
use meridian_registry::ServiceRegistry;
use meridian_types::patterns::heartbeat_subject;
use meridian_types::{
    Command, Event, InstanceId, LifecycleState, MethodName, RpcRequest, RpcResponse, ServiceInstance, ServiceName,
    ServiceStatus,
};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Result, ServiceError};

/// Consecutive registry-heartbeat failures before an instance is marked
/// `UNHEALTHY` in its own record (§4.7).
const MAX_HEARTBEAT_FAILURES: u32 = 3;

/// Tuning knobs for [`Service`] (§6 `registry`/`bus`).
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// TTL set on the registry record each heartbeat (default 30s).
    pub registry_ttl_seconds: u64,
    /// Interval between heartbeat ticks (default 10s).
    pub heartbeat_interval_seconds: f64,
    /// Whether outbound messages prefer the binary codec over JSON.
    pub prefer_binary: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            registry_ttl_seconds: 30,
            heartbeat_interval_seconds: 10.0,
            prefer_binary: true,
        }
    }
}

type LifecycleHook = Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Default)]
struct PendingHandlers {
    rpc: Vec<(MethodName, RpcHandler)>,
    events: Vec<(String, DeliveryMode, Option<String>, EventHandler)>,
    commands: Vec<(String, CommandHandler)>,
}

/// Builds a [`Service`], wiring the optional registry/discovery ports and
/// lifecycle hooks before construction.
pub struct ServiceBuilder {
    service: ServiceName,
    instance_id: InstanceId,
    bus: Arc<dyn MessageBus>,
    metrics: Arc<dyn MetricsSink>,
    config: ServiceConfig,
    registry: Option<Arc<ServiceRegistry>>,
    discovery: Option<Arc<dyn ServiceDiscovery>>,
    on_start: Option<LifecycleHook>,
    on_started: Option<LifecycleHook>,
    on_stop: Option<LifecycleHook>,
}

impl ServiceBuilder {
    /// Starts building a service identified by `service`/`instance_id`, over
    /// an already-connected `bus`.
    pub fn new(service: ServiceName, instance_id: InstanceId, bus: Arc<dyn MessageBus>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            service,
            instance_id,
            bus,
            metrics,
            config: ServiceConfig::default(),
            registry: None,
            discovery: None,
            on_start: None,
            on_started: None,
            on_stop: None,
        }
    }

    /// Overrides the default [`ServiceConfig`].
    pub fn with_config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers this instance in `registry` on `start()` and refreshes its
    /// heartbeat in the background.
    pub fn with_registry(mut self, registry: Arc<ServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Enables [`Service::call_rpc`]'s pre-flight availability check against `discovery`.
    pub fn with_discovery(mut self, discovery: Arc<dyn ServiceDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Runs `hook` at the beginning of `start()`, before registry
    /// registration or handler wiring.
    pub fn on_start<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_start = Some(Box::new(move || Box::pin(hook())));
        self
    }

    /// Runs `hook` after `start()` transitions to `STARTED`.
    pub fn on_started<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_started = Some(Box::new(move || Box::pin(hook())));
        self
    }

    /// Runs `hook` during `stop()`, after the heartbeat task is aborted and
    /// before deregistration.
    pub fn on_stop<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_stop = Some(Box::new(move || Box::pin(hook())));
        self
    }

    /// Builds the service, ready for handler registration and `start()`.
    pub fn build(self) -> Arc<Service> {
        let fabric = Arc::new(MessagingFabric::new(
            self.bus.clone(),
            self.metrics.clone(),
            self.service.clone(),
            self.instance_id.to_string(),
            self.config.prefer_binary,
        ));
        Arc::new(Service {
            instance: Mutex::new(ServiceInstance::new(self.service.as_str(), self.instance_id.as_str())),
            service: self.service,
            instance_id: self.instance_id,
            config: self.config,
            fabric,
            bus: self.bus,
            metrics: self.metrics,
            registry: self.registry,
            discovery: self.discovery,
            state: Mutex::new(LifecycleState::Initializing),
            pending: Mutex::new(PendingHandlers::default()),
            heartbeat_task: Mutex::new(None),
            heartbeat_failures: AtomicU32::new(0),
            on_start: self.on_start,
            on_started: self.on_started,
            on_stop: self.on_stop,
        })
    }
}

/// A running (or starting/stopping) microservice: lifecycle state, the
/// messaging fabric, and the optional registry/discovery wiring behind it.
///
/// Always held as `Arc<Service>` — `start()`/`stop()` take `self: &Arc<Self>`
/// so the background heartbeat task can hold its own clone.
pub struct Service {
    pub(crate) service: ServiceName,
    pub(crate) instance_id: InstanceId,
    pub(crate) config: ServiceConfig,
    pub(crate) fabric: Arc<MessagingFabric>,
    pub(crate) bus: Arc<dyn MessageBus>,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) registry: Option<Arc<ServiceRegistry>>,
    pub(crate) discovery: Option<Arc<dyn ServiceDiscovery>>,
    state: Mutex<LifecycleState>,
    instance: Mutex<ServiceInstance>,
    pending: Mutex<PendingHandlers>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    heartbeat_failures: AtomicU32,
    on_start: Option<LifecycleHook>,
    on_started: Option<LifecycleHook>,
    on_stop: Option<LifecycleHook>,
}

impl Service {
    /// The validated service name this instance serves.
    pub fn service_name(&self) -> &ServiceName {
        &self.service
    }

    /// This instance's id.
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// The current lifecycle phase.
    pub fn state(&self) -> LifecycleState {
        *self.state.lock().expect("service state lock poisoned")
    }

    /// The messaging fabric underlying this service, for callers that need
    /// direct access (e.g. [`crate::SingleActiveService`]).
    pub fn fabric(&self) -> &Arc<MessagingFabric> {
        &self.fabric
    }

    /// The metrics sink this service records to.
    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    fn transition(&self, to: LifecycleState) -> Result<()> {
        let mut state = self.state.lock().expect("service state lock poisoned");
        *state = state.transition(to)?;
        Ok(())
    }

    fn ensure_registrable(&self) -> Result<()> {
        let state = self.state();
        if matches!(state, LifecycleState::Initializing | LifecycleState::Starting) {
            Ok(())
        } else {
            Err(ServiceError::HandlerRegistrationAfterStart(state))
        }
    }

    /// Builds a validated RPC request stamped with this instance as `source`.
    pub fn create_rpc_request(
        &self,
        method: impl Into<String>,
        params: HashMap<String, Value>,
        timeout_seconds: f64,
    ) -> Result<RpcRequest> {
        let mut request = RpcRequest::with_timeout(method, params, timeout_seconds)?;
        request.envelope.source = Some(self.instance_id.to_string());
        Ok(request)
    }

    /// Builds a validated event stamped with this instance as `source`.
    pub fn create_event(
        &self,
        domain: impl Into<String>,
        event_type: impl Into<String>,
        payload: HashMap<String, Value>,
    ) -> Result<Event> {
        let mut event = Event::new(domain, event_type, payload)?;
        event.envelope.source = Some(self.instance_id.to_string());
        Ok(event)
    }

    /// Builds a validated command stamped with this instance as `source`.
    pub fn create_command(&self, command: impl Into<String>, payload: HashMap<String, Value>) -> Result<Command> {
        let mut command = Command::new(command, payload)?;
        command.validate_bounds()?;
        command.envelope.source = Some(self.instance_id.to_string());
        Ok(command)
    }

    /// Queues `handler` to serve `rpc.<service>.<method>` once `start()` wires it up.
    pub fn register_rpc_handler(&self, method: MethodName, handler: RpcHandler) -> Result<()> {
        self.ensure_registrable()?;
        self.pending.lock().expect("pending handlers lock poisoned").rpc.push((method, handler));
        Ok(())
    }

    /// Queues `handler` to subscribe to `events.<pattern>` once `start()` wires it up.
    pub fn register_event_handler(
        &self,
        pattern: impl Into<String>,
        mode: DeliveryMode,
        durable: Option<String>,
        handler: EventHandler,
    ) -> Result<()> {
        self.ensure_registrable()?;
        self.pending
            .lock()
            .expect("pending handlers lock poisoned")
            .events
            .push((pattern.into(), mode, durable, handler));
        Ok(())
    }

    /// Queues `handler` to serve `commands.<service>.<command>` once `start()` wires it up.
    pub fn register_command_handler(&self, command: impl Into<String>, handler: CommandHandler) -> Result<()> {
        self.ensure_registrable()?;
        self.pending
            .lock()
            .expect("pending handlers lock poisoned")
            .commands
            .push((command.into(), handler));
        Ok(())
    }

    /// Calls `method` on `target_service`. If discovery is configured, first
    /// confirms a healthy instance exists rather than letting the call time
    /// out against an empty queue group.
    pub async fn call_rpc(&self, target_service: &ServiceName, method: &MethodName, request: RpcRequest) -> Result<RpcResponse> {
        if let Some(discovery) = &self.discovery {
            let instances = discovery.discover_instances(target_service, true).await?;
            if instances.is_empty() {
                self.metrics.increment("rpc.client.unavailable", 1);
                return Err(ServiceError::ServiceUnavailable(target_service.as_str().to_string()));
            }
        }
        Ok(self.fabric.call_rpc(target_service, method, request).await)
    }

    /// Publishes `event` via the fabric.
    pub async fn publish_event(&self, event: &Event) -> Result<u64> {
        Ok(self.fabric.publish_event(event).await?)
    }

    /// Sends `command` to `target_service` via the fabric.
    pub async fn send_command(&self, target_service: &ServiceName, command: &Command, track_progress: bool) -> Result<Value> {
        Ok(self.fabric.send_command(target_service, command, track_progress).await?)
    }

    /// Transitions `INITIALIZING -> STARTING`, registers in the registry (if
    /// configured), wires every queued handler to the fabric, spawns the
    /// heartbeat task, then transitions to `STARTED`.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.transition(LifecycleState::Starting)?;
        if let Some(hook) = &self.on_start {
            hook().await;
        }
        if let Err(err) = self.start_inner().await {
            let _ = self.transition(LifecycleState::Failed);
            error!(service = %self.service, instance = %self.instance_id, error = %err, "service failed to start");
            return Err(err);
        }
        self.transition(LifecycleState::Started)?;
        if let Some(hook) = &self.on_started {
            hook().await;
        }
        info!(service = %self.service, instance = %self.instance_id, "service started");
        Ok(())
    }

    async fn start_inner(self: &Arc<Self>) -> Result<()> {
        if let Some(registry) = &self.registry {
            let instance = self.instance.lock().expect("instance lock poisoned").clone();
            registry.register(&instance, self.config.registry_ttl_seconds).await?;
        }

        let pending = std::mem::take(&mut *self.pending.lock().expect("pending handlers lock poisoned"));
        for (method, handler) in pending.rpc {
            self.fabric.register_rpc_handler(&self.service, &method, handler).await?;
        }
        for (pattern, mode, durable, handler) in pending.events {
            self.fabric.subscribe_event(&pattern, mode, durable.as_deref(), handler).await?;
        }
        for (command, handler) in pending.commands {
            self.fabric.register_command_handler(&self.service, &command, handler).await?;
        }

        let task = tokio::spawn(run_heartbeat(self.clone()));
        *self.heartbeat_task.lock().expect("heartbeat task lock poisoned") = Some(task);
        Ok(())
    }

    /// Aborts the heartbeat task, tears down the fabric's background
    /// subscriptions, deregisters from the registry (if configured), and
    /// transitions to `STOPPED` (or `FAILED` if deregistration errored).
    pub async fn stop(self: &Arc<Self>) -> Result<()> {
        self.transition(LifecycleState::Stopping)?;

        if let Some(task) = self.heartbeat_task.lock().expect("heartbeat task lock poisoned").take() {
            task.abort();
        }
        self.fabric.shutdown();

        let mut stop_err = None;
        if let Some(registry) = &self.registry {
            let instance_id = self.instance.lock().expect("instance lock poisoned").instance_id.clone();
            if let Err(err) = registry.deregister(&self.service, &instance_id).await {
                stop_err = Some(ServiceError::from(err));
            }
        }

        if let Some(hook) = &self.on_stop {
            hook().await;
        }

        if stop_err.is_some() {
            let _ = self.transition(LifecycleState::Failed);
        } else {
            self.transition(LifecycleState::Stopped)?;
        }
        info!(service = %self.service, instance = %self.instance_id, "service stopped");
        match stop_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn run_heartbeat(service: Arc<Service>) {
    let interval = Duration::from_secs_f64(service.config.heartbeat_interval_seconds.max(0.1));
    loop {
        tokio::time::sleep(interval).await;

        let subject = heartbeat_subject(&service.service);
        let payload = serde_json::json!({
            "instance_id": service.instance_id.as_str(),
            "timestamp": Utc::now(),
        });
        if let Ok(bytes) = serde_json::to_vec(&payload) {
            if let Err(err) = service.bus.publish(&subject, bytes).await {
                debug!(service = %service.service, error = %err, "heartbeat sideband publish failed");
            }
        }

        let Some(registry) = &service.registry else { continue };
        let mut instance = service.instance.lock().expect("instance lock poisoned").clone();
        instance.last_heartbeat = Utc::now();

        match registry.update_heartbeat(&instance, service.config.registry_ttl_seconds).await {
            Ok(()) => {
                service.heartbeat_failures.store(0, Ordering::SeqCst);
                instance.status = ServiceStatus::Active;
                *service.instance.lock().expect("instance lock poisoned") = instance;
                service.metrics.increment("heartbeat.success", 1);
            }
            Err(err) => {
                let failures = service.heartbeat_failures.fetch_add(1, Ordering::SeqCst) + 1;
                service.metrics.increment("heartbeat.failure", 1);
                warn!(service = %service.service, instance = %service.instance_id, error = %err, failures, "registry heartbeat failed");
                if failures >= MAX_HEARTBEAT_FAILURES {
                    instance.status = ServiceStatus::Unhealthy;
                    *service.instance.lock().expect("instance lock poisoned") = instance;
                    error!(service = %service.service, instance = %service.instance_id, "marked UNHEALTHY after repeated heartbeat failures");
                }
                let backoff = Duration::from_secs_f64(2f64.powi(failures.min(5) as i32));
                tokio::time::sleep(backoff).await;
            }
        }
    }
}
