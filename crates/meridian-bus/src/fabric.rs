//! The messaging fabric (C6): RPC server/client, event subscription and
//! publish, and command handler/send, all layered on a [`MessageBus`].
//!
//! Grounded on `meridian-registry`'s self-healing heartbeat pattern for the
//! "never throw to the transport" handler wrapping, and on
//! `meridian-kv::nats`'s timer-per-operation metrics convention.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use meridian_metrics::MetricsSink;
use meridian_types::patterns::{
    command_callback_subject, command_progress_subject, command_subject, is_valid_event_pattern, rpc_subject,
};
use meridian_types::{Command, Event, MethodName, RpcRequest, RpcResponse, ServiceName};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::{BusError, Result};
use crate::{DeliveryMode, JetStreamSubscribeOptions, MessageBus};

/// An RPC handler. Never propagates an error to the transport: a `Err`
/// return becomes `RpcResponse::failure`, matching §4.6's "any handler
/// failure results in success=false ... never throws" rule.
pub type RpcHandler =
    Arc<dyn Fn(RpcRequest) -> Pin<Box<dyn Future<Output = std::result::Result<Value, String>> + Send>> + Send + Sync>;

/// An event handler. `Err` triggers a nak; `Ok` an explicit ack.
pub type EventHandler =
    Arc<dyn Fn(Event) -> Pin<Box<dyn Future<Output = std::result::Result<(), String>> + Send>> + Send + Sync>;

/// A command handler, given the decoded command and a [`ProgressReporter`]
/// it may use to publish progress updates before returning its result.
pub type CommandHandler = Arc<
    dyn Fn(Command, ProgressReporter) -> Pin<Box<dyn Future<Output = std::result::Result<Value, String>> + Send>>
        + Send
        + Sync,
>;

/// Publishes `{command_id, progress, status, timestamp}` to
/// `commands.progress.<id>` on behalf of a running command handler (§4.6).
/// Progress is core pub — lossy by design, no durability.
#[derive(Clone)]
pub struct ProgressReporter {
    bus: Arc<dyn MessageBus>,
    command_id: Uuid,
}

impl ProgressReporter {
    pub async fn report(&self, percent: f64, status: &str) {
        let payload = serde_json::json!({
            "command_id": self.command_id,
            "progress": percent,
            "status": status,
            "timestamp": chrono::Utc::now(),
        });
        match serde_json::to_vec(&payload) {
            Ok(bytes) => {
                let subject = command_progress_subject(&self.command_id.to_string());
                if let Err(err) = self.bus.publish(&subject, bytes).await {
                    warn!(command_id = %self.command_id, error = %err, "failed to publish command progress");
                }
            }
            Err(err) => warn!(command_id = %self.command_id, error = %err, "failed to encode command progress"),
        }
    }
}

/// RPC/event/command plumbing shared by every handler and caller in a
/// process: codec choice, metrics naming, and the background tasks that
/// drive registered handlers.
pub struct MessagingFabric {
    bus: Arc<dyn MessageBus>,
    metrics: Arc<dyn MetricsSink>,
    service: ServiceName,
    instance_id: String,
    prefer_binary: bool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessagingFabric {
    pub fn new(bus: Arc<dyn MessageBus>, metrics: Arc<dyn MetricsSink>, service: ServiceName, instance_id: String, prefer_binary: bool) -> Self {
        Self {
            bus,
            metrics,
            service,
            instance_id,
            prefer_binary,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Aborts every background handler task this fabric has spawned.
    /// Callers (C12's `stop()`) are responsible for the bounded grace
    /// period; this is the hard stop once it elapses.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    /// Subscribes to `rpc.<service>.<method>` with queue group
    /// `rpc.<service>` and dispatches every request to `handler`.
    pub async fn register_rpc_handler(&self, service: &ServiceName, method: &MethodName, handler: RpcHandler) -> Result<()> {
        let subject = rpc_subject(service, method);
        let queue = format!("rpc.{service}");
        let mut stream = self.bus.subscribe(&subject, Some(queue)).await?;
        let bus = self.bus.clone();
        let prefer_binary = self.prefer_binary;

        let task = tokio::spawn(async move {
            use futures::StreamExt;
            while let Some(item) = stream.next().await {
                let delivered = match item {
                    Ok(d) => d,
                    Err(err) => {
                        error!(error = %err, "rpc subscription error");
                        continue;
                    }
                };
                let Some(reply_to) = delivered.message.reply_subject.clone() else {
                    warn!(subject = %delivered.message.subject, "rpc request carried no reply subject");
                    continue;
                };
                let request: RpcRequest = match meridian_wire::detect_and_deserialize(&delivered.message.data) {
                    Ok((request, _)) => request,
                    Err(err) => {
                        warn!(error = %err, "failed to decode rpc request");
                        continue;
                    }
                };
                let request_id = request.envelope.message_id;
                let response = match handler(request).await {
                    Ok(result) => RpcResponse::success(request_id, result),
                    Err(error) => RpcResponse::failure(request_id, error),
                };
                match meridian_wire::encode(&response, prefer_binary) {
                    Ok(bytes) => {
                        if let Err(err) = bus.publish(&reply_to, bytes).await {
                            warn!(error = %err, "failed to publish rpc reply");
                        }
                    }
                    Err(err) => warn!(error = %err, "failed to encode rpc reply"),
                }
            }
        });
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }

    /// Sends `request` to `service.method` and awaits a reply, translating
    /// bus-level timeouts/errors into a failed [`RpcResponse`] rather than
    /// propagating them (§4.6).
    pub async fn call_rpc(&self, service: &ServiceName, method: &MethodName, request: RpcRequest) -> RpcResponse {
        let subject = rpc_subject(service, method);
        let metric_prefix = format!("rpc.client.{service}.{method}");
        let request_id = request.envelope.message_id;
        let _timer = meridian_metrics::timer(self.metrics.as_ref(), metric_prefix.clone());

        let payload = match meridian_wire::encode(&request, self.prefer_binary) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.metrics.increment(&format!("{metric_prefix}.error"), 1);
                return RpcResponse::failure(request_id, err.to_string());
            }
        };

        let timeout = Duration::from_secs_f64(request.timeout_seconds);
        match self.bus.request(&subject, payload, timeout).await {
            Ok(bytes) => match meridian_wire::detect_and_deserialize::<RpcResponse>(&bytes) {
                Ok((response, _)) => {
                    self.metrics.increment(&format!("{metric_prefix}.success"), 1);
                    response
                }
                Err(err) => {
                    self.metrics.increment(&format!("{metric_prefix}.error"), 1);
                    RpcResponse::failure(request_id, err.to_string())
                }
            },
            Err(BusError::Timeout { .. }) => {
                self.metrics.increment(&format!("{metric_prefix}.timeout"), 1);
                RpcResponse::failure(request_id, format!("Timeout waiting for {subject}"))
            }
            Err(err) => {
                self.metrics.increment(&format!("{metric_prefix}.error"), 1);
                RpcResponse::failure(request_id, err.to_string())
            }
        }
    }

    /// Subscribes to `events.<pattern>`. A wildcard pattern always uses a
    /// core subscription (both delivery modes behave identically per
    /// §4.6); a literal pattern uses a durable JetStream subscription per
    /// `mode`.
    pub async fn subscribe_event(&self, pattern: &str, mode: DeliveryMode, durable: Option<&str>, handler: EventHandler) -> Result<()> {
        if !is_valid_event_pattern(pattern) {
            return Err(BusError::Backend {
                operation: "subscribe_event",
                message: format!("invalid event pattern '{pattern}'"),
            });
        }
        let subject = format!("events.{pattern}");
        let is_wildcard = pattern.contains('*') || pattern.contains('>');

        let mut stream = if is_wildcard {
            let queue = match mode {
                DeliveryMode::Compete => Some(self.service.to_string()),
                DeliveryMode::Broadcast => None,
            };
            self.bus.subscribe(&subject, queue).await?
        } else {
            let options = match mode {
                DeliveryMode::Compete => JetStreamSubscribeOptions::compete(self.service.to_string()),
                DeliveryMode::Broadcast => {
                    let base = durable.unwrap_or(self.service.as_str());
                    JetStreamSubscribeOptions::broadcast(format!("{base}-{}", self.instance_id))
                }
            };
            self.bus.jetstream_subscribe(&subject, options).await?
        };

        let task = tokio::spawn(async move {
            use futures::StreamExt;
            while let Some(item) = stream.next().await {
                let delivered = match item {
                    Ok(d) => d,
                    Err(err) => {
                        error!(error = %err, "event subscription error");
                        continue;
                    }
                };
                let event: Event = match meridian_wire::detect_and_deserialize(&delivered.message.data) {
                    Ok((event, _)) => event,
                    Err(err) => {
                        warn!(error = %err, "failed to decode event");
                        if let Some(ack) = &delivered.ack {
                            let _ = ack.nak().await;
                        }
                        continue;
                    }
                };
                match handler(event).await {
                    Ok(()) => {
                        if let Some(ack) = &delivered.ack {
                            let _ = ack.ack().await;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "event handler failed");
                        if let Some(ack) = &delivered.ack {
                            let _ = ack.nak().await;
                        }
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }

    /// Publishes `event` to `events.<domain>.<event_type>` via JetStream,
    /// retrying on the bus's known transient empty-reply failure.
    pub async fn publish_event(&self, event: &Event) -> Result<u64> {
        let subject = format!("events.{}.{}", event.domain, event.event_type);
        let payload = meridian_wire::encode(event, self.prefer_binary)?;
        let bus = self.bus.clone();
        let seq = crate::publish_with_retry(&subject, || {
            let bus = bus.clone();
            let subject = subject.clone();
            let payload = payload.clone();
            async move { bus.jetstream_publish_once(&subject, payload).await }
        })
        .await?;
        self.metrics
            .increment(&format!("events.published.{}.{}", event.domain, event.event_type), 1);
        Ok(seq)
    }

    /// Subscribes durably to `commands.<service>.<command>` with durable
    /// `<service>-<command>` and dispatches each command to `handler`,
    /// publishing progress and a completion callback around it.
    pub async fn register_command_handler(&self, service: &ServiceName, command: &str, handler: CommandHandler) -> Result<()> {
        let subject = command_subject(service, command);
        let options = JetStreamSubscribeOptions {
            durable: Some(format!("{service}-{command}")),
            queue: None,
            manual_ack: true,
        };
        let mut stream = self.bus.jetstream_subscribe(&subject, options).await?;
        let bus = self.bus.clone();
        let metrics = self.metrics.clone();

        let task = tokio::spawn(async move {
            use futures::StreamExt;
            while let Some(item) = stream.next().await {
                let delivered = match item {
                    Ok(d) => d,
                    Err(err) => {
                        error!(error = %err, "command subscription error");
                        continue;
                    }
                };
                let command: Command = match meridian_wire::detect_and_deserialize(&delivered.message.data) {
                    Ok((command, _)) => command,
                    Err(err) => {
                        warn!(error = %err, "failed to decode command");
                        if let Some(ack) = &delivered.ack {
                            let _ = ack.nak().await;
                        }
                        continue;
                    }
                };
                let command_id = command.envelope.message_id;
                let reporter = ProgressReporter { bus: bus.clone(), command_id };

                let callback_subject = command_callback_subject(&command_id.to_string());
                match handler(command, reporter).await {
                    Ok(result) => {
                        let payload = serde_json::json!({
                            "command_id": command_id,
                            "status": "completed",
                            "result": result,
                        });
                        if let Ok(bytes) = serde_json::to_vec(&payload) {
                            let _ = bus.publish(&callback_subject, bytes).await;
                        }
                        if let Some(ack) = &delivered.ack {
                            let _ = ack.ack().await;
                        }
                    }
                    Err(error) => {
                        metrics.increment("commands.errors", 1);
                        let payload = serde_json::json!({
                            "command_id": command_id,
                            "status": "failed",
                            "error": error,
                        });
                        if let Ok(bytes) = serde_json::to_vec(&payload) {
                            let _ = bus.publish(&callback_subject, bytes).await;
                        }
                        if let Some(ack) = &delivered.ack {
                            let _ = ack.nak().await;
                        }
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }

    /// Publishes `command` to `commands.<service>.<command>`. When
    /// `track_progress`, subscribes to both the progress sideband and the
    /// completion callback, accumulating progress updates alongside the
    /// wait for completion, until `command.timeout_seconds` elapses (§4.6).
    pub async fn send_command(&self, service: &ServiceName, command: &Command, track_progress: bool) -> Result<Value> {
        command.validate_bounds().map_err(|err| BusError::Backend {
            operation: "send_command",
            message: err.to_string(),
        })?;
        let subject = command_subject(service, &command.command);
        let command_id = command.envelope.message_id;

        let tracking = if track_progress {
            let completion = self.bus.subscribe(&command_callback_subject(&command_id.to_string()), None).await?;
            let progress = self.bus.subscribe(&command_progress_subject(&command_id.to_string()), None).await?;
            Some((completion, progress))
        } else {
            None
        };

        let payload = meridian_wire::encode(command, self.prefer_binary)?;
        let bus = self.bus.clone();
        let seq = crate::publish_with_retry(&subject, || {
            let bus = bus.clone();
            let subject = subject.clone();
            let payload = payload.clone();
            async move { bus.jetstream_publish_once(&subject, payload).await }
        })
        .await?;

        let Some((mut completion_stream, mut progress_stream)) = tracking else {
            return Ok(serde_json::json!({
                "command_id": command_id,
                "stream": "COMMANDS",
                "seq": seq,
            }));
        };

        use futures::future::{self, Either};
        use futures::StreamExt;

        let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(command.timeout_seconds);
        let mut progress_updates = Vec::new();
        let mut progress_done = false;
        let timeout_json = |progress: Vec<Value>| serde_json::json!({ "error": "Command timeout", "progress": progress });

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(timeout_json(progress_updates));
            }

            if progress_done {
                return Ok(match tokio::time::timeout(remaining, completion_stream.next()).await {
                    Ok(Some(Ok(delivered))) => merge_progress(&delivered.message.data, progress_updates),
                    _ => timeout_json(progress_updates),
                });
            }

            match tokio::time::timeout(remaining, future::select(completion_stream.next(), progress_stream.next())).await {
                Ok(Either::Left((Some(Ok(delivered)), _))) => {
                    return Ok(merge_progress(&delivered.message.data, progress_updates));
                }
                Ok(Either::Left(_)) => return Ok(timeout_json(progress_updates)),
                Ok(Either::Right((Some(Ok(delivered)), _))) => {
                    if let Ok(update) = serde_json::from_slice::<Value>(&delivered.message.data) {
                        progress_updates.push(update);
                    }
                }
                Ok(Either::Right(_)) => progress_done = true,
                Err(_) => return Ok(timeout_json(progress_updates)),
            }
        }
    }
}

/// Decodes a command completion payload and, if any progress updates were
/// observed, attaches them under `progress`.
fn merge_progress(data: &[u8], progress_updates: Vec<Value>) -> Value {
    let mut result: Value = serde_json::from_slice(data).unwrap_or_else(|_| serde_json::json!({"error": "Command timeout"}));
    if !progress_updates.is_empty() {
        if let Value::Object(map) = &mut result {
            map.insert("progress".to_string(), Value::Array(progress_updates));
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBus;
    use meridian_metrics::InMemoryMetrics;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn fabric_with(service: &str, instance_id: &str) -> (Arc<MessagingFabric>, Arc<dyn MessageBus>) {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
        bus.connect(&[]).await.unwrap();
        let metrics: Arc<dyn MetricsSink> = Arc::new(InMemoryMetrics::new());
        let fabric = Arc::new(MessagingFabric::new(
            bus.clone(),
            metrics,
            ServiceName::new(service).unwrap(),
            instance_id.to_string(),
            false,
        ));
        (fabric, bus)
    }

    #[tokio::test]
    async fn rpc_round_trip_returns_handler_result() {
        let (fabric, _bus) = fabric_with("calc", "inst-1").await;
        let service = ServiceName::new("calc").unwrap();
        let method = MethodName::new("add").unwrap();

        let handler: RpcHandler = Arc::new(|request: RpcRequest| {
            Box::pin(async move {
                let a = request.params.get("a").and_then(Value::as_i64).unwrap_or(0);
                let b = request.params.get("b").and_then(Value::as_i64).unwrap_or(0);
                Ok(serde_json::json!({ "sum": a + b }))
            })
        });
        fabric.register_rpc_handler(&service, &method, handler).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut params = StdHashMap::new();
        params.insert("a".to_string(), serde_json::json!(2));
        params.insert("b".to_string(), serde_json::json!(3));
        let request = RpcRequest::with_timeout("add", params, 1.0).unwrap();
        let response = fabric.call_rpc(&service, &method, request).await;

        assert!(response.success);
        assert_eq!(response.result.unwrap()["sum"], 5);
    }

    #[tokio::test]
    async fn rpc_handler_failure_becomes_failed_response() {
        let (fabric, _bus) = fabric_with("calc", "inst-1").await;
        let service = ServiceName::new("calc").unwrap();
        let method = MethodName::new("boom").unwrap();

        let handler: RpcHandler = Arc::new(|_req| Box::pin(async move { Err("kaboom".to_string()) }));
        fabric.register_rpc_handler(&service, &method, handler).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let request = RpcRequest::with_timeout("boom", StdHashMap::new(), 1.0).unwrap();
        let response = fabric.call_rpc(&service, &method, request).await;

        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("kaboom"));
    }

    #[tokio::test]
    async fn call_rpc_times_out_with_no_handler_registered() {
        let (fabric, _bus) = fabric_with("calc", "inst-1").await;
        let service = ServiceName::new("calc").unwrap();
        let method = MethodName::new("missing").unwrap();

        let request = RpcRequest::with_timeout("missing", StdHashMap::new(), 0.05).unwrap();
        let response = fabric.call_rpc(&service, &method, request).await;

        assert!(!response.success);
        assert!(response.error.unwrap().contains("Timeout"));
    }

    #[tokio::test]
    async fn event_publish_and_subscribe_compete_delivers_to_one_consumer() {
        let (fabric, _bus) = fabric_with("notifier", "inst-1").await;
        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = received.clone();

        let handler: EventHandler = Arc::new(move |_event| {
            let received = received_clone.clone();
            Box::pin(async move {
                received.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        fabric.subscribe_event("order.created", DeliveryMode::Compete, None, handler).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let event = Event::new("order", "created", StdHashMap::new()).unwrap();
        fabric.publish_event(&event).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn broadcast_subscribers_each_see_the_same_event() {
        let (fabric, _bus) = fabric_with("notifier", "inst-1").await;
        let a_count = Arc::new(AtomicUsize::new(0));
        let b_count = Arc::new(AtomicUsize::new(0));

        for (durable, counter) in [("watcher-a", a_count.clone()), ("watcher-b", b_count.clone())] {
            let handler: EventHandler = Arc::new(move |_event| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            });
            fabric
                .subscribe_event("order.created", DeliveryMode::Broadcast, Some(durable), handler)
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let event = Event::new("order", "created", StdHashMap::new()).unwrap();
        fabric.publish_event(&event).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(a_count.load(Ordering::SeqCst), 1);
        assert_eq!(b_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_event_pattern_is_rejected() {
        let (fabric, _bus) = fabric_with("notifier", "inst-1").await;
        let handler: EventHandler = Arc::new(|_event| Box::pin(async move { Ok(()) }));
        let err = fabric.subscribe_event("*", DeliveryMode::Compete, None, handler).await.unwrap_err();
        assert!(matches!(err, BusError::Backend { operation: "subscribe_event", .. }));
    }

    #[tokio::test]
    async fn command_round_trips_with_progress_and_completion() {
        let (fabric, _bus) = fabric_with("worker", "inst-1").await;
        let service = ServiceName::new("worker").unwrap();

        let handler: CommandHandler = Arc::new(|command, progress| {
            Box::pin(async move {
                progress.report(50.0, "halfway").await;
                Ok(serde_json::json!({ "echoed": command.command }))
            })
        });
        fabric.register_command_handler(&service, "process", handler).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let command = Command::new("process", StdHashMap::new()).unwrap();
        let result = fabric.send_command(&service, &command, true).await.unwrap();

        assert_eq!(result["status"], "completed");
        assert_eq!(result["result"]["echoed"], "process");
        assert_eq!(result["progress"][0]["status"], "halfway");
    }

    #[tokio::test]
    async fn command_send_without_tracking_returns_publish_ack() {
        let (fabric, _bus) = fabric_with("worker", "inst-1").await;
        let service = ServiceName::new("worker").unwrap();
        let command = Command::new("fire_and_forget", StdHashMap::new()).unwrap();

        let result = fabric.send_command(&service, &command, false).await.unwrap();
        assert_eq!(result["stream"], "COMMANDS");
        assert!(result["seq"].is_u64());
    }
}
