//! Bus adapter (C3) and messaging fabric (C6): a narrow [`MessageBus`] port
//! with an in-memory adapter for tests and a NATS JetStream adapter, plus
//! [`fabric::MessagingFabric`] which layers RPC/event/command semantics on
//! top of either.

pub mod error;
pub mod fabric;
pub mod memory;
pub mod nats;

pub use error::{BusError, Result};
pub use fabric::{CommandHandler, EventHandler, MessagingFabric, ProgressReporter, RpcHandler};
pub use memory::InMemoryBus;
pub use nats::{NatsBus, NatsBusConfig};

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::warn;

/// How an event subscription's durable consumer is shared across instances
/// (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// One consumer group per service: each message goes to exactly one
    /// instance.
    Compete,
    /// One durable consumer per instance: every instance sees every message.
    Broadcast,
}

/// Options for [`MessageBus::jetstream_subscribe`] (§4.3/§4.6). `queue` and
/// `durable` are mutually exclusive — `queue` implies its own durable name.
#[derive(Debug, Clone, Default)]
pub struct JetStreamSubscribeOptions {
    pub durable: Option<String>,
    pub queue: Option<String>,
    pub manual_ack: bool,
}

impl JetStreamSubscribeOptions {
    /// A compete-mode subscription sharing `queue` as both the consumer
    /// group name and its implicit durable name.
    pub fn compete(queue: impl Into<String>) -> Self {
        Self {
            durable: None,
            queue: Some(queue.into()),
            manual_ack: true,
        }
    }

    /// A broadcast-mode subscription: a distinct durable per instance, no queue.
    pub fn broadcast(durable: impl Into<String>) -> Self {
        Self {
            durable: Some(durable.into()),
            queue: None,
            manual_ack: true,
        }
    }
}

/// A message delivered to a subscriber, independent of whether it came off
/// a core or JetStream subscription.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub subject: String,
    pub data: Vec<u8>,
    pub reply_subject: Option<String>,
}

/// The ack/nak capability a JetStream-delivered message carries. Core
/// (non-durable) messages have no such handle — acking them is a no-op the
/// fabric simply skips.
#[async_trait]
pub trait Ackable: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nak(&self) -> Result<()>;
}

/// A delivered message paired with its (optional) ack handle.
pub struct DeliveredMessage {
    pub message: IncomingMessage,
    pub ack: Option<Box<dyn Ackable>>,
}

/// A stream of delivered messages, boxed so every adapter shares one return type.
pub type MessageStream = BoxStream<'static, Result<DeliveredMessage>>;

/// The narrow interface C6 (and everything above it) drives: connect/
/// disconnect, request/reply, core and durable subscriptions, and publish
/// with the transient-empty-reply retry loop baked in.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Connects to up to `servers.len()` bus servers (capped at 10, §4.3)
    /// and initializes JetStream, creating the `EVENTS`/`COMMANDS` streams
    /// if absent.
    async fn connect(&self, servers: &[String]) -> Result<()>;

    /// Disconnects every connection.
    async fn disconnect(&self) -> Result<()>;

    /// Whether at least one connection is currently live.
    async fn is_connected(&self) -> bool;

    /// Sends `data` to `subject` and awaits a single reply within `timeout`.
    async fn request(&self, subject: &str, data: Vec<u8>, timeout: Duration) -> Result<Vec<u8>>;

    /// Publishes `data` to `subject` with no durability (used for replies
    /// and sideband channels like progress/callback).
    async fn publish(&self, subject: &str, data: Vec<u8>) -> Result<()>;

    /// Opens a non-durable, wildcard-capable subscription, optionally
    /// joining queue group `queue` for load balancing.
    async fn subscribe(&self, subject: &str, queue: Option<String>) -> Result<MessageStream>;

    /// Opens a durable JetStream subscription per `options`.
    async fn jetstream_subscribe(&self, subject: &str, options: JetStreamSubscribeOptions) -> Result<MessageStream>;

    /// Publishes `data` to `subject` via JetStream, returning the new
    /// stream sequence number. Callers should route through
    /// [`publish_with_retry`] rather than calling a raw single attempt
    /// directly, to absorb the bus's known transient empty-reply bug.
    async fn jetstream_publish_once(&self, subject: &str, data: Vec<u8>) -> Result<u64>;
}

/// Retries `attempt` up to 3 times with `10ms * 2^(attempt-1)` backoff
/// between tries (§5, capping total wall time across the retry loop at
/// ~30ms), for the bus's known transient empty-reply failure mode on
/// JetStream publish. Any other error is not retried.
pub async fn publish_with_retry<F, Fut>(subject: &str, attempt: F) -> Result<u64>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<u64>>,
{
    const MAX_ATTEMPTS: u32 = 3;
    let mut last_err = None;
    for n in 0..MAX_ATTEMPTS {
        if n > 0 {
            let backoff = Duration::from_millis(10 * 2u64.pow(n - 1));
            tokio::time::sleep(backoff).await;
        }
        match attempt().await {
            Ok(seq) => return Ok(seq),
            Err(err) if is_transient(&err) => {
                warn!(subject, attempt = n + 1, error = %err, "transient jetstream publish failure, retrying");
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.expect("loop always records an error before exhausting attempts"))
}

fn is_transient(err: &BusError) -> bool {
    matches!(err, BusError::Backend { message, .. } if message.to_lowercase().contains("empty"))
}

#[async_trait]
impl MessageBus for std::sync::Arc<dyn MessageBus> {
    async fn connect(&self, servers: &[String]) -> Result<()> {
        self.as_ref().connect(servers).await
    }
    async fn disconnect(&self) -> Result<()> {
        self.as_ref().disconnect().await
    }
    async fn is_connected(&self) -> bool {
        self.as_ref().is_connected().await
    }
    async fn request(&self, subject: &str, data: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        self.as_ref().request(subject, data, timeout).await
    }
    async fn publish(&self, subject: &str, data: Vec<u8>) -> Result<()> {
        self.as_ref().publish(subject, data).await
    }
    async fn subscribe(&self, subject: &str, queue: Option<String>) -> Result<MessageStream> {
        self.as_ref().subscribe(subject, queue).await
    }
    async fn jetstream_subscribe(&self, subject: &str, options: JetStreamSubscribeOptions) -> Result<MessageStream> {
        self.as_ref().jetstream_subscribe(subject, options).await
    }
    async fn jetstream_publish_once(&self, subject: &str, data: Vec<u8>) -> Result<u64> {
        self.as_ref().jetstream_publish_once(subject, data).await
    }
}
