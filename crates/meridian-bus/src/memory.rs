//! Dependency-free in-memory [`MessageBus`] adapter for unit and
//! integration tests that should not require a running bus.
//!
//! Core subscriptions use an explicit subscriber table rather than
//! `tokio::sync::broadcast` (unlike [`meridian_kv::memory::InMemoryKvStore`])
//! because queue-group load balancing needs to pick exactly one subscriber
//! per message, which a broadcast channel can't express.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::Stream;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{BusError, Result};
use crate::{Ackable, DeliveredMessage, IncomingMessage, JetStreamSubscribeOptions, MessageBus, MessageStream};

struct CoreSubscriber {
    id: u64,
    pattern: String,
    queue: Option<String>,
    sender: mpsc::UnboundedSender<IncomingMessage>,
}

struct NoopAck;

#[async_trait]
impl Ackable for NoopAck {
    async fn ack(&self) -> Result<()> {
        Ok(())
    }
    async fn nak(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory [`MessageBus`]. All traffic is process-local; there is no
/// persistence, so `jetstream_subscribe`'s durability is simulated purely
/// by delivery semantics (compete vs. broadcast), not by replay.
pub struct InMemoryBus {
    connected: StdMutex<bool>,
    subscribers: Arc<StdMutex<Vec<CoreSubscriber>>>,
    next_sub_id: AtomicU64,
    round_robin: StdMutex<HashMap<String, usize>>,
    jetstream_seq: AtomicU64,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self {
            connected: StdMutex::new(false),
            subscribers: Arc::new(StdMutex::new(Vec::new())),
            next_sub_id: AtomicU64::new(0),
            round_robin: StdMutex::new(HashMap::new()),
            jetstream_seq: AtomicU64::new(0),
        }
    }

    fn require_connected(&self) -> Result<()> {
        if *self.connected.lock().unwrap() {
            Ok(())
        } else {
            Err(BusError::NotConnected)
        }
    }

    fn deliver(&self, subject: &str, data: &[u8], reply_subject: Option<String>) {
        let subs = self.subscribers.lock().unwrap();
        let matching: Vec<&CoreSubscriber> = subs.iter().filter(|s| subject_matches(&s.pattern, subject)).collect();

        let mut queue_groups: HashMap<&str, Vec<&CoreSubscriber>> = HashMap::new();
        let mut broadcast_targets = Vec::new();
        for sub in &matching {
            match &sub.queue {
                Some(queue) => queue_groups.entry(queue.as_str()).or_default().push(sub),
                None => broadcast_targets.push(*sub),
            }
        }

        for sub in broadcast_targets {
            let _ = sub.sender.send(IncomingMessage {
                subject: subject.to_string(),
                data: data.to_vec(),
                reply_subject: reply_subject.clone(),
            });
        }

        let mut round_robin = self.round_robin.lock().unwrap();
        for (queue, members) in queue_groups {
            if members.is_empty() {
                continue;
            }
            let counter = round_robin.entry(queue.to_string()).or_insert(0);
            let idx = *counter % members.len();
            *counter = counter.wrapping_add(1);
            let _ = members[idx].sender.send(IncomingMessage {
                subject: subject.to_string(),
                data: data.to_vec(),
                reply_subject: reply_subject.clone(),
            });
        }
    }

    fn register(&self, pattern: &str, queue: Option<String>) -> (u64, mpsc::UnboundedReceiver<IncomingMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().unwrap().push(CoreSubscriber {
            id,
            pattern: pattern.to_string(),
            queue,
            sender: tx,
        });
        (id, rx)
    }

    fn subscription_stream(&self, pattern: &str, queue: Option<String>) -> MessageStream {
        let (id, rx) = self.register(pattern, queue);
        let guard = SubscriptionGuard {
            id,
            subscribers: self.subscribers.clone(),
        };
        Box::pin(GuardedReceiver { inner: rx, _guard: guard })
    }
}

struct SubscriptionGuard {
    id: u64,
    subscribers: Arc<StdMutex<Vec<CoreSubscriber>>>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.subscribers.lock().unwrap().retain(|s| s.id != self.id);
    }
}

struct GuardedReceiver {
    inner: mpsc::UnboundedReceiver<IncomingMessage>,
    _guard: SubscriptionGuard,
}

impl Stream for GuardedReceiver {
    type Item = Result<DeliveredMessage>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.poll_recv(cx) {
            Poll::Ready(Some(message)) => Poll::Ready(Some(Ok(DeliveredMessage {
                message,
                ack: Some(Box::new(NoopAck)),
            }))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn connect(&self, _servers: &[String]) -> Result<()> {
        *self.connected.lock().unwrap() = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        *self.connected.lock().unwrap() = false;
        self.subscribers.lock().unwrap().clear();
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    async fn request(&self, subject: &str, data: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        self.require_connected()?;
        let inbox = format!("_INBOX.{}", Uuid::new_v4());
        let mut stream = self.subscription_stream(&inbox, None);
        self.deliver(subject, &data, Some(inbox.clone()));

        use futures::StreamExt;
        match tokio::time::timeout(timeout, stream.next()).await {
            Ok(Some(Ok(delivered))) => Ok(delivered.message.data),
            Ok(Some(Err(err))) => Err(err),
            Ok(None) => Err(BusError::Timeout { subject: subject.to_string() }),
            Err(_) => Err(BusError::Timeout { subject: subject.to_string() }),
        }
    }

    async fn publish(&self, subject: &str, data: Vec<u8>) -> Result<()> {
        self.require_connected()?;
        self.deliver(subject, &data, None);
        Ok(())
    }

    async fn subscribe(&self, subject: &str, queue: Option<String>) -> Result<MessageStream> {
        self.require_connected()?;
        Ok(self.subscription_stream(subject, queue))
    }

    async fn jetstream_subscribe(&self, subject: &str, options: JetStreamSubscribeOptions) -> Result<MessageStream> {
        self.require_connected()?;
        if options.queue.is_some() && options.durable.is_some() {
            return Err(BusError::ConflictingQueueAndDurable {
                subject: subject.to_string(),
            });
        }
        // Compete mode shares one consumer group (`queue`); broadcast mode's
        // distinct per-instance durable has no queue, so every matching
        // durable subscriber sees every message.
        Ok(self.subscription_stream(subject, options.queue))
    }

    async fn jetstream_publish_once(&self, subject: &str, data: Vec<u8>) -> Result<u64> {
        self.require_connected()?;
        self.deliver(subject, &data, None);
        Ok(self.jetstream_seq.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// NATS-style subject matching: `*` matches exactly one token, `>` matches
/// the rest of the subject and must be the final token of `pattern`.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.split('.').collect();
    let subject_parts: Vec<&str> = subject.split('.').collect();

    let mut p = pattern_parts.iter();
    let mut s = subject_parts.iter();
    loop {
        match (p.next(), s.next()) {
            (Some(&">"), _) => return true,
            (Some(&"*"), Some(_)) => continue,
            (Some(pp), Some(ss)) if pp == ss => continue,
            (Some(_), Some(_)) => return false,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn connected_bus() -> InMemoryBus {
        let bus = InMemoryBus::new();
        bus.connect(&[]).await.unwrap();
        bus
    }

    #[test]
    fn wildcard_single_token() {
        assert!(subject_matches("rpc.svc1.*", "rpc.svc1.add"));
        assert!(!subject_matches("rpc.svc1.*", "rpc.svc1.add.extra"));
    }

    #[test]
    fn wildcard_trailing_multi_token() {
        assert!(subject_matches("events.>", "events.order.created"));
        assert!(subject_matches("events.>", "events.order"));
        assert!(!subject_matches("events.>", "commands.order"));
    }

    #[tokio::test]
    async fn request_reply_round_trips() {
        let bus = Arc::new(connected_bus().await);
        let bus_for_responder = bus.clone();
        let mut incoming = bus.subscribe("rpc.echo", None).await.unwrap();
        tokio::spawn(async move {
            if let Some(Ok(delivered)) = incoming.next().await {
                let reply_to = delivered.message.reply_subject.unwrap();
                bus_for_responder.publish(&reply_to, b"pong".to_vec()).await.unwrap();
            }
        });
        let reply = bus.request("rpc.echo", b"ping".to_vec(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply, b"pong");
    }

    #[tokio::test]
    async fn request_times_out_with_no_responder() {
        let bus = connected_bus().await;
        let err = bus
            .request("rpc.nobody", b"ping".to_vec(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout { .. }));
    }

    #[tokio::test]
    async fn compete_mode_delivers_each_message_to_exactly_one_consumer() {
        let bus = connected_bus().await;
        let mut a = bus
            .jetstream_subscribe("events.order.created", JetStreamSubscribeOptions::compete("svc1"))
            .await
            .unwrap();
        let mut b = bus
            .jetstream_subscribe("events.order.created", JetStreamSubscribeOptions::compete("svc1"))
            .await
            .unwrap();

        for _ in 0..4 {
            bus.jetstream_publish_once("events.order.created", b"x".to_vec()).await.unwrap();
        }

        let mut a_count = 0;
        let mut b_count = 0;
        for _ in 0..4 {
            tokio::select! {
                Some(_) = a.next() => a_count += 1,
                Some(_) = b.next() => b_count += 1,
                else => break,
            }
        }
        assert_eq!(a_count + b_count, 4);
        assert!(a_count > 0 && b_count > 0, "compete mode should split work across consumers");
    }

    #[tokio::test]
    async fn broadcast_mode_delivers_every_message_to_every_consumer() {
        let bus = connected_bus().await;
        let mut a = bus
            .jetstream_subscribe("events.order.created", JetStreamSubscribeOptions::broadcast("watcher-a"))
            .await
            .unwrap();
        let mut b = bus
            .jetstream_subscribe("events.order.created", JetStreamSubscribeOptions::broadcast("watcher-b"))
            .await
            .unwrap();

        bus.jetstream_publish_once("events.order.created", b"x".to_vec()).await.unwrap();

        assert!(a.next().await.is_some());
        assert!(b.next().await.is_some());
    }

    #[tokio::test]
    async fn conflicting_queue_and_durable_is_rejected() {
        let bus = connected_bus().await;
        let options = JetStreamSubscribeOptions {
            durable: Some("d".to_string()),
            queue: Some("q".to_string()),
            manual_ack: true,
        };
        let err = bus.jetstream_subscribe("events.x", options).await.unwrap_err();
        assert!(matches!(err, BusError::ConflictingQueueAndDurable { .. }));
    }
}
