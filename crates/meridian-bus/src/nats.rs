//! NATS JetStream [`MessageBus`] adapter.
//!
//! Grounded on `meridian-kv`'s `NatsKvStore` (bucket connect-or-create,
//! metrics timers, sanitized-key bookkeeping): here the equivalent lazy
//! setup is a small pool of connections plus the `EVENTS`/`COMMANDS`
//! streams, created on first connect if absent.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_nats::jetstream::{self, consumer::AckPolicy};
use async_trait::async_trait;
use futures::stream::StreamExt;
use meridian_metrics::MetricsSink;

use crate::error::{BusError, Result};
use crate::{Ackable, DeliveredMessage, IncomingMessage, JetStreamSubscribeOptions, MessageBus, MessageStream};

/// Hard ceiling on connection pool size (§4.3).
const MAX_CONNECTIONS: usize = 10;

/// Connection pool sizing for a [`NatsBus`] (§4.3: "N, default 1, max 10").
#[derive(Debug, Clone)]
pub struct NatsBusConfig {
    pub max_connections: usize,
}

impl Default for NatsBusConfig {
    fn default() -> Self {
        Self { max_connections: 1 }
    }
}

/// [`MessageBus`] backed by one or more NATS connections sharing a single
/// JetStream context built off the first live connection.
pub struct NatsBus {
    config: NatsBusConfig,
    metrics: Arc<dyn MetricsSink>,
    connections: StdMutex<Vec<async_nats::Client>>,
    jetstream: StdMutex<Option<jetstream::Context>>,
    next_connection: AtomicUsize,
}

impl NatsBus {
    pub fn new(config: NatsBusConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            config,
            metrics,
            connections: StdMutex::new(Vec::new()),
            jetstream: StdMutex::new(None),
            next_connection: AtomicUsize::new(0),
        }
    }

    fn jetstream_context(&self) -> Result<jetstream::Context> {
        self.jetstream.lock().unwrap().clone().ok_or(BusError::NotConnected)
    }

    /// Round-robin selection with liveness fallback (§4.3, §5 "Shared
    /// resources"): starts at the next index and walks the pool once,
    /// returning the first connection whose reported state is `Connected`.
    fn pick_connection(&self) -> Result<async_nats::Client> {
        let connections = self.connections.lock().unwrap();
        if connections.is_empty() {
            return Err(BusError::NotConnected);
        }
        let start = self.next_connection.fetch_add(1, Ordering::SeqCst);
        for offset in 0..connections.len() {
            let idx = (start + offset) % connections.len();
            let candidate = &connections[idx];
            if candidate.connection_state() == async_nats::connection::State::Connected {
                return Ok(candidate.clone());
            }
        }
        Err(BusError::AllConnectionsDead)
    }

    async fn ensure_stream(
        js: &jetstream::Context,
        name: &'static str,
        subjects: Vec<String>,
        retention: jetstream::stream::RetentionPolicy,
        max_messages: i64,
    ) -> Result<()> {
        if js.get_stream(name).await.is_ok() {
            return Ok(());
        }
        js.create_stream(jetstream::stream::Config {
            name: name.to_string(),
            subjects,
            retention,
            max_messages,
            storage: jetstream::stream::StorageType::File,
            ..Default::default()
        })
        .await
        .map_err(|e| BusError::Backend {
            operation: "create_stream",
            message: e.to_string(),
        })?;
        Ok(())
    }

    async fn ensure_streams(js: &jetstream::Context) -> Result<()> {
        Self::ensure_stream(
            js,
            "EVENTS",
            vec!["events.>".to_string()],
            jetstream::stream::RetentionPolicy::Limits,
            100_000,
        )
        .await?;
        Self::ensure_stream(
            js,
            "COMMANDS",
            vec!["commands.>".to_string()],
            jetstream::stream::RetentionPolicy::WorkQueue,
            10_000,
        )
        .await?;
        Ok(())
    }

    fn stream_for_subject(subject: &str) -> &'static str {
        if subject.starts_with("commands.") {
            "COMMANDS"
        } else {
            "EVENTS"
        }
    }
}

struct JetStreamAck(jetstream::Message);

#[async_trait]
impl Ackable for JetStreamAck {
    async fn ack(&self) -> Result<()> {
        self.0.ack().await.map_err(|e| BusError::Backend {
            operation: "ack",
            message: e.to_string(),
        })
    }

    async fn nak(&self) -> Result<()> {
        self.0
            .ack_with(jetstream::AckKind::Nak(None))
            .await
            .map_err(|e| BusError::Backend {
                operation: "nak",
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn connect(&self, servers: &[String]) -> Result<()> {
        if servers.is_empty() {
            return Err(BusError::Backend {
                operation: "connect",
                message: "no bus servers configured".to_string(),
            });
        }
        let wanted = self.config.max_connections.clamp(1, MAX_CONNECTIONS).min(servers.len());

        let mut new_connections = Vec::with_capacity(wanted);
        for server in servers.iter().take(wanted) {
            let client = async_nats::connect(server.as_str()).await.map_err(|e| BusError::Backend {
                operation: "connect",
                message: e.to_string(),
            })?;
            new_connections.push(client);
        }

        let js = jetstream::new(new_connections[0].clone());
        Self::ensure_streams(&js).await?;

        *self.connections.lock().unwrap() = new_connections;
        *self.jetstream.lock().unwrap() = Some(js);
        let active = self.connections.lock().unwrap().len();
        self.metrics.gauge("bus.connections.active", active as f64);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connections.lock().unwrap().clear();
        *self.jetstream.lock().unwrap() = None;
        self.metrics.gauge("bus.connections.active", 0.0);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.connection_state() == async_nats::connection::State::Connected)
    }

    async fn request(&self, subject: &str, data: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        let client = self.pick_connection()?;
        let _timer = meridian_metrics::timer(self.metrics.as_ref(), format!("bus.request.{subject}"));
        let reply = tokio::time::timeout(timeout, client.request(subject.to_string(), data.into()))
            .await
            .map_err(|_| BusError::Timeout { subject: subject.to_string() })?
            .map_err(|e| BusError::Backend {
                operation: "request",
                message: e.to_string(),
            })?;
        Ok(reply.payload.to_vec())
    }

    async fn publish(&self, subject: &str, data: Vec<u8>) -> Result<()> {
        let client = self.pick_connection()?;
        client
            .publish(subject.to_string(), data.into())
            .await
            .map_err(|e| BusError::Backend {
                operation: "publish",
                message: e.to_string(),
            })
    }

    async fn subscribe(&self, subject: &str, queue: Option<String>) -> Result<MessageStream> {
        let client = self.pick_connection()?;
        let subscriber = match queue {
            Some(queue) => client.queue_subscribe(subject.to_string(), queue).await,
            None => client.subscribe(subject.to_string()).await,
        }
        .map_err(|e| BusError::Backend {
            operation: "subscribe",
            message: e.to_string(),
        })?;

        let stream = subscriber.map(|msg| {
            Ok(DeliveredMessage {
                message: IncomingMessage {
                    subject: msg.subject.to_string(),
                    data: msg.payload.to_vec(),
                    reply_subject: msg.reply.map(|r| r.to_string()),
                },
                ack: None,
            })
        });
        Ok(Box::pin(stream))
    }

    async fn jetstream_subscribe(&self, subject: &str, options: JetStreamSubscribeOptions) -> Result<MessageStream> {
        if options.queue.is_some() && options.durable.is_some() {
            return Err(BusError::ConflictingQueueAndDurable {
                subject: subject.to_string(),
            });
        }
        let durable_name = options.queue.clone().or_else(|| options.durable.clone()).ok_or_else(|| BusError::Backend {
            operation: "jetstream_subscribe",
            message: "jetstream_subscribe requires durable or queue".to_string(),
        })?;

        let js = self.jetstream_context()?;
        let stream_name = Self::stream_for_subject(subject);
        let stream = js.get_stream(stream_name).await.map_err(|e| BusError::Backend {
            operation: "get_stream",
            message: e.to_string(),
        })?;

        let consumer_config = jetstream::consumer::pull::Config {
            durable_name: Some(durable_name.clone()),
            filter_subject: subject.to_string(),
            ack_policy: AckPolicy::Explicit,
            ..Default::default()
        };
        let consumer: jetstream::consumer::PullConsumer = stream
            .get_or_create_consumer(&durable_name, consumer_config)
            .await
            .map_err(|e| BusError::Backend {
                operation: "get_or_create_consumer",
                message: e.to_string(),
            })?;
        let messages = consumer.messages().await.map_err(|e| BusError::Backend {
            operation: "consumer_messages",
            message: e.to_string(),
        })?;

        let stream = messages.map(|item| {
            let msg = item.map_err(|e| BusError::Backend {
                operation: "jetstream_message",
                message: e.to_string(),
            })?;
            let subject = msg.subject.to_string();
            let data = msg.payload.to_vec();
            let reply_subject = msg.reply.as_ref().map(|r| r.to_string());
            let ack: Box<dyn Ackable> = Box::new(JetStreamAck(msg));
            Ok(DeliveredMessage {
                message: IncomingMessage { subject, data, reply_subject },
                ack: Some(ack),
            })
        });
        Ok(Box::pin(stream))
    }

    async fn jetstream_publish_once(&self, subject: &str, data: Vec<u8>) -> Result<u64> {
        let js = self.jetstream_context()?;
        let ack = js
            .publish(subject.to_string(), data.into())
            .await
            .map_err(|e| BusError::Backend {
                operation: "jetstream_publish",
                message: e.to_string(),
            })?
            .await
            .map_err(|e| BusError::Backend {
                operation: "jetstream_publish_ack",
                message: e.to_string(),
            })?;
        Ok(ack.sequence)
    }
}
