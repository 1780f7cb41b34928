//! Dependency-free in-memory [`KvStore`] adapter for unit and integration
//! tests that should not require a running bus.
//!
//! Grounded on the same put/CAS/watch semantics as [`crate::nats::NatsKvStore`]
//! but held entirely in a `tokio::sync::Mutex<HashMap<..>>`, with
//! `tokio::sync::broadcast` standing in for JetStream's KV watch stream.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use futures::stream::StreamExt;
use meridian_types::{KvEntry, KvOperation, KvOptions, KvWatchEvent};
use tokio::sync::broadcast;

use crate::error::{KvError, Result};
use crate::{KvStatus, KvStore, WatchStream, WatchTarget};

struct Record {
    entry: KvEntry,
    history: Vec<KvEntry>,
}

/// In-memory [`KvStore`]. `connected` tracks [`KvStore::connect`]/
/// [`KvStore::disconnect`] so tests can exercise the not-connected error
/// path without a real bus.
pub struct InMemoryKvStore {
    bucket: StdMutex<Option<String>>,
    data: StdMutex<HashMap<String, Record>>,
    events: broadcast::Sender<(String, KvWatchEvent)>,
    history_limit: usize,
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            bucket: StdMutex::new(None),
            data: StdMutex::new(HashMap::new()),
            events,
            history_limit: 10,
        }
    }

    fn require_connected(&self) -> Result<()> {
        if self.bucket.lock().unwrap().is_some() {
            Ok(())
        } else {
            Err(KvError::NotConnected)
        }
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn connect(&self, bucket: &str) -> Result<()> {
        *self.bucket.lock().unwrap() = Some(bucket.to_string());
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        *self.bucket.lock().unwrap() = None;
        self.data.lock().unwrap().clear();
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.bucket.lock().unwrap().is_some()
    }

    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        self.require_connected()?;
        Ok(self.data.lock().unwrap().get(key).map(|r| r.entry.clone()))
    }

    async fn put(&self, key: &str, value: serde_json::Value, options: KvOptions) -> Result<u64> {
        self.require_connected()?;
        options
            .validate()
            .map_err(|e| KvError::Backend(e.to_string()))?;

        let mut data = self.data.lock().unwrap();
        let existing = data.get(key);

        if options.create_only && existing.is_some() {
            return Err(KvError::KeyAlreadyExists { key: key.to_string() });
        }

        if options.update_only {
            let current = existing.ok_or_else(|| KvError::KeyNotFound { key: key.to_string() })?;
            let expected = options.revision.unwrap_or(current.entry.revision);
            if expected != current.entry.revision {
                return Err(KvError::RevisionMismatch {
                    key: key.to_string(),
                    expected,
                    found: current.entry.revision,
                });
            }
        } else if let Some(expected) = options.revision {
            if let Some(current) = existing {
                if current.entry.revision != expected {
                    return Err(KvError::RevisionMismatch {
                        key: key.to_string(),
                        expected,
                        found: current.entry.revision,
                    });
                }
            } else {
                return Err(KvError::KeyNotFound { key: key.to_string() });
            }
        }

        let next_revision = existing.map_or(1, |r| r.entry.revision + 1);
        let mut entry = KvEntry::fresh(key, value, next_revision);
        if let Some(current) = existing {
            entry.created_at = current.entry.created_at;
        }
        entry.ttl_seconds = options.ttl_seconds;

        let record = data.entry(key.to_string()).or_insert_with(|| Record {
            entry: entry.clone(),
            history: Vec::new(),
        });
        record.history.push(entry.clone());
        if record.history.len() > self.history_limit {
            record.history.remove(0);
        }
        record.entry = entry.clone();

        drop(data);
        let _ = self.events.send((key.to_string(), KvWatchEvent::put(entry.clone())));
        Ok(entry.revision)
    }

    async fn delete(&self, key: &str, revision: Option<u64>) -> Result<bool> {
        self.require_connected()?;
        let mut data = self.data.lock().unwrap();
        let Some(current) = data.get(key) else {
            return Ok(false);
        };
        if let Some(expected) = revision {
            if current.entry.revision != expected {
                return Err(KvError::RevisionMismatch {
                    key: key.to_string(),
                    expected,
                    found: current.entry.revision,
                });
            }
        }
        data.remove(key);
        drop(data);
        let _ = self.events.send((key.to_string(), KvWatchEvent::delete(key)));
        Ok(true)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.require_connected()?;
        let data = self.data.lock().unwrap();
        Ok(data
            .keys()
            .filter(|k| prefix.is_empty() || k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn watch(&self, target: WatchTarget) -> Result<WatchStream> {
        self.require_connected()?;
        let rx = self.events.subscribe();
        let stream = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(move |item| {
            let target = target.clone();
            async move {
                match item {
                    Ok((key, event)) => match &target {
                        WatchTarget::Key(want) if *want == key => Some(Ok(event)),
                        WatchTarget::Prefix(prefix) if key.starts_with(prefix.as_str()) => {
                            Some(Ok(event))
                        }
                        _ => None,
                    },
                    Err(_lagged) => None,
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn history(&self, key: &str, limit: usize) -> Result<Vec<KvEntry>> {
        self.require_connected()?;
        let data = self.data.lock().unwrap();
        Ok(data
            .get(key)
            .map(|r| {
                let mut h: Vec<KvEntry> = r.history.clone();
                h.reverse();
                h.truncate(limit);
                h
            })
            .unwrap_or_default())
    }

    async fn purge(&self, key: &str) -> Result<()> {
        self.require_connected()?;
        self.data.lock().unwrap().remove(key);
        let _ = self.events.send((key.to_string(), KvWatchEvent::purge(key)));
        Ok(())
    }

    async fn status(&self) -> Result<KvStatus> {
        let bucket = self.bucket.lock().unwrap().clone();
        let values = self.data.lock().unwrap().len() as u64;
        Ok(KvStatus {
            connected: bucket.is_some(),
            bucket,
            values: Some(values),
            history: Some(self.history_limit as u64),
            bytes: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn connected() -> InMemoryKvStore {
        let store = InMemoryKvStore::new();
        store.connect("test-bucket").await.unwrap();
        store
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = connected().await;
        let rev = store.put("k", json!("v1"), KvOptions::default()).await.unwrap();
        assert_eq!(rev, 1);
        let entry = store.get("k").await.unwrap().unwrap();
        assert_eq!(entry.value, json!("v1"));
    }

    #[tokio::test]
    async fn cas_scenario_s6() {
        let store = connected().await;
        let r1 = store.put("k", json!("v1"), KvOptions::default()).await.unwrap();
        assert_eq!(r1, 1);

        let r2 = store
            .put("k", json!("v2"), KvOptions::with_revision(1))
            .await
            .unwrap();
        assert_eq!(r2, 2);

        let err = store
            .put("k", json!("v3"), KvOptions::with_revision(1))
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::RevisionMismatch { .. }));

        let entry = store.get("k").await.unwrap().unwrap();
        assert_eq!(entry.value, json!("v2"));
    }

    #[tokio::test]
    async fn create_only_fails_on_existing_key() {
        let store = connected().await;
        store.put("k", json!(1), KvOptions::default()).await.unwrap();
        let err = store
            .put("k", json!(2), KvOptions::create_only())
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::KeyAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn update_only_fails_on_missing_key() {
        let store = connected().await;
        let err = store
            .put("missing", json!(1), KvOptions::update_only(None))
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::KeyNotFound { .. }));
    }

    #[tokio::test]
    async fn delete_reports_absence() {
        let store = connected().await;
        assert!(!store.delete("nope", None).await.unwrap());
        store.put("k", json!(1), KvOptions::default()).await.unwrap();
        assert!(store.delete("k", None).await.unwrap());
    }

    #[tokio::test]
    async fn not_connected_rejects_operations() {
        let store = InMemoryKvStore::new();
        let err = store.get("k").await.unwrap_err();
        assert!(matches!(err, KvError::NotConnected));
    }

    #[tokio::test]
    async fn watch_receives_put_events_on_matching_key() {
        let store = connected().await;
        let mut stream = store.watch(WatchTarget::Key("k".to_string())).await.unwrap();
        store.put("k", json!("v"), KvOptions::default()).await.unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), stream.next())
            .await
            .expect("event within timeout")
            .expect("stream not closed")
            .unwrap();
        assert!(matches!(event.operation, KvOperation::Put));
        assert_eq!(event.entry.unwrap().value, json!("v"));
    }

    #[tokio::test]
    async fn history_is_newest_first_and_capped() {
        let store = connected().await;
        for v in 1..=3 {
            store.put("k", json!(v), KvOptions::default()).await.unwrap();
        }
        let history = store.history("k", 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].value, json!(3));
    }

    #[tokio::test]
    async fn clear_removes_everything_under_prefix() {
        let store = connected().await;
        store.put("svc.a", json!(1), KvOptions::default()).await.unwrap();
        store.put("svc.b", json!(1), KvOptions::default()).await.unwrap();
        store.put("other", json!(1), KvOptions::default()).await.unwrap();
        let removed = store.clear("svc.").await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.get("other").await.unwrap().is_some());
    }
}
