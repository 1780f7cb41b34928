//! NATS JetStream [`KvStore`] adapter.
//!
//! Grounded on `infrastructure/nats_kv_store.py`: buckets are connected
//! lazily (get-or-create), keys are sanitized before touching the bucket
//! and the sanitized→original mapping is kept so reads and key listings
//! return the caller's own spelling, and every call records success/error
//! counters plus a timer through [`meridian_metrics::MetricsSink`].

use std::collections::HashMap as StdHashMap;
use std::sync::Mutex as StdMutex;

use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use futures::stream::StreamExt;
use meridian_metrics::MetricsSink;
use meridian_types::{KvEntry, KvOptions, KvWatchEvent, SanitizedKey};

use crate::error::{KvError, Result};
use crate::{KvStatus, KvStore, WatchStream, WatchTarget};

/// Bucket-creation parameters applied the first time a bucket is seen
/// (§4.4, §6 "KV bucket"): history depth, file storage, and a value-size
/// ceiling.
#[derive(Debug, Clone)]
pub struct NatsKvConfig {
    pub history: i64,
    pub max_value_size_bytes: i64,
    pub sanitize_keys: bool,
}

impl Default for NatsKvConfig {
    fn default() -> Self {
        Self {
            history: 10,
            max_value_size_bytes: 1024 * 1024,
            sanitize_keys: true,
        }
    }
}

struct KeyMap {
    sanitized_to_original: StdMutex<StdHashMap<String, String>>,
}

impl KeyMap {
    fn new() -> Self {
        Self {
            sanitized_to_original: StdMutex::new(StdHashMap::new()),
        }
    }

    fn sanitize(&self, config: &NatsKvConfig, key: &str) -> String {
        if !config.sanitize_keys {
            return key.to_string();
        }
        let sanitized = SanitizedKey::sanitize(key);
        if sanitized.was_sanitized() {
            self.sanitized_to_original
                .lock()
                .unwrap()
                .insert(sanitized.sanitized().to_string(), key.to_string());
        }
        sanitized.sanitized().to_string()
    }

    fn original(&self, sanitized: &str) -> String {
        self.sanitized_to_original
            .lock()
            .unwrap()
            .get(sanitized)
            .cloned()
            .unwrap_or_else(|| sanitized.to_string())
    }

    fn clear(&self) {
        self.sanitized_to_original.lock().unwrap().clear();
    }
}

/// [`KvStore`] backed by a NATS JetStream KV bucket.
pub struct NatsKvStore {
    jetstream: jetstream::Context,
    config: NatsKvConfig,
    metrics: std::sync::Arc<dyn MetricsSink>,
    store: StdMutex<Option<kv::Store>>,
    bucket_name: StdMutex<Option<String>>,
    keys: KeyMap,
}

impl NatsKvStore {
    pub fn new(
        jetstream: jetstream::Context,
        config: NatsKvConfig,
        metrics: std::sync::Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            jetstream,
            config,
            metrics,
            store: StdMutex::new(None),
            bucket_name: StdMutex::new(None),
            keys: KeyMap::new(),
        }
    }

    fn bucket(&self) -> Result<kv::Store> {
        self.store.lock().unwrap().clone().ok_or(KvError::NotConnected)
    }

    fn to_entry(&self, original_key: String, entry: kv::Entry) -> Result<KvEntry> {
        let value: serde_json::Value = if entry.value.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&entry.value)?
        };
        let now = chrono::Utc::now();
        Ok(KvEntry {
            key: original_key,
            value,
            revision: entry.revision,
            created_at: now,
            updated_at: now,
            ttl_seconds: None,
        })
    }
}

#[async_trait]
impl KvStore for NatsKvStore {
    async fn connect(&self, bucket: &str) -> Result<()> {
        let store = match self.jetstream.get_key_value(bucket).await {
            Ok(store) => store,
            Err(_) => self
                .jetstream
                .create_key_value(kv::Config {
                    bucket: bucket.to_string(),
                    history: self.config.history as i64,
                    max_value_size: self.config.max_value_size_bytes as i32,
                    storage: jetstream::stream::StorageType::File,
                    ..Default::default()
                })
                .await
                .map_err(|e| KvError::Backend(e.to_string()))?,
        };

        *self.store.lock().unwrap() = Some(store);
        *self.bucket_name.lock().unwrap() = Some(bucket.to_string());
        self.metrics.gauge("kv.buckets.active", 1.0);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        *self.store.lock().unwrap() = None;
        *self.bucket_name.lock().unwrap() = None;
        self.keys.clear();
        self.metrics.gauge("kv.buckets.active", 0.0);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.store.lock().unwrap().is_some()
    }

    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        let bucket_name = self.bucket_name.lock().unwrap().clone().unwrap_or_default();
        let _timer = meridian_metrics::timer(self.metrics.as_ref(), format!("kv.get.{bucket_name}"));
        let store = self.bucket()?;
        let safe_key = self.keys.sanitize(&self.config, key);

        match store.entry(&safe_key).await {
            Ok(Some(entry)) => {
                self.metrics.increment("kv.get.success", 1);
                Ok(Some(self.to_entry(key.to_string(), entry)?))
            }
            Ok(None) => {
                self.metrics.increment("kv.get.miss", 1);
                Ok(None)
            }
            Err(e) => {
                self.metrics.increment("kv.get.miss", 1);
                Err(KvError::Backend(e.to_string()))
            }
        }
    }

    async fn put(&self, key: &str, value: serde_json::Value, options: KvOptions) -> Result<u64> {
        options
            .validate()
            .map_err(|e| KvError::Backend(e.to_string()))?;

        let bucket_name = self.bucket_name.lock().unwrap().clone().unwrap_or_default();
        let _timer = meridian_metrics::timer(self.metrics.as_ref(), format!("kv.put.{bucket_name}"));
        let store = self.bucket()?;
        let safe_key = self.keys.sanitize(&self.config, key);
        let payload = serde_json::to_vec(&value)?;

        let result = if options.create_only {
            store
                .create(&safe_key, payload.into())
                .await
                .map_err(|e| {
                    if e.to_string().to_lowercase().contains("already") {
                        KvError::KeyAlreadyExists { key: key.to_string() }
                    } else {
                        KvError::Backend(e.to_string())
                    }
                })
        } else if options.update_only {
            let last_revision = match options.revision {
                Some(r) => r,
                None => {
                    let current = store
                        .entry(&safe_key)
                        .await
                        .map_err(|e| KvError::Backend(e.to_string()))?
                        .ok_or_else(|| KvError::KeyNotFound { key: key.to_string() })?;
                    current.revision
                }
            };
            store
                .update(&safe_key, payload.into(), last_revision)
                .await
                .map_err(|e| {
                    if e.to_string().to_lowercase().contains("wrong last revision") {
                        KvError::RevisionMismatch {
                            key: key.to_string(),
                            expected: last_revision,
                            found: 0,
                        }
                    } else {
                        KvError::Backend(e.to_string())
                    }
                })
        } else if let Some(expected_revision) = options.revision {
            let current = store
                .entry(&safe_key)
                .await
                .map_err(|e| KvError::Backend(e.to_string()))?
                .ok_or_else(|| KvError::KeyNotFound { key: key.to_string() })?;
            if current.revision != expected_revision {
                Err(KvError::RevisionMismatch {
                    key: key.to_string(),
                    expected: expected_revision,
                    found: current.revision,
                })
            } else {
                store
                    .update(&safe_key, payload.into(), expected_revision)
                    .await
                    .map_err(|e| {
                        if e.to_string().to_lowercase().contains("wrong last revision") {
                            KvError::RevisionMismatch {
                                key: key.to_string(),
                                expected: expected_revision,
                                found: 0,
                            }
                        } else {
                            KvError::Backend(e.to_string())
                        }
                    })
            }
        } else {
            store.put(&safe_key, payload.into()).await.map_err(|e| KvError::Backend(e.to_string()))
        };

        match result {
            Ok(revision) => {
                self.metrics.increment("kv.put.success", 1);
                Ok(revision)
            }
            Err(e) => {
                self.metrics.increment("kv.put.error", 1);
                Err(e)
            }
        }
    }

    async fn delete(&self, key: &str, revision: Option<u64>) -> Result<bool> {
        let bucket_name = self.bucket_name.lock().unwrap().clone().unwrap_or_default();
        let _timer = meridian_metrics::timer(self.metrics.as_ref(), format!("kv.delete.{bucket_name}"));
        let store = self.bucket()?;
        let safe_key = self.keys.sanitize(&self.config, key);

        let result = match revision {
            Some(rev) => store.delete_expect_revision(&safe_key, Some(rev)).await,
            None => store.delete(&safe_key).await,
        };

        match result {
            Ok(()) => {
                self.metrics.increment("kv.delete.success", 1);
                Ok(true)
            }
            Err(_) => {
                self.metrics.increment("kv.delete.miss", 1);
                Ok(false)
            }
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let store = self.bucket()?;
        let mut names = store.keys().await.map_err(|e| KvError::Backend(e.to_string()))?;
        let mut out = Vec::new();
        while let Some(safe_key) = names.next().await {
            let safe_key = safe_key.map_err(|e| KvError::Backend(e.to_string()))?;
            let original = self.keys.original(&safe_key);
            if prefix.is_empty() || original.starts_with(prefix) {
                out.push(original);
            }
        }
        Ok(out)
    }

    async fn watch(&self, target: WatchTarget) -> Result<WatchStream> {
        let store = self.bucket()?;
        let watcher = match &target {
            WatchTarget::Key(key) => {
                let safe_key = self.keys.sanitize(&self.config, key);
                store.watch(&safe_key).await
            }
            WatchTarget::Prefix(_) => store.watch_all().await,
        }
        .map_err(|e| KvError::Backend(e.to_string()))?;

        let keys = std::sync::Arc::new(self.keys.sanitize_lookup());
        let stream = watcher.filter_map(move |item| {
            let target = target.clone();
            let keys = keys.clone();
            async move {
                let entry = match item {
                    Ok(entry) => entry,
                    Err(_) => return None,
                };
                let original_key = keys.get(&entry.key).cloned().unwrap_or(entry.key.clone());
                if let WatchTarget::Prefix(prefix) = &target {
                    if !original_key.starts_with(prefix.as_str()) {
                        return None;
                    }
                }
                let event = match entry.operation {
                    kv::Operation::Put => {
                        let value: serde_json::Value =
                            serde_json::from_slice(&entry.value).unwrap_or(serde_json::Value::Null);
                        KvWatchEvent::put(KvEntry {
                            key: original_key,
                            value,
                            revision: entry.revision,
                            created_at: chrono::Utc::now(),
                            updated_at: chrono::Utc::now(),
                            ttl_seconds: None,
                        })
                    }
                    kv::Operation::Delete => KvWatchEvent::delete(original_key),
                    kv::Operation::Purge => KvWatchEvent::purge(original_key),
                };
                Some(Ok(event))
            }
        });
        Ok(Box::pin(stream))
    }

    async fn history(&self, key: &str, limit: usize) -> Result<Vec<KvEntry>> {
        let store = self.bucket()?;
        let safe_key = self.keys.sanitize(&self.config, key);
        let mut history = store
            .history(&safe_key)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(entry) = history.next().await {
            let entry = entry.map_err(|e| KvError::Backend(e.to_string()))?;
            out.push(self.to_entry(key.to_string(), entry)?);
            if out.len() >= limit {
                break;
            }
        }
        out.reverse();
        out.truncate(limit);
        Ok(out)
    }

    async fn purge(&self, key: &str) -> Result<()> {
        let store = self.bucket()?;
        let safe_key = self.keys.sanitize(&self.config, key);
        store.purge(&safe_key).await.map_err(|e| KvError::Backend(e.to_string()))?;
        self.metrics.increment("kv.purge", 1);
        Ok(())
    }

    async fn status(&self) -> Result<KvStatus> {
        let bucket_name = self.bucket_name.lock().unwrap().clone();
        let Some(store) = self.store.lock().unwrap().clone() else {
            return Ok(KvStatus {
                connected: false,
                ..Default::default()
            });
        };
        match store.status().await {
            Ok(status) => Ok(KvStatus {
                connected: true,
                bucket: bucket_name,
                values: Some(status.values()),
                history: Some(status.history()),
                bytes: Some(status.bytes()),
            }),
            Err(_) => Ok(KvStatus {
                connected: true,
                bucket: bucket_name,
                ..Default::default()
            }),
        }
    }
}

impl KeyMap {
    fn sanitize_lookup(&self) -> StdHashMap<String, String> {
        self.sanitized_to_original.lock().unwrap().clone()
    }
}
