//! KV store abstraction (C4): a narrow [`KvStore`] port plus a NATS
//! JetStream adapter and a dependency-free in-memory adapter for tests.
//!
//! Buckets are created lazily with history=10, file storage, 1 MiB max
//! value size, and no default TTL (§4.4). Keys are sanitized before they
//! reach the backend — any of space/tab/`.`/`*`/`>`/`/`/`\`/`:` becomes `_`
//! — and the original key is remembered so reads and key listings return
//! the caller's own spelling, not the sanitized one.

pub mod error;
pub mod memory;
pub mod nats;

pub use error::{KvError, Result};
pub use memory::InMemoryKvStore;
pub use nats::{NatsKvConfig, NatsKvStore};

use async_trait::async_trait;
use futures::stream::BoxStream;
use meridian_types::{KvEntry, KvOptions, KvWatchEvent};

/// Either a specific key or a prefix to [`KvStore::watch`], never both
/// (§4.4, §7 `WatchKeyAndPrefix`).
#[derive(Debug, Clone)]
pub enum WatchTarget {
    Key(String),
    Prefix(String),
}

/// A stream of [`KvWatchEvent`]s, boxed so trait objects and concrete
/// adapters share one return type.
pub type WatchStream = BoxStream<'static, Result<KvWatchEvent>>;

/// The narrow interface every KV backend implements: connect/disconnect,
/// single-key CRUD with optional CAS, batch helpers, watch, history,
/// purge/clear, and a status snapshot.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Connects to (creating if absent) the named bucket.
    async fn connect(&self, bucket: &str) -> Result<()>;

    /// Disconnects, forgetting the bucket handle and key-sanitization map.
    async fn disconnect(&self) -> Result<()>;

    /// Whether [`connect`](KvStore::connect) has succeeded and
    /// [`disconnect`](KvStore::disconnect) has not since been called.
    async fn is_connected(&self) -> bool;

    /// Reads the entry for `key`, or `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<KvEntry>>;

    /// Writes `value` under `key`, honoring `options`'s CAS/TTL/exclusivity
    /// flags, and returns the new revision.
    async fn put(&self, key: &str, value: serde_json::Value, options: KvOptions) -> Result<u64>;

    /// Deletes `key`, optionally gated by `revision`. Returns `false` if the
    /// key was already absent.
    async fn delete(&self, key: &str, revision: Option<u64>) -> Result<bool>;

    /// Whether `key` currently has a live value.
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Lists keys (in their original, unsanitized form) under `prefix`, or
    /// every key when `prefix` is empty.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Reads multiple keys, returning only the ones found.
    async fn get_many(&self, keys: &[String]) -> Result<std::collections::HashMap<String, KvEntry>> {
        let mut out = std::collections::HashMap::new();
        for key in keys {
            if let Some(entry) = self.get(key).await? {
                out.insert(key.clone(), entry);
            }
        }
        Ok(out)
    }

    /// Writes multiple key/value pairs with the same `options`, returning
    /// each key's new revision.
    async fn put_many(
        &self,
        entries: &std::collections::HashMap<String, serde_json::Value>,
        options: KvOptions,
    ) -> Result<std::collections::HashMap<String, u64>> {
        let mut out = std::collections::HashMap::new();
        for (key, value) in entries {
            let revision = self.put(key, value.clone(), options.clone()).await?;
            out.insert(key.clone(), revision);
        }
        Ok(out)
    }

    /// Deletes multiple keys, returning each key's delete outcome.
    async fn delete_many(&self, keys: &[String]) -> Result<std::collections::HashMap<String, bool>> {
        let mut out = std::collections::HashMap::new();
        for key in keys {
            out.insert(key.clone(), self.delete(key, None).await?);
        }
        Ok(out)
    }

    /// Opens a watch stream on a single key or a prefix. Errors with
    /// [`KvError::WatchKeyAndPrefix`] is not reachable through this
    /// signature since [`WatchTarget`] is already exclusive by construction.
    async fn watch(&self, target: WatchTarget) -> Result<WatchStream>;

    /// Returns the revision history for `key`, newest first, capped at
    /// `limit` entries.
    async fn history(&self, key: &str, limit: usize) -> Result<Vec<KvEntry>>;

    /// Removes every revision of `key`.
    async fn purge(&self, key: &str) -> Result<()>;

    /// Deletes every key under `prefix` (or all keys, if empty), returning
    /// the count removed.
    async fn clear(&self, prefix: &str) -> Result<usize> {
        let keys = self.keys(prefix).await?;
        let results = self.delete_many(&keys).await?;
        Ok(results.values().filter(|ok| **ok).count())
    }

    /// A best-effort status snapshot (bucket name, connectivity, and
    /// whatever size/history fields the backend exposes).
    async fn status(&self) -> Result<KvStatus>;
}

/// A best-effort status snapshot returned by [`KvStore::status`].
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct KvStatus {
    pub connected: bool,
    pub bucket: Option<String>,
    pub values: Option<u64>,
    pub history: Option<u64>,
    pub bytes: Option<u64>,
}
