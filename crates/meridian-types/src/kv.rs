//! KV abstraction data types (§3, §4.4): entries, write options, watch events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, ValidationError};

/// A stored KV entry with its revision and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvEntry {
    pub key: String,
    pub value: Value,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}

impl KvEntry {
    /// Builds a freshly-written entry (`created_at == updated_at`).
    pub fn fresh(key: impl Into<String>, value: Value, revision: u64) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            value,
            revision,
            created_at: now,
            updated_at: now,
            ttl_seconds: None,
        }
    }
}

/// Write options for [`KvEntry`] puts: TTL, CAS revision, and create/update
/// exclusivity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KvOptions {
    pub ttl_seconds: Option<u64>,
    pub revision: Option<u64>,
    pub create_only: bool,
    pub update_only: bool,
}

impl KvOptions {
    /// Validates the mutual exclusivity of `create_only`/`update_only`.
    pub fn validate(&self) -> Result<()> {
        if self.create_only && self.update_only {
            Err(ValidationError::ExclusiveOptionsConflict)
        } else {
            Ok(())
        }
    }

    /// Options requesting atomic creation (fails if the key exists).
    pub fn create_only() -> Self {
        Self {
            create_only: true,
            ..Self::default()
        }
    }

    /// Options requesting a revision-checked update.
    pub fn update_only(revision: Option<u64>) -> Self {
        Self {
            update_only: true,
            revision,
            ..Self::default()
        }
    }

    /// Options requesting a revision-checked write without create/update exclusivity.
    pub fn with_revision(revision: u64) -> Self {
        Self {
            revision: Some(revision),
            ..Self::default()
        }
    }

    /// Options carrying only a TTL hint.
    pub fn with_ttl(ttl_seconds: u64) -> Self {
        Self {
            ttl_seconds: Some(ttl_seconds),
            ..Self::default()
        }
    }
}

/// The kind of mutation a [`KvWatchEvent`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvOperation {
    Put,
    Delete,
    Purge,
}

/// An event delivered by a KV watch stream. `entry` is required on `Put` and
/// absent on `Delete`/`Purge`; `key` is populated on every operation so a
/// removal can still be routed without an entry to read the key from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvWatchEvent {
    pub operation: KvOperation,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<KvEntry>,
    pub timestamp: DateTime<Utc>,
}

impl KvWatchEvent {
    /// Builds a `Put` event; panics in debug builds if `entry` is absent
    /// since that would violate the invariant this type exists to enforce.
    pub fn put(entry: KvEntry) -> Self {
        Self {
            operation: KvOperation::Put,
            key: entry.key.clone(),
            entry: Some(entry),
            timestamp: Utc::now(),
        }
    }

    /// Builds a `Delete` event for `key`.
    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            operation: KvOperation::Delete,
            key: key.into(),
            entry: None,
            timestamp: Utc::now(),
        }
    }

    /// Builds a `Purge` event for `key`.
    pub fn purge(key: impl Into<String>) -> Self {
        Self {
            operation: KvOperation::Purge,
            key: key.into(),
            entry: None,
            timestamp: Utc::now(),
        }
    }

    /// Validates the PUT-requires-entry / DELETE-PURGE-no-entry invariant.
    pub fn validate(&self) -> Result<()> {
        match (self.operation, &self.entry) {
            (KvOperation::Put, None) => Err(ValidationError::InconsistentResult),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_update_only_are_exclusive() {
        let opts = KvOptions {
            create_only: true,
            update_only: true,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn put_event_requires_entry() {
        let evt = KvWatchEvent {
            operation: KvOperation::Put,
            key: "k".to_string(),
            entry: None,
            timestamp: Utc::now(),
        };
        assert!(evt.validate().is_err());
    }

    #[test]
    fn delete_event_has_no_entry() {
        let evt = KvWatchEvent::delete("k");
        assert!(evt.entry.is_none());
        assert_eq!(evt.key, "k");
        evt.validate().unwrap();
    }
}
