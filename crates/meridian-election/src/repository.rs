//! Election repository (C9): atomic CAS over KV for the leader key, plus
//! aggregate persistence for [`StickyActiveElection`].
//!
//! The leader key (`sticky-active.<service>.<group>.leader`) is acquired
//! with a `create_only` put, refreshed with a revision-checked put, and
//! released with a revision-checked delete — the same CAS discipline
//! [`meridian_kv::KvStore`] already exposes, just aimed at one well-known key.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use meridian_kv::{KvStore, WatchTarget};
use meridian_types::{
    patterns::{election_state_key, leader_key},
    KvOperation, KvOptions, LeaderRecord, ServiceName, StickyActiveElection,
};
use serde_json::Value;
use tracing::debug;

use crate::error::{ElectionError, Result};

/// The kind of change [`ElectionRepository::watch_leadership`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipEventKind {
    /// A new leader record was written.
    Elected,
    /// The leader record was removed by its holder (a clean step-down).
    Lost,
    /// The leader record was purged (its full history removed).
    Expired,
}

/// A leadership change observed on the watch stream.
#[derive(Debug, Clone)]
pub struct LeadershipEvent {
    pub kind: LeadershipEventKind,
    pub leader_id: Option<String>,
    pub metadata: HashMap<String, Value>,
    pub timestamp: chrono::DateTime<Utc>,
}

pub type LeadershipWatchStream = futures::stream::BoxStream<'static, Result<LeadershipEvent>>;

/// CAS-based access to the leader key and election-state aggregate, backed
/// by a shared [`KvStore`].
pub struct ElectionRepository {
    kv: Arc<dyn KvStore>,
}

impl ElectionRepository {
    /// Wraps an already-connected KV store.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Attempts to atomically become leader. `true` on success; `false` if
    /// someone already holds the key (not an error).
    pub async fn attempt_leadership(
        &self,
        service: &ServiceName,
        instance_id: &str,
        group: &str,
        ttl_seconds: u64,
        metadata: Option<HashMap<String, Value>>,
    ) -> Result<bool> {
        let key = leader_key(service, group);
        let mut record = LeaderRecord::new(instance_id, service.as_str(), group, ttl_seconds);
        if let Some(metadata) = metadata {
            record.metadata = metadata;
        }
        let value = serde_json::to_value(&record).map_err(|source| ElectionError::CorruptRecord {
            key: key.clone(),
            source,
        })?;
        match self.kv.put(&key, value, KvOptions::create_only()).await {
            Ok(_) => {
                debug!(service = %service, instance = %instance_id, group, "acquired leadership");
                Ok(true)
            }
            Err(meridian_kv::KvError::KeyAlreadyExists { .. }) => Ok(false),
            Err(source) => Err(ElectionError::Kv {
                operation: "attempt_leadership",
                source,
            }),
        }
    }

    /// Refreshes the leader record's heartbeat and TTL. `false` if the key
    /// is absent or held by someone else; errors only on backend failure or
    /// a revision race lost to a concurrent writer.
    pub async fn update_leadership(
        &self,
        service: &ServiceName,
        instance_id: &str,
        group: &str,
        ttl_seconds: u64,
    ) -> Result<bool> {
        let key = leader_key(service, group);
        let Some(entry) = self.kv.get(&key).await.map_err(|source| ElectionError::Kv {
            operation: "update_leadership.get",
            source,
        })?
        else {
            return Ok(false);
        };
        let current: LeaderRecord = serde_json::from_value(entry.value).map_err(|source| ElectionError::CorruptRecord {
            key: key.clone(),
            source,
        })?;
        if current.instance_id != instance_id {
            return Ok(false);
        }
        let mut next = current;
        next.last_heartbeat = Utc::now();
        next.ttl_seconds = ttl_seconds;
        let value = serde_json::to_value(&next).map_err(|source| ElectionError::CorruptRecord {
            key: key.clone(),
            source,
        })?;
        match self
            .kv
            .put(&key, value, KvOptions::update_only(Some(entry.revision)))
            .await
        {
            Ok(_) => Ok(true),
            Err(meridian_kv::KvError::RevisionMismatch { .. }) => Ok(false),
            Err(source) => Err(ElectionError::Kv {
                operation: "update_leadership.put",
                source,
            }),
        }
    }

    /// Releases leadership, verifying ownership first. A no-op (returns
    /// `Ok(())`) if we are not the current leader.
    pub async fn release_leadership(&self, service: &ServiceName, instance_id: &str, group: &str) -> Result<()> {
        let key = leader_key(service, group);
        let Some(entry) = self.kv.get(&key).await.map_err(|source| ElectionError::Kv {
            operation: "release_leadership.get",
            source,
        })?
        else {
            return Ok(());
        };
        let current: LeaderRecord = serde_json::from_value(entry.value).map_err(|source| ElectionError::CorruptRecord {
            key: key.clone(),
            source,
        })?;
        if current.instance_id != instance_id {
            return Err(ElectionError::NotLeader {
                service: service.as_str().to_string(),
                group: group.to_string(),
                instance_id: instance_id.to_string(),
            });
        }
        self.kv
            .delete(&key, Some(entry.revision))
            .await
            .map_err(|source| ElectionError::Kv {
                operation: "release_leadership.delete",
                source,
            })?;
        debug!(service = %service, instance = %instance_id, group, "released leadership");
        Ok(())
    }

    /// Reads the current leader record, treating a stale record (heartbeat
    /// older than its own TTL) as no leader at all.
    pub async fn get_current_leader(&self, service: &ServiceName, group: &str) -> Result<Option<LeaderRecord>> {
        let key = leader_key(service, group);
        let Some(entry) = self.kv.get(&key).await.map_err(|source| ElectionError::Kv {
            operation: "get_current_leader",
            source,
        })?
        else {
            return Ok(None);
        };
        let record: LeaderRecord = serde_json::from_value(entry.value).map_err(|source| ElectionError::CorruptRecord {
            key: key.clone(),
            source,
        })?;
        if record.is_stale(Utc::now()) {
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Adapts the leader key's KV watch stream to leadership events: `PUT`
    /// maps to `Elected`, a clean `DELETE` to `Lost`, and a `PURGE` (history
    /// wipe, used when a record is discarded wholesale rather than released
    /// in the ordinary course) to `Expired`.
    pub async fn watch_leadership(&self, service: &ServiceName, group: &str) -> Result<LeadershipWatchStream> {
        let key = leader_key(service, group);
        let stream = self
            .kv
            .watch(WatchTarget::Key(key.clone()))
            .await
            .map_err(|source| ElectionError::Kv {
                operation: "watch_leadership",
                source,
            })?;
        let key_for_errors = key.clone();
        let mapped = stream.map(move |event| {
            let event = event.map_err(|source| ElectionError::Kv {
                operation: "watch_leadership.stream",
                source,
            })?;
            Ok(match event.operation {
                KvOperation::Put => {
                    let entry = event.entry.expect("PUT watch event always carries an entry");
                    let record: LeaderRecord =
                        serde_json::from_value(entry.value).map_err(|source| ElectionError::CorruptRecord {
                            key: key_for_errors.clone(),
                            source,
                        })?;
                    LeadershipEvent {
                        kind: LeadershipEventKind::Elected,
                        leader_id: Some(record.instance_id),
                        metadata: record.metadata,
                        timestamp: event.timestamp,
                    }
                }
                KvOperation::Delete => LeadershipEvent {
                    kind: LeadershipEventKind::Lost,
                    leader_id: None,
                    metadata: HashMap::new(),
                    timestamp: event.timestamp,
                },
                KvOperation::Purge => LeadershipEvent {
                    kind: LeadershipEventKind::Expired,
                    leader_id: None,
                    metadata: HashMap::new(),
                    timestamp: event.timestamp,
                },
            })
        });
        Ok(Box::pin(mapped))
    }

    /// Persists the election-state aggregate under its underscore-separated key.
    pub async fn save_election_state(&self, aggregate: &StickyActiveElection) -> Result<()> {
        let service = ServiceName::new(aggregate.service_name.clone())
            .map_err(|_| ElectionError::NotLeader {
                service: aggregate.service_name.clone(),
                group: aggregate.group_id.clone(),
                instance_id: aggregate.instance_id.clone(),
            })?;
        let key = election_state_key(&service, &aggregate.instance_id, &aggregate.group_id);
        let value = serialize_aggregate(aggregate);
        self.kv
            .put(&key, value, KvOptions::default())
            .await
            .map_err(|source| ElectionError::Kv {
                operation: "save_election_state",
                source,
            })?;
        Ok(())
    }

    /// Reads a previously-saved election-state aggregate, if any.
    pub async fn get_election_state(
        &self,
        service: &ServiceName,
        instance_id: &str,
        group: &str,
    ) -> Result<Option<StickyActiveElection>> {
        let key = election_state_key(service, instance_id, group);
        let Some(entry) = self.kv.get(&key).await.map_err(|source| ElectionError::Kv {
            operation: "get_election_state",
            source,
        })?
        else {
            return Ok(None);
        };
        deserialize_aggregate(&entry.value)
            .map(Some)
            .map_err(|source| ElectionError::CorruptRecord { key, source })
    }

    /// Removes a previously-saved election-state aggregate.
    pub async fn delete_election_state(&self, service: &ServiceName, instance_id: &str, group: &str) -> Result<()> {
        let key = election_state_key(service, instance_id, group);
        self.kv.delete(&key, None).await.map_err(|source| ElectionError::Kv {
            operation: "delete_election_state",
            source,
        })?;
        Ok(())
    }
}

/// [`StickyActiveElection`] has no `Serialize`/`Deserialize` impl of its own
/// (it enforces its invariants through constructors, not field access), so
/// the repository projects it to/from a plain JSON object of its fields.
fn serialize_aggregate(aggregate: &StickyActiveElection) -> Value {
    serde_json::json!({
        "service_name": aggregate.service_name,
        "instance_id": aggregate.instance_id,
        "group_id": aggregate.group_id,
        "status": format!("{:?}", aggregate.status).to_uppercase(),
        "leader_instance_id": aggregate.leader_instance_id,
        "last_leader_heartbeat": aggregate.last_leader_heartbeat,
        "leader_ttl_seconds": aggregate.leader_ttl_seconds,
        "heartbeat_interval_seconds": aggregate.heartbeat_interval_seconds,
        "election_timeout_seconds": aggregate.election_timeout_seconds,
        "started_at": aggregate.started_at,
        "last_election_attempt": aggregate.last_election_attempt,
        "became_leader_at": aggregate.became_leader_at,
    })
}

fn deserialize_aggregate(value: &Value) -> std::result::Result<StickyActiveElection, serde_json::Error> {
    use serde::de::Error as _;

    let service_name = field_str(value, "service_name")?;
    let instance_id = field_str(value, "instance_id")?;
    let group_id = field_str(value, "group_id")?;
    let leader_ttl_seconds = value["leader_ttl_seconds"]
        .as_u64()
        .ok_or_else(|| serde_json::Error::custom("missing leader_ttl_seconds"))?;
    let heartbeat_interval_seconds = value["heartbeat_interval_seconds"]
        .as_f64()
        .ok_or_else(|| serde_json::Error::custom("missing heartbeat_interval_seconds"))?;
    let election_timeout_seconds = value["election_timeout_seconds"]
        .as_u64()
        .ok_or_else(|| serde_json::Error::custom("missing election_timeout_seconds"))?;

    let mut aggregate = StickyActiveElection::new(
        service_name,
        instance_id,
        group_id,
        leader_ttl_seconds,
        heartbeat_interval_seconds,
        election_timeout_seconds,
    )
    .map_err(serde_json::Error::custom)?;

    if let Some(status) = value["status"].as_str() {
        match status {
            "ELECTING" => {
                let _ = aggregate.start_election();
            }
            "ACTIVE" => {
                let _ = aggregate.win_election();
            }
            _ => {}
        }
    }
    aggregate.leader_instance_id = value["leader_instance_id"].as_str().map(str::to_string);
    aggregate.last_leader_heartbeat = serde_json::from_value(value["last_leader_heartbeat"].clone()).ok();
    aggregate.last_election_attempt = serde_json::from_value(value["last_election_attempt"].clone()).ok();
    aggregate.became_leader_at = serde_json::from_value(value["became_leader_at"].clone()).ok();
    Ok(aggregate)
}

fn field_str(value: &Value, field: &str) -> std::result::Result<String, serde_json::Error> {
    use serde::de::Error as _;
    value[field]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| serde_json::Error::custom(format!("missing {field}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_kv::InMemoryKvStore;

    async fn repo() -> ElectionRepository {
        let kv = InMemoryKvStore::new();
        kv.connect("election-test").await.unwrap();
        ElectionRepository::new(Arc::new(kv))
    }

    fn svc() -> ServiceName {
        ServiceName::new("svc1").unwrap()
    }

    #[tokio::test]
    async fn first_attempt_wins_leadership() {
        let repo = repo().await;
        let won = repo.attempt_leadership(&svc(), "inst1", "default", 10, None).await.unwrap();
        assert!(won);
    }

    #[tokio::test]
    async fn second_attempt_by_another_instance_loses() {
        let repo = repo().await;
        assert!(repo.attempt_leadership(&svc(), "inst1", "default", 10, None).await.unwrap());
        assert!(!repo.attempt_leadership(&svc(), "inst2", "default", 10, None).await.unwrap());
    }

    #[tokio::test]
    async fn update_leadership_fails_for_non_leader() {
        let repo = repo().await;
        repo.attempt_leadership(&svc(), "inst1", "default", 10, None).await.unwrap();
        let updated = repo.update_leadership(&svc(), "inst2", "default", 10).await.unwrap();
        assert!(!updated);
    }

    #[tokio::test]
    async fn update_leadership_refreshes_heartbeat_for_leader() {
        let repo = repo().await;
        repo.attempt_leadership(&svc(), "inst1", "default", 10, None).await.unwrap();
        let updated = repo.update_leadership(&svc(), "inst1", "default", 10).await.unwrap();
        assert!(updated);
    }

    #[tokio::test]
    async fn release_leadership_by_non_leader_errors() {
        let repo = repo().await;
        repo.attempt_leadership(&svc(), "inst1", "default", 10, None).await.unwrap();
        let err = repo.release_leadership(&svc(), "inst2", "default").await.unwrap_err();
        assert!(matches!(err, ElectionError::NotLeader { .. }));
    }

    #[tokio::test]
    async fn release_then_reacquire_by_someone_else_succeeds() {
        let repo = repo().await;
        repo.attempt_leadership(&svc(), "inst1", "default", 10, None).await.unwrap();
        repo.release_leadership(&svc(), "inst1", "default").await.unwrap();
        assert!(repo.attempt_leadership(&svc(), "inst2", "default", 10, None).await.unwrap());
    }

    #[tokio::test]
    async fn get_current_leader_treats_stale_record_as_absent() {
        let repo = repo().await;
        repo.attempt_leadership(&svc(), "inst1", "default", 1, None).await.unwrap();
        // Manufacture staleness by writing an old heartbeat directly.
        let key = leader_key(&svc(), "default");
        let mut record = LeaderRecord::new("inst1", "svc1", "default", 1);
        record.last_heartbeat = Utc::now() - chrono::Duration::seconds(30);
        repo.kv
            .put(&key, serde_json::to_value(&record).unwrap(), KvOptions::default())
            .await
            .unwrap();
        assert!(repo.get_current_leader(&svc(), "default").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn election_state_round_trips() {
        let repo = repo().await;
        let aggregate = StickyActiveElection::new("svc1", "inst1", "default", 5, 1.0, 10).unwrap();
        repo.save_election_state(&aggregate).await.unwrap();
        let loaded = repo
            .get_election_state(&svc(), "inst1", "default")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.service_name, "svc1");
        assert_eq!(loaded.instance_id, "inst1");
        repo.delete_election_state(&svc(), "inst1", "default").await.unwrap();
        assert!(repo.get_election_state(&svc(), "inst1", "default").await.unwrap().is_none());
    }
}
