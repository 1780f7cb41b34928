//! Sticky-active leader election types (§3): the leader record stored in
//! KV, and the `StickyActiveElection` aggregate with its state machine.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The value stored at the leader key (`sticky-active.<service>.<group>.leader`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderRecord {
    pub instance_id: String,
    pub service_name: String,
    pub group_id: String,
    pub elected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub ttl_seconds: u64,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl LeaderRecord {
    /// Builds a new leader record for `instance_id` winning the election now.
    pub fn new(
        instance_id: impl Into<String>,
        service_name: impl Into<String>,
        group_id: impl Into<String>,
        ttl_seconds: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.into(),
            service_name: service_name.into(),
            group_id: group_id.into(),
            elected_at: now,
            last_heartbeat: now,
            ttl_seconds,
            metadata: HashMap::new(),
        }
    }

    /// True if `now − last_heartbeat > ttl_seconds`, i.e. this record should
    /// be treated as having no live leader.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.last_heartbeat);
        age > chrono::Duration::seconds(self.ttl_seconds as i64)
    }
}

/// The election state machine's current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ElectionStatus {
    Standby,
    Electing,
    Active,
}

/// An invalid election state transition was attempted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("illegal election transition: {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: ElectionStatus,
    pub to: ElectionStatus,
}

/// Domain events the [`StickyActiveElection`] aggregate emits on transition.
#[derive(Debug, Clone, PartialEq)]
pub enum ElectionEvent {
    ElectionStarted,
    ElectionWon,
    ElectionLost,
    LeaderSteppedDown,
    LeaderHeartbeatUpdated,
    LeaderExpiredObserved,
}

/// The sticky-active election aggregate owned by a single service instance.
///
/// Allowed transitions: `Standby -> Electing | Active`,
/// `Electing -> Active | Standby`, `Active -> Standby` only.
#[derive(Debug, Clone, PartialEq)]
pub struct StickyActiveElection {
    pub service_name: String,
    pub instance_id: String,
    pub group_id: String,
    pub status: ElectionStatus,
    pub leader_instance_id: Option<String>,
    pub last_leader_heartbeat: Option<DateTime<Utc>>,
    pub leader_ttl_seconds: u64,
    pub heartbeat_interval_seconds: f64,
    pub election_timeout_seconds: u64,
    pub started_at: DateTime<Utc>,
    pub last_election_attempt: Option<DateTime<Utc>>,
    pub became_leader_at: Option<DateTime<Utc>>,
}

impl StickyActiveElection {
    /// Builds a fresh aggregate in `Standby`, validating
    /// `heartbeat_interval_seconds < leader_ttl_seconds` and
    /// `election_timeout_seconds > leader_ttl_seconds`.
    pub fn new(
        service_name: impl Into<String>,
        instance_id: impl Into<String>,
        group_id: impl Into<String>,
        leader_ttl_seconds: u64,
        heartbeat_interval_seconds: f64,
        election_timeout_seconds: u64,
    ) -> Result<Self, &'static str> {
        if !(heartbeat_interval_seconds < leader_ttl_seconds as f64) {
            return Err("heartbeat_interval_seconds must be < leader_ttl_seconds");
        }
        if election_timeout_seconds <= leader_ttl_seconds {
            return Err("election_timeout_seconds must be > leader_ttl_seconds");
        }
        Ok(Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
            group_id: group_id.into(),
            status: ElectionStatus::Standby,
            leader_instance_id: None,
            last_leader_heartbeat: None,
            leader_ttl_seconds,
            heartbeat_interval_seconds,
            election_timeout_seconds,
            started_at: Utc::now(),
            last_election_attempt: None,
            became_leader_at: None,
        })
    }

    fn transition(&mut self, to: ElectionStatus) -> Result<(), IllegalTransition> {
        let allowed = matches!(
            (self.status, to),
            (ElectionStatus::Standby, ElectionStatus::Electing)
                | (ElectionStatus::Standby, ElectionStatus::Active)
                | (ElectionStatus::Electing, ElectionStatus::Active)
                | (ElectionStatus::Electing, ElectionStatus::Standby)
                | (ElectionStatus::Active, ElectionStatus::Standby)
        );
        if !allowed {
            return Err(IllegalTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Begins an election attempt: `Standby -> Electing`.
    pub fn start_election(&mut self) -> Result<ElectionEvent, IllegalTransition> {
        self.transition(ElectionStatus::Electing)?;
        self.last_election_attempt = Some(Utc::now());
        Ok(ElectionEvent::ElectionStarted)
    }

    /// Records victory, from either `Standby` or `Electing`.
    pub fn win_election(&mut self) -> Result<ElectionEvent, IllegalTransition> {
        self.transition(ElectionStatus::Active)?;
        self.leader_instance_id = Some(self.instance_id.clone());
        self.became_leader_at = Some(Utc::now());
        self.last_leader_heartbeat = Some(Utc::now());
        Ok(ElectionEvent::ElectionWon)
    }

    /// Records defeat, returning to `Standby` from `Electing`.
    pub fn lose_election(&mut self, leader_instance_id: Option<String>) -> Result<ElectionEvent, IllegalTransition> {
        self.transition(ElectionStatus::Standby)?;
        self.leader_instance_id = leader_instance_id;
        Ok(ElectionEvent::ElectionLost)
    }

    /// Voluntarily steps down from `Active` to `Standby`.
    pub fn step_down(&mut self) -> Result<ElectionEvent, IllegalTransition> {
        self.transition(ElectionStatus::Standby)?;
        self.leader_instance_id = None;
        self.became_leader_at = None;
        Ok(ElectionEvent::LeaderSteppedDown)
    }

    /// Updates the locally-tracked leader heartbeat timestamp (no transition).
    pub fn observe_leader_heartbeat(&mut self, at: DateTime<Utc>) -> ElectionEvent {
        self.last_leader_heartbeat = Some(at);
        ElectionEvent::LeaderHeartbeatUpdated
    }

    /// Records that the current leader's heartbeat was observed stale.
    pub fn observe_leader_expired(&mut self) -> ElectionEvent {
        self.leader_instance_id = None;
        self.last_leader_heartbeat = None;
        ElectionEvent::LeaderExpiredObserved
    }

    /// True iff this instance believes itself to be the active leader.
    pub fn is_active(&self) -> bool {
        self.status == ElectionStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn election() -> StickyActiveElection {
        StickyActiveElection::new("svc1", "inst1", "default", 5, 1.0, 10).unwrap()
    }

    #[test]
    fn rejects_heartbeat_interval_not_less_than_ttl() {
        let err = StickyActiveElection::new("svc1", "inst1", "default", 5, 5.0, 10);
        assert!(err.is_err());
    }

    #[test]
    fn rejects_election_timeout_not_greater_than_ttl() {
        let err = StickyActiveElection::new("svc1", "inst1", "default", 5, 1.0, 5);
        assert!(err.is_err());
    }

    #[test]
    fn standby_to_active_direct_is_allowed() {
        let mut e = election();
        e.win_election().unwrap();
        assert!(e.is_active());
    }

    #[test]
    fn standby_to_electing_to_active_is_allowed() {
        let mut e = election();
        e.start_election().unwrap();
        assert_eq!(e.status, ElectionStatus::Electing);
        e.win_election().unwrap();
        assert!(e.is_active());
    }

    #[test]
    fn active_to_electing_is_illegal() {
        let mut e = election();
        e.win_election().unwrap();
        assert!(e.start_election().is_err());
    }

    #[test]
    fn active_to_standby_via_step_down_is_allowed() {
        let mut e = election();
        e.win_election().unwrap();
        e.step_down().unwrap();
        assert_eq!(e.status, ElectionStatus::Standby);
    }

    #[test]
    fn leader_record_staleness() {
        let mut rec = LeaderRecord::new("inst1", "svc1", "default", 2);
        rec.last_heartbeat = Utc::now() - chrono::Duration::seconds(10);
        assert!(rec.is_stale(Utc::now()));
    }
}
