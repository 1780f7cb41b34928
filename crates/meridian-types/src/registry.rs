//! Service registry record (§3 `ServiceInstance`) and its status enum.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The operational state of a registered service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceStatus {
    Active,
    Standby,
    Unhealthy,
    Shutdown,
}

/// The sticky-active role of an instance within its group, if it belongs to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StickyActiveStatus {
    Active,
    Standby,
}

/// A registered service instance, as stored under
/// `service-instances.<service>.<instance>`.
///
/// Field names are snake_case on the wire; camelCase is also accepted on
/// deserialization for compatibility with older writers (aliases below).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    #[serde(alias = "serviceName")]
    pub service_name: String,
    #[serde(alias = "instanceId")]
    pub instance_id: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_status")]
    pub status: ServiceStatus,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(alias = "registeredAt", default = "Utc::now")]
    pub registered_at: DateTime<Utc>,
    #[serde(alias = "lastHeartbeat", default = "Utc::now")]
    pub last_heartbeat: DateTime<Utc>,
    #[serde(alias = "stickyActiveGroup", default, skip_serializing_if = "Option::is_none")]
    pub sticky_active_group: Option<String>,
    #[serde(alias = "stickyActiveStatus", default, skip_serializing_if = "Option::is_none")]
    pub sticky_active_status: Option<StickyActiveStatus>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_status() -> ServiceStatus {
    ServiceStatus::Active
}

impl ServiceInstance {
    /// Builds a freshly-registering instance record.
    pub fn new(service_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
            version: default_version(),
            status: ServiceStatus::Active,
            metadata: HashMap::new(),
            registered_at: now,
            last_heartbeat: now,
            sticky_active_group: None,
            sticky_active_status: None,
        }
    }

    /// Healthy iff `now − last_heartbeat < heartbeat_timeout` and status is
    /// neither `Unhealthy` nor `Shutdown`.
    pub fn is_healthy(&self, now: DateTime<Utc>, heartbeat_timeout: Duration) -> bool {
        if matches!(self.status, ServiceStatus::Unhealthy | ServiceStatus::Shutdown) {
            return false;
        }
        now.signed_duration_since(self.last_heartbeat) < heartbeat_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_within_timeout() {
        let inst = ServiceInstance::new("svc1", "inst1");
        assert!(inst.is_healthy(Utc::now(), Duration::seconds(30)));
    }

    #[test]
    fn unhealthy_after_timeout() {
        let mut inst = ServiceInstance::new("svc1", "inst1");
        inst.last_heartbeat = Utc::now() - Duration::seconds(60);
        assert!(!inst.is_healthy(Utc::now(), Duration::seconds(30)));
    }

    #[test]
    fn unhealthy_status_overrides_fresh_heartbeat() {
        let mut inst = ServiceInstance::new("svc1", "inst1");
        inst.status = ServiceStatus::Unhealthy;
        assert!(!inst.is_healthy(Utc::now(), Duration::seconds(30)));
    }

    #[test]
    fn accepts_legacy_camel_case_on_read() {
        let json = serde_json::json!({
            "serviceName": "svc1",
            "instanceId": "inst1",
        });
        let inst: ServiceInstance = serde_json::from_value(json).unwrap();
        assert_eq!(inst.service_name, "svc1");
        assert_eq!(inst.instance_id, "inst1");
    }
}
