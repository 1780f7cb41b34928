//! Service registry over a KV bucket (C7).
//!
//! Instance records live at `service-instances.<service>.<instance>`
//! (§4.1). Registration, heartbeat refresh, and deregistration are thin
//! wrappers over [`meridian_kv::KvStore`]; the interesting behavior is
//! `update_heartbeat`'s self-healing against a lost record (§4.7) and the
//! key-prefix enumeration `list_instances`/`list_all_services` do to hydrate
//! a whole service (or the whole registry) from raw KV keys.

pub mod error;

pub use error::{RegistryError, Result};

use std::collections::HashMap;
use std::sync::Arc;

use meridian_kv::KvStore;
use meridian_types::{
    patterns::{parse_registry_key, registry_key, registry_prefix},
    KvOptions, ServiceInstance, ServiceName,
};
use tracing::{debug, warn};

/// Service instance registry backed by a shared [`KvStore`].
pub struct ServiceRegistry {
    kv: Arc<dyn KvStore>,
}

impl ServiceRegistry {
    /// Wraps an already-connected KV store.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Registers `instance`, setting its registry-record TTL to
    /// `ttl_seconds` (§6 `registry.ttl_s`, default 30).
    pub async fn register(&self, instance: &ServiceInstance, ttl_seconds: u64) -> Result<()> {
        let service = ServiceName::new(instance.service_name.clone())
            .map_err(|_| RegistryError::InvalidServiceName(instance.service_name.clone()))?;
        let key = registry_key(&service, &instance.instance_id);
        let value = serde_json::to_value(instance).map_err(|source| RegistryError::CorruptRecord {
            key: key.clone(),
            source,
        })?;
        self.kv
            .put(&key, value, KvOptions::with_ttl(ttl_seconds))
            .await
            .map_err(|source| RegistryError::Kv {
                operation: "register",
                source,
            })?;
        debug!(service = %instance.service_name, instance = %instance.instance_id, "registered service instance");
        Ok(())
    }

    /// Refreshes `instance`'s TTL. If the record was lost (expired or
    /// evicted underneath us), re-registers from scratch rather than
    /// failing — the instance is still alive, only the record is gone.
    pub async fn update_heartbeat(&self, instance: &ServiceInstance, ttl_seconds: u64) -> Result<()> {
        let service = ServiceName::new(instance.service_name.clone())
            .map_err(|_| RegistryError::InvalidServiceName(instance.service_name.clone()))?;
        let key = registry_key(&service, &instance.instance_id);
        let existing = self.kv.get(&key).await.map_err(|source| RegistryError::Kv {
            operation: "update_heartbeat.get",
            source,
        })?;
        if existing.is_none() {
            warn!(service = %instance.service_name, instance = %instance.instance_id, "registry record lost, re-registering");
            return self.register(instance, ttl_seconds).await;
        }
        let value = serde_json::to_value(instance).map_err(|source| RegistryError::CorruptRecord {
            key: key.clone(),
            source,
        })?;
        self.kv
            .put(&key, value, KvOptions::with_ttl(ttl_seconds))
            .await
            .map_err(|source| RegistryError::Kv {
                operation: "update_heartbeat.put",
                source,
            })?;
        Ok(())
    }

    /// Removes the instance's registry record. Absence is not an error —
    /// deregistering an already-gone instance is a no-op (logged only).
    pub async fn deregister(&self, service: &ServiceName, instance_id: &str) -> Result<()> {
        let key = registry_key(service, instance_id);
        let removed = self.kv.delete(&key, None).await.map_err(|source| RegistryError::Kv {
            operation: "deregister",
            source,
        })?;
        if !removed {
            debug!(service = %service, instance = %instance_id, "deregister: instance was already absent");
        }
        Ok(())
    }

    /// Reads a single instance record.
    pub async fn get_instance(&self, service: &ServiceName, instance_id: &str) -> Result<Option<ServiceInstance>> {
        let key = registry_key(service, instance_id);
        let entry = self.kv.get(&key).await.map_err(|source| RegistryError::Kv {
            operation: "get_instance",
            source,
        })?;
        let Some(entry) = entry else { return Ok(None) };
        let instance: ServiceInstance = serde_json::from_value(entry.value)
            .map_err(|source| RegistryError::CorruptRecord { key, source })?;
        Ok(Some(instance))
    }

    /// Enumerates every instance registered for `service`.
    pub async fn list_instances(&self, service: &ServiceName) -> Result<Vec<ServiceInstance>> {
        let prefix = registry_prefix(service);
        let keys = self.kv.keys(&prefix).await.map_err(|source| RegistryError::Kv {
            operation: "list_instances.keys",
            source,
        })?;
        let mut instances = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.kv.get(&key).await.map_err(|source| RegistryError::Kv {
                operation: "list_instances.get",
                source,
            })? {
                match serde_json::from_value::<ServiceInstance>(entry.value) {
                    Ok(instance) => instances.push(instance),
                    Err(source) => return Err(RegistryError::CorruptRecord { key, source }),
                }
            }
        }
        Ok(instances)
    }

    /// Enumerates every registered instance across every service, grouped
    /// by service name.
    pub async fn list_all_services(&self) -> Result<HashMap<String, Vec<ServiceInstance>>> {
        let keys = self.kv.keys("service-instances").await.map_err(|source| RegistryError::Kv {
            operation: "list_all_services.keys",
            source,
        })?;
        let mut grouped: HashMap<String, Vec<ServiceInstance>> = HashMap::new();
        for key in keys {
            let Some((service, _instance)) = parse_registry_key(&key) else {
                continue;
            };
            if let Some(entry) = self.kv.get(&key).await.map_err(|source| RegistryError::Kv {
                operation: "list_all_services.get",
                source,
            })? {
                match serde_json::from_value::<ServiceInstance>(entry.value) {
                    Ok(instance) => grouped.entry(service).or_default().push(instance),
                    Err(source) => return Err(RegistryError::CorruptRecord { key, source }),
                }
            }
        }
        Ok(grouped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_kv::InMemoryKvStore;

    async fn registry() -> ServiceRegistry {
        let kv = InMemoryKvStore::new();
        kv.connect("registry-test").await.unwrap();
        ServiceRegistry::new(Arc::new(kv))
    }

    fn svc() -> ServiceName {
        ServiceName::new("svc1").unwrap()
    }

    #[tokio::test]
    async fn register_then_get() {
        let reg = registry().await;
        let inst = ServiceInstance::new("svc1", "inst1");
        reg.register(&inst, 30).await.unwrap();
        let found = reg.get_instance(&svc(), "inst1").await.unwrap().unwrap();
        assert_eq!(found.instance_id, "inst1");
    }

    #[tokio::test]
    async fn register_then_deregister_leaves_registry_empty() {
        let reg = registry().await;
        let inst = ServiceInstance::new("svc1", "inst1");
        reg.register(&inst, 30).await.unwrap();
        reg.deregister(&svc(), "inst1").await.unwrap();
        assert!(reg.get_instance(&svc(), "inst1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deregister_of_absent_instance_is_not_an_error() {
        let reg = registry().await;
        reg.deregister(&svc(), "ghost").await.unwrap();
    }

    #[tokio::test]
    async fn update_heartbeat_reregisters_a_lost_record() {
        let reg = registry().await;
        let inst = ServiceInstance::new("svc1", "inst1");
        // No prior registration: update_heartbeat should self-heal.
        reg.update_heartbeat(&inst, 30).await.unwrap();
        assert!(reg.get_instance(&svc(), "inst1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn list_instances_enumerates_all_members_of_a_service() {
        let reg = registry().await;
        reg.register(&ServiceInstance::new("svc1", "a"), 30).await.unwrap();
        reg.register(&ServiceInstance::new("svc1", "b"), 30).await.unwrap();
        reg.register(&ServiceInstance::new("svc2", "c"), 30).await.unwrap();
        let instances = reg.list_instances(&svc()).await.unwrap();
        assert_eq!(instances.len(), 2);
    }

    #[tokio::test]
    async fn list_all_services_groups_by_service_name() {
        let reg = registry().await;
        reg.register(&ServiceInstance::new("svc1", "a"), 30).await.unwrap();
        reg.register(&ServiceInstance::new("svc2", "b"), 30).await.unwrap();
        let grouped = reg.list_all_services().await.unwrap();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["svc1"].len(), 1);
        assert_eq!(grouped["svc2"].len(), 1);
    }
}
