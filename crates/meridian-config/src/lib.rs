//! Layered configuration surface for the Meridian runtime (§6).
//!
//! Loads from built-in defaults, then an optional `meridian.toml`, then an
//! optional `meridian.local.toml`, then `MERIDIAN_`-prefixed environment
//! variables (`__` separates nested fields), exactly mirroring the
//! reference project's `ConfigLoader` precedence order.
//!
//! This crate only covers the process-level *loading* of the §6 surface;
//! parsing a CLI or `.env` file is explicitly out of scope (§1 Non-goals).

mod error;
mod loader;
mod paths;

pub use error::{ConfigError, Result};
pub use loader::ConfigLoader;
pub use paths::Paths;

use serde::{Deserialize, Serialize};

/// The complete, strongly-typed §6 configuration surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeridianConfig {
    pub bus: BusConfig,
    pub kv: KvConfig,
    pub registry: RegistryConfig,
    pub election: ElectionConfig,
    pub discovery: DiscoveryConfig,
    pub client: ClientConfig,
}

impl MeridianConfig {
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    pub fn load_from_dir(project_dir: impl AsRef<std::path::Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Validates the cross-field invariants §6/§7/§8 call out that a plain
    /// per-field `Deserialize` can't express: a required `kv.bucket`, the
    /// sticky-retry budget's range, and the election-service construction
    /// guard `heartbeat_s < leader_ttl_s`.
    pub fn validate(&self) -> Result<()> {
        if self.kv.bucket.trim().is_empty() {
            return Err(ConfigError::Validation("kv.bucket is required".to_string()));
        }
        if self.bus.pool_size == 0 || self.bus.pool_size > 10 {
            return Err(ConfigError::Validation("bus.pool_size must be in 1..=10".to_string()));
        }
        if !(self.client.sticky.max_retries <= 10) {
            return Err(ConfigError::Validation("client.sticky.max_retries must be in 0..=10".to_string()));
        }
        let heartbeat_s = self.election.effective_heartbeat_s();
        if !(heartbeat_s < self.election.leader_ttl_s as f64) {
            return Err(ConfigError::Validation(
                "election.heartbeat_s must be strictly less than election.leader_ttl_s".to_string(),
            ));
        }
        Ok(())
    }
}

/// Bus adapter configuration (C3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub servers: Vec<String>,
    pub pool_size: u8,
    pub reconnect_attempts: u32,
    pub reconnect_wait_s: f64,
    pub use_binary_codec: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            servers: vec!["nats://localhost:4222".to_string()],
            pool_size: 1,
            reconnect_attempts: 10,
            reconnect_wait_s: 2.0,
            use_binary_codec: true,
        }
    }
}

/// KV adapter configuration (C4, §6). `bucket` has no default — it is a
/// required field, enforced by [`MeridianConfig::validate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    pub bucket: String,
    pub sanitize_keys: bool,
    pub history: u32,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            sanitize_keys: true,
            history: 10,
        }
    }
}

/// Service registry configuration (C7, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub ttl_s: u64,
    pub heartbeat_s: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { ttl_s: 30, heartbeat_s: 10 }
    }
}

/// Sticky-active election configuration (C9/C10/C11, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    pub leader_ttl_s: u64,
    /// `None` derives `max(0.5, leader_ttl_s / 3)` per §6; set explicitly to
    /// override.
    pub heartbeat_s: Option<f64>,
    pub election_timeout_s: u64,
    pub detection_threshold_s: f64,
    pub election_delay_s: f64,
    pub max_attempts: u32,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            leader_ttl_s: 5,
            heartbeat_s: None,
            election_timeout_s: 10,
            detection_threshold_s: 0.5,
            election_delay_s: 0.2,
            max_attempts: 3,
        }
    }
}

impl ElectionConfig {
    /// The leader-refresh heartbeat period, explicit value or derived default.
    pub fn effective_heartbeat_s(&self) -> f64 {
        self.heartbeat_s
            .unwrap_or_else(|| (self.leader_ttl_s as f64 / 3.0).max(0.5))
    }
}

/// Service discovery configuration (C8, §6), including the
/// reconnect-back-off knobs the watch-invalidated cache uses
/// (SPEC_FULL §"Supplemented features" #5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub cache_ttl_s: u64,
    pub cache_max_entries: usize,
    pub reconnect_delay_s: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            cache_ttl_s: 10,
            cache_max_entries: 1000,
            reconnect_delay_s: 5,
            max_reconnect_attempts: 10,
        }
    }
}

/// Client-side configuration, currently just the sticky-active retry policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub sticky: StickyRetryConfig,
}

/// Retry policy a client applies after receiving `NOT_ACTIVE` (§6, §4.13).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StickyRetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for StickyRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 5000,
            jitter_factor: 0.1,
        }
    }
}

/// Builds an `EnvFilter` from `MERIDIAN_LOG` (falling back to `info`),
/// mirroring the reference CLI's `tracing_subscriber::fmt()` +
/// `EnvFilter::from_default_env()` wiring. Exposed here as a convenience so
/// an embedding binary doesn't have to hand-roll the same three lines; no
/// crate in this workspace calls it on its own behalf.
pub fn tracing_env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_env("MERIDIAN_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bus_config_matches_spec_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.pool_size, 1);
        assert_eq!(config.reconnect_attempts, 10);
        assert!(config.use_binary_codec);
    }

    #[test]
    fn empty_bucket_fails_validation() {
        let config = MeridianConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn non_empty_bucket_passes_validation() {
        let mut config = MeridianConfig::default();
        config.kv.bucket = "meridian".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn election_heartbeat_derives_from_leader_ttl() {
        let config = ElectionConfig {
            leader_ttl_s: 6,
            ..ElectionConfig::default()
        };
        assert_eq!(config.effective_heartbeat_s(), 2.0);
    }

    #[test]
    fn election_heartbeat_floor_is_half_a_second() {
        let config = ElectionConfig {
            leader_ttl_s: 1,
            ..ElectionConfig::default()
        };
        assert_eq!(config.effective_heartbeat_s(), 0.5);
    }

    #[test]
    fn heartbeat_exceeding_leader_ttl_fails_validation() {
        let mut config = MeridianConfig::default();
        config.kv.bucket = "meridian".to_string();
        config.election.leader_ttl_s = 2;
        config.election.heartbeat_s = Some(3.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn sticky_retry_out_of_range_fails_validation() {
        let mut config = MeridianConfig::default();
        config.kv.bucket = "meridian".to_string();
        config.client.sticky.max_retries = 11;
        assert!(config.validate().is_err());
    }
}
