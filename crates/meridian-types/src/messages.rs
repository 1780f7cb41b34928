//! On-the-wire message DTOs (§3 data model): `Message`, `RPCRequest`,
//! `RPCResponse`, `Event`, `Command`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, ValidationError};
use crate::value_objects::is_valid_semver;

/// Fields shared by every message that crosses the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: Uuid,
    pub trace_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl Envelope {
    /// Builds a fresh envelope stamped with the current time.
    pub fn new() -> Self {
        Self {
            message_id: Uuid::new_v4(),
            trace_id: Uuid::new_v4(),
            correlation_id: None,
            timestamp: Utc::now(),
            source: None,
            target: None,
        }
    }

    /// Builds an envelope carrying the given `source`/`target` pair.
    pub fn between(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            target: Some(target.into()),
            ..Self::new()
        }
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new()
    }
}

/// An RPC request: `method`, `params`, and a request timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub method: String,
    #[serde(default)]
    pub params: HashMap<String, Value>,
    pub timeout_seconds: f64,
}

impl RpcRequest {
    /// Builds a new request with the default 5 s timeout.
    pub fn new(method: impl Into<String>, params: HashMap<String, Value>) -> Result<Self> {
        Self::with_timeout(method, params, 5.0)
    }

    /// Builds a new request with an explicit timeout (must be `> 0`).
    pub fn with_timeout(
        method: impl Into<String>,
        params: HashMap<String, Value>,
        timeout_seconds: f64,
    ) -> Result<Self> {
        let method = method.into();
        if method.trim().is_empty() {
            return Err(ValidationError::InvalidMethodName(method));
        }
        if !(timeout_seconds > 0.0) {
            return Err(ValidationError::OutOfRange {
                field: "timeout_seconds",
                value: timeout_seconds.to_string(),
                expected: "> 0",
            });
        }
        Ok(Self {
            envelope: Envelope::new(),
            method,
            params,
            timeout_seconds,
        })
    }
}

/// An RPC reply. Invariant: `success ⇔ error.is_none()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    /// Builds a successful response carrying `result`, correlated to `request_id`.
    pub fn success(request_id: Uuid, result: Value) -> Self {
        let mut envelope = Envelope::new();
        envelope.correlation_id = Some(request_id);
        Self {
            envelope,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// Builds a failed response carrying `error`, correlated to `request_id`.
    pub fn failure(request_id: Uuid, error: impl Into<String>) -> Self {
        let mut envelope = Envelope::new();
        envelope.correlation_id = Some(request_id);
        Self {
            envelope,
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Validates the `success ⇔ error is absent` invariant.
    pub fn validate(&self) -> Result<()> {
        if self.success == self.error.is_some() {
            Err(ValidationError::InconsistentResult)
        } else {
            Ok(())
        }
    }
}

/// A domain event published on `events.<domain>.<event_type>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub domain: String,
    pub event_type: String,
    #[serde(default)]
    pub payload: HashMap<String, Value>,
    #[serde(default = "default_event_version")]
    pub version: String,
}

fn default_event_version() -> String {
    "1.0".to_string()
}

impl Event {
    /// Builds a new event, validating `domain`/`event_type`/`version`.
    pub fn new(
        domain: impl Into<String>,
        event_type: impl Into<String>,
        payload: HashMap<String, Value>,
    ) -> Result<Self> {
        Self::versioned(domain, event_type, payload, default_event_version())
    }

    /// Builds a new event with an explicit semver `version`.
    pub fn versioned(
        domain: impl Into<String>,
        event_type: impl Into<String>,
        payload: HashMap<String, Value>,
        version: impl Into<String>,
    ) -> Result<Self> {
        let domain = domain.into();
        let event_type = event_type.into();
        let version = version.into();
        if domain.is_empty() {
            return Err(ValidationError::InvalidEventType(domain));
        }
        if event_type.is_empty() {
            return Err(ValidationError::InvalidEventType(event_type));
        }
        if !is_valid_semver(&version) {
            return Err(ValidationError::InvalidVersion(version));
        }
        Ok(Self {
            envelope: Envelope::new(),
            domain,
            event_type,
            payload,
            version,
        })
    }
}

/// A durable command processed by a single consumer group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub command: String,
    #[serde(default)]
    pub payload: HashMap<String, Value>,
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_command_timeout")]
    pub timeout_seconds: f64,
}

fn default_priority() -> String {
    "normal".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_command_timeout() -> f64 {
    300.0
}

impl Command {
    /// Builds a new command with default priority/retries/timeout.
    pub fn new(command: impl Into<String>, payload: HashMap<String, Value>) -> Result<Self> {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(ValidationError::InvalidMethodName(command));
        }
        Ok(Self {
            envelope: Envelope::new(),
            command,
            payload,
            priority: default_priority(),
            max_retries: default_max_retries(),
            timeout_seconds: default_command_timeout(),
        })
    }

    /// Validates `max_retries ∈ [0,100]` and `timeout ∈ (0, 3600]`, matching
    /// the bounds the service-base helpers enforce at construction.
    pub fn validate_bounds(&self) -> Result<()> {
        if self.max_retries > 100 {
            return Err(ValidationError::OutOfRange {
                field: "max_retries",
                value: self.max_retries.to_string(),
                expected: "0..=100",
            });
        }
        if !(self.timeout_seconds > 0.0 && self.timeout_seconds <= 3600.0) {
            return Err(ValidationError::OutOfRange {
                field: "timeout_seconds",
                value: self.timeout_seconds.to_string(),
                expected: "(0, 3600]",
            });
        }
        Ok(())
    }
}

/// The closed set of RPC error codes the runtime assigns meaning to.
///
/// Carried forward from the pre-distillation source because §7's RPC error
/// taxonomy and the sticky-active gate (§4.13) both need a stable code
/// rather than ad hoc strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcErrorCode {
    NotActive,
    ServiceUnavailable,
    Timeout,
    InvalidRequest,
    InternalError,
    Electing,
}

impl RpcErrorCode {
    /// The wire string for this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            RpcErrorCode::NotActive => "NOT_ACTIVE",
            RpcErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            RpcErrorCode::Timeout => "TIMEOUT",
            RpcErrorCode::InvalidRequest => "INVALID_REQUEST",
            RpcErrorCode::InternalError => "INTERNAL_ERROR",
            RpcErrorCode::Electing => "ELECTING",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_response_invariant_holds_for_success() {
        let r = RpcResponse::success(Uuid::new_v4(), Value::Null);
        r.validate().unwrap();
    }

    #[test]
    fn rpc_response_invariant_holds_for_failure() {
        let r = RpcResponse::failure(Uuid::new_v4(), "boom");
        r.validate().unwrap();
    }

    #[test]
    fn rpc_response_invariant_rejects_inconsistent_construction() {
        let mut r = RpcResponse::success(Uuid::new_v4(), Value::Null);
        r.error = Some("oops".into());
        assert!(r.validate().is_err());
    }

    #[test]
    fn event_round_trips_through_json() {
        let e = Event::new("order", "created", HashMap::new()).unwrap();
        let json = serde_json::to_string(&e).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(e, back);
    }

    #[test]
    fn command_rejects_bad_bounds() {
        let mut c = Command::new("do_thing", HashMap::new()).unwrap();
        c.max_retries = 200;
        assert!(c.validate_bounds().is_err());
    }
}
