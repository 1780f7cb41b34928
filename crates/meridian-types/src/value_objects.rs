//! Validated newtypes for the identifiers that flow across the bus.
//!
//! Each value object validates on construction and is otherwise a thin,
//! `Copy`-free wrapper around a `String`. Construction is the only place
//! validation happens; once built, a value is known-good for the lifetime
//! of the process.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::error::{Result, ValidationError};

fn is_service_name(s: &str) -> bool {
    if s.is_empty() || s.len() > 64 {
        return false;
    }
    let mut chars = s.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_lowercase() {
        return false;
    }
    if s.len() == 1 {
        return true;
    }
    let last = s.chars().last().unwrap();
    if last == '-' || last == '_' {
        return false;
    }
    s.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

/// A validated service name: lowercase, starts with a letter, `[a-z0-9_-]*`,
/// never ending in `-`/`_`, 1–64 characters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceName(String);

impl ServiceName {
    /// Validates and constructs a `ServiceName`, lower-casing the input.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into().to_lowercase();
        if is_service_name(&value) {
            Ok(Self(value))
        } else {
            Err(ValidationError::InvalidServiceName(value))
        }
    }

    /// Returns the validated string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ServiceName {
    type Error = ValidationError;
    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ServiceName> for String {
    fn from(v: ServiceName) -> Self {
        v.0
    }
}

/// A validated instance identifier: non-empty, no whitespace or control
/// characters, 1–128 characters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceId(String);

impl InstanceId {
    /// Validates and constructs an `InstanceId`.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() || value.trim().is_empty() {
            return Err(ValidationError::InvalidInstanceId(value));
        }
        if value.len() > 128 || value.chars().any(|c| c.is_whitespace() || (c as u32) < 32) {
            return Err(ValidationError::InvalidInstanceId(value));
        }
        Ok(Self(value))
    }

    /// Returns the validated string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for InstanceId {
    type Error = ValidationError;
    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<InstanceId> for String {
    fn from(v: InstanceId) -> Self {
        v.0
    }
}

/// A validated RPC method name: lowercase snake_case, starts with a letter,
/// 1–64 characters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MethodName(String);

impl MethodName {
    /// Validates and constructs a `MethodName`.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let valid = !value.is_empty()
            && value.len() <= 64
            && value
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_lowercase())
            && value
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if valid {
            Ok(Self(value))
        } else {
            Err(ValidationError::InvalidMethodName(value))
        }
    }

    /// Returns the validated string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MethodName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for MethodName {
    type Error = ValidationError;
    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<MethodName> for String {
    fn from(v: MethodName) -> Self {
        v.0
    }
}

/// A validated, dot-segmented, normalized-lowercase event type (e.g.
/// `order.created`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventType(String);

impl EventType {
    /// Validates and constructs an `EventType`, lower-casing the input.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into().to_lowercase();
        let segments: Vec<&str> = value.split('.').collect();
        let valid = !value.is_empty()
            && segments.iter().all(|seg| {
                !seg.is_empty()
                    && seg
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_')
            });
        if valid {
            Ok(Self(value))
        } else {
            Err(ValidationError::InvalidEventType(value))
        }
    }

    /// Returns the validated string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The first dot-separated segment, e.g. `order` for `order.created`.
    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or(&self.0)
    }

    /// The last dot-separated segment, e.g. `created` for `order.created`.
    pub fn action(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for EventType {
    type Error = ValidationError;
    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<EventType> for String {
    fn from(v: EventType) -> Self {
        v.0
    }
}

/// Command/event priority, ordered `Low < Normal < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl Priority {
    /// Parses a priority from its wire string.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(ValidationError::InvalidPriority(other.to_string())),
        }
    }

    /// Returns the wire string for this priority.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// NATS KV forbids these characters in key names.
pub const KV_INVALID_CHARS: [char; 8] = [' ', '\t', '.', '*', '>', '/', '\\', ':'];

/// A key sanitized for storage in a KV bucket, remembering its original form
/// so callers see back what they put in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SanitizedKey {
    original: String,
    sanitized: String,
}

impl SanitizedKey {
    /// Sanitizes `key`, replacing every character in [`KV_INVALID_CHARS`]
    /// with `_`.
    pub fn sanitize(key: impl Into<String>) -> Self {
        let original = key.into();
        let sanitized = original
            .chars()
            .map(|c| if KV_INVALID_CHARS.contains(&c) { '_' } else { c })
            .collect();
        Self { original, sanitized }
    }

    /// Wraps `key` verbatim, without sanitizing it.
    pub fn verbatim(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            original: key.clone(),
            sanitized: key,
        }
    }

    /// The caller-supplied key.
    pub fn original(&self) -> &str {
        &self.original
    }

    /// The KV-bucket-safe key.
    pub fn sanitized(&self) -> &str {
        &self.sanitized
    }

    /// True if sanitization actually changed the key.
    pub fn was_sanitized(&self) -> bool {
        self.original != self.sanitized
    }
}

impl Display for SanitizedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sanitized)
    }
}

/// Validates a `MAJOR.MINOR[.PATCH]` semantic version string.
pub fn is_valid_semver(value: &str) -> bool {
    let parts: Vec<&str> = value.split('.').collect();
    if parts.len() != 2 && parts.len() != 3 {
        return false;
    }
    parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("svc1" => true)]
    #[test_case("a" => true)]
    #[test_case("my-service_name" => true)]
    #[test_case("" => false)]
    #[test_case("1svc" => false)]
    #[test_case("svc-" => false)]
    #[test_case("svc_" => false)]
    fn service_name_validation(input: &str) -> bool {
        ServiceName::new(input).is_ok()
    }

    #[test]
    fn service_name_lowercases() {
        let n = ServiceName::new("MySvc").unwrap();
        assert_eq!(n.as_str(), "mysvc");
    }

    #[test_case("abc" => true)]
    #[test_case("with space" => false)]
    #[test_case("" => false)]
    #[test_case("   " => false)]
    fn instance_id_validation(input: &str) -> bool {
        InstanceId::new(input).is_ok()
    }

    #[test_case("get_user" => true)]
    #[test_case("GetUser" => false)]
    #[test_case("1method" => false)]
    fn method_name_validation(input: &str) -> bool {
        MethodName::new(input).is_ok()
    }

    #[test]
    fn event_type_domain_action() {
        let e = EventType::new("order.created").unwrap();
        assert_eq!(e.domain(), "order");
        assert_eq!(e.action(), "created");
    }

    #[test_case("order.created" => true)]
    #[test_case("order..created" => false)]
    #[test_case(".order" => false)]
    fn event_type_validation(input: &str) -> bool {
        EventType::new(input).is_ok()
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Critical);
    }

    #[test]
    fn sanitized_key_round_trip() {
        let k = SanitizedKey::sanitize("service-instances.svc1.inst1");
        assert_eq!(k.sanitized(), "service-instances_svc1_inst1");
        assert_eq!(k.original(), "service-instances.svc1.inst1");
        assert!(k.was_sanitized());
    }

    #[test]
    fn sanitized_key_unchanged() {
        let k = SanitizedKey::sanitize("already_safe_key");
        assert!(!k.was_sanitized());
    }

    #[test_case("1.0" => true)]
    #[test_case("1.0.0" => true)]
    #[test_case("1" => false)]
    #[test_case("1.a.0" => false)]
    fn semver_validation(input: &str) -> bool {
        is_valid_semver(input)
    }
}
