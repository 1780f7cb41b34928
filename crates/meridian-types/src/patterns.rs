//! Pure, deterministic subject and key builders (C1).
//!
//! Nothing in this module touches the network or a KV bucket; it only
//! builds and validates the strings those layers consume.

use crate::value_objects::{EventType, MethodName, ServiceName};

/// Builds the RPC request subject `rpc.<service>.<method>`.
pub fn rpc_subject(service: &ServiceName, method: &MethodName) -> String {
    format!("rpc.{service}.{method}")
}

/// Builds the event publish subject `events.<domain>.<event_type>`.
pub fn event_subject(domain: &str, event_type: &EventType) -> String {
    format!("events.{domain}.{event_type}")
}

/// Builds the command subject `commands.<service>.<command>`.
pub fn command_subject(service: &ServiceName, command: &str) -> String {
    format!("commands.{service}.{command}")
}

/// Builds the per-instance subject `service.<service>.<instance>`.
pub fn service_instance_subject(service: &ServiceName, instance: &str) -> String {
    format!("service.{service}.{instance}")
}

/// Builds the internal heartbeat subject `internal.heartbeat.<service>`.
pub fn heartbeat_subject(service: &ServiceName) -> String {
    format!("internal.heartbeat.{service}")
}

/// The internal registration-sideband subject.
pub fn registry_register_subject() -> &'static str {
    "internal.registry.register"
}

/// The internal deregistration-sideband subject.
pub fn registry_unregister_subject() -> &'static str {
    "internal.registry.unregister"
}

/// Builds the command progress sideband subject.
pub fn command_progress_subject(command_id: &str) -> String {
    format!("commands.progress.{command_id}")
}

/// Builds the command completion sideband subject.
pub fn command_callback_subject(command_id: &str) -> String {
    format!("commands.callback.{command_id}")
}

/// Builds the command cancellation sideband subject.
pub fn command_cancel_subject(command_id: &str) -> String {
    format!("commands.cancel.{command_id}")
}

/// Builds the sticky-active leader key `sticky-active.<service>.<group>.leader`.
pub fn leader_key(service: &ServiceName, group: &str) -> String {
    format!("sticky-active.{service}.{group}.leader")
}

/// Builds the service-instance registry key `service-instances.<service>.<instance>`.
///
/// Uses the dot separator per the standardized form; [`is_registry_key`] also
/// accepts the legacy double-underscore form for watch-invalidation
/// compatibility.
pub fn registry_key(service: &ServiceName, instance: &str) -> String {
    format!("service-instances.{service}.{instance}")
}

/// The registry key prefix under which all instances of `service` live.
pub fn registry_prefix(service: &ServiceName) -> String {
    format!("service-instances.{service}.")
}

/// Builds the election-state persistence key, which must use underscores
/// because KV key names forbid dots (see [`crate::value_objects::KV_INVALID_CHARS`]).
pub fn election_state_key(service: &ServiceName, instance: &str, group: &str) -> String {
    format!("election-state__{service}__{instance}__{group}")
}

/// Parses a registry key (either the standard dot form or the legacy
/// double-underscore form) into `(service, instance)`.
///
/// Returns `None` if `key` does not match either shape.
pub fn parse_registry_key(key: &str) -> Option<(String, String)> {
    if let Some(rest) = key.strip_prefix("service-instances.") {
        let mut parts = rest.splitn(2, '.');
        let service = parts.next()?;
        let instance = parts.next()?;
        if service.is_empty() || instance.is_empty() {
            return None;
        }
        return Some((service.to_string(), instance.to_string()));
    }
    if let Some(rest) = key.strip_prefix("service-instances__") {
        let mut parts = rest.splitn(2, "__");
        let service = parts.next()?;
        let instance = parts.next()?;
        if service.is_empty() || instance.is_empty() {
            return None;
        }
        return Some((service.to_string(), instance.to_string()));
    }
    None
}

/// Validates a subject event pattern, which may contain NATS-style
/// wildcards (`*` for one token, `>` only as the final token).
///
/// Valid: `order.created`, `order.*`, `order.>`, `*.created`, `order.*.completed`.
/// Invalid: empty, `.`, `*`, `>`, double dots, partial wildcards, `>` not last.
pub fn is_valid_event_pattern(pattern: &str) -> bool {
    if pattern.is_empty() || pattern == "." || pattern == "*" || pattern == ">" {
        return false;
    }
    if pattern.contains("..") {
        return false;
    }
    let parts: Vec<&str> = pattern.split('.').collect();
    if parts.is_empty() {
        return false;
    }
    for part in &parts {
        if part.is_empty() {
            return false;
        }
        if *part == "*" || *part == ">" {
            continue;
        }
        if part.contains('*') || part.contains('>') {
            return false;
        }
        if !is_plain_token(part) {
            return false;
        }
    }
    !(pattern.contains('>') && !pattern.ends_with('>'))
}

fn is_plain_token(part: &str) -> bool {
    let mut chars = part.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn builds_rpc_subject() {
        let svc = ServiceName::new("svc1").unwrap();
        let method = MethodName::new("add").unwrap();
        assert_eq!(rpc_subject(&svc, &method), "rpc.svc1.add");
    }

    #[test]
    fn builds_leader_key() {
        let svc = ServiceName::new("svc1").unwrap();
        assert_eq!(leader_key(&svc, "default"), "sticky-active.svc1.default.leader");
    }

    #[test]
    fn builds_election_state_key_with_underscores() {
        let svc = ServiceName::new("svc1").unwrap();
        assert_eq!(
            election_state_key(&svc, "inst1", "default"),
            "election-state__svc1__inst1__default"
        );
    }

    #[test]
    fn parses_dot_registry_key() {
        let (svc, inst) = parse_registry_key("service-instances.svc1.inst1").unwrap();
        assert_eq!(svc, "svc1");
        assert_eq!(inst, "inst1");
    }

    #[test]
    fn parses_legacy_underscore_registry_key() {
        let (svc, inst) = parse_registry_key("service-instances__svc1__inst1").unwrap();
        assert_eq!(svc, "svc1");
        assert_eq!(inst, "inst1");
    }

    #[test_case("order.created" => true)]
    #[test_case("order.*" => true)]
    #[test_case("order.>" => true)]
    #[test_case("*.created" => true)]
    #[test_case("order.*.completed" => true)]
    #[test_case("" => false)]
    #[test_case("." => false)]
    #[test_case("order..created" => false)]
    #[test_case("order.*.*.created" => true)]
    #[test_case("*order" => false)]
    #[test_case("order.>.x" => false)]
    fn event_pattern_validation(input: &str) -> bool {
        is_valid_event_pattern(input)
    }
}
