//! Configuration schema for the service-type registry and daemon policy.
//!
//! Two documents share these types: the shipped base registry (YAML,
//! embedded in the binary) and the user's `config.json`. Entries are
//! deserialized leniently into [`ServiceTypeEntry`] and then promoted into
//! validated [`ServiceType`] values during composition; a malformed entry
//! costs a warning, never startup.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::port::{Port, PortRange};

/// Maximum length of a service-type identifier.
pub const MAX_SERVICE_TYPE_LEN: usize = 50;

/// How many grants of one service type may exist at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    /// Any number of concurrent grants.
    #[default]
    Multi,
    /// At most one grant, shadowed by a singleton claim.
    Single,
}

/// A raw, not-yet-validated registry entry as it appears in documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceTypeEntry {
    /// Inclusive `[lo, hi]` port range.
    pub range: Option<PortRange>,
    /// Ports tried first, in order; each must lie inside `range`.
    #[serde(default)]
    pub preferred_ports: Vec<u16>,
    /// Grant cardinality; defaults to `multi`.
    #[serde(default)]
    pub cardinality: Cardinality,
    /// Human description.
    #[serde(default)]
    pub description: String,
    /// Set by the auto-range planner on entries it created.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub auto_allocated: bool,
    /// When the planner created the entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocated_at: Option<DateTime<Utc>>,
}

/// A validated service type as the rest of the daemon sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceType {
    /// The identifier this type is registered under.
    pub name: String,
    /// Inclusive port range.
    pub range: PortRange,
    /// Validated preferred ports, in order.
    pub preferred_ports: Vec<Port>,
    /// Grant cardinality.
    pub cardinality: Cardinality,
    /// Human description.
    pub description: String,
    /// `true` when the auto-range planner created this entry.
    pub auto_allocated: bool,
}

impl ServiceType {
    /// Promotes a raw entry, enforcing every §composition rule.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the entry must be dropped.
    pub fn from_entry(name: &str, entry: &ServiceTypeEntry) -> Result<Self, String> {
        if !is_valid_service_type_name(name) {
            return Err(format!(
                "invalid service type name '{name}' (letters, digits, hyphen; \
                 at most {MAX_SERVICE_TYPE_LEN} chars)"
            ));
        }
        let range = entry
            .range
            .ok_or_else(|| format!("service type '{name}' has no range"))?;

        let mut preferred = Vec::with_capacity(entry.preferred_ports.len());
        for &raw in &entry.preferred_ports {
            let port = Port::try_from(raw)
                .map_err(|e| format!("service type '{name}': {e}"))?;
            if !range.contains(port) {
                return Err(format!(
                    "service type '{name}': preferred port {port} outside range {range}"
                ));
            }
            preferred.push(port);
        }

        Ok(Self {
            name: name.to_string(),
            range,
            preferred_ports: preferred,
            cardinality: entry.cardinality,
            description: entry.description.clone(),
            auto_allocated: entry.auto_allocated,
        })
    }
}

/// Validates a service-type identifier: letters, digits, hyphen, 1–50
/// chars.
///
/// # Examples
///
/// ```
/// use portreeve::registry::is_valid_service_type_name;
///
/// assert!(is_valid_service_type_name("dev"));
/// assert!(is_valid_service_type_name("api-gateway-2"));
/// assert!(!is_valid_service_type_name(""));
/// assert!(!is_valid_service_type_name("has space"));
/// assert!(!is_valid_service_type_name("under_score"));
/// ```
#[must_use]
pub fn is_valid_service_type_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_SERVICE_TYPE_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// A registry document: the shipped base and the `service_types` half of
/// user config share this shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryDocument {
    /// Entries keyed by service-type identifier. A `BTreeMap` keeps
    /// composition and serialization order stable.
    #[serde(default)]
    pub service_types: BTreeMap<String, ServiceTypeEntry>,
}

/// The user's `config.json`: registry overrides plus daemon policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    /// Service-type overrides and additions, union-merged over the base
    /// with user entries winning by key.
    #[serde(default)]
    pub service_types: BTreeMap<String, ServiceTypeEntry>,
    /// Auto-range planner policy.
    #[serde(default)]
    pub auto_allocation: AutoAllocationConfig,
    /// Daemon runtime tunables.
    #[serde(default)]
    pub daemon: DaemonOptions,
}

/// Policy for the auto-range planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AutoAllocationConfig {
    /// Master switch; when off, unknown service types are request errors.
    pub enabled: bool,
    /// Where new ranges go relative to existing ones.
    pub placement: Placement,
    /// Range size when no chunk rule matches.
    pub default_chunk_size: u16,
    /// Free ports kept between a new range and its neighbors.
    pub gap_size: u16,
    /// Whether `gap_size` separation is enforced at all.
    pub preserve_gaps: bool,
    /// Lowest port the planner may use.
    pub min_port: u16,
    /// Highest port the planner may use.
    pub max_port: u16,
    /// Name-pattern overrides for chunk size; first match wins.
    pub chunk_rules: Vec<ChunkRule>,
}

impl Default for AutoAllocationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            placement: Placement::Smart,
            default_chunk_size: 100,
            gap_size: 10,
            preserve_gaps: true,
            min_port: 1024,
            max_port: 65535,
            chunk_rules: Vec::new(),
        }
    }
}

/// Placement policy for planner-created ranges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    /// Immediately above the highest existing range.
    After,
    /// Immediately below the lowest existing range.
    Before,
    /// Gap-fit first, then category grouping, then `after`.
    #[default]
    Smart,
}

/// A glob-style chunk-size override: `pattern` matches the service-type
/// name with `*` wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChunkRule {
    /// Glob pattern, e.g. `db-*`.
    pub pattern: String,
    /// Chunk size used when the pattern matches.
    pub chunk_size: u16,
}

impl ChunkRule {
    /// Glob matching with `*` as the only metacharacter.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        glob_match(&self.pattern, name)
    }
}

/// Minimal `*`-glob matcher; case-sensitive, no character classes.
fn glob_match(pattern: &str, input: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == input;
    }

    let mut rest = input;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            let Some(after) = rest.strip_prefix(part) else {
                return false;
            };
            rest = after;
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            let Some(found) = rest.find(part) else {
                return false;
            };
            rest = &rest[found + part.len()..];
        }
    }
    // Pattern ended with '*'.
    true
}

/// Daemon runtime tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonOptions {
    /// Loopback port the transport shell listens on.
    pub port: u16,
    /// When set, every candidate port is probed at the OS level, even
    /// inside managed ranges.
    pub strict_probe: bool,
    /// Seconds between periodic stale sweeps.
    pub cleanup_interval_secs: u64,
    /// Age in seconds past which a grant is stale.
    pub stale_after_secs: u64,
    /// Seconds between passive observation scans.
    pub observe_interval_secs: u64,
    /// Optional tolerant health monitor.
    pub health_monitor: HealthMonitorOptions,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            port: 9876,
            strict_probe: false,
            cleanup_interval_secs: 10,
            stale_after_secs: 30 * 60,
            observe_interval_secs: 10,
            health_monitor: HealthMonitorOptions::default(),
        }
    }
}

/// Configuration of the tolerant health monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthMonitorOptions {
    /// Whether the monitor runs at all.
    pub enabled: bool,
    /// Seconds between monitor passes.
    pub interval_secs: u64,
    /// Consecutive failed checks tolerated before release.
    pub max_failures: u32,
}

impl Default for HealthMonitorOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 30,
            max_failures: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(lo: u16, hi: u16) -> ServiceTypeEntry {
        ServiceTypeEntry {
            range: Some(PortRange::from_bounds(lo, hi).unwrap()),
            ..Default::default()
        }
    }

    #[test]
    fn test_service_type_names() {
        assert!(is_valid_service_type_name("dev"));
        assert!(is_valid_service_type_name("ai"));
        assert!(is_valid_service_type_name("api-gateway"));
        assert!(is_valid_service_type_name("x2"));
        assert!(!is_valid_service_type_name(""));
        assert!(!is_valid_service_type_name("no_underscores"));
        assert!(!is_valid_service_type_name("no spaces"));
        assert!(!is_valid_service_type_name(&"x".repeat(51)));
        assert!(is_valid_service_type_name(&"x".repeat(50)));
    }

    #[test]
    fn test_promote_valid_entry() {
        let mut raw = entry(3000, 3099);
        raw.preferred_ports = vec![3000, 3005];
        raw.description = "dev servers".into();

        let service = ServiceType::from_entry("dev", &raw).unwrap();
        assert_eq!(service.name, "dev");
        assert_eq!(service.range.lo().value(), 3000);
        assert_eq!(service.preferred_ports.len(), 2);
        assert_eq!(service.cardinality, Cardinality::Multi);
        assert!(!service.auto_allocated);
    }

    #[test]
    fn test_promote_rejects_missing_range() {
        let raw = ServiceTypeEntry::default();
        let err = ServiceType::from_entry("dev", &raw).unwrap_err();
        assert!(err.contains("no range"));
    }

    #[test]
    fn test_promote_rejects_out_of_range_preferred() {
        let mut raw = entry(3000, 3099);
        raw.preferred_ports = vec![3000, 4000];
        let err = ServiceType::from_entry("dev", &raw).unwrap_err();
        assert!(err.contains("outside range"));
    }

    #[test]
    fn test_promote_rejects_zero_preferred() {
        let mut raw = entry(3000, 3099);
        raw.preferred_ports = vec![0];
        assert!(ServiceType::from_entry("dev", &raw).is_err());
    }

    #[test]
    fn test_promote_rejects_bad_name() {
        let raw = entry(3000, 3099);
        assert!(ServiceType::from_entry("bad name", &raw).is_err());
    }

    #[test]
    fn test_cardinality_serde() {
        let single: Cardinality = serde_json::from_str("\"single\"").unwrap();
        assert_eq!(single, Cardinality::Single);
        let multi: Cardinality = serde_json::from_str("\"multi\"").unwrap();
        assert_eq!(multi, Cardinality::Multi);
        assert!(serde_json::from_str::<Cardinality>("\"both\"").is_err());
    }

    #[test]
    fn test_user_config_defaults() {
        let config: UserConfig = serde_json::from_str("{}").unwrap();
        assert!(!config.auto_allocation.enabled);
        assert_eq!(config.auto_allocation.default_chunk_size, 100);
        assert_eq!(config.auto_allocation.placement, Placement::Smart);
        assert_eq!(config.daemon.port, 9876);
        assert_eq!(config.daemon.stale_after_secs, 1800);
        assert!(!config.daemon.health_monitor.enabled);
    }

    #[test]
    fn test_user_config_roundtrip_with_entry() {
        let json = r#"{
            "service_types": {
                "jaeger": {
                    "range": [10110, 10119],
                    "auto_allocated": true,
                    "allocated_at": "2026-08-01T12:00:00Z"
                }
            },
            "auto_allocation": {"enabled": true, "placement": "after"}
        }"#;
        let config: UserConfig = serde_json::from_str(json).unwrap();
        assert!(config.auto_allocation.enabled);
        assert_eq!(config.auto_allocation.placement, Placement::After);
        let jaeger = &config.service_types["jaeger"];
        assert!(jaeger.auto_allocated);
        assert_eq!(jaeger.range.unwrap().lo().value(), 10110);
    }

    #[test]
    fn test_chunk_rule_globs() {
        let rule = ChunkRule {
            pattern: "db-*".into(),
            chunk_size: 20,
        };
        assert!(rule.matches("db-postgres"));
        assert!(rule.matches("db-"));
        assert!(!rule.matches("postgres-db"));

        let exact = ChunkRule {
            pattern: "jaeger".into(),
            chunk_size: 10,
        };
        assert!(exact.matches("jaeger"));
        assert!(!exact.matches("jaeger2"));

        let middle = ChunkRule {
            pattern: "*-cache-*".into(),
            chunk_size: 5,
        };
        assert!(middle.matches("redis-cache-main"));
        assert!(!middle.matches("redis-main"));

        let suffix = ChunkRule {
            pattern: "*-db".into(),
            chunk_size: 5,
        };
        assert!(suffix.matches("orders-db"));
        assert!(!suffix.matches("db-orders"));
    }

    #[test]
    fn test_glob_edge_cases() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("*", ""));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(!glob_match("a*b*c", "aXXbYY"));
    }
}
