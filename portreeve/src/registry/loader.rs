//! Registry composition: shipped base document ∪ user overrides.
//!
//! The base registry is embedded YAML; user overrides come from
//! `config.json`. Union with user entries winning by key, then validate
//! every merged entry. Malformed entries are dropped with a warning and
//! the daemon starts with what remains.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::Result;
use crate::registry::schema::{RegistryDocument, ServiceType, ServiceTypeEntry, UserConfig};

/// The shipped base registry document.
pub const BUILTIN_REGISTRY: &str = include_str!("builtin.yaml");

/// The result of one composition pass.
#[derive(Debug, Clone, Default)]
pub struct Composition {
    /// Validated service types, keyed by name.
    pub service_types: BTreeMap<String, ServiceType>,
    /// One message per dropped or suspicious entry.
    pub warnings: Vec<String>,
}

/// Parses the embedded base document.
///
/// # Errors
///
/// Only fails if the shipped document itself is malformed, which is a
/// build defect, not a runtime condition.
pub fn base_document() -> Result<RegistryDocument> {
    Ok(serde_yaml::from_str(BUILTIN_REGISTRY)?)
}

/// Reads the user config file, tolerating absence.
///
/// A missing file yields the default config; an unreadable or unparseable
/// file yields the default config plus a warning, because user config must
/// never stop the daemon.
#[must_use]
pub fn load_user_config(path: &Path) -> (UserConfig, Vec<String>) {
    if !path.exists() {
        return (UserConfig::default(), Vec::new());
    }
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(config) => (config, Vec::new()),
            Err(e) => (
                UserConfig::default(),
                vec![format!("ignoring malformed {}: {e}", path.display())],
            ),
        },
        Err(e) => (
            UserConfig::default(),
            vec![format!("cannot read {}: {e}", path.display())],
        ),
    }
}

/// Merges base and user entries (user wins by key) and validates each.
#[must_use]
pub fn compose(
    base: &RegistryDocument,
    user_entries: &BTreeMap<String, ServiceTypeEntry>,
) -> Composition {
    let mut merged: BTreeMap<String, ServiceTypeEntry> = base.service_types.clone();
    for (name, entry) in user_entries {
        merged.insert(name.clone(), entry.clone());
    }

    let mut composition = Composition::default();
    for (name, entry) in &merged {
        match ServiceType::from_entry(name, entry) {
            Ok(service) => {
                composition.service_types.insert(name.clone(), service);
            }
            Err(reason) => composition
                .warnings
                .push(format!("dropping service type '{name}': {reason}")),
        }
    }
    composition
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::PortRange;
    use crate::registry::schema::Cardinality;

    #[test]
    fn test_builtin_document_parses() {
        let base = base_document().unwrap();
        assert!(base.service_types.contains_key("dev"));
        assert!(base.service_types.contains_key("storybook"));
        assert!(base.service_types.contains_key("ai"));
    }

    #[test]
    fn test_builtin_composes_clean() {
        let base = base_document().unwrap();
        let composition = compose(&base, &BTreeMap::new());
        assert!(composition.warnings.is_empty(), "{:?}", composition.warnings);

        let dev = &composition.service_types["dev"];
        assert_eq!(dev.range.lo().value(), 3000);
        assert_eq!(dev.preferred_ports[0].value(), 3000);
        assert_eq!(dev.cardinality, Cardinality::Multi);

        let ai = &composition.service_types["ai"];
        assert_eq!(ai.cardinality, Cardinality::Single);
        assert_eq!(ai.range.lo().value(), 11400);

        let storybook = &composition.service_types["storybook"];
        assert_eq!(storybook.range.len(), 5);
    }

    #[test]
    fn test_user_entry_overrides_base_by_key() {
        let base = base_document().unwrap();
        let mut user = BTreeMap::new();
        user.insert(
            "dev".to_string(),
            ServiceTypeEntry {
                range: Some(PortRange::from_bounds(4000, 4099).unwrap()),
                ..Default::default()
            },
        );

        let composition = compose(&base, &user);
        assert_eq!(composition.service_types["dev"].range.lo().value(), 4000);
        // Untouched base entries survive.
        assert!(composition.service_types.contains_key("api"));
    }

    #[test]
    fn test_user_entry_adds_new_type() {
        let base = base_document().unwrap();
        let mut user = BTreeMap::new();
        user.insert(
            "jaeger".to_string(),
            ServiceTypeEntry {
                range: Some(PortRange::from_bounds(10110, 10119).unwrap()),
                auto_allocated: true,
                ..Default::default()
            },
        );

        let composition = compose(&base, &user);
        let jaeger = &composition.service_types["jaeger"];
        assert!(jaeger.auto_allocated);
        assert_eq!(jaeger.range.hi().value(), 10119);
    }

    #[test]
    fn test_malformed_entry_dropped_with_warning() {
        let base = base_document().unwrap();
        let mut user = BTreeMap::new();
        // No range at all.
        user.insert("broken".to_string(), ServiceTypeEntry::default());
        // Preferred port outside the range.
        user.insert(
            "also-broken".to_string(),
            ServiceTypeEntry {
                range: Some(PortRange::from_bounds(4000, 4010).unwrap()),
                preferred_ports: vec![5000],
                ..Default::default()
            },
        );

        let composition = compose(&base, &user);
        assert!(!composition.service_types.contains_key("broken"));
        assert!(!composition.service_types.contains_key("also-broken"));
        assert_eq!(composition.warnings.len(), 2);
        // The valid base still loaded.
        assert!(composition.service_types.contains_key("dev"));
    }

    #[test]
    fn test_user_override_can_break_an_entry() {
        // A user override that corrupts a base type drops that type only.
        let base = base_document().unwrap();
        let mut user = BTreeMap::new();
        user.insert("api".to_string(), ServiceTypeEntry::default());

        let composition = compose(&base, &user);
        assert!(!composition.service_types.contains_key("api"));
        assert_eq!(composition.warnings.len(), 1);
        assert!(composition.service_types.contains_key("dev"));
    }

    #[test]
    fn test_load_user_config_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let (config, warnings) = load_user_config(&dir.path().join("config.json"));
        assert_eq!(config, UserConfig::default());
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_load_user_config_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ nope").unwrap();

        let (config, warnings) = load_user_config(&path);
        assert_eq!(config, UserConfig::default());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("malformed"));
    }

    #[test]
    fn test_load_user_config_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"auto_allocation": {"enabled": true, "default_chunk_size": 10}}"#,
        )
        .unwrap();

        let (config, warnings) = load_user_config(&path);
        assert!(warnings.is_empty());
        assert!(config.auto_allocation.enabled);
        assert_eq!(config.auto_allocation.default_chunk_size, 10);
    }
}
