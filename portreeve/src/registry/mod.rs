//! The service-type range registry.
//!
//! Resolves service-type identifiers to their validated configuration.
//! Composition happens at daemon start and again whenever the auto-range
//! planner commits a new type; reads vastly outnumber reloads, so the
//! composed state sits behind an `RwLock`.

pub mod loader;
pub mod schema;

use std::collections::BTreeMap;
use std::path::PathBuf;

use parking_lot::RwLock;

use crate::error::Result;
use crate::port::{Port, PortRange};

pub use loader::{base_document, compose, load_user_config, Composition, BUILTIN_REGISTRY};
pub use schema::{
    is_valid_service_type_name, AutoAllocationConfig, Cardinality, ChunkRule, DaemonOptions,
    HealthMonitorOptions, Placement, RegistryDocument, ServiceType, ServiceTypeEntry, UserConfig,
};

#[derive(Debug)]
struct RegistryState {
    service_types: BTreeMap<String, ServiceType>,
    user_config: UserConfig,
    warnings: Vec<String>,
}

/// The composed, validated service-type registry.
#[derive(Debug)]
pub struct ServiceRegistry {
    base: RegistryDocument,
    user_config_path: Option<PathBuf>,
    state: RwLock<RegistryState>,
}

impl ServiceRegistry {
    /// Loads the shipped base registry plus user overrides from
    /// `user_config_path`, composing immediately.
    ///
    /// # Errors
    ///
    /// Fails only when the embedded base document cannot be parsed; user
    /// config problems degrade to warnings.
    pub fn load(user_config_path: impl Into<PathBuf>) -> Result<Self> {
        let path = user_config_path.into();
        let base = loader::base_document()?;
        let (user_config, mut warnings) = loader::load_user_config(&path);
        let composition = loader::compose(&base, &user_config.service_types);
        warnings.extend(composition.warnings);

        Ok(Self {
            base,
            user_config_path: Some(path),
            state: RwLock::new(RegistryState {
                service_types: composition.service_types,
                user_config,
                warnings,
            }),
        })
    }

    /// Builds a registry from explicit documents, bypassing the
    /// filesystem. Used by tests and embedders.
    #[must_use]
    pub fn from_documents(base: RegistryDocument, user_config: UserConfig) -> Self {
        let composition = loader::compose(&base, &user_config.service_types);
        Self {
            base,
            user_config_path: None,
            state: RwLock::new(RegistryState {
                service_types: composition.service_types,
                user_config,
                warnings: composition.warnings,
            }),
        }
    }

    /// Re-runs composition, picking up user config changes (the planner
    /// calls this after committing a new type).
    ///
    /// # Errors
    ///
    /// Currently infallible at runtime; the signature leaves room for
    /// stricter reload policies.
    pub fn reload(&self) -> Result<Vec<String>> {
        let (user_config, mut warnings) = match &self.user_config_path {
            Some(path) => loader::load_user_config(path),
            None => (self.state.read().user_config.clone(), Vec::new()),
        };
        let composition = loader::compose(&self.base, &user_config.service_types);
        warnings.extend(composition.warnings);

        let mut state = self.state.write();
        state.service_types = composition.service_types;
        state.user_config = user_config;
        state.warnings.clone_from(&warnings);
        Ok(warnings)
    }

    /// Resolves a service type by name.
    #[must_use]
    pub fn resolve(&self, service_type: &str) -> Option<ServiceType> {
        self.state.read().service_types.get(service_type).cloned()
    }

    /// Every known service-type name, sorted.
    #[must_use]
    pub fn known_types(&self) -> Vec<String> {
        self.state.read().service_types.keys().cloned().collect()
    }

    /// Every composed service type.
    #[must_use]
    pub fn all(&self) -> Vec<ServiceType> {
        self.state.read().service_types.values().cloned().collect()
    }

    /// All registered ranges, in ascending `lo` order.
    #[must_use]
    pub fn ranges(&self) -> Vec<PortRange> {
        let mut ranges: Vec<PortRange> = self
            .state
            .read()
            .service_types
            .values()
            .map(|service| service.range)
            .collect();
        ranges.sort_by_key(|range| range.lo());
        ranges
    }

    /// Whether `port` lies inside any registered range (the "managed
    /// range" of the allocation fast path).
    #[must_use]
    pub fn is_managed(&self, port: Port) -> bool {
        self.state
            .read()
            .service_types
            .values()
            .any(|service| service.range.contains(port))
    }

    /// Current auto-allocation policy.
    #[must_use]
    pub fn auto_allocation(&self) -> AutoAllocationConfig {
        self.state.read().user_config.auto_allocation.clone()
    }

    /// Current daemon tunables. `PORTREEVE_PORT` overrides the configured
    /// transport port when it parses to a valid port number.
    #[must_use]
    pub fn daemon_options(&self) -> DaemonOptions {
        let mut options = self.state.read().user_config.daemon.clone();
        if let Ok(raw) = std::env::var("PORTREEVE_PORT") {
            match raw.parse::<u16>() {
                Ok(port) if port != 0 => options.port = port,
                _ => log::warn!("ignoring unparseable PORTREEVE_PORT value"),
            }
        }
        options
    }

    /// Warnings produced by the most recent composition.
    #[must_use]
    pub fn warnings(&self) -> Vec<String> {
        self.state.read().warnings.clone()
    }

    /// Path of the user config file, when this registry is file-backed.
    #[must_use]
    pub fn user_config_path(&self) -> Option<&std::path::Path> {
        self.user_config_path.as_deref()
    }
}
