//! Passive observation of the host's true listening state.
//!
//! The observer periodically scans every listener on the host, including
//! ports this daemon never granted, into an in-memory cache. The cache
//! answers "who holds port P?" for diagnostics and feeds the suggestion
//! query. It is never consulted by the allocator: allocation trusts only
//! the grant table and the immediate bind probe.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::port::Port;
use crate::probe::{ListenerInfo, PortProbe};

/// A passively-collected fact about one listening port.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    /// The bound port.
    pub port: Port,
    /// Owning PID, when the listing tool reported one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_pid: Option<u32>,
    /// Short process name.
    pub process_name: String,
    /// Full command string.
    pub command: String,
    /// Service type inferred from the command, when a pattern matched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    /// Instance id inferred from the working directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// When the port was last seen bound.
    pub last_seen: DateTime<Utc>,
}

/// Command substrings mapped to inferred service types; first hit wins.
const COMMAND_PATTERNS: &[(&str, &str)] = &[
    ("storybook", "storybook"),
    ("vite", "dev"),
    ("webpack", "dev"),
    ("next", "dev"),
    ("node", "dev"),
    ("postgres", "database"),
    ("mysql", "database"),
    ("redis", "database"),
    ("mongod", "database"),
    ("ollama", "ai"),
    ("llama", "ai"),
    ("jest", "test"),
    ("pytest", "test"),
    ("vitest", "test"),
    ("nginx", "proxy"),
    ("caddy", "proxy"),
    ("uvicorn", "api"),
    ("gunicorn", "api"),
    ("flask", "api"),
];

/// Infers a service type from a command string.
#[must_use]
pub fn infer_service_type(command: &str) -> Option<String> {
    let lowered = command.to_lowercase();
    COMMAND_PATTERNS
        .iter()
        .find(|(needle, _)| lowered.contains(needle))
        .map(|(_, service_type)| (*service_type).to_string())
}

/// Infers an instance id from a working directory: its final component.
#[must_use]
pub fn infer_instance_id(working_dir: Option<&std::path::Path>) -> Option<String> {
    working_dir
        .and_then(std::path::Path::file_name)
        .and_then(|name| name.to_str())
        .map(ToString::to_string)
}

impl Observation {
    fn from_listener(info: &ListenerInfo, now: DateTime<Utc>) -> Self {
        Self {
            port: info.port,
            owner_pid: info.pid,
            process_name: info.process_name.clone(),
            command: info.command.clone(),
            service_type: infer_service_type(&info.command),
            instance_id: infer_instance_id(info.working_dir.as_deref()),
            last_seen: now,
        }
    }
}

/// Aggregate cache statistics for the observation dump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ObservationStats {
    /// Ports currently observed bound.
    pub total_observed: usize,
    /// Observations whose service type was inferred.
    pub inferred_types: usize,
    /// Observations carrying an owning PID.
    pub with_pid: usize,
}

/// The observation cache: one writer (the scan task), many readers.
#[derive(Debug, Default)]
pub struct ObservationCache {
    entries: RwLock<HashMap<u16, Observation>>,
}

/// The result of one scan pass, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanDelta {
    /// Ports newly observed bound.
    pub added: usize,
    /// Ports no longer bound, removed from the cache.
    pub removed: usize,
    /// Ports still bound whose record was refreshed.
    pub refreshed: usize,
}

impl ObservationCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs one scan through `probe` and diffs the result into the cache.
    pub fn scan_once(&self, probe: &dyn PortProbe) -> ScanDelta {
        let listeners = probe.scan();
        let now = Utc::now();

        let mut entries = self.entries.write();
        let mut delta = ScanDelta::default();
        let mut seen: std::collections::HashSet<u16> = std::collections::HashSet::new();

        for info in &listeners {
            seen.insert(info.port.value());
            if entries.contains_key(&info.port.value()) {
                delta.refreshed += 1;
            } else {
                delta.added += 1;
            }
            entries.insert(info.port.value(), Observation::from_listener(info, now));
        }

        let before = entries.len();
        entries.retain(|port, _| seen.contains(port));
        delta.removed = before - entries.len();
        delta
    }

    /// The observation for `port`, if it is currently bound.
    #[must_use]
    pub fn get(&self, port: Port) -> Option<Observation> {
        self.entries.read().get(&port.value()).cloned()
    }

    /// Whether `port` is currently observed bound.
    #[must_use]
    pub fn contains(&self, port: Port) -> bool {
        self.entries.read().contains_key(&port.value())
    }

    /// Every observation, ascending by port.
    #[must_use]
    pub fn all(&self) -> Vec<Observation> {
        let mut observations: Vec<Observation> =
            self.entries.read().values().cloned().collect();
        observations.sort_by_key(|o| o.port);
        observations
    }

    /// Number of observed ports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Aggregate statistics over the cache.
    #[must_use]
    pub fn stats(&self) -> ObservationStats {
        let entries = self.entries.read();
        ObservationStats {
            total_observed: entries.len(),
            inferred_types: entries.values().filter(|o| o.service_type.is_some()).count(),
            with_pid: entries.values().filter(|o| o.owner_pid.is_some()).count(),
        }
    }
}
