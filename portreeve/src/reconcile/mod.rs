//! Grant reconciliation: stale sweeps, startup recovery, and the passive
//! observer.
//!
//! The reconciler reads the engine's tables freely but mutates only
//! through the engine's release path, which keeps singleton bookkeeping
//! and persistence nudges in one place. Sweep failures are logged and the
//! next tick tries again; nothing here is allowed to take the daemon down.

pub mod observer;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use serde_json::json;

use crate::audit::{AuditAction, AuditLog};
use crate::engine::AllocationEngine;
use crate::error::Result;
use crate::grant::{Grant, LockId};
use crate::port::Port;
use crate::probe::PortProbe;
use crate::registry::{Cardinality, ServiceRegistry};
use crate::store::{LoadSource, StateStore};

pub use observer::{Observation, ObservationCache, ObservationStats, ScanDelta};

/// Why a grant was judged stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    /// Older than the staleness horizon.
    Age,
    /// The owning PID no longer exists.
    DeadOwner,
    /// A different PID now holds the port.
    PortDrift,
    /// The port is not bound at all (startup orphan policy only).
    Unbound,
}

/// Whether a process exists, as far as signal 0 can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The process exists and is signalable.
    Alive,
    /// No such process.
    Dead,
    /// The process exists but belongs to someone else (EPERM), or the
    /// platform gave no answer. Treated as alive.
    Inaccessible,
}

/// Sends signal 0 to `pid` and classifies the result.
#[cfg(unix)]
#[allow(unsafe_code)]
#[must_use]
pub fn process_liveness(pid: u32) -> Liveness {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return Liveness::Inaccessible;
    };
    // Safety: kill with signal 0 performs only the permission check.
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return Liveness::Alive;
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::ESRCH) => Liveness::Dead,
        _ => Liveness::Inaccessible,
    }
}

#[cfg(not(unix))]
#[must_use]
pub fn process_liveness(_pid: u32) -> Liveness {
    Liveness::Inaccessible
}

/// Policy for one sweep pass.
#[derive(Debug, Clone, Copy)]
pub struct SweepPolicy {
    /// Grants older than this are stale regardless of liveness.
    pub stale_after: Duration,
    /// Release grants whose port is not bound at all. Startup recovery
    /// sets this; the periodic sweep does not, because a freshly granted
    /// process may not have bound yet.
    pub release_unbound: bool,
}

impl SweepPolicy {
    /// The periodic policy: 30-minute horizon, keep unbound ports.
    #[must_use]
    pub fn periodic(stale_after_secs: u64) -> Self {
        Self {
            stale_after: Duration::seconds(i64::try_from(stale_after_secs).unwrap_or(1800)),
            release_unbound: false,
        }
    }

    /// The startup orphan policy: also reclaim unbound ports.
    #[must_use]
    pub fn startup(stale_after_secs: u64) -> Self {
        Self {
            release_unbound: true,
            ..Self::periodic(stale_after_secs)
        }
    }
}

/// The result of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Grants examined.
    pub examined: usize,
    /// Released grants with the reason each was judged stale.
    pub released: Vec<(u16, StaleReason)>,
    /// Release attempts that failed (logged, retried next tick).
    pub failures: usize,
}

impl SweepReport {
    /// Number of grants released.
    #[must_use]
    pub fn cleaned(&self) -> usize {
        self.released.len()
    }
}

/// The result of startup recovery.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Grants restored from disk before pruning.
    pub restored: usize,
    /// Grants released by the orphan sweep.
    pub orphans_released: usize,
    /// Grants released to restore singleton integrity.
    pub singletons_released: usize,
    /// Human-readable warnings (corrupt state, dropped entries).
    pub warnings: Vec<String>,
}

/// The reconciliation worker. Owns the observation cache and the health
/// monitor's failure counters; mutates grants only via the engine.
pub struct Reconciler {
    engine: Arc<AllocationEngine>,
    registry: Arc<ServiceRegistry>,
    probe: Arc<dyn PortProbe>,
    cache: Arc<ObservationCache>,
    audit: Option<Arc<AuditLog>>,
    monitor_failures: Mutex<HashMap<LockId, u32>>,
}

impl Reconciler {
    /// Creates a reconciler over the shared engine, registry, and probe.
    #[must_use]
    pub fn new(
        engine: Arc<AllocationEngine>,
        registry: Arc<ServiceRegistry>,
        probe: Arc<dyn PortProbe>,
    ) -> Self {
        Self {
            engine,
            registry,
            probe,
            cache: Arc::new(ObservationCache::new()),
            audit: None,
            monitor_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Attaches an audit log for cleanup records.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// The shared observation cache.
    #[must_use]
    pub fn cache(&self) -> Arc<ObservationCache> {
        Arc::clone(&self.cache)
    }

    /// One sweep over every grant under `policy`.
    pub fn sweep(&self, policy: SweepPolicy) -> SweepReport {
        let now = Utc::now();
        let mut report = SweepReport::default();

        for grant in self.engine.grants() {
            report.examined += 1;
            let Some(reason) = self.judge(&grant, policy, now) else {
                continue;
            };
            match self.engine.release(&grant.lock_id.to_string()) {
                Ok(outcome) => {
                    log::debug!(
                        "reclaimed port {} from '{}' ({reason:?})",
                        outcome.port,
                        grant.service_type
                    );
                    report.released.push((outcome.port.value(), reason));
                }
                Err(e) => {
                    log::warn!("failed to release stale grant {}: {e}", grant.lock_id);
                    report.failures += 1;
                }
            }
        }

        if !report.released.is_empty() {
            if let Some(audit) = &self.audit {
                let _ = audit.append(
                    AuditAction::Cleanup,
                    json!({
                        "released": report.released.iter().map(|(p, _)| p).collect::<Vec<_>>(),
                    }),
                );
            }
        }
        report
    }

    /// Applies the three staleness checks to one grant.
    fn judge(&self, grant: &Grant, policy: SweepPolicy, now: chrono::DateTime<Utc>) -> Option<StaleReason> {
        if grant.age(now) > policy.stale_after {
            return Some(StaleReason::Age);
        }

        if let Some(pid) = grant.owner_pid {
            if process_liveness(pid) == Liveness::Dead {
                return Some(StaleReason::DeadOwner);
            }
        }

        match self.probe.describe(grant.port) {
            Some(info) => {
                // A different PID holding the port means the grant no
                // longer reflects reality.
                if let (Some(observed), Some(owner)) = (info.pid, grant.owner_pid) {
                    if observed != owner {
                        return Some(StaleReason::PortDrift);
                    }
                }
                None
            }
            None if policy.release_unbound => Some(StaleReason::Unbound),
            None => None,
        }
    }

    /// The tolerant health-monitor pass: a grant must fail
    /// `max_failures` consecutive passes before it is released.
    pub fn monitor_pass(&self, policy: SweepPolicy, max_failures: u32) -> SweepReport {
        let now = Utc::now();
        let mut report = SweepReport::default();
        let mut failures = self.monitor_failures.lock();

        let grants = self.engine.grants();
        // Forget counters for grants that no longer exist.
        let live: std::collections::HashSet<LockId> =
            grants.iter().map(|g| g.lock_id).collect();
        failures.retain(|lock_id, _| live.contains(lock_id));

        for grant in grants {
            report.examined += 1;
            match self.judge(&grant, policy, now) {
                Some(reason) => {
                    let count = failures.entry(grant.lock_id).or_insert(0);
                    *count += 1;
                    if *count < max_failures {
                        continue;
                    }
                    failures.remove(&grant.lock_id);
                    match self.engine.release(&grant.lock_id.to_string()) {
                        Ok(outcome) => report.released.push((outcome.port.value(), reason)),
                        Err(_) => report.failures += 1,
                    }
                }
                None => {
                    failures.remove(&grant.lock_id);
                }
            }
        }
        report
    }

    /// Startup recovery: load persisted state, restore it into the
    /// engine, and prune it back to a consistent truth, all before the
    /// first request is accepted.
    ///
    /// # Errors
    ///
    /// Only genuine I/O failures from the store surface; corruption is
    /// absorbed into the report's warnings.
    pub fn recover(&self, store: &StateStore, stale_after_secs: u64) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let loaded = store.load()?;
        match &loaded.source {
            LoadSource::Primary | LoadSource::Fresh => {}
            LoadSource::Backup(path) => {
                report
                    .warnings
                    .push(format!("state recovered from backup {}", path.display()));
            }
            LoadSource::Corrupt { details } => {
                report.warnings.push(format!(
                    "persisted state corrupted and no backup verified ({details}); starting empty"
                ));
            }
        }

        report.restored = loaded.document.grants.len();
        self.engine.restore(&loaded.document);

        // Orphan sweep: dead owners, drifted ports, unbound ports.
        let orphan_report = self.sweep(SweepPolicy::startup(stale_after_secs));
        report.orphans_released = orphan_report.cleaned();

        // Singleton integrity: newest grant per single-cardinality type
        // wins, everything older is released.
        let singleton_types: Vec<String> = self
            .registry
            .all()
            .into_iter()
            .filter(|s| s.cardinality == Cardinality::Single)
            .map(|s| s.name)
            .collect();
        let released = self.engine.enforce_singletons(&singleton_types);
        report.singletons_released = released.len();

        Ok(report)
    }

    /// One passive observation pass.
    pub fn observe_once(&self) -> ScanDelta {
        let delta = self.cache.scan_once(self.probe.as_ref());
        if delta.added > 0 || delta.removed > 0 {
            log::debug!(
                "observation scan: +{} -{} ({} bound)",
                delta.added,
                delta.removed,
                self.cache.len()
            );
        }
        delta
    }

    /// The first `count` ports of `service_type`'s range that are neither
    /// granted nor observed bound.
    #[must_use]
    pub fn suggest(&self, service_type: &str, count: usize) -> Option<Vec<Port>> {
        let service = self.registry.resolve(service_type)?;
        let suggestions = service
            .range
            .iter()
            .filter(|port| {
                self.engine.grant_for_port(*port).is_none() && !self.cache.contains(*port)
            })
            .take(count)
            .collect();
        Some(suggestions)
    }
}
