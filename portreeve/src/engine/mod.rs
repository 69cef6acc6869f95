//! The allocation engine.
//!
//! Exclusive owner of the grant table, the singleton-claim table, and the
//! in-flight reservation set. All three live behind one mutex, so the
//! reserve → verify → commit bracket of a single candidate port is atomic
//! with respect to every other request; the only blocking work inside the
//! bracket is an OS probe for ports outside managed ranges, and the lock
//! is deliberately held across it: releasing it there would reopen the
//! check-then-commit window the in-flight set exists to close.

pub mod request;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::grant::{Grant, LockId, SingletonClaim};
use crate::planner::RangePlanner;
use crate::port::{Port, PortRange};
use crate::probe::PortProbe;
use crate::registry::{Cardinality, ServiceRegistry, ServiceType};
use crate::store::StateDocument;

pub use request::{AllocateRequest, NormalizedRequest};

#[derive(Debug, Default)]
struct EngineState {
    grants: HashMap<Port, Grant>,
    singletons: HashMap<String, SingletonClaim>,
    in_flight: HashSet<Port>,
}

/// Monotonic operation counters, exposed through the metrics surface.
#[derive(Debug, Default)]
pub struct EngineCounters {
    allocations: AtomicU64,
    releases: AtomicU64,
    conflicts: AtomicU64,
    exhaustions: AtomicU64,
}

/// A point-in-time copy of [`EngineCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    /// Grants committed.
    pub allocations: u64,
    /// Grants released (explicitly or by reclaim).
    pub releases: u64,
    /// OS-level conflicts observed on ports the table believed free.
    pub conflicts: u64,
    /// Allocation attempts that exhausted their range.
    pub exhaustions: u64,
}

impl EngineCounters {
    fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            allocations: self.allocations.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            exhaustions: self.exhaustions.load(Ordering::Relaxed),
        }
    }
}

/// The outcome of a successful (or dry-run) allocation.
#[derive(Debug, Clone, Serialize)]
pub struct AllocationOutcome {
    /// The chosen port.
    pub port: Port,
    /// The grant's handle; absent only for dry runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_id: Option<LockId>,
    /// The resolved service type.
    pub service_type: String,
    /// `true` when a singleton claim was reused instead of committing a
    /// new grant.
    pub existing: bool,
    /// Instance that holds the reused claim, when `existing`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_instance_id: Option<String>,
    /// `true` when the auto-range planner created the service type during
    /// this request.
    pub auto_allocated: bool,
    /// The planner-created range, when `auto_allocated`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocated_range: Option<PortRange>,
    /// `true` when no state was mutated.
    pub dry_run: bool,
}

/// The outcome of a release.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReleaseOutcome {
    /// The port that was freed.
    pub port: Port,
    /// The released grant's service type.
    pub service_type: String,
}

enum Attempt {
    Committed(Grant),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipReason {
    /// The grant table already holds the port.
    Allocated,
    /// Another attempt holds the reservation.
    InProgress,
    /// The OS reports a listener the table does not know about.
    Occupied,
}

/// The concurrent allocator. See the module docs for the locking shape.
pub struct AllocationEngine {
    registry: Arc<ServiceRegistry>,
    probe: Arc<dyn PortProbe>,
    planner: Option<Arc<RangePlanner>>,
    state: Mutex<EngineState>,
    counters: EngineCounters,
    save_signal: Mutex<Option<Sender<()>>>,
}

impl std::fmt::Debug for AllocationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationEngine")
            .field("grants", &self.state.lock().grants.len())
            .finish_non_exhaustive()
    }
}

impl AllocationEngine {
    /// Creates an engine over `registry` and `probe`, with no planner (an
    /// unknown service type is then always a request error).
    #[must_use]
    pub fn new(registry: Arc<ServiceRegistry>, probe: Arc<dyn PortProbe>) -> Self {
        Self {
            registry,
            probe,
            planner: None,
            state: Mutex::new(EngineState::default()),
            counters: EngineCounters::default(),
            save_signal: Mutex::new(None),
        }
    }

    /// Attaches the auto-range planner consulted for unknown types.
    #[must_use]
    pub fn with_planner(mut self, planner: Arc<RangePlanner>) -> Self {
        self.planner = Some(planner);
        self
    }

    /// Wires the persister nudge; every commit and release sends one unit.
    pub fn set_save_signal(&self, sender: Sender<()>) {
        *self.save_signal.lock() = Some(sender);
    }

    /// Serves one allocation request.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] from normalization.
    /// - [`Error::UnknownServiceType`] when the type cannot be resolved.
    /// - [`Error::PlannerFailed`] when auto-allocation was attempted and
    ///   failed.
    /// - [`Error::RangeExhausted`] when no candidate port commits.
    /// - [`Error::PortConflict`] when nothing committed and at least one
    ///   OS-level conflict was observed along the way.
    pub fn allocate(&self, request: AllocateRequest) -> Result<AllocationOutcome> {
        let request = request.normalize()?;
        let (service, auto_allocated) = self.resolve_type(&request.service_type)?;

        // Singleton short-circuit: the existing claim is the answer.
        if service.cardinality == Cardinality::Single {
            let state = self.state.lock();
            if let Some(claim) = state.singletons.get(&service.name) {
                return Ok(AllocationOutcome {
                    port: claim.port,
                    lock_id: Some(claim.lock_id),
                    service_type: service.name.clone(),
                    existing: true,
                    existing_instance_id: Some(claim.instance_id.clone()),
                    auto_allocated,
                    allocated_range: auto_allocated.then_some(service.range),
                    dry_run: request.dry_run,
                });
            }
        }

        let candidates = build_candidates(&request, &service);

        if request.dry_run {
            return self.dry_run(&service, &candidates, auto_allocated);
        }

        let strict = self.registry.daemon_options().strict_probe;
        let mut first_conflict: Option<Port> = None;

        for &port in &candidates {
            match self.try_atomic(port, &request, &service, strict) {
                Attempt::Committed(grant) => {
                    self.counters.allocations.fetch_add(1, Ordering::Relaxed);
                    self.notify_save();
                    return Ok(AllocationOutcome {
                        port: grant.port,
                        lock_id: Some(grant.lock_id),
                        service_type: service.name.clone(),
                        existing: false,
                        existing_instance_id: None,
                        auto_allocated,
                        allocated_range: auto_allocated.then_some(service.range),
                        dry_run: false,
                    });
                }
                Attempt::Skipped(SkipReason::Occupied) => {
                    self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                    first_conflict.get_or_insert(port);
                }
                Attempt::Skipped(_) => {}
            }
        }

        self.counters.exhaustions.fetch_add(1, Ordering::Relaxed);
        if let Some(port) = first_conflict {
            return Err(Error::PortConflict { port });
        }
        Err(Error::RangeExhausted {
            service_type: service.name.clone(),
            range: service.range,
            held: self.held_ports_in(service.range),
        })
    }

    /// One candidate attempt: reserve, verify, commit, all under the
    /// registry lock. The reservation is cleared on every exit path.
    fn try_atomic(
        &self,
        port: Port,
        request: &NormalizedRequest,
        service: &ServiceType,
        strict: bool,
    ) -> Attempt {
        let mut state = self.state.lock();

        if state.grants.contains_key(&port) {
            return Attempt::Skipped(SkipReason::Allocated);
        }
        if state.in_flight.contains(&port) {
            // Another attempt holds the reservation; skip without waiting.
            return Attempt::Skipped(SkipReason::InProgress);
        }
        state.in_flight.insert(port);

        let outcome = self.attempt_reserved(&mut state, port, request, service, strict);

        state.in_flight.remove(&port);
        outcome
    }

    /// The body of an attempt that holds the reservation for `port`.
    fn attempt_reserved(
        &self,
        state: &mut EngineState,
        port: Port,
        request: &NormalizedRequest,
        service: &ServiceType,
        strict: bool,
    ) -> Attempt {
        // Re-check after taking the reservation; a competing commit may
        // have landed between the availability check and the insert.
        if state.grants.contains_key(&port) {
            return Attempt::Skipped(SkipReason::Allocated);
        }

        // Managed-range fast path: inside a registered range the grant
        // table is the authority and no OS probe is needed. Outside it
        // (lenient preferred ports), or in strict mode, ask the OS.
        let must_probe = strict || !self.registry.is_managed(port);
        if must_probe && self.probe.is_bound(port) {
            return Attempt::Skipped(SkipReason::Occupied);
        }

        let grant = Grant::builder(port, service.name.clone())
            .service_name(request.service_name.clone())
            .instance_id(request.instance_id.clone())
            .project_path(request.project_path.clone())
            .owner_pid(request.owner_pid)
            .origin(request.origin.clone())
            .build();

        if service.cardinality == Cardinality::Single {
            state
                .singletons
                .insert(service.name.clone(), SingletonClaim::for_grant(&grant));
        }
        state.grants.insert(port, grant.clone());
        Attempt::Committed(grant)
    }

    /// Dry-run: find the first candidate neither granted nor reserved,
    /// without mutating anything.
    fn dry_run(
        &self,
        service: &ServiceType,
        candidates: &[Port],
        auto_allocated: bool,
    ) -> Result<AllocationOutcome> {
        let state = self.state.lock();
        let free = candidates
            .iter()
            .find(|port| !state.grants.contains_key(port) && !state.in_flight.contains(port));
        match free {
            Some(&port) => Ok(AllocationOutcome {
                port,
                lock_id: None,
                service_type: service.name.clone(),
                existing: false,
                existing_instance_id: None,
                auto_allocated,
                allocated_range: auto_allocated.then_some(service.range),
                dry_run: true,
            }),
            None => Err(Error::RangeExhausted {
                service_type: service.name.clone(),
                range: service.range,
                held: held_in(&state, service.range),
            }),
        }
    }

    /// Releases a grant by lock id: the dual of a commit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownLockId`] when no grant matches.
    pub fn release(&self, lock_id: &str) -> Result<ReleaseOutcome> {
        let parsed = LockId::parse(lock_id)?;
        let mut state = self.state.lock();

        let port = state
            .grants
            .values()
            .find(|grant| grant.lock_id == parsed)
            .map(|grant| grant.port)
            .ok_or_else(|| Error::UnknownLockId {
                lock_id: lock_id.to_string(),
            })?;

        let grant = state
            .grants
            .remove(&port)
            .ok_or_else(|| Error::Internal("grant vanished during release".into()))?;
        // A claim is removed only when it belongs to this grant; a newer
        // claim under the same type must survive an old release.
        if let Some(claim) = state.singletons.get(&grant.service_type) {
            if claim.lock_id == grant.lock_id {
                state.singletons.remove(&grant.service_type);
            }
        }
        drop(state);

        self.counters.releases.fetch_add(1, Ordering::Relaxed);
        self.notify_save();
        Ok(ReleaseOutcome {
            port: grant.port,
            service_type: grant.service_type,
        })
    }

    /// Resolves the service type, consulting the planner for unknown
    /// types when auto-allocation is enabled. The boolean reports whether
    /// the planner created the type during this call.
    fn resolve_type(&self, name: &str) -> Result<(ServiceType, bool)> {
        if let Some(service) = self.registry.resolve(name) {
            return Ok((service, false));
        }
        if self.registry.auto_allocation().enabled {
            if let Some(planner) = &self.planner {
                let service = planner.ensure_type(name)?;
                return Ok((service, true));
            }
        }
        Err(Error::UnknownServiceType {
            service_type: name.to_string(),
            known: self.registry.known_types(),
        })
    }

    fn notify_save(&self) {
        if let Some(sender) = self.save_signal.lock().as_ref() {
            let _ = sender.send(());
        }
    }

    // ------------------------------------------------------------------
    // Read-side surface for reconciliation, persistence, and queries.
    // ------------------------------------------------------------------

    /// Snapshot of every grant.
    #[must_use]
    pub fn grants(&self) -> Vec<Grant> {
        let mut grants: Vec<Grant> = self.state.lock().grants.values().cloned().collect();
        grants.sort_by_key(|grant| grant.port);
        grants
    }

    /// Snapshot of every singleton claim.
    #[must_use]
    pub fn singletons(&self) -> Vec<SingletonClaim> {
        let mut claims: Vec<SingletonClaim> =
            self.state.lock().singletons.values().cloned().collect();
        claims.sort_by(|a, b| a.service_type.cmp(&b.service_type));
        claims
    }

    /// The grant holding `port`, if any.
    #[must_use]
    pub fn grant_for_port(&self, port: Port) -> Option<Grant> {
        self.state.lock().grants.get(&port).cloned()
    }

    /// Number of live grants.
    #[must_use]
    pub fn grant_count(&self) -> usize {
        self.state.lock().grants.len()
    }

    /// Number of reservations currently in flight (used by the shutdown
    /// drain).
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Granted ports inside `range`, ascending.
    #[must_use]
    pub fn held_ports_in(&self, range: PortRange) -> Vec<Port> {
        held_in(&self.state.lock(), range)
    }

    /// Current operation counters.
    #[must_use]
    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Replaces the grant and singleton tables from a loaded document.
    /// Startup-only: recovery prunes through [`Self::release`] afterwards.
    pub fn restore(&self, document: &StateDocument) {
        let mut state = self.state.lock();
        state.grants.clear();
        state.singletons.clear();
        for grant in &document.grants {
            state.grants.insert(grant.port, grant.clone());
        }
        for claim in &document.singletons {
            state
                .singletons
                .insert(claim.service_type.clone(), claim.clone());
        }
    }

    /// Restores singleton integrity after a state load: for each listed
    /// type, the newest grant by `allocated_at` keeps the claim and every
    /// older grant is dropped. Claims without a backing grant are cleared.
    /// Returns the grants that were removed.
    pub fn enforce_singletons(&self, singleton_types: &[String]) -> Vec<ReleaseOutcome> {
        let mut state = self.state.lock();
        let mut released = Vec::new();

        for service_type in singleton_types {
            let mut of_type: Vec<(Port, chrono::DateTime<chrono::Utc>)> = state
                .grants
                .values()
                .filter(|grant| grant.service_type == *service_type)
                .map(|grant| (grant.port, grant.allocated_at))
                .collect();

            let Some(newest) = of_type.iter().max_by_key(|(_, at)| *at).map(|(p, _)| *p)
            else {
                state.singletons.remove(service_type);
                continue;
            };

            of_type.retain(|(port, _)| *port != newest);
            for (port, _) in of_type {
                if let Some(dropped) = state.grants.remove(&port) {
                    released.push(ReleaseOutcome {
                        port: dropped.port,
                        service_type: dropped.service_type,
                    });
                }
            }
            if let Some(keeper) = state.grants.get(&newest) {
                let claim = SingletonClaim::for_grant(keeper);
                state.singletons.insert(service_type.clone(), claim);
            }
        }

        if !released.is_empty() {
            self.counters
                .releases
                .fetch_add(released.len() as u64, Ordering::Relaxed);
            drop(state);
            self.notify_save();
        }
        released
    }

    /// Builds the persistable document from the engine's tables plus the
    /// caller-owned instance records.
    #[must_use]
    pub fn to_document(&self, instances: Vec<crate::grant::Instance>) -> StateDocument {
        StateDocument {
            grants: self.grants(),
            instances,
            singletons: self.singletons(),
            saved_at: None,
        }
    }
}

/// Ordered, de-duplicated candidate list: request preference first, then
/// the type's preferred ports, then the full range ascending.
fn build_candidates(request: &NormalizedRequest, service: &ServiceType) -> Vec<Port> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::with_capacity(usize::from(service.range.len()) + 4);

    if let Some(preferred) = request.preferred_port {
        if seen.insert(preferred) {
            candidates.push(preferred);
        }
    }
    for &preferred in &service.preferred_ports {
        if seen.insert(preferred) {
            candidates.push(preferred);
        }
    }
    for port in service.range {
        if seen.insert(port) {
            candidates.push(port);
        }
    }
    candidates
}

fn held_in(state: &EngineState, range: PortRange) -> Vec<Port> {
    let mut held: Vec<Port> = state
        .grants
        .keys()
        .copied()
        .filter(|port| range.contains(*port))
        .collect();
    held.sort_unstable();
    held
}

#[cfg(all(test, feature = "property-tests"))]
mod proptests;
