//! OS-level port probing.
//!
//! This module answers two questions: "is port P bound right now?" and
//! "what is listening on this host, and who owns it?". The design is
//! trait-based so the allocation engine and reconciliation loop can run
//! against a deterministic mock in tests.
//!
//! Probes are read-only with respect to OS state and never surface errors:
//! `is_bound` fails closed (uncertainty reads as bound), `describe` and
//! `scan` degrade to "nothing found". Policy on those answers belongs to
//! the callers.

pub mod listeners;

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use crate::port::Port;

pub use listeners::ListenerInfo;

/// Budget for a single bind-probe. The bind itself does not block in
/// practice; the budget bounds the contract, not the syscall.
pub const BIND_PROBE_BUDGET: Duration = Duration::from_secs(1);

/// Budget for one external listing tool invocation (`lsof`, `netstat`,
/// `ss`).
pub const TOOL_BUDGET: Duration = Duration::from_secs(5);

/// Trait for OS port probing.
///
/// Implementations must not block longer than the stated budgets and must
/// answer conservatively on failure.
pub trait PortProbe: Send + Sync {
    /// Returns `true` iff a local process currently holds a LISTEN socket
    /// on `port`. Uncertainty reads as `true`.
    fn is_bound(&self, port: Port) -> bool;

    /// Best-effort lookup of the process holding `port`. Returns `None`
    /// when no listener exists or no listing tool succeeds.
    fn describe(&self, port: Port) -> Option<ListenerInfo>;

    /// Enumerates every listening TCP port on the host. Returns an empty
    /// list when no listing tool succeeds.
    fn scan(&self) -> Vec<ListenerInfo>;
}

/// Production probe.
///
/// `is_bound` attempts a throwaway bind on `127.0.0.1:port` (through the
/// `port-selector` crate); `describe` and `scan` walk the tool chain
/// `lsof` → `netstat` → `ss`, first tool with parseable output wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl PortProbe for SystemProbe {
    fn is_bound(&self, port: Port) -> bool {
        // is_free_tcp binds and immediately closes a listener; a false
        // answer can only come from a successful bind, so any failure mode
        // already reads as bound.
        !port_selector::is_free_tcp(port.value())
    }

    fn describe(&self, port: Port) -> Option<ListenerInfo> {
        listeners::collect(TOOL_BUDGET)
            .into_iter()
            .find(|info| info.port == port)
    }

    fn scan(&self) -> Vec<ListenerInfo> {
        listeners::collect(TOOL_BUDGET)
    }
}

/// Deterministic probe for tests.
///
/// Interior mutability lets tests flip port state while the engine or
/// reconciler holds a shared handle.
#[derive(Debug, Default)]
pub struct MockProbe {
    state: Mutex<MockState>,
}

#[derive(Debug, Default)]
struct MockState {
    bound: HashMap<u16, Option<ListenerInfo>>,
}

impl MockProbe {
    /// Creates a probe with no bound ports.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `port` as bound with no associated listener details.
    pub fn bind(&self, port: Port) {
        self.state.lock().bound.insert(port.value(), None);
    }

    /// Marks `port` as bound by the given listener.
    pub fn bind_with(&self, info: ListenerInfo) {
        self.state.lock().bound.insert(info.port.value(), Some(info));
    }

    /// Marks `port` as free.
    pub fn unbind(&self, port: Port) {
        self.state.lock().bound.remove(&port.value());
    }

    /// Number of ports currently marked bound.
    #[must_use]
    pub fn bound_count(&self) -> usize {
        self.state.lock().bound.len()
    }
}

impl PortProbe for MockProbe {
    fn is_bound(&self, port: Port) -> bool {
        self.state.lock().bound.contains_key(&port.value())
    }

    fn describe(&self, port: Port) -> Option<ListenerInfo> {
        self.state
            .lock()
            .bound
            .get(&port.value())
            .and_then(Clone::clone)
    }

    fn scan(&self) -> Vec<ListenerInfo> {
        let mut listeners: Vec<ListenerInfo> = self
            .state
            .lock()
            .bound
            .values()
            .filter_map(Clone::clone)
            .collect();
        listeners.sort_by_key(|info| info.port);
        listeners
    }
}
