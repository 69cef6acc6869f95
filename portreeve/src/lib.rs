#![deny(missing_docs, unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # portreeve
//!
//! Core library for a host-local port coordination daemon: a single
//! long-lived process that arbitrates TCP port usage among independent
//! developer tools. It keeps an authoritative registry of which port
//! belongs to which service, hands ports out atomically from
//! service-typed ranges, reclaims them when their owners die, and
//! passively observes the host's real listening state to explain
//! conflicts it did not cause.
//!
//! Grants are advisory: the daemon never binds the ports it hands out,
//! and the OS remains the final arbiter.
//!
//! ## Components
//!
//! - [`probe`]: is a port bound, and who holds it ([`probe::PortProbe`])
//! - [`store`]: crash-safe, checksummed state persistence
//! - [`registry`]: service-type ranges, base config ∪ user overrides
//! - [`planner`]: range auto-allocation for unknown service types
//! - [`engine`]: the concurrent allocator ([`engine::AllocationEngine`])
//! - [`reconcile`]: stale sweeps, startup recovery, passive observation
//! - [`daemon`]: lifecycle wiring and the typed operation surface
//!
//! ## Example
//!
//! ```no_run
//! use portreeve::daemon::Daemon;
//! use portreeve::engine::AllocateRequest;
//!
//! let daemon = Daemon::start(portreeve::store::default_config_root()?)?;
//! let handlers = daemon.handlers();
//!
//! let granted = handlers.allocate(AllocateRequest::for_type("dev"))?;
//! println!("got port {} (lock {})", granted.port, granted.lock_id.unwrap());
//!
//! daemon.shutdown()?;
//! # Ok::<(), portreeve::Error>(())
//! ```

pub mod audit;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod grant;
pub mod logging;
pub mod planner;
pub mod port;
pub mod probe;
pub mod reconcile;
pub mod registry;
pub mod store;

// Re-export key types at crate root for convenience
pub use daemon::{Daemon, Handlers};
pub use engine::{AllocateRequest, AllocationEngine, AllocationOutcome, ReleaseOutcome};
pub use error::{Error, ErrorCategory, Result};
pub use grant::{Grant, Instance, LockId, SingletonClaim};
pub use logging::{init_logger, LogLevel, Logger};
pub use planner::RangePlanner;
pub use port::{Port, PortRange};
pub use probe::{MockProbe, PortProbe, SystemProbe};
pub use reconcile::{Observation, Reconciler, SweepPolicy};
pub use registry::{Cardinality, ServiceRegistry, ServiceType};
pub use store::{StateDocument, StateStore};
