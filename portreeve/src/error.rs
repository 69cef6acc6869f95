//! Error types for the portreeve library.
//!
//! One `thiserror`-derived hierarchy covers every failure the core can
//! produce. Each variant maps onto a wire [`ErrorCategory`] so the
//! transport collaborator can shape its JSON error bodies without matching
//! on variants itself.

use std::path::PathBuf;

use thiserror::Error;

use crate::port::Port;

/// Result type alias for operations that may fail with a portreeve error.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for the portreeve library.
#[derive(Debug, Error)]
pub enum Error {
    /// A request field failed validation.
    #[error("invalid {field}: {message}")]
    InvalidInput {
        /// The field that failed validation.
        field: String,
        /// A description of the validation failure.
        message: String,
    },

    /// The requested service type is not in the registry and auto-allocation
    /// could not (or was not allowed to) create it.
    #[error("unknown service type '{service_type}'; known types: {}", known.join(", "))]
    UnknownServiceType {
        /// The unresolved service type.
        service_type: String,
        /// Every service type the registry currently knows, sorted.
        known: Vec<String>,
    },

    /// No candidate port in the service type's range could be committed.
    #[error("no ports available for '{service_type}' in {range}: {} port(s) currently held", held.len())]
    RangeExhausted {
        /// The service type whose range is exhausted.
        service_type: String,
        /// The range that was scanned.
        range: crate::port::PortRange,
        /// Ports currently held in that range, ascending.
        held: Vec<Port>,
    },

    /// Strict mode found an OS-level listener on a port the grant table
    /// believed free.
    #[error("port {port} is bound by another process outside the registry")]
    PortConflict {
        /// The conflicting port.
        port: Port,
    },

    /// A release named a lock id with no matching grant.
    #[error("no grant found for lock id {lock_id}")]
    UnknownLockId {
        /// The unmatched lock id.
        lock_id: String,
    },

    /// Neither the state file nor any backup verified.
    #[error("persisted state is corrupted and no backup verified: {details}")]
    StateCorrupted {
        /// What failed to verify.
        details: String,
    },

    /// The auto-range planner could not produce or persist a range.
    #[error("auto-allocation failed for '{service_type}': {reason}")]
    PlannerFailed {
        /// The service type being planned.
        service_type: String,
        /// Why the plan or its commit failed.
        reason: String,
    },

    /// An advisory file lock could not be acquired in time.
    #[error("lock on {} timed out after {seconds}s", path.display())]
    LockTimeout {
        /// The contended path.
        path: PathBuf,
        /// Seconds waited before giving up.
        seconds: u64,
    },

    /// A filesystem path was unusable.
    #[error("invalid path {}: {reason}", path.display())]
    InvalidPath {
        /// The offending path.
        path: PathBuf,
        /// Why it was rejected.
        reason: String,
    },

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON document could not be parsed or serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The shipped registry document could not be parsed.
    #[error("registry document error: {0}")]
    Registry(#[from] serde_yaml::Error),

    /// Anything else; surfaced as a generic internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Wire-level error category, serialized into error response bodies.
///
/// The mapping is total: every [`Error`] has exactly one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Bad identifier, out-of-range port, oversized payload.
    InvalidInput,
    /// Service type not resolvable.
    UnknownServiceType,
    /// No candidate port committed.
    RangeExhausted,
    /// OS-level listener detected in strict mode.
    PortConflict,
    /// Release target missing.
    UnknownLockId,
    /// State and all backups failed verification.
    StateCorrupted,
    /// Auto-range planning or its config write failed.
    PlannerFailed,
    /// Everything else.
    Internal,
}

impl Error {
    /// Returns the wire category for this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidInput { .. } | Self::InvalidPath { .. } => ErrorCategory::InvalidInput,
            Self::UnknownServiceType { .. } => ErrorCategory::UnknownServiceType,
            Self::RangeExhausted { .. } => ErrorCategory::RangeExhausted,
            Self::PortConflict { .. } => ErrorCategory::PortConflict,
            Self::UnknownLockId { .. } => ErrorCategory::UnknownLockId,
            Self::StateCorrupted { .. } => ErrorCategory::StateCorrupted,
            Self::PlannerFailed { .. } => ErrorCategory::PlannerFailed,
            Self::LockTimeout { .. }
            | Self::Io(_)
            | Self::Json(_)
            | Self::Registry(_)
            | Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Suggested follow-up actions for recoverable categories, used by the
    /// transport shell when shaping error bodies.
    #[must_use]
    pub fn suggestions(&self) -> Vec<String> {
        match self {
            Self::RangeExhausted { service_type, .. } => vec![
                "run cleanup to reclaim stale grants".to_string(),
                format!("release unused '{service_type}' allocations"),
            ],
            Self::PortConflict { port } => vec![
                format!("try a preferred port other than {port}"),
                "retry; the conflicting process may be transient".to_string(),
            ],
            Self::UnknownServiceType { .. } => {
                vec!["enable auto-allocation or add the type to config.json".to_string()]
            }
            _ => Vec::new(),
        }
    }
}

impl From<crate::port::InvalidPortError> for Error {
    fn from(err: crate::port::InvalidPortError) -> Self {
        Self::InvalidInput {
            field: "port".into(),
            message: err.to_string(),
        }
    }
}

impl From<crate::port::InvalidPortRangeError> for Error {
    fn from(err: crate::port::InvalidPortRangeError) -> Self {
        Self::InvalidInput {
            field: "range".into(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::PortRange;

    #[test]
    fn test_unknown_service_type_lists_known() {
        let err = Error::UnknownServiceType {
            service_type: "jaeger".to_string(),
            known: vec!["api".to_string(), "dev".to_string()],
        };
        let display = format!("{err}");
        assert!(display.contains("jaeger"));
        assert!(display.contains("api, dev"));
        assert_eq!(err.category(), ErrorCategory::UnknownServiceType);
    }

    #[test]
    fn test_range_exhausted_carries_held_ports() {
        let held: Vec<Port> = (6006..=6010).map(|p| Port::try_from(p).unwrap()).collect();
        let err = Error::RangeExhausted {
            service_type: "storybook".to_string(),
            range: PortRange::from_bounds(6006, 6010).unwrap(),
            held,
        };
        let display = format!("{err}");
        assert!(display.contains("storybook"));
        assert!(display.contains("6006-6010"));
        assert!(display.contains("5 port(s)"));
        assert!(!err.suggestions().is_empty());
    }

    #[test]
    fn test_category_mapping_total() {
        let io: Error = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert_eq!(io.category(), ErrorCategory::Internal);

        let input = Error::InvalidInput {
            field: "service_name".into(),
            message: "too long".into(),
        };
        assert_eq!(input.category(), ErrorCategory::InvalidInput);

        let lock = Error::LockTimeout {
            path: PathBuf::from("/tmp/x"),
            seconds: 10,
        };
        assert_eq!(lock.category(), ErrorCategory::Internal);
    }

    #[test]
    fn test_category_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCategory::RangeExhausted).unwrap();
        assert_eq!(json, "\"RANGE_EXHAUSTED\"");
        let json = serde_json::to_string(&ErrorCategory::UnknownLockId).unwrap();
        assert_eq!(json, "\"UNKNOWN_LOCK_ID\"");
    }

    #[test]
    fn test_port_error_conversion() {
        let err: Error = Port::try_from(0).unwrap_err().into();
        assert!(matches!(err, Error::InvalidInput { .. }));
        assert_eq!(err.category(), ErrorCategory::InvalidInput);
    }
}
