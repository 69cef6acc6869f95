//! Allocation request validation and normalization.
//!
//! The transport shell hands the engine already-parsed requests; this
//! module is where their fields are validated and defaulted. Limits are
//! deliberately tight: identifiers are short and alphanumeric-ish, paths
//! are bounded, and anything else is an `InvalidInput` the caller sees
//! unchanged.

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::grant::RequestOrigin;
use crate::port::Port;
use crate::registry::is_valid_service_type_name;

/// Maximum length of `service_name` and `instance_id`.
pub const MAX_NAME_LEN: usize = 100;

/// Maximum length of `project_path` in characters.
pub const MAX_PATH_LEN: usize = 1000;

/// An allocation request as the transport delivers it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AllocateRequest {
    /// The service type to allocate under (required).
    pub service_type: String,
    /// Optional service name; defaults to `unnamed-service`.
    #[serde(default)]
    pub service_name: Option<String>,
    /// Optional instance id; defaults to `default`.
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Optional project path; defaults to the daemon's working directory.
    #[serde(default)]
    pub project_path: Option<String>,
    /// Optional preferred port, tried first.
    #[serde(default)]
    pub preferred_port: Option<u16>,
    /// When set, report the port that would be chosen without mutating
    /// any state.
    #[serde(default)]
    pub dry_run: bool,
    /// PID of the requesting process, when the transport knows it.
    #[serde(default)]
    pub owner_pid: Option<u32>,
    /// Request-origin metadata for the audit trail.
    #[serde(default, skip_deserializing)]
    pub origin: RequestOrigin,
}

impl AllocateRequest {
    /// Convenience constructor for embedders and tests.
    #[must_use]
    pub fn for_type(service_type: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            ..Self::default()
        }
    }

    /// Validates every field and fills defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] naming the first offending field.
    pub fn normalize(self) -> Result<NormalizedRequest> {
        if !is_valid_service_type_name(&self.service_type) {
            return Err(Error::InvalidInput {
                field: "service_type".into(),
                message: format!(
                    "'{}' must be letters, digits, or hyphen, at most 50 chars",
                    crate::logging::sanitize_message(&self.service_type)
                ),
            });
        }

        let service_name = match self.service_name.filter(|s| !s.is_empty()) {
            Some(name) => {
                validate_identifier("service_name", &name, true)?;
                name
            }
            None => "unnamed-service".to_string(),
        };

        let instance_id = match self.instance_id.filter(|s| !s.is_empty()) {
            Some(id) => {
                validate_identifier("instance_id", &id, false)?;
                id
            }
            None => "default".to_string(),
        };

        let project_path = match self.project_path.filter(|s| !s.is_empty()) {
            Some(path) => {
                if path.contains('\0') {
                    return Err(Error::InvalidInput {
                        field: "project_path".into(),
                        message: "must not contain NUL bytes".into(),
                    });
                }
                if path.chars().count() > MAX_PATH_LEN {
                    return Err(Error::InvalidInput {
                        field: "project_path".into(),
                        message: format!("longer than {MAX_PATH_LEN} characters"),
                    });
                }
                PathBuf::from(path)
            }
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
        };

        let preferred_port = match self.preferred_port {
            Some(raw) => Some(Port::try_from(raw)?),
            None => None,
        };

        Ok(NormalizedRequest {
            service_type: self.service_type,
            service_name,
            instance_id,
            project_path,
            preferred_port,
            dry_run: self.dry_run,
            owner_pid: self.owner_pid,
            origin: self.origin,
        })
    }
}

/// A fully validated and defaulted allocation request.
#[derive(Debug, Clone)]
pub struct NormalizedRequest {
    /// Validated service type identifier.
    pub service_type: String,
    /// Non-empty service name.
    pub service_name: String,
    /// Non-empty instance id.
    pub instance_id: String,
    /// Bounded project path.
    pub project_path: PathBuf,
    /// Validated preferred port.
    pub preferred_port: Option<Port>,
    /// Dry-run flag.
    pub dry_run: bool,
    /// Owning PID, when known.
    pub owner_pid: Option<u32>,
    /// Request-origin metadata.
    pub origin: RequestOrigin,
}

/// Identifier charset: alphanumeric plus `-`/`_`, and `.` when
/// `allow_dot` (service names carry dots, instance ids do not).
fn validate_identifier(field: &str, value: &str, allow_dot: bool) -> Result<()> {
    if value.len() > MAX_NAME_LEN {
        return Err(Error::InvalidInput {
            field: field.into(),
            message: format!("longer than {MAX_NAME_LEN} characters"),
        });
    }
    let ok = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || (allow_dot && c == '.'));
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidInput {
            field: field.into(),
            message: "contains characters outside [A-Za-z0-9._-]".into(),
        })
    }
}
