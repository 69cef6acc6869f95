//! Append-only audit trail of mutating events.
//!
//! One JSON object per line in `audit.log` under the config root. Every
//! record passes through the log sanitizer before hitting disk. The file
//! rotates at 10 MiB, keeping five generations (`audit.log.1` newest
//! rotated … `audit.log.5` oldest).

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::logging::sanitize_value;

/// Rotation threshold.
pub const MAX_AUDIT_BYTES: u64 = 10 * 1024 * 1024;

/// Rotated generations kept.
pub const AUDIT_GENERATIONS: u32 = 5;

/// What kind of mutation a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A grant was committed.
    Allocate,
    /// A grant was released (explicitly or by reclaim).
    Release,
    /// A cleanup pass removed grants.
    Cleanup,
    /// The planner persisted a new service type.
    AutoAllocateRange,
    /// An instance registered or re-registered.
    InstanceRegister,
    /// The daemon started or stopped.
    Lifecycle,
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// When the event happened.
    pub at: DateTime<Utc>,
    /// The kind of mutation.
    pub action: AuditAction,
    /// Sanitized free-form details.
    pub details: serde_json::Value,
}

/// The audit log writer. Appends are serialized through an internal mutex
/// so concurrent mutating operations interleave at line granularity.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    /// Creates a writer for `path`. Nothing is touched until the first
    /// append.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Appends one record, rotating first if the log has outgrown
    /// [`MAX_AUDIT_BYTES`].
    ///
    /// # Errors
    ///
    /// Returns an error when the log cannot be written; callers treat that
    /// as a logged warning, not a failure of the audited operation.
    pub fn append(&self, action: AuditAction, details: serde_json::Value) -> Result<()> {
        let record = AuditRecord {
            at: Utc::now(),
            action,
            details: sanitize_value(&details),
        };
        let line = serde_json::to_string(&record)?;

        let _guard = self.write_lock.lock();
        self.rotate_if_needed()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        crate::store::paths::set_file_private(&self.path)?;
        Ok(())
    }

    /// Shifts `audit.log` → `.1` → … → `.5`, discarding the oldest.
    fn rotate_if_needed(&self) -> Result<()> {
        let Ok(metadata) = std::fs::metadata(&self.path) else {
            return Ok(());
        };
        if metadata.len() < MAX_AUDIT_BYTES {
            return Ok(());
        }

        for generation in (1..AUDIT_GENERATIONS).rev() {
            let from = self.generation_path(generation);
            if from.exists() {
                let _ = std::fs::rename(&from, self.generation_path(generation + 1));
            }
        }
        std::fs::rename(&self.path, self.generation_path(1))?;
        Ok(())
    }

    fn generation_path(&self, generation: u32) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map_or_else(|| "audit.log".into(), std::ffi::OsStr::to_os_string);
        name.push(format!(".{generation}"));
        self.path.with_file_name(name)
    }
}
