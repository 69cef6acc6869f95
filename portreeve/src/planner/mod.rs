//! The auto-range planner.
//!
//! When an allocation names a service type the registry does not know and
//! auto-allocation is enabled, the planner carves out a fresh range,
//! persists it into the user's `config.json`, and reloads the registry so
//! the new type is visible, or refuses and the allocation fails.
//!
//! Planning is serialized per service-type identifier: a second request
//! for the same unknown type waits (bounded poll) for the first to commit
//! and then re-resolves instead of planning again.

mod placement;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;

use crate::audit::{AuditAction, AuditLog};
use crate::error::{Error, Result};
use crate::registry::{
    is_valid_service_type_name, ServiceRegistry, ServiceType, ServiceTypeEntry, UserConfig,
};
use crate::store::lockfile::FileLock;
use crate::store::{backup_stamp, StorePaths};

pub use placement::{category_of, plan_range};

/// How long a second request waits for a concurrent plan of the same type.
pub const CONCURRENT_PLAN_WAIT: Duration = Duration::from_secs(3);

/// Newest user-config backups kept on disk.
pub const CONFIG_BACKUP_CAP: usize = 10;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Plans and persists ranges for unknown service types.
#[derive(Debug)]
pub struct RangePlanner {
    registry: Arc<ServiceRegistry>,
    paths: StorePaths,
    audit: Option<Arc<AuditLog>>,
    in_progress: Mutex<HashSet<String>>,
}

impl RangePlanner {
    /// Creates a planner writing user config under `paths`.
    #[must_use]
    pub fn new(registry: Arc<ServiceRegistry>, paths: StorePaths) -> Self {
        Self {
            registry,
            paths,
            audit: None,
            in_progress: Mutex::new(HashSet::new()),
        }
    }

    /// Attaches an audit log; successful commits emit records through it.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Ensures `service_type` exists in the registry, planning and
    /// committing a new range when necessary.
    ///
    /// # Errors
    ///
    /// - [`Error::PlannerFailed`] when auto-allocation is disabled, no
    ///   valid range can be found, or the config write fails. The user
    ///   config file is left unchanged in every failure case.
    /// - [`Error::InvalidInput`] when the name itself is malformed.
    pub fn ensure_type(&self, service_type: &str) -> Result<ServiceType> {
        if !is_valid_service_type_name(service_type) {
            return Err(Error::InvalidInput {
                field: "service_type".into(),
                message: format!("invalid service type name '{service_type}'"),
            });
        }
        if let Some(existing) = self.registry.resolve(service_type) {
            return Ok(existing);
        }
        let policy = self.registry.auto_allocation();
        if !policy.enabled {
            return Err(Error::PlannerFailed {
                service_type: service_type.to_string(),
                reason: "auto-allocation is disabled".into(),
            });
        }

        // Per-type serialization: either we claim the slot or we wait for
        // whoever holds it and take their result from the registry.
        if !self.in_progress.lock().insert(service_type.to_string()) {
            return self.wait_for_concurrent_plan(service_type);
        }
        let _slot = InProgressSlot {
            planner: self,
            name: service_type.to_string(),
        };

        // The winner may have committed between our resolve and our claim.
        if let Some(existing) = self.registry.resolve(service_type) {
            return Ok(existing);
        }

        let chunk = policy
            .chunk_rules
            .iter()
            .find(|rule| rule.matches(service_type))
            .map_or(policy.default_chunk_size, |rule| rule.chunk_size);

        let existing = self.registry.all();
        let range = placement::plan_range(service_type, &existing, &policy, chunk).map_err(
            |reason| Error::PlannerFailed {
                service_type: service_type.to_string(),
                reason,
            },
        )?;

        self.commit(service_type, range)?;
        self.registry.reload()?;
        self.registry
            .resolve(service_type)
            .ok_or_else(|| Error::PlannerFailed {
                service_type: service_type.to_string(),
                reason: "committed range did not survive registry reload".into(),
            })
    }

    /// Bounded poll for a concurrent plan of the same type.
    fn wait_for_concurrent_plan(&self, service_type: &str) -> Result<ServiceType> {
        let deadline = Instant::now() + CONCURRENT_PLAN_WAIT;
        loop {
            if let Some(found) = self.registry.resolve(service_type) {
                return Ok(found);
            }
            let still_planning = self.in_progress.lock().contains(service_type);
            if !still_planning || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        self.registry
            .resolve(service_type)
            .ok_or_else(|| Error::PlannerFailed {
                service_type: service_type.to_string(),
                reason: "concurrent plan for this type did not produce a range".into(),
            })
    }

    /// The commit protocol: lock, back up, read-modify-write atomically,
    /// audit. Any failure leaves `config.json` unchanged.
    fn commit(&self, service_type: &str, range: crate::port::PortRange) -> Result<()> {
        let config_path = self.paths.user_config();
        let _lock = FileLock::acquire(&config_path)?;

        self.backup_user_config(&config_path)?;

        let mut config = read_user_config_strict(&config_path, service_type)?;
        config.service_types.insert(
            service_type.to_string(),
            ServiceTypeEntry {
                range: Some(range),
                preferred_ports: Vec::new(),
                cardinality: crate::registry::Cardinality::Multi,
                description: format!("Auto-allocated range for {service_type}"),
                auto_allocated: true,
                allocated_at: Some(Utc::now()),
            },
        );

        write_config_atomic(&config_path, &config).map_err(|e| Error::PlannerFailed {
            service_type: service_type.to_string(),
            reason: format!("config write failed: {e}"),
        })?;

        if let Some(audit) = &self.audit {
            let _ = audit.append(
                AuditAction::AutoAllocateRange,
                json!({
                    "service_type": service_type,
                    "range": [range.lo().value(), range.hi().value()],
                }),
            );
        }
        Ok(())
    }

    /// Copies the current config into `config-backups/`, rotating past the
    /// cap. A missing config file needs no backup.
    fn backup_user_config(&self, config_path: &std::path::Path) -> Result<()> {
        if !config_path.exists() {
            return Ok(());
        }
        let dir = self.paths.config_backups_dir();
        crate::store::paths::create_private_dir(&dir)?;
        let backup = self.paths.config_backup_file(&backup_stamp(Utc::now()));
        std::fs::copy(config_path, &backup)?;
        crate::store::paths::set_file_private(&backup)?;
        crate::store::rotate_backups(&dir, CONFIG_BACKUP_CAP)?;
        Ok(())
    }
}

/// Removes the in-progress claim when planning ends, on every path.
struct InProgressSlot<'a> {
    planner: &'a RangePlanner,
    name: String,
}

impl Drop for InProgressSlot<'_> {
    fn drop(&mut self) {
        self.planner.in_progress.lock().remove(&self.name);
    }
}

/// Reads user config for modification. Unlike registry composition, the
/// commit path refuses to proceed over a malformed file: silently
/// replacing a user's broken config would destroy their edits.
fn read_user_config_strict(path: &std::path::Path, service_type: &str) -> Result<UserConfig> {
    if !path.exists() {
        return Ok(UserConfig::default());
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(|e| Error::PlannerFailed {
        service_type: service_type.to_string(),
        reason: format!("existing config.json is malformed ({e}); refusing to overwrite"),
    })
}

/// Temp-file write with reparse self-verification, then atomic rename.
fn write_config_atomic(path: &std::path::Path, config: &UserConfig) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(config)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &bytes)?;
    crate::store::paths::set_file_private(&tmp)?;

    let verify = std::fs::read(&tmp)?;
    if serde_json::from_slice::<UserConfig>(&verify).is_err() {
        let _ = std::fs::remove_file(&tmp);
        return Err(Error::Internal(
            "config self-verification failed; temp file discarded".into(),
        ));
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}
