//! The typed operation surface the transport shell drives.
//!
//! Each method corresponds to one endpoint of the HTTP collaborator;
//! requests arrive already parsed and authenticated, responses are serde
//! structs with the wire field names (`lock_id` throughout). Errors are
//! `crate::Error` values; [`ErrorBody::from_error`] shapes them into the
//! JSON error body the shell returns.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;

use crate::audit::{AuditAction, AuditLog};
use crate::engine::{AllocateRequest, AllocationEngine, CounterSnapshot};
use crate::error::{Error, ErrorCategory, Result};
use crate::grant::{Grant, Instance};
use crate::logging::{sanitize_message, sanitize_value};
use crate::port::{Port, PortRange};
use crate::reconcile::{Observation, ObservationCache, ObservationStats, Reconciler, SweepPolicy};
use crate::registry::{Cardinality, ServiceRegistry};

/// Shared instance table: registration is observational and lives outside
/// the allocation engine.
pub type InstanceTable = Arc<Mutex<BTreeMap<String, Instance>>>;

/// The wire shape of an error, per the error-handling contract.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    /// Always `false`.
    pub success: bool,
    /// Sanitized message.
    pub error: String,
    /// Machine-readable category.
    pub category: ErrorCategory,
    /// Follow-up actions for recoverable cases.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

impl ErrorBody {
    /// Shapes an error for the wire.
    #[must_use]
    pub fn from_error(error: &Error) -> Self {
        Self {
            success: false,
            error: sanitize_message(&error.to_string()),
            category: error.category(),
            suggestions: error.suggestions(),
        }
    }
}

/// `POST /allocate` response.
#[derive(Debug, Clone, Serialize)]
pub struct AllocateResponse {
    /// Always `true` on this type; failures are [`ErrorBody`].
    pub success: bool,
    /// The granted (or dry-run) port.
    pub port: u16,
    /// The grant handle; absent for dry runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_id: Option<String>,
    /// Human-readable summary.
    pub message: String,
    /// Present and `true` when a singleton claim was reused.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub existing: bool,
    /// Present and `true` when the planner created the type just now.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub auto_allocated: bool,
    /// The planner-created range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocated_range: Option<PortRange>,
}

/// `DELETE /allocate/:lock_id` response.
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseResponse {
    /// Always `true` on this type.
    pub success: bool,
    /// The freed port.
    pub port: u16,
    /// Human-readable summary.
    pub message: String,
}

/// `GET /check/:port` response.
#[derive(Debug, Clone, Serialize)]
pub struct CheckPortResponse {
    /// The queried port.
    pub port: u16,
    /// `true` when neither granted nor observed bound.
    pub available: bool,
    /// The grant holding the port, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocated_to: Option<Grant>,
    /// What the host observer knows about the port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_usage: Option<Observation>,
}

/// `GET /allocations` response.
#[derive(Debug, Clone, Serialize)]
pub struct AllocationsResponse {
    /// Every live grant, ascending by port.
    pub allocations: Vec<Grant>,
}

/// One service type in the `GET /config` dump.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceTypeInfo {
    /// Inclusive `[lo, hi]` range.
    pub range: PortRange,
    /// Preferred ports in order.
    pub preferred_ports: Vec<u16>,
    /// `multi` or `single`.
    pub cardinality: Cardinality,
    /// Human description.
    pub description: String,
    /// Whether the planner created the entry.
    pub auto_allocated: bool,
}

/// `GET /config` response.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigResponse {
    /// The composed registry.
    pub service_types: BTreeMap<String, ServiceTypeInfo>,
}

/// `POST /cleanup` response.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupResponse {
    /// Always `true` on this type.
    pub success: bool,
    /// Grants released by the sweep.
    pub cleaned: usize,
    /// Human-readable summary.
    pub message: String,
}

/// `POST /instance/register` response.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterInstanceResponse {
    /// Always `true` on this type.
    pub success: bool,
    /// The registered id.
    pub instance_id: String,
}

/// `PUT /instance/:id/heartbeat` response.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatResponse {
    /// Always `true` on this type.
    pub success: bool,
    /// The refreshed heartbeat time.
    pub last_heartbeat: DateTime<Utc>,
}

/// `GET /observe/:port` response.
#[derive(Debug, Clone, Serialize)]
pub struct ObservePortResponse {
    /// The queried port.
    pub port: u16,
    /// Whether the observer currently sees it bound.
    pub bound: bool,
    /// The cached observation, when bound.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation: Option<Observation>,
}

/// `GET /observe/all` response.
#[derive(Debug, Clone, Serialize)]
pub struct ObserveAllResponse {
    /// Number of observed ports.
    pub total: usize,
    /// Every observation, ascending by port.
    pub observations: Vec<Observation>,
    /// Aggregate statistics.
    pub stats: ObservationStats,
}

/// `GET /suggest/:service_type` response.
#[derive(Debug, Clone, Serialize)]
pub struct SuggestResponse {
    /// The queried type.
    pub service_type: String,
    /// Free ports, lowest first.
    pub suggestions: Vec<u16>,
    /// Number of suggestions returned.
    pub count: usize,
}

/// `GET /status` response.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    /// Seconds since the daemon finished startup.
    pub uptime_secs: u64,
    /// Live grants.
    pub grants: usize,
    /// Live singleton claims.
    pub singletons: usize,
    /// Registered instances.
    pub instances: usize,
    /// Ports the observer currently sees bound.
    pub observed_ports: usize,
    /// Known service types.
    pub service_types: usize,
    /// Startup and composition warnings still standing.
    pub warnings: Vec<String>,
}

/// `GET /health` response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Fixed `"ok"`; the daemon answered, so it is alive.
    pub status: &'static str,
    /// The daemon's PID.
    pub pid: u32,
}

/// `GET /metrics` response.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsResponse {
    /// Engine operation counters.
    pub counters: CounterSnapshot,
    /// Live grants.
    pub grants: usize,
    /// Observed bound ports.
    pub observed_ports: usize,
}

/// The operation surface. One instance serves every request worker.
pub struct Handlers {
    engine: Arc<AllocationEngine>,
    registry: Arc<ServiceRegistry>,
    reconciler: Arc<Reconciler>,
    cache: Arc<ObservationCache>,
    instances: InstanceTable,
    audit: Option<Arc<AuditLog>>,
    started_at: DateTime<Utc>,
    warnings: Vec<String>,
}

impl Handlers {
    /// Wires the surface over the shared components.
    #[must_use]
    pub fn new(
        engine: Arc<AllocationEngine>,
        registry: Arc<ServiceRegistry>,
        reconciler: Arc<Reconciler>,
        instances: InstanceTable,
    ) -> Self {
        let cache = reconciler.cache();
        Self {
            engine,
            registry,
            reconciler,
            cache,
            instances,
            audit: None,
            started_at: Utc::now(),
            warnings: Vec::new(),
        }
    }

    /// Attaches the audit log.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Records startup warnings surfaced through `GET /status`.
    #[must_use]
    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    /// `POST /allocate`.
    ///
    /// # Errors
    ///
    /// Everything the engine's allocate can raise.
    pub fn allocate(&self, request: AllocateRequest) -> Result<AllocateResponse> {
        let outcome = self.engine.allocate(request)?;

        let message = if outcome.dry_run {
            format!("port {} would be allocated (dry run)", outcome.port)
        } else if outcome.existing {
            format!(
                "reusing existing {} allocation on port {}",
                outcome.service_type, outcome.port
            )
        } else {
            format!("allocated port {} for {}", outcome.port, outcome.service_type)
        };

        if !outcome.dry_run && !outcome.existing {
            self.audit(
                AuditAction::Allocate,
                json!({
                    "port": outcome.port.value(),
                    "service_type": outcome.service_type,
                    "auto_allocated": outcome.auto_allocated,
                }),
            );
        }

        Ok(AllocateResponse {
            success: true,
            port: outcome.port.value(),
            lock_id: outcome.lock_id.map(|id| id.to_string()),
            message,
            existing: outcome.existing,
            auto_allocated: outcome.auto_allocated,
            allocated_range: outcome.allocated_range,
        })
    }

    /// `DELETE /allocate/:lock_id`.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownLockId`] when no grant matches.
    pub fn release(&self, lock_id: &str) -> Result<ReleaseResponse> {
        let outcome = self.engine.release(lock_id)?;
        self.audit(
            AuditAction::Release,
            json!({"port": outcome.port.value(), "service_type": outcome.service_type}),
        );
        Ok(ReleaseResponse {
            success: true,
            port: outcome.port.value(),
            message: format!("released port {}", outcome.port),
        })
    }

    /// `GET /check/:port`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] for port 0.
    pub fn check_port(&self, port: u16) -> Result<CheckPortResponse> {
        let port = Port::try_from(port)?;
        let allocated_to = self.engine.grant_for_port(port);
        let system_usage = self.cache.get(port);
        Ok(CheckPortResponse {
            port: port.value(),
            available: allocated_to.is_none() && system_usage.is_none(),
            allocated_to,
            system_usage,
        })
    }

    /// `GET /allocations`.
    #[must_use]
    pub fn allocations(&self) -> AllocationsResponse {
        AllocationsResponse {
            allocations: self.engine.grants(),
        }
    }

    /// `GET /config`.
    #[must_use]
    pub fn config(&self) -> ConfigResponse {
        let service_types = self
            .registry
            .all()
            .into_iter()
            .map(|service| {
                (
                    service.name.clone(),
                    ServiceTypeInfo {
                        range: service.range,
                        preferred_ports: service
                            .preferred_ports
                            .iter()
                            .map(|p| p.value())
                            .collect(),
                        cardinality: service.cardinality,
                        description: service.description,
                        auto_allocated: service.auto_allocated,
                    },
                )
            })
            .collect();
        ConfigResponse { service_types }
    }

    /// `POST /cleanup`. A forced cleanup also reclaims grants whose port
    /// is not bound at all; the regular pass leaves those alone.
    #[must_use]
    pub fn cleanup(&self, force: bool) -> CleanupResponse {
        let stale_after = self.registry.daemon_options().stale_after_secs;
        let policy = if force {
            SweepPolicy::startup(stale_after)
        } else {
            SweepPolicy::periodic(stale_after)
        };
        let report = self.reconciler.sweep(policy);
        CleanupResponse {
            success: true,
            cleaned: report.cleaned(),
            message: format!(
                "examined {} grant(s), released {}",
                report.examined,
                report.cleaned()
            ),
        }
    }

    /// `POST /instance/register`. Re-registration refreshes the record.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] for a malformed instance id.
    pub fn register_instance(
        &self,
        instance_id: &str,
        working_directory: &str,
        metadata: serde_json::Value,
    ) -> Result<RegisterInstanceResponse> {
        validate_instance_id(instance_id)?;
        let instance = Instance::register(
            instance_id,
            working_directory,
            sanitize_value(&metadata),
        );
        self.instances
            .lock()
            .insert(instance_id.to_string(), instance);
        self.audit(
            AuditAction::InstanceRegister,
            json!({"instance_id": instance_id}),
        );
        Ok(RegisterInstanceResponse {
            success: true,
            instance_id: instance_id.to_string(),
        })
    }

    /// `PUT /instance/:id/heartbeat`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] when the instance is not registered.
    pub fn heartbeat(&self, instance_id: &str) -> Result<HeartbeatResponse> {
        let mut instances = self.instances.lock();
        let instance = instances.get_mut(instance_id).ok_or_else(|| {
            Error::InvalidInput {
                field: "instance_id".into(),
                message: format!("'{}' is not registered", sanitize_message(instance_id)),
            }
        })?;
        instance.heartbeat();
        Ok(HeartbeatResponse {
            success: true,
            last_heartbeat: instance.last_heartbeat,
        })
    }

    /// Explicit instance teardown; instances have no TTL.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] when the instance is not registered.
    pub fn deregister_instance(&self, instance_id: &str) -> Result<()> {
        if self.instances.lock().remove(instance_id).is_none() {
            return Err(Error::InvalidInput {
                field: "instance_id".into(),
                message: format!("'{}' is not registered", sanitize_message(instance_id)),
            });
        }
        Ok(())
    }

    /// `GET /observe/:port`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] for port 0.
    pub fn observe_port(&self, port: u16) -> Result<ObservePortResponse> {
        let port = Port::try_from(port)?;
        let observation = self.cache.get(port);
        Ok(ObservePortResponse {
            port: port.value(),
            bound: observation.is_some(),
            observation,
        })
    }

    /// `GET /observe/all`.
    #[must_use]
    pub fn observe_all(&self) -> ObserveAllResponse {
        let observations = self.cache.all();
        ObserveAllResponse {
            total: observations.len(),
            observations,
            stats: self.cache.stats(),
        }
    }

    /// `GET /suggest/:service_type?count=N`.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownServiceType`] for an unregistered type.
    pub fn suggest(&self, service_type: &str, count: usize) -> Result<SuggestResponse> {
        let suggestions = self.reconciler.suggest(service_type, count).ok_or_else(|| {
            Error::UnknownServiceType {
                service_type: service_type.to_string(),
                known: self.registry.known_types(),
            }
        })?;
        let suggestions: Vec<u16> = suggestions.iter().map(|p| p.value()).collect();
        Ok(SuggestResponse {
            service_type: service_type.to_string(),
            count: suggestions.len(),
            suggestions,
        })
    }

    /// `GET /status`.
    #[must_use]
    pub fn status(&self) -> StatusResponse {
        let uptime =
            u64::try_from((Utc::now() - self.started_at).num_seconds()).unwrap_or(0);
        StatusResponse {
            uptime_secs: uptime,
            grants: self.engine.grant_count(),
            singletons: self.engine.singletons().len(),
            instances: self.instances.lock().len(),
            observed_ports: self.cache.len(),
            service_types: self.registry.known_types().len(),
            warnings: self.warnings.clone(),
        }
    }

    /// `GET /health`.
    #[must_use]
    pub fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "ok",
            pid: std::process::id(),
        }
    }

    /// `GET /metrics`.
    #[must_use]
    pub fn metrics(&self) -> MetricsResponse {
        MetricsResponse {
            counters: self.engine.counters(),
            grants: self.engine.grant_count(),
            observed_ports: self.cache.len(),
        }
    }

    fn audit(&self, action: AuditAction, details: serde_json::Value) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.append(action, details) {
                log::warn!("audit append failed: {e}");
            }
        }
    }
}

fn validate_instance_id(instance_id: &str) -> Result<()> {
    let ok = !instance_id.is_empty()
        && instance_id.len() <= 100
        && instance_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidInput {
            field: "instance_id".into(),
            message: "must be alphanumeric with '-' or '_', at most 100 chars".into(),
        })
    }
}
