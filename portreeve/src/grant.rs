//! Grant, singleton-claim, and instance records.
//!
//! A [`Grant`] is the durable fact that a port has been handed out; it is
//! created by the allocation engine's commit step and destroyed by release,
//! stale-sweep, or recovery, and never mutated. A [`SingletonClaim`] shadows
//! the single permitted grant of a `cardinality = single` service type.
//! [`Instance`] records are observational self-registrations and never
//! influence allocation.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::port::Port;

/// Opaque handle identifying one grant.
///
/// Lock ids are UUIDv4 and globally unique for the life of the daemon's
/// state; release addresses grants by lock id, never by port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockId(Uuid);

impl LockId {
    /// Generates a fresh lock id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses a lock id from its canonical hyphenated form.
    ///
    /// # Errors
    ///
    /// Returns an error when the string is not a valid UUID.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| crate::Error::UnknownLockId {
                lock_id: s.to_string(),
            })
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request-origin metadata captured on a grant for auditing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOrigin {
    /// The requesting client's user agent, when the transport passed one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// The requesting client's remote address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
}

impl RequestOrigin {
    /// Returns `true` when no origin metadata was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.user_agent.is_none() && self.remote_addr.is_none()
    }
}

/// A recorded hand-out of a specific port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    /// The granted port.
    pub port: Port,
    /// Unique handle for releasing this grant.
    pub lock_id: LockId,
    /// The service type the grant was resolved against.
    pub service_type: String,
    /// Caller-supplied service name.
    pub service_name: String,
    /// Caller-supplied instance identifier.
    pub instance_id: String,
    /// Project directory the grant belongs to.
    pub project_path: PathBuf,
    /// PID that requested the grant; the daemon's own PID when the request
    /// arrived with no hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_pid: Option<u32>,
    /// When the grant was committed.
    pub allocated_at: DateTime<Utc>,
    /// Request-origin metadata, kept for the audit trail.
    #[serde(default, skip_serializing_if = "RequestOrigin::is_empty")]
    pub origin: RequestOrigin,
}

impl Grant {
    /// Starts building a grant for `port` under `service_type`.
    #[must_use]
    pub fn builder(port: Port, service_type: impl Into<String>) -> GrantBuilder {
        GrantBuilder {
            port,
            service_type: service_type.into(),
            service_name: None,
            instance_id: None,
            project_path: None,
            owner_pid: None,
            allocated_at: None,
            origin: RequestOrigin::default(),
        }
    }

    /// Age of this grant relative to `now`.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.allocated_at
    }
}

/// Builder for [`Grant`]. Fresh lock id and timestamp are filled in at
/// build time unless explicitly provided (recovery paths provide both).
#[derive(Debug)]
pub struct GrantBuilder {
    port: Port,
    service_type: String,
    service_name: Option<String>,
    instance_id: Option<String>,
    project_path: Option<PathBuf>,
    owner_pid: Option<u32>,
    allocated_at: Option<DateTime<Utc>>,
    origin: RequestOrigin,
}

impl GrantBuilder {
    /// Sets the service name.
    #[must_use]
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    /// Sets the instance identifier.
    #[must_use]
    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    /// Sets the project path.
    #[must_use]
    pub fn project_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_path = Some(path.into());
        self
    }

    /// Sets the owning PID.
    #[must_use]
    pub const fn owner_pid(mut self, pid: Option<u32>) -> Self {
        self.owner_pid = pid;
        self
    }

    /// Sets the allocation timestamp (recovery only).
    #[must_use]
    pub fn allocated_at(mut self, at: DateTime<Utc>) -> Self {
        self.allocated_at = Some(at);
        self
    }

    /// Attaches request-origin metadata.
    #[must_use]
    pub fn origin(mut self, origin: RequestOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Finalizes the grant with a fresh lock id.
    #[must_use]
    pub fn build(self) -> Grant {
        Grant {
            port: self.port,
            lock_id: LockId::generate(),
            service_type: self.service_type,
            service_name: self
                .service_name
                .unwrap_or_else(|| "unnamed-service".to_string()),
            instance_id: self.instance_id.unwrap_or_else(|| "default".to_string()),
            project_path: self.project_path.unwrap_or_default(),
            owner_pid: self.owner_pid,
            allocated_at: self.allocated_at.unwrap_or_else(Utc::now),
            origin: self.origin,
        }
    }
}

/// The single permitted claim of a `cardinality = single` service type.
///
/// Created and destroyed atomically with the grant it mirrors; `(port,
/// lock_id)` always match that grant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingletonClaim {
    /// The singleton service type.
    pub service_type: String,
    /// Port held by the claim.
    pub port: Port,
    /// Lock id of the backing grant.
    pub lock_id: LockId,
    /// Instance that first claimed the type.
    pub instance_id: String,
    /// PID of the claiming process, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_pid: Option<u32>,
    /// When the claim was created.
    pub allocated_at: DateTime<Utc>,
}

impl SingletonClaim {
    /// Derives the claim mirroring `grant`.
    #[must_use]
    pub fn for_grant(grant: &Grant) -> Self {
        Self {
            service_type: grant.service_type.clone(),
            port: grant.port,
            lock_id: grant.lock_id,
            instance_id: grant.instance_id.clone(),
            owner_pid: grant.owner_pid,
            allocated_at: grant.allocated_at,
        }
    }
}

/// An optional self-registration record used only by observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Caller-chosen instance identifier.
    pub instance_id: String,
    /// The instance's working directory.
    pub project_path: PathBuf,
    /// Arbitrary caller metadata, sanitized before persisting.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// First registration time.
    pub registered_at: DateTime<Utc>,
    /// Last heartbeat time.
    pub last_heartbeat: DateTime<Utc>,
}

impl Instance {
    /// Creates a new registration stamped with the current time.
    #[must_use]
    pub fn register(
        instance_id: impl Into<String>,
        project_path: impl Into<PathBuf>,
        metadata: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.into(),
            project_path: project_path.into(),
            metadata,
            registered_at: now,
            last_heartbeat: now,
        }
    }

    /// Touches the heartbeat timestamp.
    pub fn heartbeat(&mut self) {
        self.last_heartbeat = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_id_generate_unique() {
        let a = LockId::generate();
        let b = LockId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_lock_id_parse_roundtrip() {
        let id = LockId::generate();
        let parsed = LockId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);

        let err = LockId::parse("not-a-uuid").unwrap_err();
        assert!(matches!(err, crate::Error::UnknownLockId { .. }));
    }

    #[test]
    fn test_grant_builder_defaults() {
        let port = Port::try_from(3000).unwrap();
        let grant = Grant::builder(port, "dev").build();

        assert_eq!(grant.port, port);
        assert_eq!(grant.service_type, "dev");
        assert_eq!(grant.service_name, "unnamed-service");
        assert_eq!(grant.instance_id, "default");
        assert_eq!(grant.owner_pid, None);
        assert!(grant.origin.is_empty());
    }

    #[test]
    fn test_grant_builder_explicit_fields() {
        let port = Port::try_from(11400).unwrap();
        let grant = Grant::builder(port, "ai")
            .service_name("model-server")
            .instance_id("workspace-a")
            .project_path("/home/dev/proj")
            .owner_pid(Some(4242))
            .origin(RequestOrigin {
                user_agent: Some("ide/2.1".to_string()),
                remote_addr: Some("127.0.0.1".to_string()),
            })
            .build();

        assert_eq!(grant.service_name, "model-server");
        assert_eq!(grant.instance_id, "workspace-a");
        assert_eq!(grant.owner_pid, Some(4242));
        assert_eq!(grant.origin.user_agent.as_deref(), Some("ide/2.1"));
    }

    #[test]
    fn test_grant_serde_wire_names() {
        let grant = Grant::builder(Port::try_from(3000).unwrap(), "dev").build();
        let json = serde_json::to_value(&grant).unwrap();

        assert_eq!(json["port"], 3000);
        assert!(json["lock_id"].is_string());
        assert_eq!(json["service_type"], "dev");
        // Unset optionals stay off the wire entirely.
        assert!(json.get("owner_pid").is_none());
        assert!(json.get("origin").is_none());

        let back: Grant = serde_json::from_value(json).unwrap();
        assert_eq!(back, grant);
    }

    #[test]
    fn test_singleton_claim_mirrors_grant() {
        let grant = Grant::builder(Port::try_from(11400).unwrap(), "ai")
            .instance_id("a")
            .owner_pid(Some(7))
            .build();
        let claim = SingletonClaim::for_grant(&grant);

        assert_eq!(claim.port, grant.port);
        assert_eq!(claim.lock_id, grant.lock_id);
        assert_eq!(claim.service_type, "ai");
        assert_eq!(claim.allocated_at, grant.allocated_at);
    }

    #[test]
    fn test_instance_heartbeat_advances() {
        let mut instance = Instance::register("a", "/tmp", serde_json::json!({}));
        let first = instance.last_heartbeat;
        std::thread::sleep(std::time::Duration::from_millis(5));
        instance.heartbeat();
        assert!(instance.last_heartbeat > first);
        assert!(instance.registered_at < instance.last_heartbeat);
    }

    #[test]
    fn test_grant_age() {
        let grant = Grant::builder(Port::try_from(3000).unwrap(), "dev")
            .allocated_at(Utc::now() - chrono::Duration::minutes(45))
            .build();
        assert!(grant.age(Utc::now()) > chrono::Duration::minutes(30));
    }
}
