//! The persisted state document.
//!
//! The entire registry is one JSON object rewritten on every save; there
//! is no incremental log. Structural validation lives here so both the
//! primary read path and backup verification share it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::grant::{Grant, Instance, SingletonClaim};

/// The complete on-disk state: grants, instances, singleton claims, and a
/// save timestamp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    /// All live grants.
    #[serde(default)]
    pub grants: Vec<Grant>,
    /// All registered instances.
    #[serde(default)]
    pub instances: Vec<Instance>,
    /// All singleton claims.
    #[serde(default)]
    pub singletons: Vec<SingletonClaim>,
    /// When the document was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
}

impl StateDocument {
    /// An empty document, used when nothing on disk verifies.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns `true` when the document holds no records at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.grants.is_empty() && self.instances.is_empty() && self.singletons.is_empty()
    }

    /// Structural validation beyond JSON well-formedness.
    ///
    /// Serde already guarantees field shapes; this checks the cross-record
    /// rules a verifying read must enforce: unique ports, unique lock ids,
    /// and claims that point at real grants.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated rule.
    pub fn validate(&self) -> Result<(), String> {
        let mut ports = std::collections::HashSet::new();
        let mut lock_ids = std::collections::HashSet::new();
        for grant in &self.grants {
            if !ports.insert(grant.port) {
                return Err(format!("duplicate grant for port {}", grant.port));
            }
            if !lock_ids.insert(grant.lock_id) {
                return Err(format!("duplicate lock id {}", grant.lock_id));
            }
        }

        let mut claimed_types = std::collections::HashSet::new();
        for claim in &self.singletons {
            if !claimed_types.insert(claim.service_type.as_str()) {
                return Err(format!(
                    "two singleton claims for service type '{}'",
                    claim.service_type
                ));
            }
            let backing = self
                .grants
                .iter()
                .find(|grant| grant.lock_id == claim.lock_id);
            match backing {
                Some(grant) if grant.port == claim.port => {}
                Some(_) => {
                    return Err(format!(
                        "singleton claim for '{}' disagrees with its grant's port",
                        claim.service_type
                    ));
                }
                None => {
                    return Err(format!(
                        "singleton claim for '{}' has no backing grant",
                        claim.service_type
                    ));
                }
            }
        }
        Ok(())
    }

    /// Parses and structurally validates raw state bytes.
    ///
    /// # Errors
    ///
    /// Returns a description of the parse or validation failure.
    pub fn parse(bytes: &[u8]) -> Result<Self, String> {
        let document: Self =
            serde_json::from_slice(bytes).map_err(|e| format!("invalid JSON: {e}"))?;
        document.validate()?;
        Ok(document)
    }
}
