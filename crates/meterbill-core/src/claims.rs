//! Authorization context forwarded to the store.
//!
//! The engine does not authenticate anyone; it receives a claims object from
//! the caller (the job runner's auth layer) and forwards it opaquely. The
//! store uses the organization id for row scoping.

use serde::{Deserialize, Serialize};

use crate::ids::OrganizationId;

/// Caller-supplied authorization context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingClaims {
    /// The organization every store call is scoped to.
    pub organization_id: OrganizationId,

    /// Who triggered the work (service name, admin id), for audit fields.
    #[serde(default)]
    pub actor: Option<String>,

    /// Opaque extra claims; never interpreted by this engine.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl BillingClaims {
    /// Claims scoped to an organization with no actor attribution.
    #[must_use]
    pub fn for_organization(organization_id: OrganizationId) -> Self {
        Self {
            organization_id,
            actor: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// Attach an actor label.
    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}
