use crate::error::VisibilityResult;
use async_trait::async_trait;
use iv_core::types::{Incident, IncidentId, OrgId, VisibilityEvent, WorkspaceId};
use std::collections::BTreeSet;

/// Read-only view of the externally-owned organization hierarchy.
#[async_trait]
pub trait OrgHierarchy: Send + Sync {
    /// Transitive parent closure of `org_id`, excluding the org itself.
    async fn get_parents(&self, org_id: &OrgId) -> VisibilityResult<BTreeSet<OrgId>>;

    /// Transitive descendants of every org in `org_ids`.
    async fn get_children(&self, org_ids: &BTreeSet<OrgId>) -> VisibilityResult<BTreeSet<OrgId>>;
}

/// Persistence for incident-org visibility mappings.
///
/// Implementations must serialize grant/revoke reconciliation per incident:
/// `lock_incident` grants exclusive access to that incident's mapping set
/// until the matching `unlock_incident`. The reconciler's read-modify-write
/// sequence is only correct under that guarantee.
#[async_trait]
pub trait VisibilityStore: Send + Sync {
    /// Fails with `IncidentNotFound` when the incident does not exist.
    async fn get_incident(&self, incident_id: &IncidentId) -> VisibilityResult<Incident>;

    /// Current mapping set for the incident. Empty means unrestricted.
    async fn get_mappings(&self, incident_id: &IncidentId) -> VisibilityResult<BTreeSet<OrgId>>;

    /// Idempotent: adding an existing mapping is a no-op.
    async fn add_mapping(&self, incident_id: &IncidentId, org_id: &OrgId) -> VisibilityResult<()>;

    async fn remove_mapping(
        &self,
        incident_id: &IncidentId,
        org_id: &OrgId,
    ) -> VisibilityResult<()>;

    /// All org ids in the workspace, for broadcast fan-out.
    async fn list_workspace_orgs(
        &self,
        workspace_id: &WorkspaceId,
    ) -> VisibilityResult<BTreeSet<OrgId>>;

    /// Blocks until exclusive access to the incident's mappings is held.
    async fn lock_incident(&self, incident_id: &IncidentId) -> VisibilityResult<()>;

    async fn unlock_incident(&self, incident_id: &IncidentId) -> VisibilityResult<()>;
}

/// Fire-and-forget client notification. Delivery is best-effort; the
/// reconciler never consumes an acknowledgment.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn publish(&self, topic: &str, event: &VisibilityEvent) -> VisibilityResult<()>;
}
