use crate::config::VisibilityConfig;
use crate::error::{VisibilityError, VisibilityResult};
use crate::reconciler::{self, RejectedRemoval};
use crate::traits::{NotificationGateway, OrgHierarchy, VisibilityStore};
use iv_core::types::{Incident, IncidentId, OrgId, UserId, VisibilityEvent, now_millis};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Orchestrates visibility reconciliation: fetches state through the ports,
/// plans the delta with the pure reconciler, persists it, then notifies.
///
/// Persist-then-notify: a publish failure never rolls back a persisted
/// mapping change. All reads and writes for one call run under the store's
/// per-incident lock.
pub struct VisibilityService {
    config: VisibilityConfig,
    hierarchy: Arc<dyn OrgHierarchy>,
    store: Arc<dyn VisibilityStore>,
    gateway: Arc<dyn NotificationGateway>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantReport {
    pub incident_id: IncidentId,
    /// Orgs that gained a mapping in this call; the notification fan-out.
    pub added: BTreeSet<OrgId>,
    /// Full mapping set after the grant.
    pub mappings: BTreeSet<OrgId>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeReport {
    pub incident_id: IncidentId,
    pub removed: BTreeSet<OrgId>,
    pub remaining: BTreeSet<OrgId>,
    /// Per-item skips. Callers must inspect these alongside `removed`.
    pub rejected: Vec<RejectedRemoval>,
    /// True when this call cleared the last mapping, making the incident
    /// visible to the whole workspace again.
    pub unrestricted: bool,
    pub dry_run: bool,
}

impl RevokeReport {
    pub fn has_rejections(&self) -> bool {
        !self.rejected.is_empty()
    }
}

impl VisibilityService {
    pub fn new(
        config: VisibilityConfig,
        hierarchy: Arc<dyn OrgHierarchy>,
        store: Arc<dyn VisibilityStore>,
        gateway: Arc<dyn NotificationGateway>,
    ) -> Self {
        Self {
            config,
            hierarchy,
            store,
            gateway,
        }
    }

    /// Grants the requested orgs (and, transitively, their parent orgs)
    /// visibility into the incident. The owning org is always part of the
    /// result. Never removes a mapping.
    #[tracing::instrument(skip(self, requested_org_ids))]
    pub async fn grant_access(
        &self,
        incident_id: &IncidentId,
        requested_org_ids: &BTreeSet<OrgId>,
        requesting_org_id: &OrgId,
        requesting_user_id: &UserId,
    ) -> VisibilityResult<GrantReport> {
        if requested_org_ids.is_empty() {
            return Err(VisibilityError::InvalidArgument(
                "requested org set must not be empty".to_string(),
            ));
        }

        let incident = self.store.get_incident(incident_id).await?;
        debug!(
            incident_id = %incident_id,
            requester_org = %requesting_org_id,
            requester = %requesting_user_id,
            requested = requested_org_ids.len(),
            "Granting incident visibility"
        );

        self.store.lock_incident(incident_id).await?;
        let result = self
            .grant_locked(&incident, requested_org_ids, requesting_user_id)
            .await;
        self.release_lock(incident_id).await;
        result
    }

    async fn grant_locked(
        &self,
        incident: &Incident,
        requested: &BTreeSet<OrgId>,
        requesting_user_id: &UserId,
    ) -> VisibilityResult<GrantReport> {
        let before = self.store.get_mappings(&incident.id).await?;

        let mut union: BTreeSet<OrgId> = before.union(requested).cloned().collect();
        union.insert(incident.owner_org_id.clone());

        let mut ancestors: BTreeMap<OrgId, BTreeSet<OrgId>> = BTreeMap::new();
        for org in &union {
            let parents = self.hierarchy.get_parents(org).await?;
            ancestors.insert(org.clone(), parents);
        }

        let plan = reconciler::plan_grant(&incident.owner_org_id, &before, requested, &ancestors);

        if self.config.dry_run {
            info!(
                incident_id = %incident.id,
                to_add = plan.to_add.len(),
                "Dry run: skipping grant persistence and notification"
            );
            return Ok(GrantReport {
                incident_id: incident.id.clone(),
                added: plan.to_add,
                mappings: plan.target,
                dry_run: true,
            });
        }

        for org in &plan.to_add {
            self.store.add_mapping(&incident.id, org).await?;
        }
        counter!("visibility.grants.applied").increment(plan.to_add.len() as u64);

        if !plan.to_add.is_empty() {
            let event = VisibilityEvent::AccessGranted {
                incident_id: incident.id.clone(),
                workspace_id: incident.workspace_id.clone(),
                org_ids: plan.to_add.clone(),
                granted_by: requesting_user_id.clone(),
                timestamp: now_millis(),
            };
            self.notify(&self.config.topic_for(&incident.workspace_id), &event)
                .await;
        }

        info!(
            incident_id = %incident.id,
            added = plan.to_add.len(),
            mappings = plan.target.len(),
            "Grant applied"
        );

        Ok(GrantReport {
            incident_id: incident.id.clone(),
            added: plan.to_add,
            mappings: plan.target,
            dry_run: false,
        })
    }

    /// Revokes the requested orgs' visibility mappings. Removals that would
    /// orphan a mapped descendant are skipped and reported; removing the
    /// owner while other mappings survive aborts with `OwnerLockout`.
    /// Clearing the last mapping reverts the incident to unrestricted and
    /// broadcasts that to the workspace.
    #[tracing::instrument(skip(self, org_ids))]
    pub async fn revoke_access(
        &self,
        incident_id: &IncidentId,
        org_ids: &BTreeSet<OrgId>,
        requesting_user_id: &UserId,
    ) -> VisibilityResult<RevokeReport> {
        if org_ids.is_empty() {
            return Err(VisibilityError::InvalidArgument(
                "org removal set must not be empty".to_string(),
            ));
        }

        let incident = self.store.get_incident(incident_id).await?;
        debug!(
            incident_id = %incident_id,
            requester = %requesting_user_id,
            requested = org_ids.len(),
            "Revoking incident visibility"
        );

        self.store.lock_incident(incident_id).await?;
        let result = self
            .revoke_locked(&incident, org_ids, requesting_user_id)
            .await;
        self.release_lock(incident_id).await;
        result
    }

    async fn revoke_locked(
        &self,
        incident: &Incident,
        requested: &BTreeSet<OrgId>,
        requesting_user_id: &UserId,
    ) -> VisibilityResult<RevokeReport> {
        let before = self.store.get_mappings(&incident.id).await?;

        let mut descendants: BTreeMap<OrgId, BTreeSet<OrgId>> = BTreeMap::new();
        for org in requested.intersection(&before) {
            let children = self
                .hierarchy
                .get_children(&BTreeSet::from([org.clone()]))
                .await?;
            descendants.insert(org.clone(), children);
        }

        let plan = reconciler::plan_revoke(
            incident.id.as_str(),
            &incident.owner_org_id,
            &before,
            requested,
            &descendants,
        )?;
        let unrestricted = plan.becomes_unrestricted(&before);

        if self.config.dry_run {
            info!(
                incident_id = %incident.id,
                to_remove = plan.removed.len(),
                rejected = plan.rejected.len(),
                "Dry run: skipping revoke persistence and notification"
            );
            return Ok(RevokeReport {
                incident_id: incident.id.clone(),
                removed: plan.removed,
                remaining: plan.remaining,
                rejected: plan.rejected,
                unrestricted,
                dry_run: true,
            });
        }

        for org in &plan.removed {
            self.store.remove_mapping(&incident.id, org).await?;
        }
        counter!("visibility.revocations.applied").increment(plan.removed.len() as u64);
        counter!("visibility.revocations.rejected").increment(plan.rejected.len() as u64);

        if unrestricted {
            // Broadcast-add: every org in the workspace sees the incident
            // again. This is the canonical notification for the
            // restricted -> unrestricted transition; no separate targeted
            // removal event fires.
            let org_ids = self
                .store
                .list_workspace_orgs(&incident.workspace_id)
                .await?;
            let event = VisibilityEvent::IncidentUnrestricted {
                incident_id: incident.id.clone(),
                workspace_id: incident.workspace_id.clone(),
                org_ids,
                revoked_by: requesting_user_id.clone(),
                timestamp: now_millis(),
            };
            self.notify(&self.config.topic_for(&incident.workspace_id), &event)
                .await;
        } else if !plan.removed.is_empty() {
            let event = VisibilityEvent::AccessRevoked {
                incident_id: incident.id.clone(),
                workspace_id: incident.workspace_id.clone(),
                removed_org_ids: plan.removed.clone(),
                remaining_org_ids: plan.remaining.clone(),
                revoked_by: requesting_user_id.clone(),
                timestamp: now_millis(),
            };
            self.notify(&self.config.topic_for(&incident.workspace_id), &event)
                .await;
        }

        info!(
            incident_id = %incident.id,
            removed = plan.removed.len(),
            rejected = plan.rejected.len(),
            unrestricted,
            "Revoke applied"
        );

        Ok(RevokeReport {
            incident_id: incident.id.clone(),
            removed: plan.removed,
            remaining: plan.remaining,
            rejected: plan.rejected,
            unrestricted,
            dry_run: false,
        })
    }

    async fn release_lock(&self, incident_id: &IncidentId) {
        if let Err(e) = self.store.unlock_incident(incident_id).await {
            warn!(
                incident_id = %incident_id,
                error = %e,
                "Failed to release incident lock"
            );
            counter!("visibility.lock.release_failures").increment(1);
        }
    }

    async fn notify(&self, topic: &str, event: &VisibilityEvent) {
        if let Err(e) = self.gateway.publish(topic, event).await {
            warn!(
                topic,
                incident_id = %event.incident_id(),
                error = %e,
                "Failed to publish visibility event"
            );
            counter!("visibility.notify.failures").increment(1);
        }
    }
}

impl std::fmt::Debug for VisibilityService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisibilityService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
