use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct OrgId(String);

impl OrgId {
    pub fn new(id: String) -> Option<Self> {
        if id.is_empty() || id.len() > 100 {
            None
        } else {
            Some(Self(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for OrgId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for OrgId {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string()).ok_or_else(|| anyhow::anyhow!("Invalid org ID"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct IncidentId(String);

impl IncidentId {
    pub fn new(id: String) -> Option<Self> {
        if id.is_empty() || id.len() > 100 {
            None
        } else {
            Some(Self(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for IncidentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for IncidentId {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string()).ok_or_else(|| anyhow::anyhow!("Invalid incident ID"))
    }
}

/// Tenancy partition. Opaque to the reconciliation core; used to scope
/// organization listings and notification streams.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct WorkspaceId(String);

impl WorkspaceId {
    pub fn new(id: String) -> Option<Self> {
        if id.is_empty() || id.len() > 100 {
            None
        } else {
            Some(Self(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for WorkspaceId {
    fn default() -> Self {
        Self("default".to_string())
    }
}

impl std::str::FromStr for WorkspaceId {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string()).ok_or_else(|| anyhow::anyhow!("Invalid workspace ID"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: String) -> Option<Self> {
        if id.is_empty() || id.len() > 100 {
            None
        } else {
            Some(Self(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for UserId {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string()).ok_or_else(|| anyhow::anyhow!("Invalid user ID"))
    }
}

/// An organization in the externally-owned hierarchy. The hierarchy is a
/// DAG: an org may have multiple parents. This core only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: OrgId,
    pub name: String,
    pub workspace_id: WorkspaceId,
    pub parent_ids: Vec<OrgId>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// An incident. The owning org is fixed at creation and is always entitled
/// to visibility while the incident is restricted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub id: IncidentId,
    pub name: Option<String>,
    pub workspace_id: WorkspaceId,
    pub owner_org_id: OrgId,
    pub created_at: i64,
}

/// Visibility change events published for client notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum VisibilityEvent {
    /// Orgs gained visibility into an incident. `org_ids` holds only the
    /// newly added orgs, not the full mapping set.
    AccessGranted {
        incident_id: IncidentId,
        workspace_id: WorkspaceId,
        org_ids: BTreeSet<OrgId>,
        granted_by: UserId,
        timestamp: i64,
    },

    /// Orgs lost visibility. `remaining_org_ids` lets clients decide
    /// whether they still see the incident through another mapping.
    AccessRevoked {
        incident_id: IncidentId,
        workspace_id: WorkspaceId,
        removed_org_ids: BTreeSet<OrgId>,
        remaining_org_ids: BTreeSet<OrgId>,
        revoked_by: UserId,
        timestamp: i64,
    },

    /// The last mapping was removed: the incident is visible to every org
    /// in the workspace again. Broadcast-add, carries the full org list.
    IncidentUnrestricted {
        incident_id: IncidentId,
        workspace_id: WorkspaceId,
        org_ids: BTreeSet<OrgId>,
        revoked_by: UserId,
        timestamp: i64,
    },
}

impl VisibilityEvent {
    #[must_use]
    pub fn incident_id(&self) -> &IncidentId {
        match self {
            VisibilityEvent::AccessGranted { incident_id, .. } => incident_id,
            VisibilityEvent::AccessRevoked { incident_id, .. } => incident_id,
            VisibilityEvent::IncidentUnrestricted { incident_id, .. } => incident_id,
        }
    }

    #[must_use]
    pub fn workspace_id(&self) -> &WorkspaceId {
        match self {
            VisibilityEvent::AccessGranted { workspace_id, .. } => workspace_id,
            VisibilityEvent::AccessRevoked { workspace_id, .. } => workspace_id,
            VisibilityEvent::IncidentUnrestricted { workspace_id, .. } => workspace_id,
        }
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
