use thiserror::Error;

pub type VisibilityResult<T> = Result<T, VisibilityError>;

#[derive(Debug, Error)]
pub enum VisibilityError {
    #[error("Incident not found: {0}")]
    IncidentNotFound(String),

    #[error("Organization not found: {0}")]
    OrgNotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Owner lockout: incident {incident_id} would become invisible to owning org {owner_org_id}")]
    OwnerLockout {
        incident_id: String,
        owner_org_id: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VisibilityError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Publish(_))
    }
}
