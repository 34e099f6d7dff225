use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisibilityConfig {
    pub database_url: String,
    pub redis_url: String,
    /// Events are published to `{stream_prefix}:{workspace_id}`.
    #[serde(default = "default_stream_prefix")]
    pub stream_prefix: String,
    /// Compute and report the reconciliation plan without persisting
    /// mappings or publishing notifications.
    #[serde(default)]
    pub dry_run: bool,
}

fn default_stream_prefix() -> String {
    "visibility:events".to_string()
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            redis_url: String::new(),
            stream_prefix: default_stream_prefix(),
            dry_run: false,
        }
    }
}

impl VisibilityConfig {
    pub fn topic_for(&self, workspace_id: &iv_core::types::WorkspaceId) -> String {
        format!("{}:{}", self.stream_prefix, workspace_id.as_str())
    }
}
