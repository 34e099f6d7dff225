pub mod config;
pub mod error;
pub mod reconciler;
pub mod service;
pub mod traits;

pub use config::VisibilityConfig;
pub use error::{VisibilityError, VisibilityResult};
pub use reconciler::{GrantPlan, RejectedRemoval, RevokePlan};
pub use service::{GrantReport, RevokeReport, VisibilityService};
pub use traits::{NotificationGateway, OrgHierarchy, VisibilityStore};
