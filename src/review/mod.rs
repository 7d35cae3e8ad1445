pub mod category;
pub mod escalation;
pub mod rejections;
pub mod routing;

pub use category::{RejectionCategory, REJECTION_CATEGORIES};
pub use escalation::{
    Escalation, EscalationManager, EscalationOutcome, EscalationStats, EscalationStatus,
};
pub use rejections::{Rejection, RejectionTracker, DEFAULT_REJECTION_THRESHOLD};
pub use routing::{
    CategoryRoute, RouteTable, RoutingDecision, RoutingMetadata, RoutingStats, SmartRouter,
    DEFAULT_ESCALATION_TARGET, DEFAULT_MAX_RETRIES, GENERIC_HANDLER,
};
