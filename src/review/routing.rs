use crate::review::category::{RejectionCategory, REJECTION_CATEGORIES};
use crate::config::EngineSettings;
use crate::review::rejections::{count_for, load_rejection, query_rejections};
use crate::store::{Database, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const GENERIC_HANDLER: &str = "generic-handler";
pub const DEFAULT_ESCALATION_TARGET: &str = "human-reviewer";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRoute {
    pub handler: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_escalation_target")]
    pub escalation_target: String,
}

impl CategoryRoute {
    pub fn new(handler: &str, max_retries: u32, escalation_target: &str) -> Self {
        Self {
            handler: handler.to_string(),
            max_retries,
            escalation_target: escalation_target.to_string(),
        }
    }

    pub fn fallback() -> Self {
        Self::new(GENERIC_HANDLER, DEFAULT_MAX_RETRIES, DEFAULT_ESCALATION_TARGET)
    }
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_escalation_target() -> String {
    DEFAULT_ESCALATION_TARGET.to_string()
}

/// Category to handler table. Categories without an entry use
/// [`CategoryRoute::fallback`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteTable {
    routes: BTreeMap<RejectionCategory, CategoryRoute>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::with_budget(DEFAULT_MAX_RETRIES)
    }
}

impl RouteTable {
    pub fn empty() -> Self {
        Self {
            routes: BTreeMap::new(),
        }
    }

    /// The built-in category table with every route allowing `max_retries`
    /// rejections before escalation.
    pub fn with_budget(max_retries: u32) -> Self {
        let mut routes = BTreeMap::new();
        routes.insert(
            RejectionCategory::Style,
            CategoryRoute::new("style-editor", max_retries, "senior-editor"),
        );
        routes.insert(
            RejectionCategory::Mechanics,
            CategoryRoute::new("mechanics-reviewer", max_retries, "human-reviewer"),
        );
        routes.insert(
            RejectionCategory::Clarity,
            CategoryRoute::new("clarity-editor", max_retries, "senior-editor"),
        );
        routes.insert(
            RejectionCategory::Scope,
            CategoryRoute::new("scope-reviewer", max_retries, "human-reviewer"),
        );
        Self { routes }
    }

    pub fn route(&self, category: RejectionCategory) -> CategoryRoute {
        self.routes
            .get(&category)
            .cloned()
            .unwrap_or_else(CategoryRoute::fallback)
    }

    pub fn set_route(&mut self, category: RejectionCategory, route: CategoryRoute) {
        self.routes.insert(category, route);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingMetadata {
    pub category: RejectionCategory,
    pub run_id: String,
    pub max_retries: u32,
    pub escalation_target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingDecision {
    pub handler: String,
    pub should_escalate: bool,
    pub retry_count: u32,
    pub metadata: RoutingMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingStats {
    pub total_routed: u64,
    pub by_category: BTreeMap<RejectionCategory, u64>,
    pub by_handler: BTreeMap<String, u64>,
    pub escalations: u64,
}

#[derive(Debug, Clone)]
pub struct SmartRouter<'a> {
    db: &'a Database,
    routes: RouteTable,
}

impl<'a> SmartRouter<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self::with_routes(db, RouteTable::default())
    }

    pub fn with_routes(db: &'a Database, routes: RouteTable) -> Self {
        Self { db, routes }
    }

    pub fn from_settings(db: &'a Database, settings: &EngineSettings) -> Self {
        Self::with_routes(db, settings.route_table())
    }

    pub fn route(&self, category: RejectionCategory) -> CategoryRoute {
        self.routes.route(category)
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn set_route(&mut self, category: RejectionCategory, route: CategoryRoute) {
        self.routes.set_route(category, route);
    }

    /// Picks the handler for a stored rejection. Once the (run, category)
    /// count reaches the route's budget the escalation target takes over.
    pub fn route_rejection(&self, rejection_id: &str) -> Result<RoutingDecision, StoreError> {
        let connection = self.db.connect()?;
        let rejection =
            load_rejection(&connection, rejection_id)?.ok_or_else(|| StoreError::NotFound {
                entity: "rejection",
                id: rejection_id.to_string(),
            })?;
        let retry_count = count_for(&connection, &rejection.run_id, rejection.category)?;
        let route = self.routes.route(rejection.category);
        let should_escalate = retry_count >= route.max_retries;
        let handler = if should_escalate {
            route.escalation_target.clone()
        } else {
            route.handler.clone()
        };
        Ok(RoutingDecision {
            handler,
            should_escalate,
            retry_count,
            metadata: RoutingMetadata {
                category: rejection.category,
                run_id: rejection.run_id,
                max_retries: route.max_retries,
                escalation_target: route.escalation_target,
            },
        })
    }

    pub fn routing_stats(&self, run_id: Option<&str>) -> Result<RoutingStats, StoreError> {
        let connection = self.db.connect()?;
        let rejections = match run_id {
            Some(run_id) => query_rejections(&connection, "WHERE run_id = ?1", Some(run_id))?,
            None => query_rejections(&connection, "", None)?,
        };

        let mut stats = RoutingStats::default();
        for category in REJECTION_CATEGORIES {
            stats.by_category.insert(category, 0);
        }
        for rejection in rejections {
            let route = self.routes.route(rejection.category);
            stats.total_routed += 1;
            *stats.by_category.entry(rejection.category).or_insert(0) += 1;
            *stats.by_handler.entry(route.handler).or_insert(0) += 1;
            if rejection.retry_count >= route.max_retries {
                stats.escalations += 1;
            }
        }
        Ok(stats)
    }
}
