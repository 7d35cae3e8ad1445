use crate::config::EngineSettings;
use crate::review::category::{RejectionCategory, REJECTION_CATEGORIES};
use crate::review::rejections::count_for;
use crate::review::routing::RouteTable;
use crate::shared::ids::generate_record_id;
use crate::store::error::{sql_error, StoreError};
use crate::store::event_log::{append_event, EventType};
use crate::store::Database;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Pending,
    Acknowledged,
    Resolved,
}

impl EscalationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EscalationStatus::Pending => "pending",
            EscalationStatus::Acknowledged => "acknowledged",
            EscalationStatus::Resolved => "resolved",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "pending" => Ok(EscalationStatus::Pending),
            "acknowledged" => Ok(EscalationStatus::Acknowledged),
            "resolved" => Ok(EscalationStatus::Resolved),
            other => Err(format!("unknown escalation status `{other}`")),
        }
    }
}

impl std::fmt::Display for EscalationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Escalation {
    pub id: String,
    pub run_id: String,
    pub category: RejectionCategory,
    pub retry_count: u32,
    pub target: String,
    pub reason: String,
    pub status: EscalationStatus,
    pub resolution: Option<String>,
    pub created_at: i64,
    pub acknowledged_at: Option<i64>,
    pub resolved_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationOutcome {
    pub escalated: bool,
    pub escalation_id: Option<String>,
    pub target: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationStats {
    pub total: u64,
    pub by_status: BTreeMap<EscalationStatus, u64>,
    pub by_category: BTreeMap<RejectionCategory, u64>,
    pub by_target: BTreeMap<String, u64>,
    pub avg_acknowledge_seconds: Option<f64>,
    pub avg_resolve_seconds: Option<f64>,
}

const ESCALATION_COLUMNS: &str = "id, run_id, category, retry_count, target, reason, status, \
                                  resolution, created_at, acknowledged_at, resolved_at";

type RawEscalation = (
    String,
    String,
    String,
    i64,
    String,
    String,
    String,
    Option<String>,
    i64,
    Option<i64>,
    Option<i64>,
);

#[derive(Debug, Clone)]
pub struct EscalationManager<'a> {
    db: &'a Database,
    routes: RouteTable,
}

impl<'a> EscalationManager<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self::with_routes(db, RouteTable::default())
    }

    pub fn with_routes(db: &'a Database, routes: RouteTable) -> Self {
        Self { db, routes }
    }

    pub fn from_settings(db: &'a Database, settings: &EngineSettings) -> Self {
        Self::with_routes(db, settings.route_table())
    }

    /// Escalates the (run, category) pair once its rejection count reaches
    /// the category budget. At most one escalation exists per pair; repeated
    /// calls return the existing record.
    pub fn check_and_escalate(
        &self,
        run_id: &str,
        category: RejectionCategory,
        now: i64,
    ) -> Result<EscalationOutcome, StoreError> {
        let route = self.routes.route(category);
        let candidate_id = generate_record_id("esc", now).map_err(StoreError::Id)?;
        self.db.write(|tx| {
            if let Some(existing) = load_for_pair(tx, run_id, category)? {
                return Ok(already_escalated(existing));
            }

            let retry_count = count_for(tx, run_id, category)?;
            if retry_count < route.max_retries {
                return Ok(EscalationOutcome {
                    escalated: false,
                    escalation_id: None,
                    target: None,
                    reason: format!(
                        "Retry count ({retry_count}) has not reached threshold ({})",
                        route.max_retries
                    ),
                });
            }

            let reason = format!(
                "Retry limit ({}) exceeded for {} rejections",
                route.max_retries, category
            );
            let inserted = tx
                .execute(
                    "
                    INSERT INTO escalations (
                        id, run_id, category, retry_count, target, reason, status,
                        resolution, created_at, acknowledged_at, resolved_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', NULL, ?7, NULL, NULL)
                    ON CONFLICT(run_id, category) DO NOTHING
                    ",
                    params![
                        candidate_id,
                        run_id,
                        category.as_str(),
                        retry_count,
                        route.escalation_target,
                        reason,
                        now
                    ],
                )
                .map_err(sql_error)?;
            let stored =
                load_for_pair(tx, run_id, category)?.ok_or_else(|| StoreError::NotFound {
                    entity: "escalation",
                    id: format!("{run_id}/{category}"),
                })?;
            if inserted == 0 {
                return Ok(already_escalated(stored));
            }

            let mut payload = Map::new();
            payload.insert("escalationId".to_string(), Value::String(stored.id.clone()));
            payload.insert(
                "category".to_string(),
                Value::String(category.as_str().to_string()),
            );
            payload.insert("retryCount".to_string(), Value::from(retry_count));
            payload.insert("target".to_string(), Value::String(stored.target.clone()));
            append_event(
                tx,
                run_id,
                EventType::Escalated,
                Some(&stored.target),
                payload,
                now,
            )?;

            Ok(EscalationOutcome {
                escalated: true,
                escalation_id: Some(stored.id),
                target: Some(stored.target),
                reason,
            })
        })
    }

    pub fn acknowledge(&self, escalation_id: &str, now: i64) -> Result<Escalation, StoreError> {
        self.db.write(|tx| {
            let escalation = require_escalation(tx, escalation_id)?;
            match escalation.status {
                EscalationStatus::Acknowledged => Ok(escalation),
                EscalationStatus::Resolved => Err(StoreError::InvalidEscalationTransition {
                    escalation_id: escalation_id.to_string(),
                    from: escalation.status.to_string(),
                    to: EscalationStatus::Acknowledged.to_string(),
                }),
                EscalationStatus::Pending => {
                    tx.execute(
                        "
                        UPDATE escalations SET status = 'acknowledged', acknowledged_at = ?2
                        WHERE id = ?1
                        ",
                        params![escalation_id, now],
                    )
                    .map_err(sql_error)?;
                    require_escalation(tx, escalation_id)
                }
            }
        })
    }

    pub fn resolve(
        &self,
        escalation_id: &str,
        resolution: &str,
        now: i64,
    ) -> Result<Escalation, StoreError> {
        self.db.write(|tx| {
            let escalation = require_escalation(tx, escalation_id)?;
            if escalation.status == EscalationStatus::Resolved {
                return Ok(escalation);
            }
            tx.execute(
                "
                UPDATE escalations SET status = 'resolved', resolution = ?2, resolved_at = ?3
                WHERE id = ?1
                ",
                params![escalation_id, resolution, now],
            )
            .map_err(sql_error)?;
            require_escalation(tx, escalation_id)
        })
    }

    pub fn get_escalation(&self, escalation_id: &str) -> Result<Option<Escalation>, StoreError> {
        let connection = self.db.connect()?;
        load_escalation(&connection, escalation_id)
    }

    pub fn pending_escalations(&self) -> Result<Vec<Escalation>, StoreError> {
        let connection = self.db.connect()?;
        query_escalations(&connection, "WHERE status = ?1", Some("pending"))
    }

    pub fn escalations_for_run(&self, run_id: &str) -> Result<Vec<Escalation>, StoreError> {
        let connection = self.db.connect()?;
        query_escalations(&connection, "WHERE run_id = ?1", Some(run_id))
    }

    pub fn escalation_stats(&self) -> Result<EscalationStats, StoreError> {
        let connection = self.db.connect()?;
        let escalations = query_escalations(&connection, "", None)?;

        let mut stats = EscalationStats::default();
        for status in [
            EscalationStatus::Pending,
            EscalationStatus::Acknowledged,
            EscalationStatus::Resolved,
        ] {
            stats.by_status.insert(status, 0);
        }
        for category in REJECTION_CATEGORIES {
            stats.by_category.insert(category, 0);
        }

        let mut acknowledge_durations = Vec::new();
        let mut resolve_durations = Vec::new();
        for escalation in escalations {
            stats.total += 1;
            *stats.by_status.entry(escalation.status).or_insert(0) += 1;
            *stats.by_category.entry(escalation.category).or_insert(0) += 1;
            *stats.by_target.entry(escalation.target).or_insert(0) += 1;
            if let Some(at) = escalation.acknowledged_at {
                acknowledge_durations.push(at - escalation.created_at);
            }
            if let Some(at) = escalation.resolved_at {
                resolve_durations.push(at - escalation.created_at);
            }
        }
        stats.avg_acknowledge_seconds = average(&acknowledge_durations);
        stats.avg_resolve_seconds = average(&resolve_durations);
        Ok(stats)
    }
}

fn already_escalated(existing: Escalation) -> EscalationOutcome {
    EscalationOutcome {
        escalated: true,
        escalation_id: Some(existing.id),
        target: Some(existing.target),
        reason: "Already escalated for this run and category".to_string(),
    }
}

fn average(values: &[i64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let sum: i64 = values.iter().sum();
    Some(sum as f64 / values.len() as f64)
}

fn load_for_pair(
    connection: &Connection,
    run_id: &str,
    category: RejectionCategory,
) -> Result<Option<Escalation>, StoreError> {
    let raw = connection
        .query_row(
            &format!(
                "SELECT {ESCALATION_COLUMNS} FROM escalations WHERE run_id = ?1 AND category = ?2"
            ),
            params![run_id, category.as_str()],
            raw_escalation,
        )
        .optional()
        .map_err(sql_error)?;
    raw.map(escalation_from_raw).transpose()
}

fn load_escalation(
    connection: &Connection,
    escalation_id: &str,
) -> Result<Option<Escalation>, StoreError> {
    let raw = connection
        .query_row(
            &format!("SELECT {ESCALATION_COLUMNS} FROM escalations WHERE id = ?1"),
            params![escalation_id],
            raw_escalation,
        )
        .optional()
        .map_err(sql_error)?;
    raw.map(escalation_from_raw).transpose()
}

fn require_escalation(
    connection: &Connection,
    escalation_id: &str,
) -> Result<Escalation, StoreError> {
    load_escalation(connection, escalation_id)?.ok_or_else(|| StoreError::NotFound {
        entity: "escalation",
        id: escalation_id.to_string(),
    })
}

fn query_escalations(
    connection: &Connection,
    where_clause: &str,
    key: Option<&str>,
) -> Result<Vec<Escalation>, StoreError> {
    let mut statement = connection
        .prepare(&format!(
            "SELECT {ESCALATION_COLUMNS} FROM escalations {where_clause} ORDER BY seq ASC"
        ))
        .map_err(sql_error)?;
    let rows = match key {
        Some(key) => statement.query_map(params![key], raw_escalation),
        None => statement.query_map([], raw_escalation),
    }
    .map_err(sql_error)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(escalation_from_raw(row.map_err(sql_error)?)?);
    }
    Ok(out)
}

fn raw_escalation(row: &Row<'_>) -> rusqlite::Result<RawEscalation> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
    ))
}

fn escalation_from_raw(raw: RawEscalation) -> Result<Escalation, StoreError> {
    let (
        id,
        run_id,
        category_raw,
        retry_count,
        target,
        reason,
        status_raw,
        resolution,
        created_at,
        acknowledged_at,
        resolved_at,
    ) = raw;
    let category =
        RejectionCategory::parse(&category_raw).map_err(|_| StoreError::InvalidColumn {
            column: "category",
            value: category_raw.clone(),
        })?;
    let status = EscalationStatus::parse(&status_raw).map_err(|_| StoreError::InvalidColumn {
        column: "status",
        value: status_raw.clone(),
    })?;
    Ok(Escalation {
        id,
        run_id,
        category,
        retry_count: u32::try_from(retry_count).unwrap_or(0),
        target,
        reason,
        status,
        resolution,
        created_at,
        acknowledged_at,
        resolved_at,
    })
}
