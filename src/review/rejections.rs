use crate::config::EngineSettings;
use crate::review::category::RejectionCategory;
use crate::review::routing::{RouteTable, DEFAULT_MAX_RETRIES};
use crate::shared::ids::generate_record_id;
use crate::store::error::{sql_error, StoreError};
use crate::store::event_log::{append_event, EventType};
use crate::store::Database;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_REJECTION_THRESHOLD: u32 = DEFAULT_MAX_RETRIES;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub id: String,
    pub run_id: String,
    pub category: RejectionCategory,
    pub reason: String,
    pub retry_count: u32,
    pub resolved: bool,
    pub created_at: i64,
}

const REJECTION_COLUMNS: &str = "id, run_id, category, reason, retry_count, resolved, created_at";

type RawRejection = (String, String, String, String, i64, bool, i64);

/// Counts domain-level rejections per (run, category). Counts never reset:
/// resolving a rejection only flips its flag. The escalation threshold of a
/// category is its route's `max_retries`, the same budget the router and the
/// escalation manager apply.
#[derive(Debug, Clone)]
pub struct RejectionTracker<'a> {
    db: &'a Database,
    routes: RouteTable,
}

impl<'a> RejectionTracker<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self::with_routes(db, RouteTable::default())
    }

    pub fn with_threshold(db: &'a Database, threshold: u32) -> Self {
        Self::with_routes(db, RouteTable::with_budget(threshold))
    }

    pub fn with_routes(db: &'a Database, routes: RouteTable) -> Self {
        Self { db, routes }
    }

    pub fn from_settings(db: &'a Database, settings: &EngineSettings) -> Self {
        Self::with_routes(db, settings.route_table())
    }

    pub fn threshold(&self, category: RejectionCategory) -> u32 {
        self.routes.route(category).max_retries
    }

    pub fn record_rejection(
        &self,
        run_id: &str,
        category: RejectionCategory,
        reason: &str,
        now: i64,
    ) -> Result<Rejection, StoreError> {
        let id = generate_record_id("rej", now).map_err(StoreError::Id)?;
        self.db.write(|tx| {
            let retry_count = count_for(tx, run_id, category)? + 1;
            tx.execute(
                "
                INSERT INTO rejections (id, run_id, category, reason, retry_count, resolved, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
                ",
                params![id, run_id, category.as_str(), reason, retry_count, now],
            )
            .map_err(sql_error)?;

            let mut payload = Map::new();
            payload.insert("rejectionId".to_string(), Value::String(id.clone()));
            payload.insert(
                "category".to_string(),
                Value::String(category.as_str().to_string()),
            );
            payload.insert("reason".to_string(), Value::String(reason.to_string()));
            payload.insert("retryCount".to_string(), Value::from(retry_count));
            append_event(tx, run_id, EventType::Rejected, None, payload, now)?;

            Ok(Rejection {
                id: id.clone(),
                run_id: run_id.to_string(),
                category,
                reason: reason.to_string(),
                retry_count,
                resolved: false,
                created_at: now,
            })
        })
    }

    pub fn get_retry_count(
        &self,
        run_id: &str,
        category: RejectionCategory,
    ) -> Result<u32, StoreError> {
        let connection = self.db.connect()?;
        count_for(&connection, run_id, category)
    }

    pub fn should_escalate(
        &self,
        run_id: &str,
        category: RejectionCategory,
    ) -> Result<bool, StoreError> {
        Ok(self.get_retry_count(run_id, category)? >= self.threshold(category))
    }

    pub fn resolve_rejection(&self, rejection_id: &str) -> Result<(), StoreError> {
        let connection = self.db.connect()?;
        let changed = connection
            .execute(
                "UPDATE rejections SET resolved = 1 WHERE id = ?1",
                params![rejection_id],
            )
            .map_err(sql_error)?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "rejection",
                id: rejection_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn get_rejection(&self, rejection_id: &str) -> Result<Option<Rejection>, StoreError> {
        let connection = self.db.connect()?;
        load_rejection(&connection, rejection_id)
    }

    pub fn rejections_for_run(&self, run_id: &str) -> Result<Vec<Rejection>, StoreError> {
        let connection = self.db.connect()?;
        query_rejections(&connection, "WHERE run_id = ?1", Some(run_id))
    }

    pub fn unresolved_rejections(&self, run_id: &str) -> Result<Vec<Rejection>, StoreError> {
        let connection = self.db.connect()?;
        query_rejections(
            &connection,
            "WHERE run_id = ?1 AND resolved = 0",
            Some(run_id),
        )
    }
}

pub(crate) fn count_for(
    connection: &Connection,
    run_id: &str,
    category: RejectionCategory,
) -> Result<u32, StoreError> {
    let count: i64 = connection
        .query_row(
            "SELECT COUNT(*) FROM rejections WHERE run_id = ?1 AND category = ?2",
            params![run_id, category.as_str()],
            |row| row.get(0),
        )
        .map_err(sql_error)?;
    Ok(u32::try_from(count).unwrap_or(u32::MAX))
}

pub(crate) fn load_rejection(
    connection: &Connection,
    rejection_id: &str,
) -> Result<Option<Rejection>, StoreError> {
    let raw = connection
        .query_row(
            &format!("SELECT {REJECTION_COLUMNS} FROM rejections WHERE id = ?1"),
            params![rejection_id],
            raw_rejection,
        )
        .optional()
        .map_err(sql_error)?;
    raw.map(rejection_from_raw).transpose()
}

/// Rejections in insertion order, optionally scoped by a single-key clause.
pub(crate) fn query_rejections(
    connection: &Connection,
    where_clause: &str,
    key: Option<&str>,
) -> Result<Vec<Rejection>, StoreError> {
    let mut statement = connection
        .prepare(&format!(
            "SELECT {REJECTION_COLUMNS} FROM rejections {where_clause} ORDER BY seq ASC"
        ))
        .map_err(sql_error)?;
    let rows = match key {
        Some(key) => statement.query_map(params![key], raw_rejection),
        None => statement.query_map([], raw_rejection),
    }
    .map_err(sql_error)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(rejection_from_raw(row.map_err(sql_error)?)?);
    }
    Ok(out)
}

fn raw_rejection(row: &Row<'_>) -> rusqlite::Result<RawRejection> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn rejection_from_raw(raw: RawRejection) -> Result<Rejection, StoreError> {
    let (id, run_id, category_raw, reason, retry_count, resolved, created_at) = raw;
    let category =
        RejectionCategory::parse(&category_raw).map_err(|_| StoreError::InvalidColumn {
            column: "category",
            value: category_raw.clone(),
        })?;
    Ok(Rejection {
        id,
        run_id,
        category,
        reason,
        retry_count: u32::try_from(retry_count).unwrap_or(0),
        resolved,
        created_at,
    })
}
