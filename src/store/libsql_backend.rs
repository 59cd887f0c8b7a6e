//! libSQL backend: async `RunStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::state::{RunStatus, WorkRequest};
use crate::error::DatabaseError;
use crate::jobs::model::{ExternalJob, JobStatus};
use crate::jobs::result::{CalcKind, CalcResult};
use crate::store::migrations;
use crate::store::traits::{ActivityLogEntry, LogKind, RunStore};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so that lexical order is time order.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid '{s}': {e}")))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Map a libsql Row to a WorkRequest.
///
/// Column order matches REQUEST_COLUMNS.
fn row_to_request(row: &libsql::Row) -> Result<WorkRequest, DatabaseError> {
    let get = |e: libsql::Error| DatabaseError::Query(format!("row_to_request: {e}"));
    let id_str: String = row.get(0).map_err(get)?;
    let status_str: String = row.get(2).map_err(get)?;
    let created_str: String = row.get(3).map_err(get)?;
    let started_str: Option<String> = row.get(4).ok();
    let completed_str: Option<String> = row.get(5).ok();

    Ok(WorkRequest {
        id: parse_uuid(&id_str)?,
        description: row.get(1).map_err(get)?,
        status: status_str
            .parse()
            .map_err(DatabaseError::Serialization)?,
        created_at: parse_datetime(&created_str),
        started_at: parse_optional_datetime(&started_str),
        completed_at: parse_optional_datetime(&completed_str),
        result: row.get(6).ok(),
        error_message: row.get(7).ok(),
    })
}

fn row_to_log(row: &libsql::Row) -> Result<ActivityLogEntry, DatabaseError> {
    let get = |e: libsql::Error| DatabaseError::Query(format!("row_to_log: {e}"));
    let request_str: String = row.get(0).map_err(get)?;
    let kind_str: String = row.get(1).map_err(get)?;
    let ts_str: String = row.get(4).map_err(get)?;

    Ok(ActivityLogEntry {
        request_id: parse_uuid(&request_str)?,
        kind: kind_str
            .parse::<LogKind>()
            .map_err(DatabaseError::Serialization)?,
        actor: row.get(2).ok(),
        content: row.get(3).map_err(get)?,
        timestamp: parse_datetime(&ts_str),
    })
}

fn row_to_job(row: &libsql::Row) -> Result<ExternalJob, DatabaseError> {
    let get = |e: libsql::Error| DatabaseError::Query(format!("row_to_job: {e}"));
    let calc_str: String = row.get(0).map_err(get)?;
    let request_str: Option<String> = row.get(1).ok();
    let kind_str: String = row.get(3).map_err(get)?;
    let path_str: String = row.get(4).map_err(get)?;
    let status_str: String = row.get(5).map_err(get)?;
    let result_str: Option<String> = row.get(6).ok();
    let created_str: String = row.get(8).map_err(get)?;
    let updated_str: String = row.get(9).map_err(get)?;

    let result = match result_str {
        Some(raw) => Some(
            serde_json::from_str::<CalcResult>(&raw)
                .map_err(|e| DatabaseError::Serialization(format!("job result: {e}")))?,
        ),
        None => None,
    };

    Ok(ExternalJob {
        calculation_id: parse_uuid(&calc_str)?,
        request_id: request_str.as_deref().map(parse_uuid).transpose()?,
        job_id: row.get(2).ok(),
        calc_kind: CalcKind::from(kind_str.as_str()),
        work_path: PathBuf::from(path_str),
        status: status_str
            .parse::<JobStatus>()
            .map_err(DatabaseError::Serialization)?,
        result,
        error: row.get(7).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// SQL list of the statuses `target` may be reached from.
fn predecessor_list(target: RunStatus) -> String {
    RunStatus::predecessors(target)
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

// ── Trait implementation ────────────────────────────────────────────

const REQUEST_COLUMNS: &str =
    "id, description, status, created_at, started_at, completed_at, result, error_message";

const LOG_COLUMNS: &str = "request_id, kind, actor, content, timestamp";

const JOB_COLUMNS: &str = "calculation_id, request_id, job_id, calc_kind, work_path, status, result, error, created_at, updated_at";

#[async_trait]
impl RunStore for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Work requests ───────────────────────────────────────────────

    async fn create_request(&self, request: &WorkRequest) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO work_requests (id, description, status, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                request.id.to_string(),
                request.description.clone(),
                request.status.as_str(),
                format_datetime(&request.created_at),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("create_request: {e}")))?;

        debug!(request_id = %request.id, "Work request persisted");
        Ok(())
    }

    async fn update_status(
        &self,
        id: Uuid,
        target: RunStatus,
        outcome: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let from = predecessor_list(target);
        if from.is_empty() {
            return Ok(false);
        }
        let now = format_datetime(&Utc::now());

        let conn = self.conn();
        let count = match target {
            RunStatus::Running => conn
                .execute(
                    &format!(
                        "UPDATE work_requests SET status = ?1, started_at = ?2 WHERE id = ?3 AND status IN ({from})"
                    ),
                    params![target.as_str(), now, id.to_string()],
                )
                .await,
            RunStatus::Completed => conn
                .execute(
                    &format!(
                        "UPDATE work_requests SET status = ?1, completed_at = ?2, result = ?3 WHERE id = ?4 AND status IN ({from})"
                    ),
                    params![target.as_str(), now, opt_text(outcome), id.to_string()],
                )
                .await,
            _ => conn
                .execute(
                    &format!(
                        "UPDATE work_requests SET status = ?1, completed_at = ?2, error_message = ?3 WHERE id = ?4 AND status IN ({from})"
                    ),
                    params![target.as_str(), now, opt_text(outcome), id.to_string()],
                )
                .await,
        }
        .map_err(|e| DatabaseError::Query(format!("update_status: {e}")))?;

        Ok(count > 0)
    }

    async fn get_request(&self, id: Uuid) -> Result<Option<WorkRequest>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {REQUEST_COLUMNS} FROM work_requests WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_request: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_request: {e}")))?
        {
            Some(row) => Ok(Some(row_to_request(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<WorkRequest>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {REQUEST_COLUMNS} FROM work_requests ORDER BY created_at DESC, rowid DESC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_recent: {e}")))?;

        let mut requests = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_request(&row) {
                Ok(r) => requests.push(r),
                Err(e) => warn!("Skipping work request row: {e}"),
            }
        }
        Ok(requests)
    }

    async fn list_by_status(&self, status: RunStatus) -> Result<Vec<WorkRequest>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {REQUEST_COLUMNS} FROM work_requests WHERE status = ?1 ORDER BY created_at ASC, rowid ASC"
                ),
                params![status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_by_status: {e}")))?;

        let mut requests = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_request(&row) {
                Ok(r) => requests.push(r),
                Err(e) => warn!("Skipping work request row: {e}"),
            }
        }
        Ok(requests)
    }

    async fn count_by_status(&self, status: RunStatus) -> Result<usize, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM work_requests WHERE status = ?1",
                params![status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_by_status: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) as usize),
            _ => Ok(0),
        }
    }

    // ── Activity log ────────────────────────────────────────────────

    async fn append_log(&self, entry: &ActivityLogEntry) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO activity_logs (request_id, kind, actor, content, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.request_id.to_string(),
                entry.kind.as_str(),
                opt_text(entry.actor.as_deref()),
                entry.content.clone(),
                format_datetime(&entry.timestamp),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("append_log: {e}")))?;
        Ok(())
    }

    async fn get_logs(&self, request_id: Uuid) -> Result<Vec<ActivityLogEntry>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM activity_logs WHERE request_id = ?1 ORDER BY timestamp ASC, seq ASC"
                ),
                params![request_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_logs: {e}")))?;

        let mut entries = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_log(&row) {
                Ok(e) => entries.push(e),
                Err(e) => warn!("Skipping activity log row: {e}"),
            }
        }
        Ok(entries)
    }

    // ── External jobs ───────────────────────────────────────────────

    async fn upsert_job(&self, job: &ExternalJob) -> Result<(), DatabaseError> {
        let result = match &job.result {
            Some(r) => libsql::Value::Text(
                serde_json::to_string(r)
                    .map_err(|e| DatabaseError::Serialization(format!("job result: {e}")))?,
            ),
            None => libsql::Value::Null,
        };
        let request_id = job.request_id.map(|id| id.to_string());

        let conn = self.conn();
        conn.execute(
            &format!(
                "INSERT INTO external_jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(calculation_id) DO UPDATE SET
                    job_id = excluded.job_id,
                    status = excluded.status,
                    result = excluded.result,
                    error = excluded.error,
                    updated_at = excluded.updated_at"
            ),
            params![
                job.calculation_id.to_string(),
                opt_text(request_id.as_deref()),
                opt_text(job.job_id.as_deref()),
                job.calc_kind.to_string(),
                job.work_path.display().to_string(),
                job.status.as_str(),
                result,
                opt_text(job.error.as_deref()),
                format_datetime(&job.created_at),
                format_datetime(&job.updated_at),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("upsert_job: {e}")))?;
        Ok(())
    }

    async fn get_job(&self, calculation_id: Uuid) -> Result<Option<ExternalJob>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM external_jobs WHERE calculation_id = ?1"),
                params![calculation_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?
        {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_jobs_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<ExternalJob>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM external_jobs WHERE request_id = ?1 ORDER BY created_at ASC"
                ),
                params![request_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_jobs_for_request: {e}")))?;

        let mut jobs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_job(&row) {
                Ok(j) => jobs.push(j),
                Err(e) => warn!("Skipping external job row: {e}"),
            }
        }
        Ok(jobs)
    }
}
