//! `RunStore` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::state::{RunStatus, WorkRequest};
use crate::error::DatabaseError;
use crate::jobs::model::ExternalJob;

/// Kind of an activity log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    System,
    Input,
    Output,
    ToolInput,
    ToolOutput,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Input => "input",
            Self::Output => "output",
            Self::ToolInput => "tool_input",
            Self::ToolOutput => "tool_output",
        }
    }

    /// Tool payloads are stored as JSON.
    pub fn is_tool(&self) -> bool {
        matches!(self, Self::ToolInput | Self::ToolOutput)
    }
}

impl std::fmt::Display for LogKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "input" | "agent_input" => Ok(Self::Input),
            "output" | "agent_output" => Ok(Self::Output),
            "tool_input" => Ok(Self::ToolInput),
            "tool_output" => Ok(Self::ToolOutput),
            other => Err(format!("unknown log kind '{other}'")),
        }
    }
}

/// One append-only activity line for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub request_id: Uuid,
    pub kind: LogKind,
    pub actor: Option<String>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ActivityLogEntry {
    pub fn new(
        request_id: Uuid,
        kind: LogKind,
        actor: Option<&str>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            kind,
            actor: actor.map(str::to_string),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    /// Lifecycle line written by the engine itself.
    pub fn system(request_id: Uuid, content: impl Into<String>) -> Self {
        Self::new(request_id, LogKind::System, None, content)
    }
}

/// Backend-agnostic store for work requests, activity logs and batch jobs.
///
/// Every write is a single statement, committed before the call returns.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Work requests ───────────────────────────────────────────────

    async fn create_request(&self, request: &WorkRequest) -> Result<(), DatabaseError>;

    /// Move a request to `target` if its current status allows it.
    ///
    /// Sets `started_at` for `running`, `completed_at` for terminal states,
    /// and stores `outcome` as `result` (completed) or `error_message`
    /// (failed, cancelled). Returns `false` when the row was missing or
    /// already past the transition; the first writer wins.
    async fn update_status(
        &self,
        id: Uuid,
        target: RunStatus,
        outcome: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    async fn get_request(&self, id: Uuid) -> Result<Option<WorkRequest>, DatabaseError>;

    /// Newest first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<WorkRequest>, DatabaseError>;

    /// Oldest first.
    async fn list_by_status(&self, status: RunStatus) -> Result<Vec<WorkRequest>, DatabaseError>;

    async fn count_by_status(&self, status: RunStatus) -> Result<usize, DatabaseError>;

    // ── Activity log ────────────────────────────────────────────────

    async fn append_log(&self, entry: &ActivityLogEntry) -> Result<(), DatabaseError>;

    /// Entries for one request, ordered by timestamp then insertion order.
    async fn get_logs(&self, request_id: Uuid) -> Result<Vec<ActivityLogEntry>, DatabaseError>;

    // ── External jobs ───────────────────────────────────────────────

    async fn upsert_job(&self, job: &ExternalJob) -> Result<(), DatabaseError>;

    async fn get_job(&self, calculation_id: Uuid) -> Result<Option<ExternalJob>, DatabaseError>;

    async fn list_jobs_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<ExternalJob>, DatabaseError>;
}
