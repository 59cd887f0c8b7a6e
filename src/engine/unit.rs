//! The unit-of-work boundary and the surfaces it can call back into.
//!
//! A unit runs on its own OS thread and only knows its `ExecutionToken`.
//! Everything it reaches (logging, batch jobs) goes through `RunContext`,
//! which bridges into the async runtime with `Handle::block_on`. None of
//! these methods may be called from inside an async task.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::correlator::{ExecutionToken, IdentityCorrelator};
use crate::error::UnitError;
use crate::jobs::{CalcKind, ExternalJob, JobCancelResult, JobManager};
use crate::store::{ActivityLogEntry, LogKind, RunStore};

/// Opaque work executed for one request.
pub trait UnitOfWork: Send + Sync + 'static {
    /// Run to completion or fail. May block for the run's whole duration.
    fn execute(&self, description: &str, ctx: &RunContext) -> Result<String, UnitError>;

    /// Release external resources held for `token`. Called once per run,
    /// after it ends for any reason.
    fn teardown(&self, _token: ExecutionToken) -> Result<(), UnitError> {
        Ok(())
    }
}

/// Tool payloads are stored as JSON; anything else becomes `{"raw": ...}`.
pub fn normalise_payload(kind: LogKind, content: &str) -> String {
    if !kind.is_tool() {
        return content.to_string();
    }
    match serde_json::from_str::<serde_json::Value>(content) {
        Ok(value) => value.to_string(),
        Err(_) => json!({ "raw": content }).to_string(),
    }
}

/// Token-routed activity logging.
#[derive(Clone)]
pub struct RunLogger {
    store: Arc<dyn RunStore>,
    correlator: Arc<IdentityCorrelator>,
    runtime: Handle,
}

impl RunLogger {
    pub fn new(
        store: Arc<dyn RunStore>,
        correlator: Arc<IdentityCorrelator>,
        runtime: Handle,
    ) -> Self {
        Self {
            store,
            correlator,
            runtime,
        }
    }

    fn entry_for(
        &self,
        kind: LogKind,
        actor: Option<&str>,
        content: &str,
        token: ExecutionToken,
    ) -> Option<ActivityLogEntry> {
        match self.correlator.lookup(token) {
            Some(request_id) => Some(ActivityLogEntry::new(
                request_id,
                kind,
                actor,
                normalise_payload(kind, content),
            )),
            None => {
                debug!(token = %token, kind = %kind, "Dropping log line for unregistered token");
                None
            }
        }
    }

    /// Append a line for the run owning `token`. Blocking.
    ///
    /// Returns `false` if the token is not registered (yet) or the write
    /// failed; the line is dropped in both cases.
    pub fn log(
        &self,
        kind: LogKind,
        actor: Option<&str>,
        content: &str,
        token: ExecutionToken,
    ) -> bool {
        let Some(entry) = self.entry_for(kind, actor, content, token) else {
            return false;
        };
        match self.runtime.block_on(self.store.append_log(&entry)) {
            Ok(()) => true,
            Err(e) => {
                warn!(request_id = %entry.request_id, error = %e, "Failed to append log line");
                false
            }
        }
    }

    /// Engine lifecycle line, addressed by request id.
    pub async fn system(&self, request_id: Uuid, content: impl Into<String>) {
        let entry = ActivityLogEntry::system(request_id, content);
        if let Err(e) = self.store.append_log(&entry).await {
            warn!(request_id = %request_id, error = %e, "Failed to append system log line");
        }
    }
}

/// Everything a running unit of work may touch.
#[derive(Clone)]
pub struct RunContext {
    request_id: Uuid,
    token: ExecutionToken,
    work_dir: PathBuf,
    cancel: CancellationToken,
    logger: RunLogger,
    jobs: Arc<JobManager>,
    runtime: Handle,
}

impl RunContext {
    pub(crate) fn new(
        request_id: Uuid,
        token: ExecutionToken,
        work_dir: PathBuf,
        cancel: CancellationToken,
        logger: RunLogger,
        jobs: Arc<JobManager>,
        runtime: Handle,
    ) -> Self {
        Self {
            request_id,
            token,
            work_dir,
            cancel,
            logger,
            jobs,
            runtime,
        }
    }

    pub fn token(&self) -> ExecutionToken {
        self.token
    }

    /// Per-run scratch directory, created before the unit starts.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cooperative cancellation point.
    pub fn check_cancelled(&self) -> Result<(), UnitError> {
        if self.is_cancelled() {
            Err(UnitError::Interrupted)
        } else {
            Ok(())
        }
    }

    pub fn log(&self, kind: LogKind, actor: Option<&str>, content: &str) -> bool {
        self.logger.log(kind, actor, content, self.token)
    }

    /// Submit a batch job. Never fails; see `ExternalJob::status`.
    pub fn submit_job(&self, kind: CalcKind, work_path: &Path) -> ExternalJob {
        let op = "submit_job";
        let args = json!({ "calc_type": kind.to_string(), "work_path": work_path.display().to_string() });
        self.log(LogKind::ToolInput, Some(op), &args.to_string());

        let job = self
            .runtime
            .block_on(self.jobs.submit(kind, work_path, Some(self.request_id)));

        self.log(LogKind::ToolOutput, Some(op), &job.to_log_value().to_string());
        job
    }

    /// Refresh the given jobs from the scheduler.
    pub fn poll_jobs(&self, calculation_ids: &[Uuid]) -> Vec<ExternalJob> {
        let op = "poll_jobs";
        let args = json!({ "calculation_ids": calculation_ids });
        self.log(LogKind::ToolInput, Some(op), &args.to_string());

        let jobs = self.runtime.block_on(self.jobs.poll_ids(calculation_ids));

        let output = json!({ "jobs": jobs.iter().map(ExternalJob::to_log_value).collect::<Vec<_>>() });
        self.log(LogKind::ToolOutput, Some(op), &output.to_string());
        jobs
    }

    pub fn cancel_job(&self, calculation_id: Uuid) -> JobCancelResult {
        let op = "cancel_job";
        let args = json!({ "calculation_id": calculation_id });
        self.log(LogKind::ToolInput, Some(op), &args.to_string());

        let result = self.runtime.block_on(self.jobs.cancel(calculation_id));

        let output = serde_json::to_string(&result).unwrap_or_default();
        self.log(LogKind::ToolOutput, Some(op), &output);
        result
    }
}
