//! Lifecycle of one admitted request.
//!
//! `supervise` marks the request running, starts the unit of work on a named
//! OS thread, and waits for whichever comes first: the unit's result or the
//! run's cancellation. The admission slot is released by `SlotGuard` on every
//! exit path, including a dropped future.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::correlator::ExecutionToken;
use crate::engine::queue::{QueuedEntry, RunControl};
use crate::engine::state::RunStatus;
use crate::engine::termination::WorkerThread;
use crate::engine::unit::RunContext;
use crate::engine::EngineInner;
use crate::error::UnitError;
use crate::jobs::JobCancelResult;

pub(crate) const CANCELLED_MESSAGE: &str = "Task cancelled";

/// How a supervised run ended, published to anyone cancelling it.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Status the request ended in.
    pub status: RunStatus,
    pub token: Option<ExecutionToken>,
    /// Whether a unit of work was actually executing.
    pub in_flight: bool,
    /// `false` only when forced termination could not confirm the stop.
    pub stopped: bool,
    #[serde(skip)]
    pub waited: Duration,
    pub jobs: Vec<JobCancelResult>,
}

impl RunReport {
    fn not_started(status: RunStatus) -> Self {
        Self {
            status,
            token: None,
            in_flight: false,
            stopped: true,
            waited: Duration::ZERO,
            jobs: Vec::new(),
        }
    }
}

/// Releases the admission slot and admits the next request.
struct SlotGuard {
    inner: Arc<EngineInner>,
    request_id: Uuid,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let released = self.inner.lock_admission().complete(self.request_id);
        if released {
            debug!(request_id = %self.request_id, "Admission slot released");
        }
        self.inner.try_admit();
    }
}

pub(crate) async fn supervise(inner: Arc<EngineInner>, control: RunControl) {
    let RunControl {
        entry,
        cancel,
        report,
    } = control;
    let _slot = SlotGuard {
        inner: Arc::clone(&inner),
        request_id: entry.request_id,
    };

    let outcome = run(&inner, &entry, &cancel).await;
    info!(
        request_id = %entry.request_id,
        status = %outcome.status,
        "Run finished"
    );
    report.send_replace(Some(outcome));
}

enum Finish {
    Completed(String),
    Failed(String),
    Cancelled,
}

async fn run(inner: &Arc<EngineInner>, entry: &QueuedEntry, cancel: &CancellationToken) -> RunReport {
    let request_id = entry.request_id;

    if cancel.is_cancelled() {
        return cancel_before_start(inner, request_id).await;
    }

    match inner.store.update_status(request_id, RunStatus::Running, None).await {
        Ok(true) => {}
        Ok(false) => {
            // Resolved elsewhere before admission (cancelled directly).
            let status = current_status(inner, request_id).await;
            debug!(request_id = %request_id, status = %status, "Admitted request no longer queued");
            return RunReport::not_started(status);
        }
        Err(e) => {
            error!(request_id = %request_id, error = %e, "Failed to mark request running");
            return RunReport::not_started(RunStatus::Queued);
        }
    }
    inner
        .logger
        .system(request_id, "Run admitted, starting unit of work")
        .await;

    let work_dir = inner.config.work_dir.join(request_id.to_string());
    if let Err(e) = tokio::fs::create_dir_all(&work_dir).await {
        let message = format!("Error occurred during execution: failed to create work directory: {e}");
        return finish(inner, request_id, None, Finish::Failed(message)).await;
    }

    let (token_tx, token_rx) = oneshot::channel();
    let (done_tx, mut done_rx) = oneshot::channel();
    let spawned = {
        let unit = Arc::clone(&inner.unit);
        let correlator = Arc::clone(&inner.correlator);
        let logger = inner.logger.clone();
        let jobs = Arc::clone(&inner.jobs);
        let runtime = inner.runtime.clone();
        let cancel = cancel.clone();
        let description = entry.description.clone();
        let work_dir = work_dir.clone();

        std::thread::Builder::new()
            .name(format!("unit-{}", &request_id.simple().to_string()[..8]))
            .spawn(move || {
                let token = ExecutionToken::mint();
                correlator.register(request_id, token);
                let _ = token_tx.send(token);

                let ctx = RunContext::new(request_id, token, work_dir, cancel, logger, jobs, runtime);
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    unit.execute(&description, &ctx)
                }))
                .unwrap_or_else(|panic| Err(UnitError::Failed(panic_message(panic))));
                let _ = done_tx.send(result);
            })
    };
    let handle = match spawned {
        Ok(handle) => handle,
        Err(e) => {
            let message = format!("Error occurred during execution: failed to start worker: {e}");
            return finish(inner, request_id, None, Finish::Failed(message)).await;
        }
    };
    let worker = WorkerThread::new(handle, cancel.clone());

    let token = token_rx.await.ok();
    if let Some(token) = token {
        inner
            .logger
            .system(request_id, format!("Execution token {token} registered"))
            .await;
    }

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = &mut done_rx => Some(result),
    };

    let outcome = match result {
        Some(Ok(Ok(output))) => Finish::Completed(output),
        Some(Ok(Err(UnitError::Interrupted))) if cancel.is_cancelled() => Finish::Cancelled,
        Some(Ok(Err(e))) => Finish::Failed(format!("Error occurred during execution: {e}")),
        Some(Err(_)) => Finish::Failed(
            "Error occurred during execution: worker exited without a result".to_string(),
        ),
        None => Finish::Cancelled,
    };

    let report = match outcome {
        Finish::Cancelled => cancel_in_flight(inner, request_id, token, &worker).await,
        other => finish(inner, request_id, token, other).await,
    };

    finalize(inner, request_id, token, report.status).await;
    report
}

async fn cancel_before_start(inner: &Arc<EngineInner>, request_id: Uuid) -> RunReport {
    match inner
        .store
        .update_status(request_id, RunStatus::Cancelled, Some(CANCELLED_MESSAGE))
        .await
    {
        Ok(_) => {}
        Err(e) => error!(request_id = %request_id, error = %e, "Failed to mark request cancelled"),
    }
    inner
        .logger
        .system(request_id, "Cancelled before the unit of work started")
        .await;
    RunReport::not_started(current_status(inner, request_id).await)
}

async fn cancel_in_flight(
    inner: &Arc<EngineInner>,
    request_id: Uuid,
    token: Option<ExecutionToken>,
    worker: &WorkerThread,
) -> RunReport {
    let termination = inner.terminator.terminate(worker).await;

    if let Err(e) = inner
        .store
        .update_status(request_id, RunStatus::Cancelled, Some(CANCELLED_MESSAGE))
        .await
    {
        error!(request_id = %request_id, error = %e, "Failed to mark request cancelled");
    }

    if !termination.stopped {
        warn!(
            request_id = %request_id,
            waited = ?termination.waited,
            "Forced termination unconfirmed; unit of work may still be running"
        );
        inner
            .logger
            .system(
                request_id,
                format!(
                    "Forced termination unconfirmed after {:.1}s; the unit of work may still be running",
                    termination.waited.as_secs_f64()
                ),
            )
            .await;
    }

    let jobs = inner.jobs.cancel_for_request(request_id).await;
    let summary = if jobs.is_empty() {
        "no batch jobs found".to_string()
    } else {
        jobs.iter()
            .map(|j| format!("{}: {}", j.calculation_id, j.message))
            .collect::<Vec<_>>()
            .join("; ")
    };
    inner
        .logger
        .system(
            request_id,
            format!("Cancelled (stopped: {}); {summary}", termination.stopped),
        )
        .await;

    RunReport {
        status: current_status(inner, request_id).await,
        token,
        in_flight: true,
        stopped: termination.stopped,
        waited: termination.waited,
        jobs,
    }
}

async fn finish(
    inner: &Arc<EngineInner>,
    request_id: Uuid,
    token: Option<ExecutionToken>,
    outcome: Finish,
) -> RunReport {
    let (target, text) = match outcome {
        Finish::Completed(output) => (RunStatus::Completed, output),
        Finish::Failed(message) => {
            inner.logger.system(request_id, message.clone()).await;
            (RunStatus::Failed, message)
        }
        Finish::Cancelled => (RunStatus::Cancelled, CANCELLED_MESSAGE.to_string()),
    };

    match inner.store.update_status(request_id, target, Some(&text)).await {
        Ok(true) => {}
        Ok(false) => debug!(request_id = %request_id, target = %target, "Status already resolved"),
        Err(e) => error!(request_id = %request_id, error = %e, "Failed to record run outcome"),
    }

    RunReport {
        status: current_status(inner, request_id).await,
        token,
        in_flight: true,
        stopped: true,
        waited: Duration::ZERO,
        jobs: Vec::new(),
    }
}

/// Always runs once a unit was started.
async fn finalize(
    inner: &Arc<EngineInner>,
    request_id: Uuid,
    token: Option<ExecutionToken>,
    status: RunStatus,
) {
    inner.correlator.unregister(request_id);

    if let Some(token) = token {
        let unit = Arc::clone(&inner.unit);
        let teardown = tokio::task::spawn_blocking(move || unit.teardown(token));
        let failure = match tokio::time::timeout(inner.config.terminate_timeout, teardown).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => Some(e.to_string()),
            Ok(Err(join)) => Some(format!("teardown panicked: {join}")),
            Err(_) => Some("teardown timed out".to_string()),
        };
        if let Some(reason) = failure {
            warn!(request_id = %request_id, reason = %reason, "Teardown failed");
            inner
                .logger
                .system(request_id, format!("Teardown failed: {reason}"))
                .await;
        }
    }

    inner
        .logger
        .system(request_id, format!("Run finished ({status})"))
        .await;
}

async fn current_status(inner: &Arc<EngineInner>, request_id: Uuid) -> RunStatus {
    match inner.store.get_request(request_id).await {
        Ok(Some(request)) => request.status,
        Ok(None) => RunStatus::Failed,
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "Failed to read request status");
            RunStatus::Failed
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("unit of work panicked: {detail}")
}
