//! Run orchestration engine.
//!
//! Accepts work requests, admits at most `max_concurrent_runs` of them at a
//! time, supervises each run on its own worker thread, and cancels queued or
//! running requests (including the batch jobs they submitted).

pub mod command_unit;
pub mod correlator;
pub mod queue;
pub mod state;
pub mod supervisor;
pub mod termination;
pub mod unit;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{ConfigError, EngineError};
use crate::jobs::{JobCancelResult, JobManager};
use crate::store::{ActivityLogEntry, RunStore};

pub use correlator::{ExecutionToken, IdentityCorrelator};
pub use queue::{QueueSnapshot, QueuedPosition};
pub use state::{RunStatus, WorkRequest};
pub use supervisor::RunReport;
pub use termination::{ForcedTermination, Interruptible, TerminationReport, WorkerThread};
pub use unit::{RunContext, RunLogger, UnitOfWork};

use queue::{AdmissionQueue, QueuedEntry, RunHandle};
use supervisor::CANCELLED_MESSAGE;

/// Extra time a canceller waits for the supervisor beyond the termination timeout.
const CANCEL_REPORT_GRACE: Duration = Duration::from_secs(30);

/// Result of `Engine::cancel`.
#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub request_id: Uuid,
    pub token: Option<ExecutionToken>,
    pub success: bool,
    /// `false` when forced termination could not confirm the unit stopped.
    pub stopped: bool,
    /// Whether a unit of work was actually executing.
    pub in_flight: bool,
    pub detail: String,
    pub jobs: Vec<JobCancelResult>,
}

/// Live and persisted view of the admission queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub running_count: usize,
    pub queued_count: usize,
    pub persisted_running: usize,
    pub persisted_queued: usize,
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    pub queue: Vec<QueuedPosition>,
}

/// What `Engine::recover` did at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub failed: usize,
    pub requeued: usize,
}

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) store: Arc<dyn RunStore>,
    pub(crate) unit: Arc<dyn UnitOfWork>,
    pub(crate) correlator: Arc<IdentityCorrelator>,
    pub(crate) jobs: Arc<JobManager>,
    pub(crate) logger: RunLogger,
    pub(crate) terminator: ForcedTermination,
    pub(crate) runtime: Handle,
    admission: Mutex<AdmissionQueue>,
}

impl EngineInner {
    pub(crate) fn lock_admission(&self) -> MutexGuard<'_, AdmissionQueue> {
        self.admission.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit queued requests while slots are free. Safe to call from any
    /// number of places at once; pop and admit happen under one lock.
    pub(crate) fn try_admit(self: &Arc<Self>) {
        let admitted = self.lock_admission().admit_ready();
        for control in admitted {
            debug!(request_id = %control.entry.request_id, "Admitting request");
            self.runtime
                .spawn(supervisor::supervise(Arc::clone(self), control));
        }
    }
}

/// Gives the reservation back unless the submission reached the queue.
struct Reservation<'a> {
    inner: &'a EngineInner,
    committed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.inner.lock_admission().release_reservation();
        }
    }
}

enum Tracked {
    Queued,
    Running(RunHandle),
    Untracked,
}

/// Cloneable handle to the engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Build an engine. Must be called from within a tokio runtime.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn RunStore>,
        unit: Arc<dyn UnitOfWork>,
        jobs: Arc<JobManager>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| ConfigError::InvalidValue {
            key: "runtime".to_string(),
            message: e.to_string(),
        })?;

        let correlator = Arc::new(IdentityCorrelator::new());
        let logger = RunLogger::new(Arc::clone(&store), Arc::clone(&correlator), runtime.clone());
        let terminator =
            ForcedTermination::new(config.terminate_timeout, config.terminate_poll_interval);
        let admission = Mutex::new(AdmissionQueue::new(
            config.max_concurrent_runs,
            config.max_queue_size,
        ));

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                unit,
                correlator,
                jobs,
                logger,
                terminator,
                runtime,
                admission,
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Token-routed logging surface for units of work.
    pub fn logger(&self) -> RunLogger {
        self.inner.logger.clone()
    }

    pub fn correlator(&self) -> Arc<IdentityCorrelator> {
        Arc::clone(&self.inner.correlator)
    }

    pub fn jobs(&self) -> Arc<JobManager> {
        Arc::clone(&self.inner.jobs)
    }

    /// Persist a new request as queued and try to admit it.
    pub async fn submit(&self, description: impl Into<String>) -> Result<Uuid, EngineError> {
        self.inner.lock_admission().reserve()?;
        let mut reservation = Reservation {
            inner: &self.inner,
            committed: false,
        };

        let request = WorkRequest::new(description);
        self.inner.store.create_request(&request).await?;

        let position = self.inner.lock_admission().commit(QueuedEntry {
            request_id: request.id,
            description: request.description.clone(),
            created_at: request.created_at,
        });
        reservation.committed = true;

        info!(request_id = %request.id, position, "Work request queued");
        self.inner
            .logger
            .system(request.id, format!("Request queued at position {position}"))
            .await;

        self.inner.try_admit();
        Ok(request.id)
    }

    pub async fn get_request(&self, id: Uuid) -> Result<WorkRequest, EngineError> {
        self.inner
            .store
            .get_request(id)
            .await?
            .ok_or(EngineError::NotFound { id })
    }

    pub async fn get_status(&self, id: Uuid) -> Result<RunStatus, EngineError> {
        Ok(self.get_request(id).await?.status)
    }

    /// Activity log of a request, oldest first.
    pub async fn get_logs(&self, id: Uuid) -> Result<Vec<ActivityLogEntry>, EngineError> {
        self.get_request(id).await?;
        Ok(self.inner.store.get_logs(id).await?)
    }

    /// Newest first. `None` uses the configured default.
    pub async fn list_recent(&self, limit: Option<usize>) -> Result<Vec<WorkRequest>, EngineError> {
        let limit = limit.unwrap_or(self.inner.config.recent_limit);
        Ok(self.inner.store.list_recent(limit).await?)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.inner.lock_admission().snapshot()
    }

    pub async fn queue_status(&self) -> Result<QueueStatus, EngineError> {
        let snapshot = self.snapshot();
        let persisted_running = self.inner.store.count_by_status(RunStatus::Running).await?;
        let persisted_queued = self.inner.store.count_by_status(RunStatus::Queued).await?;
        Ok(QueueStatus {
            running_count: snapshot.running_count,
            queued_count: snapshot.queued_count,
            persisted_running,
            persisted_queued,
            max_concurrent: self.inner.config.max_concurrent_runs,
            max_queue_size: self.inner.config.max_queue_size,
            queue: snapshot.queued,
        })
    }

    /// Cancel a queued or running request.
    ///
    /// Queued requests are removed synchronously. Running requests are
    /// interrupted and waited on (bounded); the request ends `cancelled`
    /// either way and `stopped` reports whether the unit really stopped.
    pub async fn cancel(&self, id: Uuid) -> Result<CancelOutcome, EngineError> {
        let request = self.get_request(id).await?;
        if !request.status.can_transition_to(RunStatus::Cancelled) {
            return Err(EngineError::InvalidTransition {
                id,
                state: request.status.to_string(),
            });
        }

        let attempts = self.inner.config.token_wait_attempts.max(1);
        let mut backoff = self.inner.config.token_wait_backoff;
        for attempt in 0..attempts {
            match self.locate(id) {
                Tracked::Queued => return self.cancel_queued(id).await,
                Tracked::Running(handle) => return self.cancel_running(id, handle).await,
                Tracked::Untracked => {}
            }

            // Between persist and enqueue, or between pop and supervision.
            let status = self.get_status(id).await?;
            if !status.can_transition_to(RunStatus::Cancelled) {
                return Err(EngineError::InvalidTransition {
                    id,
                    state: status.to_string(),
                });
            }
            if attempt + 1 < attempts {
                debug!(request_id = %id, attempt, "Request not tracked yet, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(1));
            }
        }

        self.cancel_untracked(id).await
    }

    fn locate(&self, id: Uuid) -> Tracked {
        let mut admission = self.inner.lock_admission();
        if admission.remove_queued(id).is_some() {
            Tracked::Queued
        } else if let Some(handle) = admission.running_handle(id) {
            Tracked::Running(handle)
        } else {
            Tracked::Untracked
        }
    }

    async fn cancel_queued(&self, id: Uuid) -> Result<CancelOutcome, EngineError> {
        self.inner
            .store
            .update_status(id, RunStatus::Cancelled, Some(CANCELLED_MESSAGE))
            .await?;
        self.inner
            .logger
            .system(id, "Cancelled while queued")
            .await;
        info!(request_id = %id, "Queued request cancelled");

        Ok(CancelOutcome {
            request_id: id,
            token: None,
            success: true,
            stopped: true,
            in_flight: false,
            detail: "Request removed from queue and cancelled".to_string(),
            jobs: Vec::new(),
        })
    }

    async fn cancel_running(&self, id: Uuid, handle: RunHandle) -> Result<CancelOutcome, EngineError> {
        info!(request_id = %id, "Cancelling running request");
        handle.cancel.cancel();

        let wait = self.inner.config.terminate_timeout + CANCEL_REPORT_GRACE;
        let mut receiver = handle.report;
        let report = match tokio::time::timeout(wait, receiver.wait_for(Option::is_some)).await {
            Ok(Ok(report)) => (*report).clone(),
            Ok(Err(_)) => None,
            Err(_) => {
                warn!(request_id = %id, ?wait, "Supervisor did not report cancellation in time");
                None
            }
        };

        let Some(report) = report else {
            // Keep the caller-visible state prompt; the supervisor's own
            // write will then be a no-op.
            self.inner
                .store
                .update_status(id, RunStatus::Cancelled, Some(CANCELLED_MESSAGE))
                .await?;
            return Ok(CancelOutcome {
                request_id: id,
                token: self.inner.correlator.token_for(id),
                success: true,
                stopped: false,
                in_flight: true,
                detail: "Cancellation signalled; termination not yet confirmed".to_string(),
                jobs: Vec::new(),
            });
        };

        if report.status != RunStatus::Cancelled {
            return Err(EngineError::InvalidTransition {
                id,
                state: report.status.to_string(),
            });
        }

        let detail = match (report.in_flight, report.stopped) {
            (false, _) => "Cancelled before the unit of work started".to_string(),
            (true, true) => "Run cancelled and stopped".to_string(),
            (true, false) => format!(
                "Run cancelled; forced termination unconfirmed after {:.1}s, the unit of work may still be running",
                report.waited.as_secs_f64()
            ),
        };

        Ok(CancelOutcome {
            request_id: id,
            token: report.token,
            success: true,
            stopped: report.stopped,
            in_flight: report.in_flight,
            detail,
            jobs: report.jobs,
        })
    }

    async fn cancel_untracked(&self, id: Uuid) -> Result<CancelOutcome, EngineError> {
        let updated = self
            .inner
            .store
            .update_status(id, RunStatus::Cancelled, Some(CANCELLED_MESSAGE))
            .await?;
        if !updated {
            let status = self.get_status(id).await?;
            return Err(EngineError::InvalidTransition {
                id,
                state: status.to_string(),
            });
        }

        warn!(request_id = %id, "Request was not tracked by the queue; marked cancelled directly");
        self.inner
            .logger
            .system(id, "Cancelled while not tracked by the queue")
            .await;

        Ok(CancelOutcome {
            request_id: id,
            token: None,
            success: true,
            stopped: true,
            in_flight: false,
            detail: "Request was not tracked by the queue; marked cancelled".to_string(),
            jobs: Vec::new(),
        })
    }

    /// Reconcile persisted state after a restart. Call once, before serving.
    ///
    /// Rows left `running` are failed; rows left `queued` are re-enqueued in
    /// creation order.
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let mut report = RecoveryReport::default();

        for request in self.inner.store.list_by_status(RunStatus::Running).await? {
            if self.inner.lock_admission().running_handle(request.id).is_some() {
                continue;
            }
            let failed = self
                .inner
                .store
                .update_status(
                    request.id,
                    RunStatus::Failed,
                    Some("interrupted by engine restart"),
                )
                .await?;
            if failed {
                report.failed += 1;
                self.inner
                    .logger
                    .system(request.id, "Marked failed: interrupted by engine restart")
                    .await;
            }
        }

        let queued = self.inner.store.list_by_status(RunStatus::Queued).await?;
        {
            let mut admission = self.inner.lock_admission();
            for request in queued {
                if admission.is_queued(request.id) || admission.running_handle(request.id).is_some() {
                    continue;
                }
                admission.push(QueuedEntry {
                    request_id: request.id,
                    description: request.description,
                    created_at: request.created_at,
                });
                report.requeued += 1;
            }
        }

        if report != RecoveryReport::default() {
            info!(failed = report.failed, requeued = report.requeued, "Recovered persisted runs");
        }
        self.inner.try_admit();
        Ok(report)
    }
}
