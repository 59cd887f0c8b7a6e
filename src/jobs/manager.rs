//! External job lifecycle: submit, poll, cancel, and per-request cleanup.
//!
//! Nothing here raises past the manager. Scheduler and read failures are
//! folded into the job record (`failed`, `unknown`, `error`, or a frozen
//! status with the error attached) so one bad job never aborts a batch.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::discovery::discover_job_ids;
use crate::jobs::model::{ExternalJob, JobStatus};
use crate::jobs::result::{CalcKind, ResultReader};
use crate::jobs::scheduler::BatchScheduler;
use crate::store::RunStore;

/// Outcome of one job cancellation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCancelResult {
    pub calculation_id: Uuid,
    pub job_id: Option<String>,
    pub success: bool,
    pub message: String,
}

pub struct JobManager {
    scheduler: Arc<dyn BatchScheduler>,
    store: Arc<dyn RunStore>,
    reader: Arc<dyn ResultReader>,
}

impl JobManager {
    pub fn new(
        scheduler: Arc<dyn BatchScheduler>,
        store: Arc<dyn RunStore>,
        reader: Arc<dyn ResultReader>,
    ) -> Self {
        Self {
            scheduler,
            store,
            reader,
        }
    }

    /// Submit the batch script in `work_path`. A scheduler failure yields a
    /// `failed` record carrying the raw error.
    pub async fn submit(
        &self,
        kind: CalcKind,
        work_path: &Path,
        request_id: Option<Uuid>,
    ) -> ExternalJob {
        let mut job = ExternalJob::new(kind, work_path.to_path_buf(), request_id);

        match self.scheduler.submit(work_path).await {
            Ok(job_id) => {
                info!(
                    calculation_id = %job.calculation_id,
                    job_id = %job_id,
                    kind = %job.calc_kind,
                    "Batch job submitted"
                );
                job.job_id = Some(job_id);
            }
            Err(e) => {
                warn!(calculation_id = %job.calculation_id, error = %e, "Batch submission failed");
                job.status = JobStatus::Failed;
                job.error = Some(e.to_string());
            }
        }

        self.persist(&job).await;
        job
    }

    /// Refresh every job in `jobs`, keyed by calculation id.
    pub async fn poll(&self, jobs: HashMap<Uuid, ExternalJob>) -> HashMap<Uuid, ExternalJob> {
        let refreshed = join_all(jobs.into_values().map(|job| self.refresh(job))).await;
        refreshed
            .into_iter()
            .map(|job| (job.calculation_id, job))
            .collect()
    }

    /// Load jobs from the registry and poll them. Unknown ids are skipped.
    pub async fn poll_ids(&self, ids: &[Uuid]) -> Vec<ExternalJob> {
        let mut jobs = HashMap::new();
        for id in ids {
            match self.store.get_job(*id).await {
                Ok(Some(job)) => {
                    jobs.insert(job.calculation_id, job);
                }
                Ok(None) => debug!(calculation_id = %id, "Poll for unknown calculation"),
                Err(e) => warn!(calculation_id = %id, error = %e, "Failed to load job"),
            }
        }

        let mut polled = self.poll(jobs).await;
        ids.iter().filter_map(|id| polled.remove(id)).collect()
    }

    async fn refresh(&self, mut job: ExternalJob) -> ExternalJob {
        if !job.status.is_active() {
            return job;
        }
        let Some(job_id) = job.job_id.clone() else {
            return job;
        };

        match self.scheduler.queue_state(&job_id).await {
            Ok(Some(_)) => {
                job.status = JobStatus::Running;
                job.error = None;
            }
            Ok(None) => match self.scheduler.accounting_state(&job_id).await {
                Ok(Some(state)) if state.contains("COMPLETED") => {
                    match self.reader.read(&job.calc_kind, &job.work_path).await {
                        Ok(result) => {
                            job.status = JobStatus::Completed;
                            job.result = Some(result);
                            job.error = None;
                        }
                        Err(e) => {
                            warn!(job_id = %job_id, error = %e, "Failed to read job results");
                            job.status = JobStatus::Error;
                            job.error = Some(e);
                        }
                    }
                }
                Ok(Some(state)) => {
                    job.status = JobStatus::Failed;
                    job.error = Some(format!("batch job failed with state: {state}"));
                }
                Ok(None) => {
                    job.status = JobStatus::Unknown;
                    job.error = Some("cannot determine job status".to_string());
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Accounting query failed, status frozen");
                    job.error = Some(e.to_string());
                }
            },
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Queue query failed, status frozen");
                job.error = Some(e.to_string());
            }
        }

        job.updated_at = Utc::now();
        self.persist(&job).await;
        job
    }

    /// Cancel one job. Idempotent: a job that is no longer active is a
    /// successful no-op.
    pub async fn cancel(&self, calculation_id: Uuid) -> JobCancelResult {
        let job = match self.store.get_job(calculation_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                return JobCancelResult {
                    calculation_id,
                    job_id: None,
                    success: false,
                    message: format!("unknown calculation {calculation_id}"),
                };
            }
            Err(e) => {
                return JobCancelResult {
                    calculation_id,
                    job_id: None,
                    success: false,
                    message: e.to_string(),
                };
            }
        };

        let label = job
            .job_id
            .clone()
            .unwrap_or_else(|| calculation_id.to_string());
        let (Some(job_id), true) = (job.job_id.clone(), job.status.is_active()) else {
            return JobCancelResult {
                calculation_id,
                job_id: job.job_id,
                success: true,
                message: format!("batch job {label} is not running"),
            };
        };

        match self.scheduler.cancel(&job_id).await {
            Ok(()) => {
                let mut job = job;
                job.status = JobStatus::Cancelled;
                job.updated_at = Utc::now();
                self.persist(&job).await;
                info!(calculation_id = %calculation_id, job_id = %job_id, "Batch job cancelled");
                JobCancelResult {
                    calculation_id,
                    job_id: Some(job_id.clone()),
                    success: true,
                    message: format!("batch job {job_id} cancelled"),
                }
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Batch cancel failed");
                JobCancelResult {
                    calculation_id,
                    job_id: Some(job_id),
                    success: false,
                    message: e.to_string(),
                }
            }
        }
    }

    /// Candidate job ids mentioned in the request's activity log.
    pub async fn discover_job_ids_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<String>, DatabaseError> {
        let logs = self.store.get_logs(request_id).await?;
        Ok(discover_job_ids(&logs, request_id))
    }

    /// Cancel every registered job associated with `request_id`, found via
    /// the activity log and the registry's request link.
    pub async fn cancel_for_request(&self, request_id: Uuid) -> Vec<JobCancelResult> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        match self.discover_job_ids_for_request(request_id).await {
            Ok(ids) => {
                for raw in ids {
                    match Uuid::parse_str(&raw) {
                        Ok(id) if seen.insert(id) => candidates.push(id),
                        Ok(_) => {}
                        Err(_) => debug!(candidate = %raw, "Skipping non-uuid job candidate"),
                    }
                }
            }
            Err(e) => warn!(request_id = %request_id, error = %e, "Job discovery failed"),
        }
        match self.store.list_jobs_for_request(request_id).await {
            Ok(jobs) => {
                for job in jobs {
                    if seen.insert(job.calculation_id) {
                        candidates.push(job.calculation_id);
                    }
                }
            }
            Err(e) => warn!(request_id = %request_id, error = %e, "Job registry lookup failed"),
        }

        let mut results = Vec::new();
        for id in candidates {
            match self.store.get_job(id).await {
                Ok(Some(_)) => results.push(self.cancel(id).await),
                Ok(None) => debug!(candidate = %id, "Discovered id is not a registered job"),
                Err(e) => warn!(candidate = %id, error = %e, "Failed to load job"),
            }
        }
        results
    }

    async fn persist(&self, job: &ExternalJob) {
        if let Err(e) = self.store.upsert_job(job).await {
            warn!(calculation_id = %job.calculation_id, error = %e, "Failed to persist job");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::error::SchedulerError;
    use crate::jobs::result::{CalcResult, JsonArtifactReader};
    use crate::store::{ActivityLogEntry, LibSqlBackend, LogKind};

    /// Scripted scheduler: job id -> (in queue, accounting state).
    #[derive(Default)]
    struct FakeScheduler {
        next_id: Mutex<u32>,
        states: Mutex<HashMap<String, (bool, Option<String>)>>,
        cancelled: Mutex<Vec<String>>,
        fail_submit: bool,
        fail_queue: bool,
    }

    impl FakeScheduler {
        fn set(&self, job_id: &str, in_queue: bool, accounting: Option<&str>) {
            self.states
                .lock()
                .unwrap()
                .insert(job_id.to_string(), (in_queue, accounting.map(str::to_string)));
        }
    }

    #[async_trait]
    impl BatchScheduler for FakeScheduler {
        async fn submit(&self, _work_dir: &Path) -> Result<String, SchedulerError> {
            if self.fail_submit {
                return Err(SchedulerError::CommandFailed {
                    command: "sbatch".into(),
                    code: Some(1),
                    stderr: "invalid account".into(),
                });
            }
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            let id = format!("{}", 1000 + *next);
            self.states.lock().unwrap().insert(id.clone(), (true, None));
            Ok(id)
        }

        async fn queue_state(&self, job_id: &str) -> Result<Option<String>, SchedulerError> {
            if self.fail_queue {
                return Err(SchedulerError::Timeout {
                    command: "squeue".into(),
                    timeout: std::time::Duration::from_secs(1),
                });
            }
            let states = self.states.lock().unwrap();
            Ok(match states.get(job_id) {
                Some((true, _)) => Some(format!("{job_id} R")),
                _ => None,
            })
        }

        async fn accounting_state(&self, job_id: &str) -> Result<Option<String>, SchedulerError> {
            let states = self.states.lock().unwrap();
            Ok(states.get(job_id).and_then(|(_, acct)| acct.clone()))
        }

        async fn cancel(&self, job_id: &str) -> Result<(), SchedulerError> {
            self.cancelled.lock().unwrap().push(job_id.to_string());
            Ok(())
        }
    }

    async fn manager(scheduler: Arc<FakeScheduler>) -> (JobManager, Arc<LibSqlBackend>) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let manager = JobManager::new(
            scheduler,
            store.clone(),
            Arc::new(JsonArtifactReader::new("result.json")),
        );
        (manager, store)
    }

    #[tokio::test]
    async fn submit_failure_never_raises() {
        let scheduler = Arc::new(FakeScheduler {
            fail_submit: true,
            ..Default::default()
        });
        let (manager, store) = manager(scheduler).await;

        let job = manager.submit(CalcKind::Scf, Path::new("/nowhere"), None).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.job_id.is_none());
        assert!(job.error.unwrap().contains("invalid account"));

        let stored = store.get_job(job.calculation_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn poll_reads_results_on_completion() {
        let work = tempfile::tempdir().unwrap();
        std::fs::write(
            work.path().join("result.json"),
            r#"{"efermi": 3.1, "band_gap": {"energy": 1.1, "direct": true}, "is_metal": false}"#,
        )
        .unwrap();

        let scheduler = Arc::new(FakeScheduler::default());
        let (manager, _store) = manager(scheduler.clone()).await;
        let job = manager.submit(CalcKind::Nscf, work.path(), None).await;
        let job_id = job.job_id.clone().unwrap();

        let polled = manager.poll_ids(&[job.calculation_id]).await;
        assert_eq!(polled[0].status, JobStatus::Running);

        scheduler.set(&job_id, false, Some("COMPLETED"));
        let polled = manager.poll_ids(&[job.calculation_id]).await;
        assert_eq!(polled[0].status, JobStatus::Completed);
        assert!(matches!(polled[0].result, Some(CalcResult::Nscf { is_metal: false, .. })));
    }

    #[tokio::test]
    async fn poll_degrades_without_aborting_batch() {
        let good = tempfile::tempdir().unwrap();
        std::fs::write(
            good.path().join("result.json"),
            r#"{"total_energy": -1.0, "max_force": 0.0, "stress": [], "ionic_steps": 3}"#,
        )
        .unwrap();
        let empty = tempfile::tempdir().unwrap();

        let scheduler = Arc::new(FakeScheduler::default());
        let (manager, _store) = manager(scheduler.clone()).await;
        let ok = manager.submit(CalcKind::Relaxation, good.path(), None).await;
        let broken = manager.submit(CalcKind::Relaxation, empty.path(), None).await;
        let failed = manager.submit(CalcKind::Scf, empty.path(), None).await;
        let lost = manager.submit(CalcKind::Scf, empty.path(), None).await;

        scheduler.set(ok.job_id.as_deref().unwrap(), false, Some("COMPLETED"));
        scheduler.set(broken.job_id.as_deref().unwrap(), false, Some("COMPLETED"));
        scheduler.set(failed.job_id.as_deref().unwrap(), false, Some("TIMEOUT"));
        scheduler.set(lost.job_id.as_deref().unwrap(), false, None);

        let polled = manager
            .poll_ids(&[ok.calculation_id, broken.calculation_id, failed.calculation_id, lost.calculation_id])
            .await;
        assert_eq!(polled[0].status, JobStatus::Completed);
        assert_eq!(polled[1].status, JobStatus::Error);
        assert_eq!(polled[2].status, JobStatus::Failed);
        assert_eq!(
            polled[2].error.as_deref(),
            Some("batch job failed with state: TIMEOUT")
        );
        assert_eq!(polled[3].status, JobStatus::Unknown);

        // Absorbing states are not re-queried.
        scheduler.set(lost.job_id.as_deref().unwrap(), true, None);
        let again = manager.poll_ids(&[lost.calculation_id]).await;
        assert_eq!(again[0].status, JobStatus::Unknown);
    }

    #[tokio::test]
    async fn transient_failure_freezes_status() {
        let scheduler = Arc::new(FakeScheduler {
            fail_queue: true,
            ..Default::default()
        });
        let (manager, _store) = manager(scheduler).await;
        let job = manager.submit(CalcKind::Scf, Path::new("/tmp"), None).await;

        let polled = manager.poll_ids(&[job.calculation_id]).await;
        assert_eq!(polled[0].status, JobStatus::Submitted);
        assert!(polled[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let scheduler = Arc::new(FakeScheduler::default());
        let (manager, _store) = manager(scheduler.clone()).await;
        let job = manager.submit(CalcKind::Scf, Path::new("/tmp"), None).await;

        let first = manager.cancel(job.calculation_id).await;
        assert!(first.success);
        assert!(first.message.ends_with("cancelled"));

        let second = manager.cancel(job.calculation_id).await;
        assert!(second.success);
        assert!(second.message.contains("is not running"));
        assert_eq!(scheduler.cancelled.lock().unwrap().len(), 1);

        let unknown = manager.cancel(Uuid::new_v4()).await;
        assert!(!unknown.success);
    }

    #[tokio::test]
    async fn cancel_for_request_uses_logged_ids() {
        let scheduler = Arc::new(FakeScheduler::default());
        let (manager, store) = manager(scheduler.clone()).await;
        let request_id = Uuid::new_v4();

        // Submitted without a request link; only the log mentions it.
        let job = manager.submit(CalcKind::Scf, &PathBuf::from("/tmp"), None).await;
        store
            .append_log(&ActivityLogEntry::new(
                request_id,
                LogKind::ToolOutput,
                Some("submit_job"),
                job.to_log_value().to_string(),
            ))
            .await
            .unwrap();
        // Linked through the registry only.
        let linked = manager
            .submit(CalcKind::Nscf, &PathBuf::from("/tmp"), Some(request_id))
            .await;

        let results = manager.cancel_for_request(request_id).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.success));
        let ids: Vec<_> = results.iter().map(|r| r.calculation_id).collect();
        assert!(ids.contains(&job.calculation_id));
        assert!(ids.contains(&linked.calculation_id));
    }
}
