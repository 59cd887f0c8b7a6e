//! External batch job records.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::result::{CalcKind, CalcResult};

/// Status of a batch job as last observed from the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Submitted,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// The scheduler could not say what happened to the job.
    Unknown,
    /// Results could not be read or parsed.
    Error,
}

impl JobStatus {
    /// Whether polling may still change this status.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Submitted | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(Self::Submitted),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "unknown" => Ok(Self::Unknown),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// A batch job tracked in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalJob {
    /// Engine-minted id. This is what appears in activity logs.
    pub calculation_id: Uuid,
    /// Request whose unit of work submitted the job, when known.
    pub request_id: Option<Uuid>,
    /// Scheduler-assigned id; `None` when submission failed.
    pub job_id: Option<String>,
    pub calc_kind: CalcKind,
    pub work_path: PathBuf,
    pub status: JobStatus,
    pub result: Option<CalcResult>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExternalJob {
    pub fn new(calc_kind: CalcKind, work_path: PathBuf, request_id: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            calculation_id: Uuid::new_v4(),
            request_id,
            job_id: None,
            calc_kind,
            work_path,
            status: JobStatus::Submitted,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// JSON view with typed result fields merged in at the top level.
    pub fn to_log_value(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert(
            "calculation_id".into(),
            serde_json::Value::String(self.calculation_id.to_string()),
        );
        map.insert(
            "job_id".into(),
            self.job_id
                .clone()
                .map(serde_json::Value::String)
                .unwrap_or(serde_json::Value::Null),
        );
        map.insert(
            "calc_type".into(),
            serde_json::Value::String(self.calc_kind.to_string()),
        );
        map.insert(
            "work_path".into(),
            serde_json::Value::String(self.work_path.display().to_string()),
        );
        map.insert(
            "status".into(),
            serde_json::Value::String(self.status.to_string()),
        );
        if let Some(error) = &self.error {
            map.insert("error".into(), serde_json::Value::String(error.clone()));
        }
        if let Some(result) = &self.result {
            for (k, v) in result.fields() {
                map.insert(k, v);
            }
        }
        serde_json::Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::result::BandGap;

    #[test]
    fn active_statuses() {
        assert!(JobStatus::Submitted.is_active());
        assert!(JobStatus::Running.is_active());
        for s in [
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
            JobStatus::Unknown,
            JobStatus::Error,
        ] {
            assert!(!s.is_active(), "{s} should be absorbing");
        }
    }

    #[test]
    fn log_value_merges_result_fields() {
        let mut job = ExternalJob::new(CalcKind::Scf, PathBuf::from("/tmp/si"), None);
        job.job_id = Some("4242".into());
        job.status = JobStatus::Completed;
        job.result = Some(CalcResult::Scf {
            total_energy: -10.8,
            efermi: 5.6,
            band_gap: BandGap {
                energy: 0.6,
                direct: false,
                transition: None,
            },
            is_metal: false,
        });

        let value = job.to_log_value();
        assert_eq!(value["status"], "completed");
        assert_eq!(value["job_id"], "4242");
        assert_eq!(value["total_energy"], -10.8);
        assert_eq!(value["calculation_id"], job.calculation_id.to_string());
    }
}
