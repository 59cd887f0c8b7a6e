//! Work request state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Waiting for a concurrency slot.
    Queued,
    /// Admitted; the unit of work is executing.
    Running,
    /// The unit of work returned a result.
    Completed,
    /// The unit of work raised.
    Failed,
    /// Cancelled while queued or running.
    Cancelled,
}

impl RunStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: RunStatus) -> bool {
        use RunStatus::*;

        matches!(
            (self, target),
            (Queued, Running) | (Queued, Cancelled) |
            (Running, Completed) | (Running, Failed) | (Running, Cancelled)
        )
    }

    /// States from which `target` may be reached.
    pub fn predecessors(target: RunStatus) -> &'static [RunStatus] {
        match target {
            RunStatus::Queued => &[],
            RunStatus::Running => &[RunStatus::Queued],
            RunStatus::Completed | RunStatus::Failed => &[RunStatus::Running],
            RunStatus::Cancelled => &[RunStatus::Queued, RunStatus::Running],
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// A submitted unit of work, tracked end-to-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    pub id: Uuid,
    /// Opaque payload handed to the unit of work.
    pub description: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Present only when completed.
    pub result: Option<String>,
    /// Present only when failed or cancelled.
    pub error_message: Option<String>,
}

impl WorkRequest {
    /// Create a new queued request with a fresh id.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            status: RunStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_valid() {
        assert!(RunStatus::Queued.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Queued.can_transition_to(RunStatus::Cancelled));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Cancelled));
    }

    #[test]
    fn state_transitions_invalid() {
        assert!(!RunStatus::Queued.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::Queued.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Cancelled));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Cancelled.can_transition_to(RunStatus::Queued));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Queued));
    }

    #[test]
    fn predecessors_agree_with_transitions() {
        for target in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            for from in RunStatus::predecessors(target) {
                assert!(from.can_transition_to(target), "{from} -> {target}");
            }
        }
    }

    #[test]
    fn terminal_states() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn new_request_is_queued_without_timestamps() {
        let req = WorkRequest::new("relax Si");
        assert_eq!(req.status, RunStatus::Queued);
        assert!(req.started_at.is_none());
        assert!(req.completed_at.is_none());
    }

    #[test]
    fn status_parse_roundtrip() {
        for s in ["queued", "running", "completed", "failed", "cancelled"] {
            let status: RunStatus = s.parse().unwrap();
            assert_eq!(status.to_string(), s);
        }
        assert!("stuck".parse::<RunStatus>().is_err());
    }
}
