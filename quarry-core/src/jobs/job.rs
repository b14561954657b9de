use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::TenantId;

/// Identifier of a submitted job. Time-ordered, so sorting by id sorts
/// by submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Fresh time-ordered id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Admitted, process not started yet.
    Pending,
    /// Process running.
    Running,
    /// Exited with status 0.
    Succeeded,
    /// Exited non-zero or could not be waited on.
    Failed,
    /// Terminated by the governor.
    Killed,
}

impl JobStatus {
    /// The job will not change status again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Killed)
    }

    /// Counts against the concurrent job ceiling.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

/// Why the governor terminated a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillReason {
    /// Exceeded the maximum job age.
    MaxAge,
    /// Cancelled on request.
    Cancelled,
    /// Terminated because the governor is shutting down.
    Shutdown,
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    /// Job id.
    pub id: JobId,
    /// Owning tenant.
    pub tenant: TenantId,
    /// Human-readable description.
    pub label: String,
    /// Current status.
    pub status: JobStatus,
    /// Exit code once the process exited normally.
    pub exit_code: Option<i32>,
    /// Set when the governor requested termination.
    pub kill_reason: Option<KillReason>,
    /// OS process id while it is known.
    pub pid: Option<u32>,
    /// Admission time.
    pub submitted_at: DateTime<Utc>,
    /// Time the job reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_round_trip_through_strings() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-job".parse::<JobId>().is_err());
    }

    #[test]
    fn only_finished_statuses_are_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Killed.is_terminal());
        assert!(JobStatus::Running.is_active());
        assert!(!JobStatus::Failed.is_active());
    }
}
