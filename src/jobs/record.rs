use super::model::JobStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Placeholder stored when no playbook process produced output.
pub const MISSING_STDOUT: &str = "stdout capture is missing";

/// Result fields written back at well-defined transition points.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub status: JobStatus,
    pub explanation: String,
    pub stdout: String,
    /// Arguments used, as one display string with secret arguments excluded.
    pub job_args: Vec<String>,
    pub job_env: Vec<String>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Move to `status`, stamping start/finish times on the way.
    ///
    /// Terminal states are absorbing: once reached, later transitions are
    /// ignored and `false` is returned.
    pub fn transition(&mut self, status: JobStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if status == JobStatus::Running && self.started.is_none() {
            self.started = Some(Utc::now());
        }
        if status.is_terminal() {
            self.finished = Some(Utc::now());
        }
        self.status = status;
        true
    }

    pub fn fail(&mut self, explanation: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.explanation = explanation.into();
        self.transition(JobStatus::Failed)
    }
}
