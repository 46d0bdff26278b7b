use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::worker::process::Process;

pub type JobId = Uuid;

/// Exit code reported while a job is running or when it was killed by a signal.
pub const NO_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    #[default]
    None,
    Running,
    Success,
    Failed,
    Stopped,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::None => "none",
            JobState::Running => "running",
            JobState::Success => "success",
            JobState::Failed => "failed",
            JobState::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Success | JobState::Failed | JobState::Stopped
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid job state: {0}")]
pub struct ParseJobStateError(pub String);

impl FromStr for JobState {
    type Err = ParseJobStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(JobState::None),
            "running" => Ok(JobState::Running),
            "success" => Ok(JobState::Success),
            "failed" => Ok(JobState::Failed),
            "stopped" => Ok(JobState::Stopped),
            other => Err(ParseJobStateError(other.to_string())),
        }
    }
}

/// Externally visible status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmdStatus {
    pub process_id: i64,
    pub state: JobState,
    /// [`NO_EXIT_CODE`] while running or when no exit code exists.
    pub exit_code: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl CmdStatus {
    pub fn running(process_id: i64, started_at: DateTime<Utc>) -> Self {
        Self {
            process_id,
            state: JobState::Running,
            exit_code: NO_EXIT_CODE,
            started_at,
            finished_at: None,
        }
    }
}

/// One managed OS process registered with the worker.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub args: Vec<String>,
    pub status: CmdStatus,
    pub(crate) process: Arc<Process>,
}

impl Job {
    pub(crate) fn new(
        id: JobId,
        command: String,
        args: Vec<String>,
        process: Arc<Process>,
    ) -> Self {
        let process_id = process.pid().map(i64::from).unwrap_or_default();
        Self {
            id,
            command,
            args,
            status: CmdStatus::running(process_id, Utc::now()),
            process,
        }
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            command: self.command.clone(),
            args: self.args.clone(),
            status: self.status,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub command: String,
    pub args: Vec<String>,
    pub status: CmdStatus,
}
