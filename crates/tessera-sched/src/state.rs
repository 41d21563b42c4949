//! Canonical job states and the information a backend query yields.
//!
//! ```text
//!   New ──run──► Pending ──► Running ──► Done
//!                   │          │  ▲      Failed
//!                   │          ▼  │      Canceled
//!                   │       Suspended
//!                   └──────────────────► Canceled / Failed
//! ```
//!
//! `Done`, `Failed` and `Canceled` are final: once a job reaches one of them
//! it never becomes active again.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backend independent job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Described but not yet submitted.
    New,
    /// Accepted by the backend, waiting for resources.
    Pending,
    Running,
    Suspended,
    Done,
    Failed,
    Canceled,
    /// The backend reported something we cannot classify.
    Unknown,
}

impl JobState {
    /// Whether no further transitions can happen.
    pub fn is_final(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Canceled)
    }

    /// Whether the monitor should keep polling this job.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobState::Pending | JobState::Running | JobState::Suspended
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobState::New => "New",
            JobState::Pending => "Pending",
            JobState::Running => "Running",
            JobState::Suspended => "Suspended",
            JobState::Done => "Done",
            JobState::Failed => "Failed",
            JobState::Canceled => "Canceled",
            JobState::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of one backend query for one job. Fields the backend did not
/// report stay `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub state: JobState,
    /// The state token as the backend printed it.
    pub native_state: Option<String>,
    pub exit_code: Option<i32>,
    pub exec_hosts: Vec<String>,
    pub created: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
}

impl JobInfo {
    pub fn new(state: JobState) -> Self {
        Self {
            state,
            native_state: None,
            exit_code: None,
            exec_hosts: Vec::new(),
            created: None,
            started: None,
            finished: None,
        }
    }

    pub fn with_native_state(mut self, token: impl Into<String>) -> Self {
        self.native_state = Some(token.into());
        self
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_exec_hosts(mut self, hosts: Vec<String>) -> Self {
        self.exec_hosts = hosts;
        self
    }
}

impl Default for JobInfo {
    fn default() -> Self {
        Self::new(JobState::Unknown)
    }
}

/// Decide the final state of a job the backend only reports as gone.
///
/// An exit code wins when there is one. Without it, a job last seen active
/// is assumed to have failed.
pub fn infer_final_state(exit_code: Option<i32>, last: JobState) -> JobState {
    match exit_code {
        Some(0) => JobState::Done,
        Some(_) => JobState::Failed,
        None if last.is_final() => last,
        None => JobState::Failed,
    }
}
