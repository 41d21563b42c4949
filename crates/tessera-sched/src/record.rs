//! Cached per-job state kept by a [`JobService`](crate::JobService).

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::config::CancelPolicy;
use crate::description::JobDescription;
use crate::job_id::JobId;
use crate::state::{JobInfo, JobState};

/// What the service currently knows about one submitted job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub id: JobId,
    /// `None` for jobs picked up through reconnect.
    pub description: Option<JobDescription>,
    pub state: JobState,
    pub native_state: Option<String>,
    pub exit_code: Option<i32>,
    pub exec_hosts: Vec<String>,
    pub created: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    /// Neither the live queue nor accounting knows the job any more.
    pub gone: bool,
    /// Canceled locally; the monitor polls once more to confirm.
    #[serde(skip)]
    pub(crate) reconcile: bool,
}

impl JobRecord {
    /// Record of a job that was just accepted by the backend.
    pub(crate) fn submitted(id: JobId, description: JobDescription) -> Self {
        Self {
            id,
            description: Some(description),
            state: JobState::Pending,
            native_state: None,
            exit_code: None,
            exec_hosts: Vec::new(),
            created: Some(Utc::now()),
            started: None,
            finished: None,
            gone: false,
            reconcile: false,
        }
    }

    /// Record of an existing job found through reconnect.
    pub(crate) fn reconnected(id: JobId, info: JobInfo) -> Self {
        let state = match info.state {
            JobState::Unknown | JobState::New => JobState::Pending,
            state => state,
        };
        Self {
            id,
            description: None,
            state,
            native_state: info.native_state,
            exit_code: info.exit_code,
            exec_hosts: info.exec_hosts,
            created: info.created,
            started: info.started,
            finished: info.finished,
            gone: false,
            reconcile: false,
        }
    }

    /// The last known state in the form adaptors take as a hint.
    pub(crate) fn last_info(&self) -> JobInfo {
        let mut info = JobInfo::new(self.state).with_exit_code(self.exit_code);
        info.native_state = self.native_state.clone();
        info
    }

    /// Whether the monitor still has work to do for this job.
    pub(crate) fn needs_poll(&self) -> bool {
        self.reconcile || (self.state.is_active() && !self.gone)
    }

    /// Merge a fetch result. Returns `(old, new)` when the state changed.
    ///
    /// A final state is never left again, with one exception: under
    /// [`CancelPolicy::MonitorAuthoritative`] a locally set `Canceled` gives
    /// way to a different final state the backend reports on the
    /// confirmation poll.
    pub(crate) fn apply(
        &mut self,
        info: JobInfo,
        policy: CancelPolicy,
    ) -> Option<(JobState, JobState)> {
        let old = self.state;
        let reconciling = std::mem::take(&mut self.reconcile);
        self.gone = false;

        let new = if reconciling {
            if policy == CancelPolicy::MonitorAuthoritative
                && info.state.is_final()
                && info.state != JobState::Canceled
            {
                warn!(
                    "Backend reports {} for canceled job {}, keeping the backend's state",
                    info.state, self.id
                );
                info.state
            } else {
                old
            }
        } else if old.is_final() || info.state == JobState::Unknown {
            old
        } else {
            info.state
        };

        if let Some(token) = info.native_state {
            self.native_state = Some(token);
        }
        self.exit_code = info.exit_code.or(self.exit_code);
        if !info.exec_hosts.is_empty() {
            self.exec_hosts = info.exec_hosts;
        }
        self.created = self.created.or(info.created);
        self.started = info.started.or(self.started);
        self.finished = info.finished.or(self.finished);

        if new == old {
            return None;
        }
        self.state = new;
        self.stamp(new);
        Some((old, new))
    }

    /// Set a state the service decided locally (cancel, suspend, resume).
    pub(crate) fn set_state(&mut self, new: JobState) -> Option<(JobState, JobState)> {
        let old = self.state;
        if old == new || old.is_final() {
            return None;
        }
        self.state = new;
        self.stamp(new);
        Some((old, new))
    }

    /// Fill timestamps the backend did not report with the time the
    /// transition was observed.
    fn stamp(&mut self, new: JobState) {
        let now = Utc::now();
        if matches!(new, JobState::Running | JobState::Suspended) && self.started.is_none() {
            self.started = Some(now);
        }
        if new.is_final() && self.finished.is_none() {
            self.finished = Some(now);
        }
    }
}
