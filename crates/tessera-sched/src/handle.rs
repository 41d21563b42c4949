//! Per-job lifecycle handle.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CancelPolicy;
use crate::description::JobDescription;
use crate::error::{SchedError, SchedResult};
use crate::job_id::JobId;
use crate::record::JobRecord;
use crate::service::{ServiceInner, StateCallback};
use crate::state::JobState;

/// A job created by a [`JobService`](crate::JobService).
///
/// ```text
/// New ─run─► Pending ─► Running ─► Done | Failed | Canceled
///                          ▲ │
///                   resume │ ▼ suspend
///                       Suspended
/// ```
///
/// Before [`run`](Self::run) the job exists only locally. Accessors read the
/// service's cached record, which the monitor keeps current.
pub struct JobHandle {
    inner: Arc<ServiceInner>,
    description: Option<JobDescription>,
    id: Option<JobId>,
    /// Callbacks registered before the job had an id.
    pending_callbacks: Vec<StateCallback>,
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl JobHandle {
    pub(crate) fn new(inner: Arc<ServiceInner>, description: JobDescription) -> Self {
        Self {
            inner,
            description: Some(description),
            id: None,
            pending_callbacks: Vec::new(),
        }
    }

    /// Handle for a job that is already in the service's table.
    pub(crate) fn attached(
        inner: Arc<ServiceInner>,
        id: JobId,
        description: Option<JobDescription>,
    ) -> Self {
        Self {
            inner,
            description,
            id: Some(id),
            pending_callbacks: Vec::new(),
        }
    }

    /// `None` until the job was submitted.
    pub fn id(&self) -> Option<&JobId> {
        self.id.as_ref()
    }

    /// `None` for jobs obtained through reconnect.
    pub fn description(&self) -> Option<&JobDescription> {
        self.description.as_ref()
    }

    /// Stage input files and submit the job.
    ///
    /// Only valid for a new job. If staging or submission fails the job stays
    /// `New` and the service keeps no record of it.
    pub async fn run(&mut self) -> SchedResult<()> {
        self.inner.check_open()?;
        if let Some(id) = &self.id {
            let state = self.inner.record(id).await?.state;
            return Err(SchedError::incorrect_state("New", state));
        }
        let Some(desc) = self.description.as_ref() else {
            return Err(SchedError::Internal("job handle has neither id nor description".into()));
        };
        desc.validate()?;

        for directive in desc.stage_in() {
            let remote = desc.resolve_path(&directive.remote);
            self.inner
                .shell
                .stage_to_remote(Path::new(&directive.local), &remote, directive.op.is_append())
                .await?;
            debug!("Staged in {}", directive);
        }

        let native = self.inner.adaptor.submit(desc).await?;
        let id = self.inner.job_id(native);
        self.inner
            .table
            .lock()
            .await
            .insert(id.clone(), JobRecord::submitted(id.clone(), desc.clone()));
        for callback in self.pending_callbacks.drain(..) {
            self.inner.add_callback(&id, callback);
        }
        info!("Job {} submitted ({})", id, desc.display_name());
        self.id = Some(id.clone());

        self.inner.notify(&id, JobState::New, JobState::Pending);
        self.inner.ensure_monitor();
        Ok(())
    }

    /// Wait until the job reaches a final state.
    ///
    /// `None` waits indefinitely, `Some(Duration::ZERO)` checks once. Returns
    /// whether the job is final. A job the backend lost track of is reported
    /// as not final right away, since no further update can arrive.
    pub async fn wait(&self, timeout: Option<Duration>) -> SchedResult<bool> {
        let id = self.require_id("wait")?;
        self.inner.ensure_monitor();

        let deadline = timeout.map(|t| Instant::now() + t);
        let poll = self.inner.config.wait_poll_interval();
        loop {
            let record = self.inner.record(id).await?;
            if record.state.is_final() {
                return Ok(true);
            }
            if record.gone {
                warn!("Job {} is gone in state {}, stop waiting", id, record.state);
                return Ok(false);
            }
            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    poll.min(deadline - now)
                }
                None => poll,
            };
            tokio::time::sleep(pause).await;
        }
    }

    /// Cancel the job. A job that is already final is left alone.
    pub async fn cancel(&self) -> SchedResult<()> {
        let id = self.require_id("cancel")?;
        let state = self.inner.record(id).await?.state;
        if state.is_final() {
            debug!("Job {} is already {}, nothing to cancel", id, state);
            return Ok(());
        }

        match self.inner.adaptor.cancel(id.native()).await {
            Ok(()) => {}
            // finished between our last poll and now; the confirmation poll
            // below sorts out the real state
            Err(SchedError::JobNotFound(_)) => {
                debug!("Backend no longer knows job {} while canceling", id);
            }
            Err(e) => return Err(e),
        }

        let change = {
            let mut table = self.inner.table.lock().await;
            let record = table
                .get_mut(id)
                .ok_or_else(|| SchedError::JobNotFound(id.to_string()))?;
            let change = record.set_state(JobState::Canceled);
            if change.is_some() {
                record.reconcile =
                    self.inner.config.cancel_policy == CancelPolicy::MonitorAuthoritative;
            }
            change
        };
        if let Some((old, new)) = change {
            self.inner.notify(id, old, new);
        }
        Ok(())
    }

    /// Suspend a running job.
    pub async fn suspend(&self) -> SchedResult<()> {
        self.toggle(JobState::Running, JobState::Suspended).await
    }

    /// Resume a suspended job.
    pub async fn resume(&self) -> SchedResult<()> {
        self.toggle(JobState::Suspended, JobState::Running).await
    }

    async fn toggle(&self, from: JobState, to: JobState) -> SchedResult<()> {
        let id = self.require_id(if to == JobState::Suspended {
            "suspend"
        } else {
            "resume"
        })?;
        if !self.inner.adaptor.capabilities().suspend {
            return Err(SchedError::NotSupported(format!(
                "{} cannot suspend or resume jobs",
                self.inner.adaptor.name()
            )));
        }
        let state = self.inner.record(id).await?.state;
        if state != from {
            return Err(SchedError::incorrect_state(from.name(), state));
        }

        if to == JobState::Suspended {
            self.inner.adaptor.suspend(id.native()).await?;
        } else {
            self.inner.adaptor.resume(id.native()).await?;
        }

        let change = {
            let mut table = self.inner.table.lock().await;
            table.get_mut(id).and_then(|record| record.set_state(to))
        };
        if let Some((old, new)) = change {
            self.inner.notify(id, old, new);
        }
        Ok(())
    }

    /// Register a callback for this job's state changes.
    pub fn on_state_change<F>(&mut self, callback: F)
    where
        F: Fn(&JobId, JobState, JobState) + Send + Sync + 'static,
    {
        let callback: StateCallback = Arc::new(callback);
        match &self.id {
            Some(id) => self.inner.add_callback(id, callback),
            None => self.pending_callbacks.push(callback),
        }
    }

    /// Current state; `New` before [`run`](Self::run).
    pub async fn state(&self) -> SchedResult<JobState> {
        Ok(self
            .record()
            .await?
            .map(|rec| rec.state)
            .unwrap_or(JobState::New))
    }

    pub async fn exit_code(&self) -> SchedResult<Option<i32>> {
        Ok(self.record().await?.and_then(|rec| rec.exit_code))
    }

    pub async fn execution_hosts(&self) -> SchedResult<Vec<String>> {
        Ok(self
            .record()
            .await?
            .map(|rec| rec.exec_hosts)
            .unwrap_or_default())
    }

    pub async fn created(&self) -> SchedResult<Option<DateTime<Utc>>> {
        Ok(self.record().await?.and_then(|rec| rec.created))
    }

    pub async fn started(&self) -> SchedResult<Option<DateTime<Utc>>> {
        Ok(self.record().await?.and_then(|rec| rec.started))
    }

    pub async fn finished(&self) -> SchedResult<Option<DateTime<Utc>>> {
        Ok(self.record().await?.and_then(|rec| rec.finished))
    }

    /// Whether the backend has lost track of the job.
    pub async fn is_gone(&self) -> SchedResult<bool> {
        Ok(self.record().await?.is_some_and(|rec| rec.gone))
    }

    /// Snapshot of the cached record; `None` before [`run`](Self::run).
    pub async fn record(&self) -> SchedResult<Option<JobRecord>> {
        self.inner.check_open()?;
        match &self.id {
            Some(id) => self.inner.record(id).await.map(Some),
            None => Ok(None),
        }
    }

    fn require_id(&self, operation: &str) -> SchedResult<&JobId> {
        self.inner.check_open()?;
        self.id.as_ref().ok_or_else(|| SchedError::IncorrectState {
            expected: format!("a submitted job to {operation}"),
            found: JobState::New.to_string(),
        })
    }
}
