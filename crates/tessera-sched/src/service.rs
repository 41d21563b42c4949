//! The job service: one backend, one shell, one job table, one monitor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::adaptor::{AdaptorContext, AdaptorRegistry, SchedulerAdaptor};
use crate::config::ServiceConfig;
use crate::description::JobDescription;
use crate::error::{SchedError, SchedResult};
use crate::handle::JobHandle;
use crate::job_id::JobId;
use crate::monitor::{self, MonitorHandle};
use crate::record::JobRecord;
use crate::resource::ResourceUrl;
use crate::shell::{self, RemoteShell, SerialShell};
use crate::state::{JobInfo, JobState};

/// Capacity of the state change broadcast channel.
const EVENT_CAPACITY: usize = 256;

/// Callback invoked with `(job, old state, new state)`.
pub type StateCallback = Arc<dyn Fn(&JobId, JobState, JobState) + Send + Sync>;

/// A state transition, as sent to [`JobService::subscribe`] receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub job_id: JobId,
    pub old: JobState,
    pub new: JobState,
}

/// State shared between the service, its handles and the monitor task.
pub(crate) struct ServiceInner {
    pub(crate) url: ResourceUrl,
    pub(crate) config: Arc<ServiceConfig>,
    pub(crate) adaptor: Arc<dyn SchedulerAdaptor>,
    pub(crate) shell: Arc<dyn RemoteShell>,
    pub(crate) table: tokio::sync::Mutex<FxHashMap<JobId, JobRecord>>,
    callbacks: Mutex<FxHashMap<JobId, Vec<StateCallback>>>,
    events: broadcast::Sender<StateChange>,
    monitor: Mutex<Option<MonitorHandle>>,
    closed: AtomicBool,
}

impl ServiceInner {
    pub(crate) fn check_open(&self) -> SchedResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SchedError::incorrect_state("open service", "closed service"));
        }
        Ok(())
    }

    /// The URL part of job ids this service issues.
    pub(crate) fn job_id(&self, native: impl Into<String>) -> JobId {
        JobId::new(self.url.to_string(), native)
    }

    pub(crate) async fn record(&self, id: &JobId) -> SchedResult<JobRecord> {
        self.check_open()?;
        self.table
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SchedError::JobNotFound(id.to_string()))
    }

    pub(crate) fn add_callback(&self, id: &JobId, callback: StateCallback) {
        lock(&self.callbacks)
            .entry(id.clone())
            .or_default()
            .push(callback);
    }

    /// Fire per-job callbacks and the broadcast. Never called with the job
    /// table locked.
    pub(crate) fn notify(&self, id: &JobId, old: JobState, new: JobState) {
        info!("Job {}: {} -> {}", id, old, new);
        let callbacks = lock(&self.callbacks).get(id).cloned().unwrap_or_default();
        for callback in callbacks {
            callback(id, old, new);
        }
        // no receivers is fine
        let _ = self.events.send(StateChange {
            job_id: id.clone(),
            old,
            new,
        });
    }

    /// Start the monitor unless one is already running.
    pub(crate) fn ensure_monitor(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut monitor = lock(&self.monitor);
        if monitor.as_ref().is_none_or(MonitorHandle::is_finished) {
            *monitor = Some(MonitorHandle::spawn(self));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Entry point for submitting and tracking jobs on one resource.
///
/// ```no_run
/// use tessera_sched::{AdaptorRegistry, JobDescription, JobService, ServiceConfig};
///
/// # async fn demo() -> tessera_sched::SchedResult<()> {
/// let registry = AdaptorRegistry::with_builtins();
/// let service = JobService::new("slurm+ssh://login.cluster", ServiceConfig::default(), &registry)?;
///
/// let mut job = service.create_job(JobDescription::new("/bin/hostname"))?;
/// job.run().await?;
/// job.wait(None).await?;
/// println!("{} finished as {}", job.id().unwrap(), job.state().await?);
///
/// service.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct JobService {
    inner: Arc<ServiceInner>,
}

impl JobService {
    /// Open a service for `url`, connecting a shell as the URL's transport
    /// says.
    pub fn new(url: &str, config: ServiceConfig, registry: &AdaptorRegistry) -> SchedResult<Self> {
        let url = ResourceUrl::parse(url)?;
        let shell = shell::connect(&url, &config);
        Self::build(url, config, registry, shell)
    }

    /// Open a service on an existing shell. The shell is serialized; it may
    /// still be shared with other code.
    pub fn with_shell(
        url: ResourceUrl,
        config: ServiceConfig,
        registry: &AdaptorRegistry,
        shell: Arc<dyn RemoteShell>,
    ) -> SchedResult<Self> {
        Self::build(url, config, registry, Arc::new(SerialShell::new(shell)))
    }

    fn build(
        url: ResourceUrl,
        config: ServiceConfig,
        registry: &AdaptorRegistry,
        shell: Arc<dyn RemoteShell>,
    ) -> SchedResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let adaptor = registry.create(AdaptorContext {
            url: url.clone(),
            config: config.clone(),
            shell: shell.clone(),
        })?;
        info!("Job service for {} uses the {} adaptor", url, adaptor.name());

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(ServiceInner {
                url,
                config,
                adaptor,
                shell,
                table: tokio::sync::Mutex::new(FxHashMap::default()),
                callbacks: Mutex::new(FxHashMap::default()),
                events,
                monitor: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn url(&self) -> &ResourceUrl {
        &self.inner.url
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn adaptor(&self) -> &dyn SchedulerAdaptor {
        self.inner.adaptor.as_ref()
    }

    /// A handle for a new job. Nothing is submitted until
    /// [`JobHandle::run`].
    pub fn create_job(&self, description: JobDescription) -> SchedResult<JobHandle> {
        self.inner.check_open()?;
        Ok(JobHandle::new(self.inner.clone(), description))
    }

    /// Ids of the user's jobs the backend currently knows.
    pub async fn list(&self) -> SchedResult<Vec<JobId>> {
        self.inner.check_open()?;
        let ids = self.inner.adaptor.list().await?;
        Ok(ids.into_iter().map(|id| self.inner.job_id(id)).collect())
    }

    /// Snapshot of every job this service tracks.
    pub async fn jobs(&self) -> SchedResult<Vec<JobRecord>> {
        self.inner.check_open()?;
        let mut records: Vec<JobRecord> = self.inner.table.lock().await.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    /// Reconnect to a job by id, tracked or not.
    pub async fn get_job(&self, id: &str) -> SchedResult<JobHandle> {
        self.inner.check_open()?;
        let id = JobId::parse(id)?;
        let own_url = self.inner.url.to_string();
        if id.url() != own_url {
            return Err(SchedError::Parameter(format!(
                "job {id} does not belong to {own_url}"
            )));
        }

        if let Some(record) = self.inner.table.lock().await.get(&id) {
            let description = record.description.clone();
            let handle = JobHandle::attached(self.inner.clone(), id, description);
            self.inner.ensure_monitor();
            return Ok(handle);
        }

        let info = self
            .inner
            .adaptor
            .fetch_info(id.native(), &JobInfo::default())
            .await?
            .ok_or_else(|| SchedError::JobNotFound(id.to_string()))?;
        debug!("Reconnected to job {} in state {}", id, info.state);
        let record = JobRecord::reconnected(id.clone(), info);
        self.inner
            .table
            .lock()
            .await
            .entry(id.clone())
            .or_insert(record);
        self.inner.ensure_monitor();
        Ok(JobHandle::attached(self.inner.clone(), id, None))
    }

    /// Receive every state change of every job of this service.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.inner.events.subscribe()
    }

    /// Poll all active jobs now instead of waiting for the monitor.
    pub async fn refresh(&self) -> SchedResult<()> {
        self.inner.check_open()?;
        monitor::poll_once(&self.inner).await;
        Ok(())
    }

    /// Stop the background monitor and wait for it to exit. The next
    /// `run`, `wait` or `get_job` starts a new one.
    pub async fn stop_monitor(&self) {
        let monitor = lock(&self.inner.monitor).take();
        if let Some(monitor) = monitor {
            monitor.shutdown(self.inner.config.monitor_join_timeout()).await;
        }
    }

    pub fn is_monitoring(&self) -> bool {
        lock(&self.inner.monitor)
            .as_ref()
            .is_some_and(|m| !m.is_finished())
    }

    /// Stop the monitor, forget all jobs and release the shell. Every later
    /// call fails with [`SchedError::IncorrectState`].
    pub async fn close(&self) -> SchedResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(SchedError::incorrect_state("open service", "closed service"));
        }
        self.stop_monitor().await;
        self.inner.table.lock().await.clear();
        lock(&self.inner.callbacks).clear();
        self.inner.shell.finalize(false).await?;
        info!("Job service for {} closed", self.inner.url);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::shell::ScriptedShell;

    fn noop_service() -> JobService {
        JobService::with_shell(
            ResourceUrl::parse("noop://localhost").unwrap(),
            ServiceConfig::default(),
            &AdaptorRegistry::with_builtins(),
            Arc::new(ScriptedShell::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_unknown_scheme() {
        let result = JobService::with_shell(
            ResourceUrl::parse("gridway://localhost").unwrap(),
            ServiceConfig::default(),
            &AdaptorRegistry::with_builtins(),
            Arc::new(ScriptedShell::new()),
        );
        assert!(matches!(result, Err(SchedError::UnknownBackend(_))));
    }

    #[tokio::test]
    async fn test_get_job_checks_url() {
        let service = noop_service();
        let err = service.get_job("[slurm://other]-[1]").await.unwrap_err();
        assert!(matches!(err, SchedError::Parameter(_)));
        let err = service.get_job("not an id").await.unwrap_err();
        assert!(matches!(err, SchedError::Parameter(_)));
        let err = service.get_job("[noop://localhost]-[77]").await.unwrap_err();
        assert!(matches!(err, SchedError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_close_twice() {
        let service = noop_service();
        service.close().await.unwrap();
        assert!(service.is_closed());
        assert!(matches!(
            service.close().await,
            Err(SchedError::IncorrectState { .. })
        ));
        assert!(service.create_job(JobDescription::new("true")).is_err());
        assert!(service.jobs().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_restarts_on_demand() {
        let service = noop_service();
        assert!(!service.is_monitoring());
        let mut job = service
            .create_job(JobDescription::new("sleep").with_arguments(["1"]))
            .unwrap();
        job.run().await.unwrap();
        assert!(service.is_monitoring());

        service.stop_monitor().await;
        assert!(!service.is_monitoring());
        assert!(job.wait(Some(Duration::from_secs(60))).await.unwrap());
        assert!(service.is_monitoring());
        service.close().await.unwrap();
        assert!(!service.is_monitoring());
    }

    #[tokio::test]
    async fn test_subscribe_sees_submission() {
        let service = noop_service();
        let mut events = service.subscribe();
        let mut job = service.create_job(JobDescription::new("true")).unwrap();
        job.run().await.unwrap();
        let change = events.recv().await.unwrap();
        assert_eq!(change.old, JobState::New);
        assert_eq!(change.new, JobState::Pending);
        assert_eq!(Some(&change.job_id), job.id());
        service.close().await.unwrap();
    }
}
