//! Groups of jobs run and waited on together.

use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;

use crate::error::SchedResult;
use crate::handle::JobHandle;
use crate::state::JobState;

/// An ordered set of job handles.
///
/// Operations fan out to every job concurrently and report per-job results
/// in insertion order.
#[derive(Debug, Default)]
pub struct JobContainer {
    jobs: Vec<JobHandle>,
}

impl JobContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, job: JobHandle) {
        self.jobs.push(job);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn jobs(&self) -> &[JobHandle] {
        &self.jobs
    }

    pub fn jobs_mut(&mut self) -> &mut [JobHandle] {
        &mut self.jobs
    }

    /// Submit every job.
    pub async fn run_all(&mut self) -> Vec<SchedResult<()>> {
        join_all(self.jobs.iter_mut().map(JobHandle::run)).await
    }

    /// Cancel every job.
    pub async fn cancel_all(&self) -> Vec<SchedResult<()>> {
        join_all(self.jobs.iter().map(JobHandle::cancel)).await
    }

    /// Wait for every job against one shared deadline. Returns whether all
    /// of them reached a final state.
    pub async fn wait_all(&self, timeout: Option<Duration>) -> SchedResult<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let results = join_all(self.jobs.iter().map(|job| async move {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            job.wait(remaining).await
        }))
        .await;

        let mut all_final = true;
        for result in results {
            all_final &= result?;
        }
        Ok(all_final)
    }

    /// Current state of every job.
    pub async fn states(&self) -> SchedResult<Vec<JobState>> {
        let mut states = Vec::with_capacity(self.jobs.len());
        for job in &self.jobs {
            states.push(job.state().await?);
        }
        Ok(states)
    }
}

impl Extend<JobHandle> for JobContainer {
    fn extend<I: IntoIterator<Item = JobHandle>>(&mut self, iter: I) {
        self.jobs.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::adaptor::AdaptorRegistry;
    use crate::config::ServiceConfig;
    use crate::description::JobDescription;
    use crate::resource::ResourceUrl;
    use crate::service::JobService;
    use crate::shell::ScriptedShell;

    fn service() -> JobService {
        JobService::with_shell(
            ResourceUrl::parse("noop://localhost").unwrap(),
            ServiceConfig::default()
                .with_monitor_interval(Duration::from_millis(200))
                .with_wait_poll_interval(Duration::from_millis(100)),
            &AdaptorRegistry::with_builtins(),
            Arc::new(ScriptedShell::new()),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_and_wait_all() {
        let service = service();
        let mut container = JobContainer::new();
        for secs in ["1", "3"] {
            container.add(
                service
                    .create_job(JobDescription::new("sleep").with_arguments([secs]))
                    .unwrap(),
            );
        }
        container.add(service.create_job(JobDescription::new("false")).unwrap());
        assert_eq!(container.len(), 3);

        let results = container.run_all().await;
        assert!(results.iter().all(Result::is_ok));
        assert!(container.wait_all(Some(Duration::from_secs(10))).await.unwrap());
        assert_eq!(
            container.states().await.unwrap(),
            vec![JobState::Done, JobState::Done, JobState::Failed]
        );
        service.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_all_times_out_and_cancel_all() {
        let service = service();
        let mut container = JobContainer::new();
        container.extend((0..2).map(|_| {
            service
                .create_job(JobDescription::new("sleep").with_arguments(["600"]))
                .unwrap()
        }));
        container.run_all().await;

        assert!(!container.wait_all(Some(Duration::from_secs(1))).await.unwrap());
        let results = container.cancel_all().await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(
            container.states().await.unwrap(),
            vec![JobState::Canceled, JobState::Canceled]
        );
        service.close().await.unwrap();
    }
}
