//! In-process backend that runs nothing.
//!
//! Useful for tests and dry runs of workflow code. Jobs "run" on the tokio
//! clock: `sleep N` takes N seconds, `false` fails with exit code 1 and
//! anything else completes immediately with exit code 0.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use tokio::time::Instant;

use crate::adaptor::common::{command_line, prologue};
use crate::adaptor::{Capabilities, SchedulerAdaptor};
use crate::config::BackendConfig;
use crate::description::JobDescription;
use crate::error::{SchedError, SchedResult};
use crate::state::{JobInfo, JobState};

#[derive(Debug, Clone)]
struct SimulatedJob {
    runtime: Duration,
    exit_code: i32,
    created: DateTime<Utc>,
    /// Run time accumulated before the last suspend.
    banked: Duration,
    /// Set while the job runs; cleared on suspend.
    resumed_at: Option<Instant>,
    canceled: bool,
}

impl SimulatedJob {
    fn elapsed(&self) -> Duration {
        self.banked + self.resumed_at.map(|t| t.elapsed()).unwrap_or_default()
    }

    fn state(&self) -> JobState {
        if self.canceled {
            JobState::Canceled
        } else if self.elapsed() >= self.runtime {
            if self.exit_code == 0 {
                JobState::Done
            } else {
                JobState::Failed
            }
        } else if self.resumed_at.is_none() {
            JobState::Suspended
        } else {
            JobState::Running
        }
    }

    fn info(&self) -> JobInfo {
        let state = self.state();
        let mut info = JobInfo::new(state)
            .with_native_state(state.name())
            .with_exec_hosts(vec!["localhost".to_string()]);
        info.created = Some(self.created);
        info.started = Some(self.created);
        if matches!(state, JobState::Done | JobState::Failed) {
            info.exit_code = Some(self.exit_code);
            info.finished = chrono::Duration::from_std(self.runtime)
                .ok()
                .map(|d| self.created + d);
        }
        info
    }
}

/// Run time and exit code a description simulates.
fn simulate(desc: &JobDescription) -> SchedResult<(Duration, i32)> {
    let program = Path::new(&desc.executable)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    match program {
        "sleep" => {
            let secs = desc
                .arguments
                .first()
                .and_then(|a| a.parse::<f64>().ok())
                .filter(|s| s.is_finite() && *s >= 0.0)
                .unwrap_or(0.0);
            let runtime = Duration::try_from_secs_f64(secs)
                .map_err(|e| SchedError::Parameter(format!("sleep {secs}: {e}")))?;
            Ok((runtime, 0))
        }
        "false" => Ok((Duration::ZERO, 1)),
        _ => Ok((Duration::ZERO, 0)),
    }
}

/// Backend with no batch system behind it.
#[derive(Default)]
pub struct NoopAdaptor {
    next_id: AtomicU64,
    jobs: Mutex<FxHashMap<String, SimulatedJob>>,
    backend: BackendConfig,
}

impl NoopAdaptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render scripts with site settings such as `modules`.
    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    fn jobs(&self) -> MutexGuard<'_, FxHashMap<String, SimulatedJob>> {
        self.jobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn update<F>(&self, native_id: &str, f: F) -> SchedResult<()>
    where
        F: FnOnce(&mut SimulatedJob) -> SchedResult<()>,
    {
        let mut jobs = self.jobs();
        let job = jobs
            .get_mut(native_id)
            .ok_or_else(|| SchedError::JobNotFound(native_id.to_string()))?;
        f(job)
    }
}

#[async_trait]
impl SchedulerAdaptor for NoopAdaptor {
    fn name(&self) -> &str {
        "noop"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            suspend: true,
            bulk_query: false,
            accounting: false,
        }
    }

    fn generate_script(&self, desc: &JobDescription) -> SchedResult<String> {
        desc.validate()?;
        Ok(format!(
            "#!/bin/sh\n{}{}\n",
            prologue(desc, &self.backend),
            command_line(desc)
        ))
    }

    async fn submit(&self, desc: &JobDescription) -> SchedResult<String> {
        desc.validate()?;
        let (runtime, exit_code) = simulate(desc)?;
        let id = (self.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string();
        self.jobs().insert(
            id.clone(),
            SimulatedJob {
                runtime,
                exit_code,
                created: Utc::now(),
                banked: Duration::ZERO,
                resumed_at: Some(Instant::now()),
                canceled: false,
            },
        );
        tracing::debug!("noop job {} runs for {:?}", id, runtime);
        Ok(id)
    }

    async fn fetch_info(&self, native_id: &str, _last: &JobInfo) -> SchedResult<Option<JobInfo>> {
        Ok(self.jobs().get(native_id).map(SimulatedJob::info))
    }

    fn translate_state(&self, token: &str, _exit_code: Option<i32>) -> JobState {
        match token {
            "Pending" => JobState::Pending,
            "Running" => JobState::Running,
            "Suspended" => JobState::Suspended,
            "Done" => JobState::Done,
            "Failed" => JobState::Failed,
            "Canceled" => JobState::Canceled,
            _ => JobState::Unknown,
        }
    }

    async fn cancel(&self, native_id: &str) -> SchedResult<()> {
        self.update(native_id, |job| {
            if !job.state().is_final() {
                job.canceled = true;
            }
            Ok(())
        })
    }

    async fn suspend(&self, native_id: &str) -> SchedResult<()> {
        self.update(native_id, |job| {
            if job.state() != JobState::Running {
                return Err(SchedError::incorrect_state("Running", job.state()));
            }
            job.banked = job.elapsed();
            job.resumed_at = None;
            Ok(())
        })
    }

    async fn resume(&self, native_id: &str) -> SchedResult<()> {
        self.update(native_id, |job| {
            if job.state() != JobState::Suspended {
                return Err(SchedError::incorrect_state("Suspended", job.state()));
            }
            job.resumed_at = Some(Instant::now());
            Ok(())
        })
    }

    async fn list(&self) -> SchedResult<Vec<String>> {
        let mut ids: Vec<String> = self.jobs().keys().cloned().collect();
        ids.sort_by_key(|id| id.parse::<u64>().unwrap_or(u64::MAX));
        Ok(ids)
    }
}
