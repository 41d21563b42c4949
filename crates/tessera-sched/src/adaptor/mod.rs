//! Scheduler adaptors.
//!
//! An adaptor bundles everything backend specific behind one trait:
//!
//! | Method             | Role                                             |
//! |--------------------|--------------------------------------------------|
//! | `generate_script`  | render a [`JobDescription`] as a batch script    |
//! | `submit`           | stage the script, run the submit command         |
//! | `fetch_info`       | query the live queue, fall back to accounting    |
//! | `translate_state`  | map a native state token onto [`JobState`]       |
//! | `cancel`           | remove a job                                     |
//! | `suspend`/`resume` | optional, see [`Capabilities`]                   |
//! | `list`             | native ids of the user's jobs                    |
//!
//! Adaptors are created through an [`AdaptorRegistry`] keyed by URL scheme.

pub(crate) mod common;
pub mod condor;
pub mod loadl;
pub mod lsf;
pub mod noop;
pub mod pbs;
mod registry;
pub mod sge;
pub mod slurm;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ServiceConfig;
use crate::description::JobDescription;
use crate::error::{SchedError, SchedResult};
use crate::resource::ResourceUrl;
use crate::shell::RemoteShell;
use crate::state::{JobInfo, JobState};

pub use registry::{AdaptorFactory, AdaptorRegistry};

/// Optional features of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// `suspend` and `resume` are implemented.
    pub suspend: bool,
    /// `fetch_bulk` answers many jobs with one command.
    pub bulk_query: bool,
    /// Finished jobs can be looked up in accounting records.
    pub accounting: bool,
}

/// Everything an adaptor needs from the service that owns it.
#[derive(Clone)]
pub struct AdaptorContext {
    pub url: ResourceUrl,
    pub config: Arc<ServiceConfig>,
    pub shell: Arc<dyn RemoteShell>,
}

/// Result of a bulk query: one entry per requested id, in request order.
pub type BulkInfo = Vec<(String, SchedResult<Option<JobInfo>>)>;

/// A batch system backend.
#[async_trait]
pub trait SchedulerAdaptor: Send + Sync {
    /// Backend name (`slurm`, `torque`, ...).
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Render the submission script. Pure and deterministic.
    fn generate_script(&self, desc: &JobDescription) -> SchedResult<String>;

    /// Submit a job and return the backend's native id.
    async fn submit(&self, desc: &JobDescription) -> SchedResult<String>;

    /// Query one job. `Ok(None)` means no source knows the job any more.
    async fn fetch_info(&self, native_id: &str, last: &JobInfo) -> SchedResult<Option<JobInfo>>;

    /// Query several jobs. The default issues one query per job.
    async fn fetch_bulk(&self, jobs: &[(String, JobInfo)]) -> BulkInfo {
        let mut results = Vec::with_capacity(jobs.len());
        for (id, last) in jobs {
            results.push((id.clone(), self.fetch_info(id, last).await));
        }
        results
    }

    /// Map a native state token onto the canonical model. Never fails.
    fn translate_state(&self, token: &str, exit_code: Option<i32>) -> JobState;

    async fn cancel(&self, native_id: &str) -> SchedResult<()>;

    async fn suspend(&self, _native_id: &str) -> SchedResult<()> {
        Err(SchedError::NotSupported(format!(
            "{} cannot suspend jobs",
            self.name()
        )))
    }

    async fn resume(&self, _native_id: &str) -> SchedResult<()> {
        Err(SchedError::NotSupported(format!(
            "{} cannot resume jobs",
            self.name()
        )))
    }

    /// Native ids of the current user's jobs known to the backend.
    async fn list(&self) -> SchedResult<Vec<String>>;
}
