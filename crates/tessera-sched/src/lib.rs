//! Tessera job lifecycle layer for HPC batch schedulers
//!
//! This crate submits, tracks and controls batch jobs through one API,
//! whatever scheduler runs the cluster.
//!
//! # Overview
//!
//! 1. **Describe**: a [`JobDescription`] states executable, resources and file
//!    transfers independently of the backend
//! 2. **Submit**: a [`JobService`] renders the backend's batch script, stages
//!    input files and runs the submit command over a [`RemoteShell`](shell::RemoteShell)
//! 3. **Track**: a background monitor polls active jobs and maps native states
//!    onto [`JobState`]
//! 4. **Control**: [`JobHandle`] waits on, cancels, suspends and resumes jobs
//!
//! # Supported Schedulers
//!
//! | Scheme | Scheduler | Commands |
//! |--------|-----------|----------|
//! | `pbs`, `pbspro`, `torque` | PBS family | qsub, qstat, qdel, tracejob |
//! | `slurm` | SLURM | sbatch, scontrol, squeue, sacct, scancel |
//! | `sge` | Sun/Univa Grid Engine | qsub, qstat, qacct, qdel, qmod |
//! | `lsf` | IBM LSF | bsub, bjobs, bkill, bstop, bresume |
//! | `loadl` | IBM LoadLeveler | llsubmit, llq, llcancel |
//! | `condor` | HTCondor | condor_submit, condor_q, condor_history, condor_rm |
//! | `noop` | in-process simulation | none |
//!
//! A URL such as `slurm+ssh://user@login.cluster` selects the scheduler by its
//! scheme and the transport by the `+ssh`/`+local` suffix. Hosts other than
//! `localhost` default to SSH.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use tessera_sched::shell::{CommandOutput, ScriptedShell};
//! use tessera_sched::{
//!     AdaptorRegistry, JobDescription, JobService, JobState, ResourceUrl, ServiceConfig,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> tessera_sched::SchedResult<()> {
//! let shell = Arc::new(
//!     ScriptedShell::new().on("sbatch", CommandOutput::ok("Submitted batch job 4711\n")),
//! );
//! let service = JobService::with_shell(
//!     ResourceUrl::parse("slurm://localhost")?,
//!     ServiceConfig::default(),
//!     &AdaptorRegistry::with_builtins(),
//!     shell,
//! )?;
//!
//! let mut job = service.create_job(JobDescription::new("/bin/hostname").with_queue("debug"))?;
//! job.run().await?;
//! assert_eq!(job.id().map(|id| id.native()), Some("4711"));
//! assert_eq!(job.state().await?, JobState::Pending);
//! service.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod adaptor;
pub mod config;
pub mod container;
pub mod description;
pub mod error;
pub mod handle;
pub mod job_id;
mod monitor;
pub mod record;
pub mod resource;
pub mod service;
pub mod shell;
pub mod state;
pub mod transfer;

// Re-exports
pub use adaptor::{AdaptorRegistry, Capabilities, SchedulerAdaptor};
pub use config::{BackendConfig, CancelPolicy, PbsFlavor, ServiceConfig, SlurmNodeSpec, SshConfig};
pub use container::JobContainer;
pub use description::{JobDescription, SpmdVariation};
pub use error::{ErrorKind, SchedError, SchedResult};
pub use handle::JobHandle;
pub use job_id::JobId;
pub use record::JobRecord;
pub use resource::ResourceUrl;
pub use service::{JobService, StateCallback, StateChange};
pub use state::{JobInfo, JobState};
pub use transfer::{TransferDirective, TransferOp};
