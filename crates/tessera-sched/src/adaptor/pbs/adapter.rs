//! PBS adaptor for job submission and tracking.

use async_trait::async_trait;
use rustc_hash::FxHashMap;

use crate::adaptor::common::{
    ScriptSubmission, quote_arg, run_query, with_accounting_retries,
};
use crate::adaptor::pbs::parser::{self, PbsJobRecord};
use crate::adaptor::pbs::templates;
use crate::adaptor::{AdaptorContext, BulkInfo, Capabilities, SchedulerAdaptor};
use crate::config::PbsFlavor;
use crate::description::JobDescription;
use crate::error::{SchedError, SchedResult};
use crate::state::{JobInfo, JobState, infer_final_state};

/// How cores and nodes are requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRequest {
    /// `nodes=N:ppn=P` (Torque, OpenPBS)
    NodesPpn,
    /// `select=N:ncpus=P` (PBS Pro)
    Select,
    /// `mppwidth=C` (Cray)
    Cray,
}

/// Per-flavor differences of the PBS family.
///
/// | Flavor | Project | Cores                 | Workdir   | Finished jobs |
/// |--------|---------|-----------------------|-----------|---------------|
/// | pbs    | `-A`    | `nodes=N:ppn=P`       | `cd`      | `tracejob`    |
/// | torque | `-A`    | `nodes=N:ppn=P`       | `-d`      | `tracejob`    |
/// | pbspro | `-P`    | `select=N:ncpus=P`    | `cd`      | `qstat -x`    |
///
/// Cray mode replaces the core request with `mppwidth`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PbsDialect {
    pub flavor: PbsFlavor,
    pub cray: bool,
}

impl PbsDialect {
    pub fn new(flavor: PbsFlavor, cray: bool) -> Self {
        Self { flavor, cray }
    }

    pub fn name(&self) -> &'static str {
        match self.flavor {
            PbsFlavor::Pbs => "pbs",
            PbsFlavor::PbsPro => "pbspro",
            PbsFlavor::Torque => "torque",
        }
    }

    pub fn project_flag(&self) -> &'static str {
        match self.flavor {
            PbsFlavor::PbsPro => "-P",
            PbsFlavor::Pbs | PbsFlavor::Torque => "-A",
        }
    }

    pub fn node_request(&self) -> NodeRequest {
        if self.cray {
            return NodeRequest::Cray;
        }
        match self.flavor {
            PbsFlavor::PbsPro => NodeRequest::Select,
            PbsFlavor::Pbs | PbsFlavor::Torque => NodeRequest::NodesPpn,
        }
    }

    /// Whether `#PBS -d` sets the working directory.
    pub fn workdir_directive(&self) -> bool {
        self.flavor == PbsFlavor::Torque
    }

    /// Status query; PBS Pro includes finished jobs with `-x`.
    fn status_command(&self, ids: &str) -> String {
        match self.flavor {
            PbsFlavor::PbsPro => format!("qstat -xf {ids}"),
            PbsFlavor::Pbs | PbsFlavor::Torque => format!("qstat -f {ids}"),
        }
    }

    fn has_tracejob(&self) -> bool {
        self.flavor != PbsFlavor::PbsPro
    }
}

/// Adaptor for the PBS family.
pub struct PbsAdaptor {
    ctx: AdaptorContext,
    dialect: PbsDialect,
}

impl PbsAdaptor {
    pub fn new(ctx: AdaptorContext, flavor: PbsFlavor) -> Self {
        let dialect = PbsDialect::new(flavor, ctx.config.backend.cray);
        Self { ctx, dialect }
    }

    pub fn dialect(&self) -> &PbsDialect {
        &self.dialect
    }

    fn to_info(&self, rec: PbsJobRecord, last: JobState) -> JobInfo {
        let state = if rec.deleted {
            JobState::Canceled
        } else if rec.job_state.is_empty() {
            infer_final_state(rec.exit_status, last)
        } else {
            self.translate_state(&rec.job_state, rec.exit_status)
        };
        let mut info = JobInfo::new(state)
            .with_exit_code(rec.exit_status)
            .with_exec_hosts(rec.exec_hosts);
        if !rec.job_state.is_empty() {
            info.native_state = Some(rec.job_state);
        }
        info.created = rec.created;
        info.started = rec.started;
        info.finished = rec.finished;
        info
    }

    async fn run_tracejob(&self, native_id: &str, last: JobState) -> SchedResult<Option<JobInfo>> {
        let command = format!("tracejob -n 2 {}", quote_arg(native_id));
        let output = self.ctx.shell.run(&command).await?;
        if parser::is_unknown_job(&output.stderr) {
            return Ok(None);
        }
        Ok(parser::parse_tracejob_output(&output.stdout).map(|rec| self.to_info(rec, last)))
    }
}

#[async_trait]
impl SchedulerAdaptor for PbsAdaptor {
    fn name(&self) -> &str {
        self.dialect.name()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            suspend: false,
            bulk_query: true,
            accounting: self.dialect.has_tracejob(),
        }
    }

    fn generate_script(&self, desc: &JobDescription) -> SchedResult<String> {
        templates::generate_pbs_script(desc, &self.dialect, &self.ctx.config.backend)
    }

    async fn submit(&self, desc: &JobDescription) -> SchedResult<String> {
        let script = self.generate_script(desc)?;
        ScriptSubmission {
            shell: self.ctx.shell.as_ref(),
            desc,
            script,
            extension: "pbs",
        }
        .submit(
            |path| format!("qsub {path}"),
            |out| parser::parse_qsub_output(&out.stdout),
        )
        .await
    }

    async fn fetch_info(&self, native_id: &str, last: &JobInfo) -> SchedResult<Option<JobInfo>> {
        let command = self.dialect.status_command(&quote_arg(native_id));
        let output = self.ctx.shell.run(&command).await?;

        if !parser::is_unknown_job(&output.stderr) {
            if !output.success() {
                return Err(SchedError::query(command, output.stderr.trim()));
            }
            if let Some(rec) = parser::parse_qstat_full_output(&output.stdout)
                .into_iter()
                .next()
            {
                return Ok(Some(self.to_info(rec, last.state)));
            }
        }

        if !self.dialect.has_tracejob() {
            return Ok(None);
        }
        let config = &self.ctx.config;
        with_accounting_retries(config.accounting_retries, config.accounting_backoff(), || {
            self.run_tracejob(native_id, last.state)
        })
        .await
    }

    async fn fetch_bulk(&self, jobs: &[(String, JobInfo)]) -> BulkInfo {
        if jobs.len() < 2 {
            let mut results = Vec::new();
            for (id, last) in jobs {
                results.push((id.clone(), self.fetch_info(id, last).await));
            }
            return results;
        }

        let ids = jobs
            .iter()
            .map(|(id, _)| quote_arg(id))
            .collect::<Vec<_>>()
            .join(" ");
        // qstat exits non-zero if any id is unknown but still prints the rest
        let mut found: FxHashMap<String, PbsJobRecord> =
            match self.ctx.shell.run(&self.dialect.status_command(&ids)).await {
                Ok(output) => parser::parse_qstat_full_output(&output.stdout)
                    .into_iter()
                    .map(|rec| {
                        let short = rec.job_id.split('.').next().unwrap_or("").to_string();
                        (short, rec)
                    })
                    .collect(),
                Err(e) => {
                    tracing::warn!("Bulk qstat failed, querying jobs one by one: {}", e);
                    FxHashMap::default()
                }
            };

        let mut results = Vec::with_capacity(jobs.len());
        for (id, last) in jobs {
            let result = match found.remove(id) {
                Some(rec) => Ok(Some(self.to_info(rec, last.state))),
                None => self.fetch_info(id, last).await,
            };
            results.push((id.clone(), result));
        }
        results
    }

    fn translate_state(&self, token: &str, exit_code: Option<i32>) -> JobState {
        match token.trim() {
            "C" | "F" => {
                if exit_code == Some(0) {
                    JobState::Done
                } else {
                    JobState::Failed
                }
            }
            "H" | "Q" | "S" | "W" => JobState::Pending,
            "R" | "E" | "T" | "B" => JobState::Running,
            "X" => JobState::Canceled,
            _ => JobState::Unknown,
        }
    }

    async fn cancel(&self, native_id: &str) -> SchedResult<()> {
        let command = format!("qdel {}", quote_arg(native_id));
        let output = self.ctx.shell.run(&command).await?;
        if parser::is_unknown_job(&output.stderr) {
            return Err(SchedError::JobNotFound(native_id.to_string()));
        }
        if !output.success() && !output.stderr.contains("being deleted") {
            return Err(SchedError::query(command, output.stderr.trim()));
        }
        Ok(())
    }

    async fn list(&self) -> SchedResult<Vec<String>> {
        let output = run_query(self.ctx.shell.as_ref(), "qstat -u $USER").await?;
        Ok(parser::parse_qstat_ids(&output.stdout))
    }
}
