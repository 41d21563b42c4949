//! SLURM adaptor for job submission and tracking.

use async_trait::async_trait;
use rustc_hash::FxHashMap;

use crate::adaptor::common::{
    ScriptSubmission, quote_arg, run_control, run_query, with_accounting_retries,
};
use crate::adaptor::slurm::parser::{self, SlurmJobRecord};
use crate::adaptor::slurm::templates;
use crate::adaptor::{AdaptorContext, BulkInfo, Capabilities, SchedulerAdaptor};
use crate::description::JobDescription;
use crate::error::{SchedError, SchedResult};
use crate::state::{JobInfo, JobState};

const SACCT_FIELDS: &str = "JobID,State,ExitCode,Submit,Start,End,NodeList";

/// Adaptor for SLURM clusters.
pub struct SlurmAdaptor {
    ctx: AdaptorContext,
}

impl SlurmAdaptor {
    pub fn new(ctx: AdaptorContext) -> Self {
        Self { ctx }
    }

    fn to_info(&self, rec: SlurmJobRecord) -> JobInfo {
        let state = self.translate_state(&rec.state, rec.exit_code);
        let mut info = JobInfo::new(state)
            .with_native_state(rec.state)
            .with_exit_code(rec.exit_code)
            .with_exec_hosts(rec.nodes);
        info.created = rec.submitted;
        info.started = rec.started;
        if state.is_final() {
            info.finished = rec.ended;
        }
        info
    }

    async fn run_sacct(&self, native_id: &str) -> SchedResult<Option<JobInfo>> {
        let command = format!("sacct -j {} -o {SACCT_FIELDS} -P", quote_arg(native_id));
        let output = run_query(self.ctx.shell.as_ref(), &command).await?;
        Ok(parser::parse_sacct_output(&output.stdout).map(|rec| self.to_info(rec)))
    }
}

#[async_trait]
impl SchedulerAdaptor for SlurmAdaptor {
    fn name(&self) -> &str {
        "slurm"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            suspend: true,
            bulk_query: true,
            accounting: true,
        }
    }

    fn generate_script(&self, desc: &JobDescription) -> SchedResult<String> {
        templates::generate_slurm_script(desc, &self.ctx.config.backend)
    }

    async fn submit(&self, desc: &JobDescription) -> SchedResult<String> {
        let script = self.generate_script(desc)?;
        ScriptSubmission {
            shell: self.ctx.shell.as_ref(),
            desc,
            script,
            extension: "slurm",
        }
        .submit(
            |path| format!("sbatch {path}"),
            |out| parser::parse_sbatch_output(&out.stdout),
        )
        .await
    }

    async fn fetch_info(&self, native_id: &str, _last: &JobInfo) -> SchedResult<Option<JobInfo>> {
        let command = format!("scontrol show job {}", quote_arg(native_id));
        let output = self.ctx.shell.run(&command).await?;

        if !parser::is_invalid_job(&output.stderr) {
            if !output.success() {
                return Err(SchedError::query(command, output.stderr.trim()));
            }
            if let Some(rec) = parser::parse_scontrol_output(&output.stdout) {
                return Ok(Some(self.to_info(rec)));
            }
        }

        // the controller forgets jobs after MinJobAge; sacct keeps them
        let config = &self.ctx.config;
        with_accounting_retries(config.accounting_retries, config.accounting_backoff(), || {
            self.run_sacct(native_id)
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
            .map(|(id, _)| id.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let command = format!("squeue -h -j {} -o '%i|%T|%N'", quote_arg(&ids));
        let mut found: FxHashMap<String, SlurmJobRecord> =
            match self.ctx.shell.run(&command).await {
                Ok(output) => parser::parse_squeue_output(&output.stdout)
                    .into_iter()
                    .map(|rec| (rec.job_id.clone(), rec))
                    .collect(),
                Err(e) => {
                    tracing::warn!("Bulk squeue failed, querying jobs one by one: {}", e);
                    FxHashMap::default()
                }
            };

        let mut results = Vec::with_capacity(jobs.len());
        for (id, last) in jobs {
            let result = match found.remove(id) {
                Some(rec) => Ok(Some(self.to_info(rec))),
                None => self.fetch_info(id, last).await,
            };
            results.push((id.clone(), result));
        }
        results
    }

    fn translate_state(&self, token: &str, exit_code: Option<i32>) -> JobState {
        // `CANCELLED by 1000` from scontrol, `CANCELLED+` from sacct
        let token = token
            .split_whitespace()
            .next()
            .unwrap_or("")
            .trim_end_matches('+')
            .to_ascii_uppercase();
        match token.as_str() {
            "PD" | "PENDING" | "CF" | "CONFIGURING" | "RQ" | "REQUEUED" | "RH"
            | "REQUEUE_HOLD" | "RF" | "REQUEUE_FED" => JobState::Pending,
            "R" | "RUNNING" | "CG" | "COMPLETING" | "SO" | "STAGE_OUT" | "RS" | "RESIZING" => {
                JobState::Running
            }
            "S" | "SUSPENDED" | "ST" | "STOPPED" => JobState::Suspended,
            "CD" | "COMPLETED" => match exit_code {
                Some(code) if code != 0 => JobState::Failed,
                _ => JobState::Done,
            },
            "F" | "FAILED" | "NF" | "NODE_FAIL" | "BF" | "BOOT_FAIL" | "OOM"
            | "OUT_OF_MEMORY" | "DL" | "DEADLINE" => JobState::Failed,
            "CA" | "CANCELLED" | "PR" | "PREEMPTED" | "TO" | "TIMEOUT" | "RV" | "REVOKED" => {
                JobState::Canceled
            }
            _ => JobState::Unknown,
        }
    }

    async fn cancel(&self, native_id: &str) -> SchedResult<()> {
        let command = format!("scancel {}", quote_arg(native_id));
        let output = self.ctx.shell.run(&command).await?;
        if parser::is_invalid_job(&output.stderr) {
            return Err(SchedError::JobNotFound(native_id.to_string()));
        }
        // scancel on a finished job warns but exits 0
        if !output.success() && !output.stderr.contains("already completing or completed") {
            return Err(SchedError::query(command, output.stderr.trim()));
        }
        Ok(())
    }

    async fn suspend(&self, native_id: &str) -> SchedResult<()> {
        run_control(
            self.ctx.shell.as_ref(),
            &format!("scontrol suspend {}", quote_arg(native_id)),
        )
        .await
    }

    async fn resume(&self, native_id: &str) -> SchedResult<()> {
        run_control(
            self.ctx.shell.as_ref(),
            &format!("scontrol resume {}", quote_arg(native_id)),
        )
        .await
    }

    async fn list(&self) -> SchedResult<Vec<String>> {
        let output = run_query(self.ctx.shell.as_ref(), "squeue -h -o %i -u $USER").await?;
        Ok(parser::parse_squeue_ids(&output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::ServiceConfig;
    use crate::resource::ResourceUrl;
    use crate::shell::{CommandOutput, ScriptedShell};

    fn adaptor(shell: Arc<ScriptedShell>) -> SlurmAdaptor {
        let config = ServiceConfig::default().with_accounting(2, Duration::from_millis(10));
        SlurmAdaptor::new(AdaptorContext {
            url: ResourceUrl::parse("slurm://localhost").unwrap(),
            config: Arc::new(config),
            shell,
        })
    }

    #[test]
    fn test_translate_state() {
        let slurm = adaptor(Arc::new(ScriptedShell::new()));
        let cases = [
            ("CA", JobState::Canceled),
            ("CD", JobState::Done),
            ("CF", JobState::Pending),
            ("CG", JobState::Running),
            ("F", JobState::Failed),
            ("NF", JobState::Failed),
            ("PD", JobState::Pending),
            ("PR", JobState::Canceled),
            ("R", JobState::Running),
            ("S", JobState::Suspended),
            ("TO", JobState::Canceled),
            ("CANCELLED by 1000", JobState::Canceled),
            ("CANCELLED+", JobState::Canceled),
            ("OUT_OF_MEMORY", JobState::Failed),
            ("running", JobState::Running),
            ("WEIRD", JobState::Unknown),
        ];
        for (token, expected) in cases {
            assert_eq!(slurm.translate_state(token, None), expected, "{token}");
        }
        assert_eq!(slurm.translate_state("COMPLETED", Some(3)), JobState::Failed);
    }

    #[tokio::test]
    async fn test_submit_parses_id() {
        let shell = Arc::new(
            ScriptedShell::new().on("sbatch", CommandOutput::ok("Submitted batch job 991\n")),
        );
        let slurm = adaptor(shell.clone());
        let id = slurm.submit(&JobDescription::new("/bin/true")).await.unwrap();
        assert_eq!(id, "991");
        assert_eq!(shell.count("rm -f"), 1);
    }

    #[tokio::test]
    async fn test_submit_rejected() {
        let shell = Arc::new(ScriptedShell::new().on(
            "sbatch",
            CommandOutput::failed(1, "sbatch: error: invalid partition specified: nope"),
        ));
        let slurm = adaptor(shell);
        let err = slurm
            .submit(&JobDescription::new("a.out").with_queue("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedError::Submission { exit_code: 1, .. }));
        assert!(err.to_string().contains("invalid partition"));
    }

    #[tokio::test]
    async fn test_fetch_running_keeps_projected_end_out() {
        let shell = Arc::new(ScriptedShell::new().on(
            "scontrol show job 5",
            CommandOutput::ok(
                "JobId=5 JobName=x\n   JobState=RUNNING Reason=None\n   ExitCode=0:0\n   \
                 StartTime=2024-01-15T10:30:00 EndTime=2024-01-15T12:30:00\n   NodeList=c1\n",
            ),
        ));
        let slurm = adaptor(shell);
        let info = slurm
            .fetch_info("5", &JobInfo::new(JobState::Pending))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.state, JobState::Running);
        assert!(info.started.is_some());
        assert!(info.finished.is_none());
        assert_eq!(info.exec_hosts, vec!["c1"]);
    }

    #[tokio::test]
    async fn test_fetch_falls_back_to_sacct() {
        let shell = Arc::new(
            ScriptedShell::new()
                .on(
                    "scontrol",
                    CommandOutput::failed(1, "slurm_load_jobs error: Invalid job id specified"),
                )
                .on(
                    "sacct",
                    CommandOutput::ok(
                        "JobID|State|ExitCode|Submit|Start|End|NodeList\n\
                         6|FAILED|4:0|2024-01-15T10:29:00|2024-01-15T10:30:00|2024-01-15T10:31:00|c2\n",
                    ),
                ),
        );
        let slurm = adaptor(shell);
        let info = slurm
            .fetch_info("6", &JobInfo::new(JobState::Running))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.state, JobState::Failed);
        assert_eq!(info.exit_code, Some(4));
        assert!(info.finished.is_some());
    }

    #[tokio::test]
    async fn test_vanished_job_returns_none() {
        let shell = Arc::new(
            ScriptedShell::new()
                .on("scontrol", CommandOutput::failed(1, "Invalid job id specified"))
                .on("sacct", CommandOutput::ok("JobID|State|ExitCode|Submit|Start|End|NodeList\n")),
        );
        let slurm = adaptor(shell.clone());
        assert!(slurm.fetch_info("7", &JobInfo::default()).await.unwrap().is_none());
        assert_eq!(shell.count("sacct"), 2);
    }

    #[tokio::test]
    async fn test_fetch_bulk_uses_one_squeue() {
        let shell = Arc::new(
            ScriptedShell::new()
                .on("squeue -h -j", CommandOutput::ok("1|RUNNING|c1\n2|PENDING|\n")),
        );
        let slurm = adaptor(shell.clone());
        let jobs = vec![
            ("1".to_string(), JobInfo::new(JobState::Pending)),
            ("2".to_string(), JobInfo::new(JobState::Pending)),
        ];
        let results = slurm.fetch_bulk(&jobs).await;
        let states: Vec<JobState> = results
            .iter()
            .map(|(_, r)| r.as_ref().unwrap().as_ref().unwrap().state)
            .collect();
        assert_eq!(states, vec![JobState::Running, JobState::Pending]);
        assert_eq!(shell.count("scontrol"), 0);
    }

    #[tokio::test]
    async fn test_suspend_and_cancel() {
        let shell = Arc::new(
            ScriptedShell::new()
                .on(
                    "scontrol suspend",
                    CommandOutput::failed(1, "Access/permission denied"),
                )
                .on("scancel 9", CommandOutput::failed(1, "Invalid job id specified")),
        );
        let slurm = adaptor(shell.clone());
        assert!(slurm.suspend("8").await.is_err());
        assert!(slurm.resume("8").await.is_ok());
        assert!(matches!(
            slurm.cancel("9").await,
            Err(SchedError::JobNotFound(_))
        ));
        assert!(slurm.cancel("10").await.is_ok());
    }
}
