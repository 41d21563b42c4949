//! Sun/Oracle/Univa Grid Engine.
//!
//! Parallel jobs need a parallel environment (`-pe`); which one is site
//! specific and comes from [`BackendConfig::sge_parallel_environments`].
//! The same goes for memory, which grid engines only understand through
//! admin defined complexes listed in [`BackendConfig::sge_memory_attributes`].

use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;

use crate::adaptor::common::{
    ScriptSubmission, capture, command_line, escape_directive, format_walltime, parse_timestamp,
    project, prologue, queue, quote_arg, run_control, run_query, sanitize_name,
    with_accounting_retries,
};
use crate::adaptor::{AdaptorContext, Capabilities, SchedulerAdaptor};
use crate::config::BackendConfig;
use crate::description::{JobDescription, SpmdVariation};
use crate::error::{SchedError, SchedResult};
use crate::state::{JobInfo, JobState, infer_final_state};

static QSUB_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Your job(?:-array)? (\d+)").expect("valid regex"));

/// Generate a grid engine batch script for a job.
pub fn generate_sge_script(desc: &JobDescription, config: &BackendConfig) -> SchedResult<String> {
    desc.validate()?;

    let cpus = desc.total_cpu_count;
    let pe = match (&desc.spmd_variation, cpus) {
        (_, 1) => None,
        (None, _) => {
            return Err(SchedError::Parameter(format!(
                "grid engine needs an SPMD variation to place {cpus} processes"
            )));
        }
        (Some(spmd), _) => Some(
            config
                .sge_parallel_environments
                .get(spmd.name())
                .cloned()
                .unwrap_or_else(|| spmd.name().to_string()),
        ),
    };
    if desc.total_physical_memory.is_some() && config.sge_memory_attributes.is_empty() {
        return Err(SchedError::Parameter(
            "memory requests need sge_memory_attributes in the backend config".into(),
        ));
    }

    let mut script = String::new();
    script.push_str("#!/bin/bash\n");
    script.push_str(&format!(
        "#$ -N {}\n",
        sanitize_name(&desc.display_name(), 64)
    ));
    script.push_str("#$ -S /bin/bash\n");

    if let Some(wd) = &desc.working_directory {
        script.push_str(&format!("#$ -wd {}\n", escape_directive(wd)));
    }
    if let Some(output) = desc.resolved_output() {
        script.push_str(&format!("#$ -o {}\n", escape_directive(&output)));
    }
    if let Some(error) = desc.resolved_error() {
        script.push_str(&format!("#$ -e {}\n", escape_directive(&error)));
    }
    if let Some(input) = desc.resolved_input() {
        script.push_str(&format!("#$ -i {}\n", escape_directive(&input)));
    }
    if let Some(queue) = queue(desc, config) {
        script.push_str(&format!("#$ -q {}\n", escape_directive(queue)));
    }
    if let Some(project) = project(desc, config) {
        script.push_str(&format!("#$ -P {}\n", escape_directive(project)));
    }
    if let Some(minutes) = desc.wall_time_limit {
        script.push_str(&format!("#$ -l h_rt={}\n", format_walltime(minutes)));
    }
    if let Some(pe) = &pe {
        script.push_str(&format!("#$ -pe {} {cpus}\n", escape_directive(pe)));
    }
    if let Some(mem) = desc.total_physical_memory {
        for attr in &config.sge_memory_attributes {
            script.push_str(&format!("#$ -l {}={mem}M\n", escape_directive(attr)));
        }
    }
    if !desc.job_contact.is_empty() {
        script.push_str(&format!(
            "#$ -M {}\n#$ -m be\n",
            escape_directive(&desc.job_contact.join(","))
        ));
    }
    if !desc.candidate_hosts.is_empty() {
        script.push_str(&format!(
            "#$ -l h={}\n",
            escape_directive(&desc.candidate_hosts.join("|"))
        ));
    }
    if let Some(gpus) = desc.total_gpu_count {
        script.push_str(&format!("#$ -l gpu={gpus}\n"));
    }
    if let Some(arch) = &desc.cpu_architecture {
        script.push_str(&format!("#$ -l arch={}\n", escape_directive(arch)));
    }
    for directive in &config.extra_directives {
        script.push_str(&format!("#$ {}\n", escape_directive(directive)));
    }

    script.push('\n');
    script.push_str(&prologue(desc, config));
    if pe.is_some()
        && matches!(
            desc.spmd_variation,
            Some(SpmdVariation::Mpi | SpmdVariation::MpichG)
        )
    {
        script.push_str("mpirun -np \\$NSLOTS ");
    }
    script.push_str(&command_line(desc));
    script.push('\n');

    Ok(script)
}

#[derive(Debug, Clone, Default, PartialEq)]
struct SgeJobRecord {
    state: String,
    host: Option<String>,
    since: Option<DateTime<Utc>>,
}

/// Find one job in `qstat` table output.
///
/// ```text
/// job-ID  prior   name   user   state submit/start at     queue         slots
/// ---------------------------------------------------------------------------
///     123 0.55500 sim    alice  r     01/15/2024 10:30:00 all.q@node01  4
/// ```
fn parse_qstat_line(output: &str, native_id: &str) -> Option<SgeJobRecord> {
    output.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 7 || fields[0] != native_id {
            return None;
        }
        let host = fields
            .get(7)
            .and_then(|queue| queue.split_once('@'))
            .map(|(_, host)| host.to_string());
        Some(SgeJobRecord {
            state: fields[4].to_string(),
            host,
            since: parse_timestamp(&format!("{} {}", fields[5], fields[6])),
        })
    })
}

#[derive(Debug, Clone, Default, PartialEq)]
struct QacctRecord {
    hostname: Option<String>,
    exit_status: Option<i32>,
    failed: bool,
    submitted: Option<DateTime<Utc>>,
    started: Option<DateTime<Utc>>,
    ended: Option<DateTime<Utc>>,
}

/// Parse `qacct -j <id>`. With several records (reruns) the last wins.
fn parse_qacct_output(output: &str) -> Option<QacctRecord> {
    let mut record: Option<QacctRecord> = None;
    for line in output.lines() {
        if line.starts_with("====") {
            record = Some(QacctRecord::default());
            continue;
        }
        let (Some(rec), Some((key, value))) = (record.as_mut(), line.split_once(char::is_whitespace))
        else {
            continue;
        };
        let value = value.trim();
        match key {
            "hostname" => rec.hostname = Some(value.to_string()),
            "exit_status" => {
                rec.exit_status = value.split_whitespace().next().and_then(|v| v.parse().ok());
            }
            "failed" => rec.failed = !value.starts_with('0'),
            "qsub_time" => rec.submitted = parse_timestamp(value),
            "start_time" => rec.started = parse_timestamp(value),
            "end_time" => rec.ended = parse_timestamp(value),
            _ => {}
        }
    }
    record
}

fn parse_qstat_ids(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|token| token.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
        .collect()
}

/// Adaptor for grid engine clusters.
pub struct SgeAdaptor {
    ctx: AdaptorContext,
}

impl SgeAdaptor {
    pub fn new(ctx: AdaptorContext) -> Self {
        Self { ctx }
    }

    async fn run_qacct(&self, native_id: &str, last: JobState) -> SchedResult<Option<JobInfo>> {
        let command = format!("qacct -j {}", quote_arg(native_id));
        let output = self.ctx.shell.run(&command).await?;
        if !output.success() {
            // "error: job id 123 not found" until the accounting file is written
            return Ok(None);
        }
        Ok(parse_qacct_output(&output.stdout).map(|rec| {
            let state = if rec.failed {
                JobState::Failed
            } else {
                infer_final_state(rec.exit_status, last)
            };
            let mut info = JobInfo::new(state)
                .with_exit_code(rec.exit_status)
                .with_exec_hosts(rec.hostname.into_iter().collect());
            info.created = rec.submitted;
            info.started = rec.started;
            info.finished = rec.ended;
            info
        }))
    }
}

#[async_trait]
impl SchedulerAdaptor for SgeAdaptor {
    fn name(&self) -> &str {
        "sge"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            suspend: true,
            bulk_query: false,
            accounting: true,
        }
    }

    fn generate_script(&self, desc: &JobDescription) -> SchedResult<String> {
        generate_sge_script(desc, &self.ctx.config.backend)
    }

    async fn submit(&self, desc: &JobDescription) -> SchedResult<String> {
        let script = self.generate_script(desc)?;
        ScriptSubmission {
            shell: self.ctx.shell.as_ref(),
            desc,
            script,
            extension: "sge",
        }
        .submit(
            |path| format!("qsub {path}"),
            |out| capture(&QSUB_RE, &out.stdout),
        )
        .await
    }

    async fn fetch_info(&self, native_id: &str, last: &JobInfo) -> SchedResult<Option<JobInfo>> {
        let output = run_query(self.ctx.shell.as_ref(), "qstat -u $USER").await?;
        if let Some(rec) = parse_qstat_line(&output.stdout, native_id) {
            let state = self.translate_state(&rec.state, None);
            let mut info = JobInfo::new(state)
                .with_native_state(rec.state)
                .with_exec_hosts(rec.host.into_iter().collect());
            // the date column is the start time once a job runs
            if state == JobState::Running {
                info.started = rec.since;
            } else if state == JobState::Pending {
                info.created = rec.since;
            }
            return Ok(Some(info));
        }

        let config = &self.ctx.config;
        with_accounting_retries(config.accounting_retries, config.accounting_backoff(), || {
            self.run_qacct(native_id, last.state)
        })
        .await
    }

    /// State letters combine (`Eqw`, `dr`, `hqw`); the most significant one
    /// wins.
    fn translate_state(&self, token: &str, _exit_code: Option<i32>) -> JobState {
        let token = token.trim();
        let has = |letters: &[char]| token.chars().any(|c| letters.contains(&c));
        if token.is_empty() {
            JobState::Unknown
        } else if has(&['d']) {
            JobState::Canceled
        } else if has(&['E']) {
            JobState::Failed
        } else if has(&['s', 'S', 'T']) {
            JobState::Suspended
        } else if has(&['r', 't', 'R']) {
            JobState::Running
        } else if has(&['q', 'w', 'h']) {
            JobState::Pending
        } else {
            JobState::Unknown
        }
    }

    async fn cancel(&self, native_id: &str) -> SchedResult<()> {
        let command = format!("qdel {}", quote_arg(native_id));
        let output = self.ctx.shell.run(&command).await?;
        if output.combined().contains("does not exist") {
            return Err(SchedError::JobNotFound(native_id.to_string()));
        }
        if !output.success() {
            return Err(SchedError::query(command, output.stderr.trim()));
        }
        Ok(())
    }

    async fn suspend(&self, native_id: &str) -> SchedResult<()> {
        run_control(
            self.ctx.shell.as_ref(),
            &format!("qmod -sj {}", quote_arg(native_id)),
        )
        .await
    }

    async fn resume(&self, native_id: &str) -> SchedResult<()> {
        run_control(
            self.ctx.shell.as_ref(),
            &format!("qmod -usj {}", quote_arg(native_id)),
        )
        .await
    }

    async fn list(&self) -> SchedResult<Vec<String>> {
        let output = run_query(self.ctx.shell.as_ref(), "qstat -u $USER").await?;
        Ok(parse_qstat_ids(&output.stdout))
    }
}
