//! HTCondor.
//!
//! Condor takes a submit description instead of a batch script; the
//! executable runs directly, so `module` lines from the backend config do
//! not apply here.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use crate::adaptor::common::{
    ScriptSubmission, capture, escape_command, escape_directive, parse_timestamp, project,
    quote_arg, run_control, run_query, with_accounting_retries,
};
use crate::adaptor::{AdaptorContext, Capabilities, SchedulerAdaptor};
use crate::config::BackendConfig;
use crate::description::JobDescription;
use crate::error::{SchedError, SchedResult};
use crate::state::{JobInfo, JobState};

static SUBMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"submitted to cluster (\d+)").expect("valid regex"));

const ATTRIBUTES: &str = "JobStatus ExitCode RemoteHost QDate JobStartDate CompletionDate";

/// Quote a value for the new-style `arguments`/`environment` syntax: single
/// quotes around each item, embedded single quotes doubled.
fn condor_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Generate a Condor submit description for a job.
pub fn generate_condor_submit(desc: &JobDescription, config: &BackendConfig) -> SchedResult<String> {
    desc.validate()?;

    let mut lines: Vec<String> = Vec::new();
    let mut set = |key: &str, value: String| lines.push(format!("{key} = {value}"));

    set(
        "universe",
        escape_directive(config.condor_universe.as_deref().unwrap_or("vanilla")),
    );
    set("executable", escape_command(&desc.executable));
    if !desc.arguments.is_empty() {
        let args = desc
            .arguments
            .iter()
            .map(|a| condor_quote(a))
            .collect::<Vec<_>>()
            .join(" ");
        set("arguments", escape_command(&format!("\"{args}\"")));
    }
    if !desc.environment.is_empty() {
        let env = desc
            .environment
            .iter()
            .map(|(k, v)| condor_quote(&format!("{k}={v}")))
            .collect::<Vec<_>>()
            .join(" ");
        set("environment", escape_command(&format!("\"{env}\"")));
    }
    if let Some(wd) = &desc.working_directory {
        set("initialdir", escape_directive(wd));
    }
    if let Some(output) = desc.resolved_output() {
        set("output", escape_directive(&output));
    }
    if let Some(error) = desc.resolved_error() {
        set("error", escape_directive(&error));
    }
    if let Some(input) = desc.resolved_input() {
        set("input", escape_directive(&input));
    }
    set("request_cpus", desc.total_cpu_count.to_string());
    if let Some(gpus) = desc.total_gpu_count {
        set("request_gpus", gpus.to_string());
    }
    if let Some(mem) = desc.total_physical_memory {
        set("request_memory", format!("{mem}M"));
    }
    if let Some(project) = project(desc, config) {
        set("accounting_group", escape_directive(project));
    }
    if !desc.job_contact.is_empty() {
        set("notify_user", escape_directive(&desc.job_contact.join(",")));
        set("notification", "Always".to_string());
    }

    let mut requirements = Vec::new();
    if !desc.candidate_hosts.is_empty() {
        let hosts = desc
            .candidate_hosts
            .iter()
            .map(|h| format!("Machine == \"{h}\""))
            .collect::<Vec<_>>()
            .join(" || ");
        requirements.push(format!("({hosts})"));
    }
    if let Some(arch) = &desc.cpu_architecture {
        requirements.push(format!("(Arch == \"{arch}\")"));
    }
    if !requirements.is_empty() {
        set("requirements", escape_directive(&requirements.join(" && ")));
    }
    if let Some(minutes) = desc.wall_time_limit {
        // Condor has no walltime limit; remove the job once it ran too long
        set(
            "periodic_remove",
            format!(
                "(JobStatus == 2) && ((time() - EnteredCurrentStatus) > {})",
                u64::from(minutes) * 60
            ),
        );
    }
    for directive in &config.extra_directives {
        lines.push(escape_directive(directive));
    }
    lines.push("queue".to_string());

    let mut submit = lines.join("\n");
    submit.push('\n');
    Ok(submit)
}

#[derive(Debug, Clone, Default, PartialEq)]
struct CondorRecord {
    status: String,
    info: JobInfo,
}

/// Parse one line of `-af JobStatus ExitCode RemoteHost QDate JobStartDate
/// CompletionDate`. Missing attributes print as `undefined`.
fn parse_autoformat(output: &str) -> Option<CondorRecord> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 6 || fields[0].parse::<u32>().is_err() {
        return None;
    }
    let mut info = JobInfo::default().with_exit_code(fields[1].parse().ok());
    if let Some((_, host)) = fields[2].split_once('@') {
        info.exec_hosts = vec![host.to_string()];
    }
    info.created = parse_timestamp(fields[3]);
    info.started = parse_timestamp(fields[4]);
    info.finished = parse_timestamp(fields[5]);
    Some(CondorRecord {
        status: fields[0].to_string(),
        info,
    })
}

/// Adaptor for HTCondor pools. Native ids are cluster numbers.
pub struct CondorAdaptor {
    ctx: AdaptorContext,
}

impl CondorAdaptor {
    pub fn new(ctx: AdaptorContext) -> Self {
        Self { ctx }
    }

    fn to_info(&self, rec: CondorRecord) -> JobInfo {
        let mut info = rec.info;
        info.state = self.translate_state(&rec.status, info.exit_code);
        info.native_state = Some(rec.status);
        info
    }

    async fn run_history(&self, native_id: &str) -> SchedResult<Option<JobInfo>> {
        let command = format!(
            "condor_history {} -limit 1 -af {ATTRIBUTES}",
            quote_arg(native_id)
        );
        let output = run_query(self.ctx.shell.as_ref(), &command).await?;
        Ok(parse_autoformat(&output.stdout).map(|rec| self.to_info(rec)))
    }
}

#[async_trait]
impl SchedulerAdaptor for CondorAdaptor {
    fn name(&self) -> &str {
        "condor"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            suspend: true,
            bulk_query: false,
            accounting: true,
        }
    }

    fn generate_script(&self, desc: &JobDescription) -> SchedResult<String> {
        generate_condor_submit(desc, &self.ctx.config.backend)
    }

    async fn submit(&self, desc: &JobDescription) -> SchedResult<String> {
        let script = self.generate_script(desc)?;
        ScriptSubmission {
            shell: self.ctx.shell.as_ref(),
            desc,
            script,
            extension: "sub",
        }
        .submit(
            |path| format!("condor_submit {path}"),
            |out| capture(&SUBMIT_RE, &out.stdout),
        )
        .await
    }

    async fn fetch_info(&self, native_id: &str, _last: &JobInfo) -> SchedResult<Option<JobInfo>> {
        let command = format!("condor_q {} -af {ATTRIBUTES}", quote_arg(native_id));
        let output = run_query(self.ctx.shell.as_ref(), &command).await?;
        if let Some(rec) = parse_autoformat(&output.stdout) {
            return Ok(Some(self.to_info(rec)));
        }

        let config = &self.ctx.config;
        with_accounting_retries(config.accounting_retries, config.accounting_backoff(), || {
            self.run_history(native_id)
        })
        .await
    }

    fn translate_state(&self, token: &str, exit_code: Option<i32>) -> JobState {
        match token.trim() {
            "1" | "5" => JobState::Pending,
            "2" | "6" => JobState::Running,
            "3" => JobState::Canceled,
            "4" => match exit_code {
                Some(0) => JobState::Done,
                _ => JobState::Failed,
            },
            "7" => JobState::Suspended,
            _ => JobState::Unknown,
        }
    }

    async fn cancel(&self, native_id: &str) -> SchedResult<()> {
        let command = format!("condor_rm {}", quote_arg(native_id));
        let output = self.ctx.shell.run(&command).await?;
        let text = output.combined();
        if text.contains("not found") || text.contains("Couldn't find") {
            return Err(SchedError::JobNotFound(native_id.to_string()));
        }
        if !output.success() {
            return Err(SchedError::query(command, text.trim()));
        }
        Ok(())
    }

    async fn suspend(&self, native_id: &str) -> SchedResult<()> {
        run_control(
            self.ctx.shell.as_ref(),
            &format!("condor_suspend {}", quote_arg(native_id)),
        )
        .await
    }

    async fn resume(&self, native_id: &str) -> SchedResult<()> {
        run_control(
            self.ctx.shell.as_ref(),
            &format!("condor_continue {}", quote_arg(native_id)),
        )
        .await
    }

    async fn list(&self) -> SchedResult<Vec<String>> {
        let output = run_query(self.ctx.shell.as_ref(), "condor_q -af ClusterId").await?;
        let mut ids: Vec<String> = Vec::new();
        for id in output.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if !ids.iter().any(|i| i == id) {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }
}
