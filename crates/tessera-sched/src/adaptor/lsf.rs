//! IBM Spectrum LSF.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use crate::adaptor::common::{
    ScriptSubmission, capture, command_line, escape_directive, project, prologue, queue,
    quote_arg, run_control, sanitize_name,
};
use crate::adaptor::{AdaptorContext, Capabilities, SchedulerAdaptor};
use crate::config::BackendConfig;
use crate::description::{JobDescription, SpmdVariation};
use crate::error::{SchedError, SchedResult};
use crate::state::{JobInfo, JobState};

static BSUB_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Job <(\d+)> is submitted").expect("valid regex"));

const BJOBS_FORMAT: &str = "jobid stat exit_code exec_host delimiter='|'";

/// Generate an LSF batch script for a job.
pub fn generate_lsf_script(desc: &JobDescription, config: &BackendConfig) -> SchedResult<String> {
    desc.validate()?;

    let mut script = String::new();
    script.push_str("#!/bin/bash\n");
    script.push_str(&format!(
        "#BSUB -J {}\n",
        sanitize_name(&desc.display_name(), 128)
    ));

    if let Some(wd) = &desc.working_directory {
        script.push_str(&format!("#BSUB -cwd {}\n", escape_directive(wd)));
    }
    if let Some(output) = desc.resolved_output() {
        script.push_str(&format!("#BSUB -o {}\n", escape_directive(&output)));
    }
    if let Some(error) = desc.resolved_error() {
        script.push_str(&format!("#BSUB -e {}\n", escape_directive(&error)));
    }
    if let Some(input) = desc.resolved_input() {
        script.push_str(&format!("#BSUB -i {}\n", escape_directive(&input)));
    }
    if let Some(queue) = queue(desc, config) {
        script.push_str(&format!("#BSUB -q {}\n", escape_directive(queue)));
    }
    if let Some(project) = project(desc, config) {
        script.push_str(&format!("#BSUB -P {}\n", escape_directive(project)));
    }
    if let Some(minutes) = desc.wall_time_limit {
        script.push_str(&format!("#BSUB -W {}:{:02}\n", minutes / 60, minutes % 60));
    }

    script.push_str(&format!("#BSUB -n {}\n", desc.total_cpu_count));
    if let Some(ppn) = desc.processes_per_host.or(config.ppn) {
        script.push_str(&resource_directive(&format!("span[ptile={ppn}]")));
    }
    if let Some(gpus) = desc.total_gpu_count {
        script.push_str(&format!(
            "#BSUB -gpu {}\n",
            escape_directive(&format!("\"num={gpus}\""))
        ));
    }
    if let Some(mem) = desc.total_physical_memory {
        script.push_str(&resource_directive(&format!("rusage[mem={mem}]")));
    }
    if let Some(arch) = &desc.cpu_architecture {
        script.push_str(&resource_directive(&format!("select[type=={arch}]")));
    }
    if !desc.job_contact.is_empty() {
        script.push_str(&format!(
            "#BSUB -u {}\n#BSUB -N\n",
            escape_directive(&desc.job_contact.join(","))
        ));
    }
    if !desc.candidate_hosts.is_empty() {
        script.push_str(&format!(
            "#BSUB -m {}\n",
            escape_directive(&format!("\"{}\"", desc.candidate_hosts.join(" ")))
        ));
    }
    for directive in &config.extra_directives {
        script.push_str(&format!("#BSUB {}\n", escape_directive(directive)));
    }

    script.push('\n');
    script.push_str(&prologue(desc, config));
    if matches!(
        desc.spmd_variation,
        Some(SpmdVariation::Mpi | SpmdVariation::MpichG)
    ) {
        script.push_str("mpirun ");
    }
    script.push_str(&command_line(desc));
    script.push('\n');

    Ok(script)
}

fn resource_directive(requirement: &str) -> String {
    format!(
        "#BSUB -R {}\n",
        escape_directive(&format!("\"{requirement}\""))
    )
}

#[derive(Debug, Clone, PartialEq)]
struct LsfJobRecord {
    stat: String,
    exit_code: Option<i32>,
    hosts: Vec<String>,
}

/// Parse one `bjobs -o "... delimiter='|'" -noheader` line.
fn parse_bjobs_line(output: &str, native_id: &str) -> Option<LsfJobRecord> {
    output.lines().find_map(|line| {
        let fields: Vec<&str> = line.trim().split('|').collect();
        if fields.len() < 4 || fields[0] != native_id {
            return None;
        }
        Some(LsfJobRecord {
            stat: fields[1].trim().to_string(),
            exit_code: fields[2].trim().parse().ok(),
            hosts: parse_exec_host(fields[3]),
        })
    })
}

/// `4*node01:2*node02` → `[node01, node02]`.
fn parse_exec_host(value: &str) -> Vec<String> {
    let mut hosts: Vec<String> = Vec::new();
    for part in value.split(':') {
        let host = part.rsplit('*').next().unwrap_or("").trim();
        if !host.is_empty() && host != "-" && !hosts.iter().any(|h| h == host) {
            hosts.push(host.to_string());
        }
    }
    hosts
}

fn is_unknown_job(text: &str) -> bool {
    text.contains("is not found") || text.contains("No matching job found")
}

/// Adaptor for LSF clusters.
///
/// Finished jobs stay visible in `bjobs` for the cluster's `CLEAN_PERIOD`;
/// there is no accounting fallback after that.
pub struct LsfAdaptor {
    ctx: AdaptorContext,
}

impl LsfAdaptor {
    pub fn new(ctx: AdaptorContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl SchedulerAdaptor for LsfAdaptor {
    fn name(&self) -> &str {
        "lsf"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            suspend: true,
            bulk_query: false,
            accounting: false,
        }
    }

    fn generate_script(&self, desc: &JobDescription) -> SchedResult<String> {
        generate_lsf_script(desc, &self.ctx.config.backend)
    }

    async fn submit(&self, desc: &JobDescription) -> SchedResult<String> {
        let script = self.generate_script(desc)?;
        ScriptSubmission {
            shell: self.ctx.shell.as_ref(),
            desc,
            script,
            extension: "lsf",
        }
        .submit(
            // bsub reads embedded directives only from stdin
            |path| format!("bsub < {path}"),
            |out| capture(&BSUB_RE, &out.stdout),
        )
        .await
    }

    async fn fetch_info(&self, native_id: &str, _last: &JobInfo) -> SchedResult<Option<JobInfo>> {
        let command = format!(
            "bjobs -noheader -o {} {}",
            quote_arg(BJOBS_FORMAT),
            quote_arg(native_id)
        );
        let output = self.ctx.shell.run(&command).await?;
        if is_unknown_job(&output.combined()) {
            return Ok(None);
        }
        if !output.success() {
            return Err(SchedError::query(command, output.stderr.trim()));
        }
        Ok(parse_bjobs_line(&output.stdout, native_id).map(|rec| {
            let state = self.translate_state(&rec.stat, rec.exit_code);
            JobInfo::new(state)
                .with_native_state(rec.stat)
                .with_exit_code(rec.exit_code.or((state == JobState::Done).then_some(0)))
                .with_exec_hosts(rec.hosts)
        }))
    }

    fn translate_state(&self, token: &str, _exit_code: Option<i32>) -> JobState {
        match token.trim() {
            "PEND" | "WAIT" | "PROV" => JobState::Pending,
            "RUN" => JobState::Running,
            "PSUSP" | "USUSP" | "SSUSP" => JobState::Suspended,
            "DONE" => JobState::Done,
            "EXIT" => JobState::Failed,
            "ZOMBI" => JobState::Canceled,
            _ => JobState::Unknown,
        }
    }

    async fn cancel(&self, native_id: &str) -> SchedResult<()> {
        let command = format!("bkill {}", quote_arg(native_id));
        let output = self.ctx.shell.run(&command).await?;
        let text = output.combined();
        if is_unknown_job(&text) {
            return Err(SchedError::JobNotFound(native_id.to_string()));
        }
        if !output.success() && !text.contains("already finished") {
            return Err(SchedError::query(command, text.trim()));
        }
        Ok(())
    }

    async fn suspend(&self, native_id: &str) -> SchedResult<()> {
        run_control(
            self.ctx.shell.as_ref(),
            &format!("bstop {}", quote_arg(native_id)),
        )
        .await
    }

    async fn resume(&self, native_id: &str) -> SchedResult<()> {
        run_control(
            self.ctx.shell.as_ref(),
            &format!("bresume {}", quote_arg(native_id)),
        )
        .await
    }

    async fn list(&self) -> SchedResult<Vec<String>> {
        let command = "bjobs -noheader -o jobid";
        let output = self.ctx.shell.run(command).await?;
        // "No unfinished job found" comes with a non-zero exit
        if !output.success() && !output.combined().contains("No unfinished job found") {
            return Err(SchedError::query(command, output.stderr.trim()));
        }
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && l.chars().all(|c| c.is_ascii_digit()))
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::ServiceConfig;
    use crate::resource::ResourceUrl;
    use crate::shell::{CommandOutput, ScriptedShell};

    fn adaptor(shell: Arc<ScriptedShell>) -> LsfAdaptor {
        LsfAdaptor::new(AdaptorContext {
            url: ResourceUrl::parse("lsf://localhost").unwrap(),
            config: Arc::new(ServiceConfig::default()),
            shell,
        })
    }

    #[test]
    fn test_script() {
        let desc = JobDescription::new("./app")
            .with_name("lsf test")
            .with_wall_time_limit(90)
            .with_total_cpu_count(32)
            .with_processes_per_host(16)
            .with_total_physical_memory(1000)
            .with_queue("normal")
            .with_candidate_host("h1")
            .with_candidate_host("h2")
            .with_spmd_variation(SpmdVariation::Mpi);
        let script = generate_lsf_script(&desc, &BackendConfig::default()).unwrap();
        assert!(script.starts_with("#!/bin/bash\n#BSUB -J lsf_test\n"));
        assert!(script.contains("#BSUB -q normal\n"));
        assert!(script.contains("#BSUB -W 1:30\n"));
        assert!(script.contains("#BSUB -n 32\n"));
        assert!(script.contains("#BSUB -R \\\"span[ptile=16]\\\"\n"));
        assert!(script.contains("#BSUB -R \\\"rusage[mem=1000]\\\"\n"));
        assert!(script.contains("#BSUB -m \\\"h1 h2\\\"\n"));
        assert!(script.ends_with("mpirun ./app\n"));
    }

    #[test]
    fn test_translate_state() {
        let lsf = adaptor(Arc::new(ScriptedShell::new()));
        assert_eq!(lsf.translate_state("PEND", None), JobState::Pending);
        assert_eq!(lsf.translate_state("RUN", None), JobState::Running);
        assert_eq!(lsf.translate_state("USUSP", None), JobState::Suspended);
        assert_eq!(lsf.translate_state("DONE", None), JobState::Done);
        assert_eq!(lsf.translate_state("EXIT", Some(1)), JobState::Failed);
        assert_eq!(lsf.translate_state("ZOMBI", None), JobState::Canceled);
        assert_eq!(lsf.translate_state("UNKWN", None), JobState::Unknown);
    }

    #[test]
    fn test_parse_exec_host() {
        assert_eq!(parse_exec_host("4*node01:2*node02"), vec!["node01", "node02"]);
        assert_eq!(parse_exec_host("node03"), vec!["node03"]);
        assert!(parse_exec_host("-").is_empty());
    }

    #[tokio::test]
    async fn test_submit_and_fetch() {
        let shell = Arc::new(
            ScriptedShell::new()
                .on(
                    "bsub",
                    CommandOutput::ok("Job <4242> is submitted to queue <normal>.\n"),
                )
                .on("bjobs", CommandOutput::ok("4242|EXIT|3|2*n1:n2\n")),
        );
        let lsf = adaptor(shell.clone());
        let id = lsf.submit(&JobDescription::new("a.out")).await.unwrap();
        assert_eq!(id, "4242");
        assert!(shell.commands().iter().any(|c| c.starts_with("bsub < ")));

        let info = lsf.fetch_info(&id, &JobInfo::default()).await.unwrap().unwrap();
        assert_eq!(info.state, JobState::Failed);
        assert_eq!(info.exit_code, Some(3));
        assert_eq!(info.exec_hosts, vec!["n1", "n2"]);
    }

    #[tokio::test]
    async fn test_done_without_exit_code_reports_zero() {
        let shell = Arc::new(ScriptedShell::new().on("bjobs", CommandOutput::ok("7|DONE|-|n1\n")));
        let info = adaptor(shell)
            .fetch_info("7", &JobInfo::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let shell = Arc::new(
            ScriptedShell::new()
                .on("bjobs", CommandOutput::failed(255, "Job <8> is not found"))
                .on("bkill", CommandOutput::failed(255, "Job <8>: No matching job found")),
        );
        let lsf = adaptor(shell);
        assert!(lsf.fetch_info("8", &JobInfo::default()).await.unwrap().is_none());
        assert!(matches!(lsf.cancel("8").await, Err(SchedError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn test_list() {
        let shell = Arc::new(
            ScriptedShell::new().on("bjobs -noheader -o jobid", CommandOutput::ok("11\n12\n")),
        );
        assert_eq!(adaptor(shell).list().await.unwrap(), vec!["11", "12"]);
    }
}
