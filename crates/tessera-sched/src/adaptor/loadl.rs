//! IBM Tivoli Workload Scheduler LoadLeveler.

use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;

use crate::adaptor::common::{
    ScriptSubmission, capture, command_line, escape_directive, format_walltime, node_count,
    parse_timestamp, project, prologue, queue, quote_arg, run_query, sanitize_name,
};
use crate::adaptor::{AdaptorContext, Capabilities, SchedulerAdaptor};
use crate::config::BackendConfig;
use crate::description::{JobDescription, SpmdVariation};
use crate::error::{SchedError, SchedResult};
use crate::state::{JobInfo, JobState};

static LLSUBMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"The job "([^"]+)" has been submitted"#).expect("valid regex"));

fn keyword(script: &mut String, key: &str, value: &str) {
    script.push_str(&format!("#@ {key} = {}\n", escape_directive(value)));
}

/// Generate a LoadLeveler job command file.
pub fn generate_loadl_script(desc: &JobDescription, config: &BackendConfig) -> SchedResult<String> {
    desc.validate()?;

    let cpus = desc.total_cpu_count;
    let class = queue(desc, config);
    if cpus > 1 && class.is_none() {
        return Err(SchedError::Parameter(
            "parallel LoadLeveler jobs need a class (queue)".into(),
        ));
    }

    let mut script = String::new();
    script.push_str("#!/bin/bash\n");
    keyword(&mut script, "job_name", &sanitize_name(&desc.display_name(), 64));
    if let Some(wd) = &desc.working_directory {
        keyword(&mut script, "initialdir", wd);
    }
    if let Some(output) = desc.resolved_output() {
        keyword(&mut script, "output", &output);
    }
    if let Some(error) = desc.resolved_error() {
        keyword(&mut script, "error", &error);
    }
    if let Some(input) = desc.resolved_input() {
        keyword(&mut script, "input", &input);
    }
    if let Some(class) = class {
        keyword(&mut script, "class", class);
    }
    if let Some(project) = project(desc, config) {
        keyword(&mut script, "account_no", project);
    }
    if let Some(minutes) = desc.wall_time_limit {
        keyword(&mut script, "wall_clock_limit", &format_walltime(minutes));
    }
    if cpus > 1 {
        keyword(&mut script, "job_type", "parallel");
        match desc.processes_per_host.or(config.ppn) {
            Some(ppn) => {
                keyword(&mut script, "node", &node_count(cpus, ppn).to_string());
                keyword(&mut script, "tasks_per_node", &ppn.min(cpus).to_string());
            }
            None => keyword(&mut script, "total_tasks", &cpus.to_string()),
        }
    }
    if let Some(mem) = desc.total_physical_memory {
        keyword(&mut script, "resources", &format!("ConsumableMemory({mem}mb)"));
    }
    if !desc.job_contact.is_empty() {
        keyword(&mut script, "notify_user", &desc.job_contact.join(","));
        keyword(&mut script, "notification", "always");
    }

    let mut requirements = Vec::new();
    if !desc.candidate_hosts.is_empty() {
        let hosts = desc
            .candidate_hosts
            .iter()
            .map(|h| format!("(Machine == \"{h}\")"))
            .collect::<Vec<_>>()
            .join(" || ");
        requirements.push(format!("({hosts})"));
    }
    if let Some(arch) = &desc.cpu_architecture {
        requirements.push(format!("(Arch == \"{arch}\")"));
    }
    if !requirements.is_empty() {
        keyword(&mut script, "requirements", &requirements.join(" && "));
    }
    for directive in &config.extra_directives {
        script.push_str(&format!("#@ {}\n", escape_directive(directive)));
    }
    script.push_str("#@ queue\n");

    script.push('\n');
    script.push_str(&prologue(desc, config));
    if cpus > 1
        && matches!(
            desc.spmd_variation,
            Some(SpmdVariation::Mpi | SpmdVariation::MpichG)
        )
    {
        script.push_str("poe ");
    }
    script.push_str(&command_line(desc));
    script.push('\n');

    Ok(script)
}

#[derive(Debug, Clone, Default, PartialEq)]
struct LlqRecord {
    status: String,
    hosts: Vec<String>,
    exit_code: Option<i32>,
    queued: Option<DateTime<Utc>>,
    dispatched: Option<DateTime<Utc>>,
    completed: Option<DateTime<Utc>>,
}

/// Parse `llq -l <id>` long listing.
fn parse_llq_long(output: &str) -> Option<LlqRecord> {
    let mut rec = LlqRecord::default();
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Status" => rec.status = value.to_string(),
            "Allocated Host" | "Allocated Hosts" => {
                for host in value.split(|c: char| c == '+' || c.is_whitespace()) {
                    let host = host.split("::").next().unwrap_or("").trim();
                    if !host.is_empty() && !rec.hosts.iter().any(|h| h == host) {
                        rec.hosts.push(host.to_string());
                    }
                }
            }
            "Completion Code" => rec.exit_code = value.parse().ok(),
            "Queue Date" => rec.queued = parse_timestamp(value),
            "Dispatch Time" => rec.dispatched = parse_timestamp(value),
            "Completion Date" => rec.completed = parse_timestamp(value),
            _ => {}
        }
    }
    (!rec.status.is_empty()).then_some(rec)
}

fn is_unknown_job(text: &str) -> bool {
    text.contains("no job status to report") || text.contains("is not a valid")
}

/// Adaptor for LoadLeveler clusters. Native ids are `host.cluster`.
pub struct LoadLevelerAdaptor {
    ctx: AdaptorContext,
}

impl LoadLevelerAdaptor {
    pub fn new(ctx: AdaptorContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl SchedulerAdaptor for LoadLevelerAdaptor {
    fn name(&self) -> &str {
        "loadl"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn generate_script(&self, desc: &JobDescription) -> SchedResult<String> {
        generate_loadl_script(desc, &self.ctx.config.backend)
    }

    async fn submit(&self, desc: &JobDescription) -> SchedResult<String> {
        let script = self.generate_script(desc)?;
        ScriptSubmission {
            shell: self.ctx.shell.as_ref(),
            desc,
            script,
            extension: "ll",
        }
        .submit(
            |path| format!("llsubmit {path}"),
            |out| capture(&LLSUBMIT_RE, &out.combined()),
        )
        .await
    }

    async fn fetch_info(&self, native_id: &str, _last: &JobInfo) -> SchedResult<Option<JobInfo>> {
        let command = format!("llq -l {}", quote_arg(native_id));
        let output = self.ctx.shell.run(&command).await?;
        if is_unknown_job(&output.combined()) {
            return Ok(None);
        }
        if !output.success() {
            return Err(SchedError::query(command, output.stderr.trim()));
        }
        Ok(parse_llq_long(&output.stdout).map(|rec| {
            let state = self.translate_state(&rec.status, rec.exit_code);
            let mut info = JobInfo::new(state)
                .with_native_state(rec.status)
                .with_exit_code(rec.exit_code)
                .with_exec_hosts(rec.hosts);
            info.created = rec.queued;
            info.started = rec.dispatched;
            info.finished = rec.completed;
            info
        }))
    }

    /// Accepts both the long status names of `llq -l` and the two letter
    /// codes of the short listing.
    fn translate_state(&self, token: &str, _exit_code: Option<i32>) -> JobState {
        match token.trim() {
            "Idle" | "I" | "Pending" | "P" | "Deferred" | "D" | "NotQueued" | "NQ" | "V"
            | "Vacated" => JobState::Pending,
            t if t.starts_with("Hold") || t.ends_with("Hold") || t == "H" || t == "S"
                || t == "HS" =>
            {
                JobState::Pending
            }
            "Starting" | "ST" | "Running" | "R" => JobState::Running,
            "Preempted" | "E" => JobState::Suspended,
            "Completed" | "C" => JobState::Done,
            "Canceled" | "CA" | "Removed" | "RM" => JobState::Canceled,
            "Rejected" | "X" | "Terminated" | "TX" => JobState::Failed,
            _ => JobState::Unknown,
        }
    }

    async fn cancel(&self, native_id: &str) -> SchedResult<()> {
        let command = format!("llcancel {}", quote_arg(native_id));
        let output = self.ctx.shell.run(&command).await?;
        if is_unknown_job(&output.combined()) {
            return Err(SchedError::JobNotFound(native_id.to_string()));
        }
        if !output.success() {
            return Err(SchedError::query(command, output.combined().trim()));
        }
        Ok(())
    }

    async fn list(&self) -> SchedResult<Vec<String>> {
        let output = run_query(self.ctx.shell.as_ref(), "llq -u $USER").await?;
        let mut ids: Vec<String> = Vec::new();
        for token in output.stdout.lines().filter_map(|l| l.split_whitespace().next()) {
            // step ids are `host.cluster.step`
            let Some((job, step)) = token.rsplit_once('.') else {
                continue;
            };
            if step.chars().all(|c| c.is_ascii_digit()) && !ids.iter().any(|i| i == job) {
                ids.push(job.to_string());
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::ServiceConfig;
    use crate::resource::ResourceUrl;
    use crate::shell::{CommandOutput, ScriptedShell};

    fn adaptor(shell: Arc<ScriptedShell>) -> LoadLevelerAdaptor {
        LoadLevelerAdaptor::new(AdaptorContext {
            url: ResourceUrl::parse("loadl://localhost").unwrap(),
            config: Arc::new(ServiceConfig::default()),
            shell,
        })
    }

    #[test]
    fn test_script() {
        let desc = JobDescription::new("./app")
            .with_total_cpu_count(8)
            .with_queue("parallel")
            .with_wall_time_limit(60)
            .with_candidate_host("n1")
            .with_spmd_variation(SpmdVariation::Mpi);
        let script = generate_loadl_script(&desc, &BackendConfig::default()).unwrap();
        assert!(script.starts_with("#!/bin/bash\n#@ job_name = app\n"));
        assert!(script.contains("#@ class = parallel\n"));
        assert!(script.contains("#@ wall_clock_limit = 01:00:00\n"));
        assert!(script.contains("#@ job_type = parallel\n#@ total_tasks = 8\n"));
        assert!(script.contains("#@ requirements = ((Machine == \\\"n1\\\"))\n"));
        assert!(script.contains("#@ queue\n\npoe ./app\n"));
    }

    #[test]
    fn test_parallel_job_needs_class() {
        let desc = JobDescription::new("./app").with_total_cpu_count(4);
        assert!(matches!(
            generate_loadl_script(&desc, &BackendConfig::default()),
            Err(SchedError::Parameter(_))
        ));
    }

    #[test]
    fn test_translate_state() {
        let ll = adaptor(Arc::new(ScriptedShell::new()));
        assert_eq!(ll.translate_state("Idle", None), JobState::Pending);
        assert_eq!(ll.translate_state("User Hold", None), JobState::Pending);
        assert_eq!(ll.translate_state("Running", None), JobState::Running);
        assert_eq!(ll.translate_state("ST", None), JobState::Running);
        assert_eq!(ll.translate_state("Preempted", None), JobState::Suspended);
        assert_eq!(ll.translate_state("Completed", None), JobState::Done);
        assert_eq!(ll.translate_state("Removed", None), JobState::Canceled);
        assert_eq!(ll.translate_state("Rejected", None), JobState::Failed);
        assert_eq!(ll.translate_state("???", None), JobState::Unknown);
    }

    #[tokio::test]
    async fn test_submit_and_fetch() {
        let shell = Arc::new(
            ScriptedShell::new()
                .on(
                    "llsubmit",
                    CommandOutput::ok("llsubmit: The job \"login1.77\" has been submitted.\n"),
                )
                .on(
                    "llq -l",
                    CommandOutput::ok(
                        "===== Job Step login1.77.0 =====\n\
                         \x20       Job Step Id: login1.77.0\n\
                         \x20        Queue Date: Mon Jan 15 10:29:00 2024\n\
                         \x20            Status: Running\n\
                         \x20     Dispatch Time: Mon Jan 15 10:30:00 2024\n\
                         \x20    Allocated Host: node04\n",
                    ),
                ),
        );
        let ll = adaptor(shell);
        let id = ll.submit(&JobDescription::new("a.out")).await.unwrap();
        assert_eq!(id, "login1.77");
        let info = ll.fetch_info(&id, &JobInfo::default()).await.unwrap().unwrap();
        assert_eq!(info.state, JobState::Running);
        assert_eq!(info.exec_hosts, vec!["node04"]);
        assert!(info.started.is_some());
    }

    #[tokio::test]
    async fn test_unknown_job_and_list() {
        let shell = Arc::new(
            ScriptedShell::new()
                .on(
                    "llq -l",
                    CommandOutput::ok("llq: There is currently no job status to report.\n"),
                )
                .on(
                    "llq -u",
                    CommandOutput::ok(
                        "Id                       Owner      Submitted   ST PRI Class        Running On\n\
                         ------------------------ ---------- ----------- -- --- ------------ -----------\n\
                         login1.77.0              alice       1/15 10:29 R  50  parallel     node04\n\
                         \n\
                         1 job step(s) in queue, 0 waiting, 0 pending, 1 running, 0 held, 0 preempted\n",
                    ),
                ),
        );
        let ll = adaptor(shell);
        assert!(ll.fetch_info("login1.78", &JobInfo::default()).await.unwrap().is_none());
        assert_eq!(ll.list().await.unwrap(), vec!["login1.77"]);
    }
}
