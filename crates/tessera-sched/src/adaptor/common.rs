//! Pieces shared by the script based adaptors.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;

use crate::config::BackendConfig;
use crate::description::JobDescription;
use crate::error::{SchedError, SchedResult};
use crate::shell::{CommandOutput, RemoteShell, dquote};
use crate::state::JobInfo;

/// Escape text for the command portion of a script.
///
/// Scripts reach the remote side through a double-quoted shell expansion;
/// everything here must survive it literally.
pub(crate) fn escape_command(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '"' | '`' | '$') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Escape text for the directive portion. `$VAR` stays live so that
/// `$HOME` style paths resolve when the script is written.
pub(crate) fn escape_directive(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '"') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// `ceil(cpus / ppn)`, at least one node.
pub(crate) fn node_count(cpus: u32, ppn: u32) -> u32 {
    cpus.div_ceil(ppn.max(1)).max(1)
}

/// Minutes as `HH:MM:SS`.
pub(crate) fn format_walltime(minutes: u32) -> String {
    format!("{:02}:{:02}:00", minutes / 60, minutes % 60)
}

/// Replace characters batch systems reject in job names.
pub(crate) fn sanitize_name(name: &str, max_len: usize) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(max_len)
        .collect()
}

/// Quote a single argument for a command line we build ourselves.
pub(crate) fn quote_arg(s: &str) -> String {
    shell_escape::unix::escape(s.into()).into_owned()
}

/// The executable and its arguments, escaped.
pub(crate) fn command_line(desc: &JobDescription) -> String {
    let mut line = escape_command(&desc.executable);
    for arg in &desc.arguments {
        line.push(' ');
        line.push_str(&escape_command(arg));
    }
    line
}

/// `export` statements for the job environment. Values are single quoted in
/// the final script.
pub(crate) fn export_lines(desc: &JobDescription) -> String {
    let mut out = String::new();
    for (key, value) in &desc.environment {
        let value = value.replace('\'', "'\\''");
        out.push_str(&format!("export {}='{}'\n", key, escape_command(&value)));
    }
    out
}

/// `module load` lines and the working directory change that open every
/// script body.
pub(crate) fn prologue(desc: &JobDescription, config: &BackendConfig) -> String {
    let mut out = String::new();
    for module in &config.modules {
        out.push_str(&format!("module load {}\n", escape_command(module)));
    }
    if let Some(wd) = &desc.working_directory {
        out.push_str(&format!("cd \\\"{}\\\"\n", escape_directive(wd)));
    }
    out.push_str(&export_lines(desc));
    out
}

/// Queue from the description, falling back to the configured default.
pub(crate) fn queue<'a>(desc: &'a JobDescription, config: &'a BackendConfig) -> Option<&'a str> {
    desc.queue.as_deref().or(config.queue.as_deref())
}

pub(crate) fn project<'a>(desc: &'a JobDescription, config: &'a BackendConfig) -> Option<&'a str> {
    desc.project.as_deref().or(config.project.as_deref())
}

/// Steps shared by every script based submission.
pub(crate) struct ScriptSubmission<'a> {
    pub shell: &'a dyn RemoteShell,
    pub desc: &'a JobDescription,
    pub script: String,
    /// Temp file suffix (`pbs`, `slurm`, ...).
    pub extension: &'a str,
}

impl ScriptSubmission<'_> {
    /// Create directories, write the script, submit it and parse the id.
    ///
    /// Output and error directories are created on the submit host, which
    /// assumes it shares a filesystem with the compute nodes.
    pub(crate) async fn submit<C, P>(self, submit_command: C, parse_id: P) -> SchedResult<String>
    where
        C: FnOnce(&str) -> String,
        P: FnOnce(&CommandOutput) -> Option<String>,
    {
        let mut dirs: Vec<String> = Vec::new();
        if let Some(wd) = &self.desc.working_directory {
            dirs.push(wd.clone());
        }
        for path in [self.desc.resolved_output(), self.desc.resolved_error()]
            .into_iter()
            .flatten()
        {
            if let Some((parent, _)) = path.rsplit_once('/') {
                if !parent.is_empty() && !dirs.iter().any(|d| d == parent) {
                    dirs.push(parent.to_string());
                }
            }
        }
        if !dirs.is_empty() {
            let mkdir = format!(
                "mkdir -p {}",
                dirs.iter().map(|d| dquote(d)).collect::<Vec<_>>().join(" ")
            );
            let out = self.shell.run(&mkdir).await?;
            if !out.success() {
                return Err(submission_error(&mkdir, out));
            }
        }

        let base = self
            .desc
            .working_directory
            .clone()
            .unwrap_or_else(|| "$HOME".to_string());
        let script_path = format!(
            "{}/.tessera-{}.{}",
            base.trim_end_matches('/'),
            uuid::Uuid::new_v4().simple(),
            self.extension
        );
        self.shell
            .write_to_remote(&self.script, &script_path)
            .await?;

        let command = submit_command(&dquote(&script_path));
        let result = self.shell.run(&command).await;

        let cleanup = format!("rm -f {}", dquote(&script_path));
        match self.shell.run(&cleanup).await {
            Ok(out) if !out.success() => {
                tracing::warn!("Could not remove {}: {}", script_path, out.stderr.trim());
            }
            Err(e) => tracing::warn!("Could not remove {}: {}", script_path, e),
            Ok(_) => {}
        }

        let output = result?;
        if !output.success() {
            return Err(submission_error(&command, output));
        }
        match parse_id(&output) {
            Some(id) => {
                tracing::info!("Submitted {} as native job {}", self.desc.display_name(), id);
                Ok(id)
            }
            None => Err(submission_error(&command, output)),
        }
    }
}

fn submission_error(command: &str, output: CommandOutput) -> SchedError {
    SchedError::Submission {
        command: command.to_string(),
        exit_code: output.exit_code,
        stdout: output.stdout,
        stderr: output.stderr,
    }
}

/// Run a command whose failure is a query error.
pub(crate) async fn run_query(shell: &dyn RemoteShell, command: &str) -> SchedResult<CommandOutput> {
    let output = shell.run(command).await?;
    if !output.success() {
        return Err(SchedError::query(command, output.stderr.trim()));
    }
    Ok(output)
}

/// Run a control command (cancel, suspend, ...) that must succeed.
pub(crate) async fn run_control(shell: &dyn RemoteShell, command: &str) -> SchedResult<()> {
    let output = shell.run(command).await?;
    if !output.success() {
        let message = if output.stderr.trim().is_empty() {
            output.stdout.trim().to_string()
        } else {
            output.stderr.trim().to_string()
        };
        return Err(SchedError::query(command, message));
    }
    Ok(())
}

/// Retry an accounting lookup. Records of a job that just left the queue
/// often show up with a delay.
pub(crate) async fn with_accounting_retries<F, Fut>(
    retries: u32,
    backoff: Duration,
    mut lookup: F,
) -> SchedResult<Option<JobInfo>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SchedResult<Option<JobInfo>>>,
{
    let mut delay = backoff;
    for attempt in 0..retries.max(1) {
        if let Some(info) = lookup().await? {
            return Ok(Some(info));
        }
        if attempt + 1 < retries {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }
    Ok(None)
}

/// First capture group of `re` in `text`.
pub(crate) fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Parse the timestamp formats batch systems print. Naive times are taken
/// as UTC.
pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() || matches!(s, "Unknown" | "N/A" | "None" | "undefined" | "-" | "0") {
        return None;
    }
    if let Ok(epoch) = s.parse::<i64>() {
        return Utc.timestamp_opt(epoch, 0).single();
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    const FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S",
        "%a %b %e %H:%M:%S %Y",
        "%m/%d/%Y %H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
    ];
    let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&collapsed, fmt).ok())
        .map(|naive| naive.and_utc())
}
