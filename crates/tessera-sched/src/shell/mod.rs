//! Command execution on the scheduler's submit host.
//!
//! Every adaptor talks to its backend exclusively through [`RemoteShell`].
//! A service owns exactly one shell and wraps it in [`SerialShell`] so that
//! commands from the monitor and from callers never interleave.

mod local;
mod scripted;
mod serial;
mod ssh;

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::ServiceConfig;
use crate::error::{SchedError, SchedResult};
use crate::resource::{ResourceUrl, Transport};

pub use local::LocalShell;
pub use scripted::ScriptedShell;
pub use serial::SerialShell;
pub use ssh::SshShell;

/// Captured result of one command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful command with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed command with the given exit code and stderr.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr, for parsers that must look at both.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// A persistent shell on the host where scheduler commands are available.
///
/// Paths on the shell side are strings and may use shell expansions such as
/// `$HOME`.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Human readable target (`localhost`, `alice@login1`).
    fn target(&self) -> &str;

    /// Run a command through `sh -c` semantics.
    async fn run(&self, command: &str) -> SchedResult<CommandOutput>;

    /// Write `content` to `path`.
    ///
    /// `content` is expanded inside double quotes on the shell side, so
    /// callers escape `\`, `"`, `` ` `` and `$` wherever a literal is wanted.
    async fn write_to_remote(&self, content: &str, path: &str) -> SchedResult<()> {
        let command = format!("printf '%s' \"{content}\" > {}", dquote(path));
        let output = self.run(&command).await?;
        if !output.success() {
            return Err(SchedError::Command {
                command: format!("write {path}"),
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    /// Copy a local file to the shell side.
    async fn stage_to_remote(&self, local: &Path, remote: &str, append: bool) -> SchedResult<()>;

    /// Copy a file from the shell side to the local filesystem.
    async fn stage_from_remote(&self, remote: &str, local: &Path, append: bool)
    -> SchedResult<()>;

    /// Release the connection. `kill` tears it down without waiting for
    /// other users of a shared connection.
    async fn finalize(&self, _kill: bool) -> SchedResult<()> {
        Ok(())
    }
}

/// Open the shell a service at `url` should use.
pub fn connect(url: &ResourceUrl, config: &ServiceConfig) -> Arc<dyn RemoteShell> {
    let shell: Arc<dyn RemoteShell> = match url.transport() {
        Transport::Local => Arc::new(LocalShell::new(config.command_timeout())),
        Transport::Ssh => Arc::new(SshShell::new(url, &config.ssh, config.command_timeout())),
    };
    Arc::new(SerialShell::new(shell))
}

/// Double-quote a path, leaving `$VAR` expansions active.
pub(crate) fn dquote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if matches!(c, '"' | '\\' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Run a local program with a timeout.
pub(crate) async fn exec(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> SchedResult<CommandOutput> {
    let shown = format!("{program} {}", args.join(" "));
    tracing::debug!(command = %shown, "exec");

    let output = tokio::time::timeout(
        timeout,
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| SchedError::Timeout(format!("`{shown}` timed out after {timeout:?}")))?
    .map_err(|e| SchedError::Command {
        command: shown.clone(),
        message: e.to_string(),
    })?;

    Ok(output.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dquote() {
        assert_eq!(dquote("$HOME/a b"), "\"$HOME/a b\"");
        assert_eq!(dquote("x\"y`z"), "\"x\\\"y\\`z\"");
    }

    #[test]
    fn test_command_output() {
        assert!(CommandOutput::ok("1").success());
        let failed = CommandOutput::failed(2, "nope");
        assert!(!failed.success());
        assert!(failed.combined().contains("nope"));
    }

    #[tokio::test]
    async fn test_exec_program() {
        let out = exec("/bin/echo", &["a".to_string(), "b".to_string()], Duration::from_secs(10))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "a b\n");

        let err = exec("/nonexistent/tessera-missing", &[], Duration::from_secs(10))
            .await
            .unwrap_err();
        match err {
            SchedError::Command { command, .. } => {
                assert_eq!(command, "/nonexistent/tessera-missing ")
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
