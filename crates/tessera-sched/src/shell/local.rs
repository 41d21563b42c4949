//! Shell running on the local host.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use super::{CommandOutput, RemoteShell, dquote, exec};
use crate::error::{SchedError, SchedResult};

/// Runs commands with `/bin/sh -c` on this machine.
pub struct LocalShell {
    timeout: Duration,
}

impl LocalShell {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn copy(&self, from: &str, to: &str, append: bool) -> SchedResult<()> {
        let command = if append {
            format!("cat {} >> {}", dquote(from), dquote(to))
        } else {
            format!("cp {} {}", dquote(from), dquote(to))
        };
        let output = self.run(&command).await?;
        if !output.success() {
            return Err(SchedError::Command {
                command,
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteShell for LocalShell {
    fn target(&self) -> &str {
        "localhost"
    }

    async fn run(&self, command: &str) -> SchedResult<CommandOutput> {
        exec("/bin/sh", &["-c".to_string(), command.to_string()], self.timeout).await
    }

    async fn stage_to_remote(&self, local: &Path, remote: &str, append: bool) -> SchedResult<()> {
        self.copy(&local.to_string_lossy(), remote, append).await
    }

    async fn stage_from_remote(
        &self,
        remote: &str,
        local: &Path,
        append: bool,
    ) -> SchedResult<()> {
        self.copy(remote, &local.to_string_lossy(), append).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell() -> LocalShell {
        LocalShell::new(Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_run_captures_output() {
        let out = shell().run("echo hello; echo oops >&2; exit 3").await.unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_write_expands_double_quoted_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.sh");
        let path_str = path.to_string_lossy().to_string();

        shell()
            .write_to_remote("echo \\$HOME \\\"quoted\\\"\n", &path_str)
            .await
            .unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "echo $HOME \"quoted\"\n");
    }

    #[tokio::test]
    async fn test_stage_roundtrip_with_append() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("dst.txt");
        std::fs::write(&src, "one\n").unwrap();

        let shell = shell();
        let dst_str = dst.to_string_lossy().to_string();
        shell.stage_to_remote(&src, &dst_str, false).await.unwrap();
        shell.stage_to_remote(&src, &dst_str, true).await.unwrap();
        assert_eq!(std::fs::read_to_string(&dst).unwrap(), "one\none\n");

        let back = dir.path().join("back.txt");
        shell.stage_from_remote(&dst_str, &back, false).await.unwrap();
        assert_eq!(std::fs::read_to_string(&back).unwrap(), "one\none\n");
    }

    #[tokio::test]
    async fn test_timeout() {
        let shell = LocalShell::new(Duration::from_millis(100));
        let err = shell.run("sleep 5").await.unwrap_err();
        assert!(matches!(err, SchedError::Timeout(_)));
    }
}
