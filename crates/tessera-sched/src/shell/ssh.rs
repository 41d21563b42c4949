//! OpenSSH transport with a multiplexed master connection.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use super::{CommandOutput, RemoteShell, dquote, exec};
use crate::config::SshConfig;
use crate::error::{SchedError, SchedResult};
use crate::resource::ResourceUrl;

/// Runs commands on a remote host through `ssh`, copies files with `scp`.
///
/// All invocations share one `ControlMaster` socket, so only the first
/// command pays for authentication.
pub struct SshShell {
    destination: String,
    port: Option<u16>,
    control_path: PathBuf,
    config: SshConfig,
    timeout: Duration,
}

impl SshShell {
    pub fn new(url: &ResourceUrl, config: &SshConfig, timeout: Duration) -> Self {
        let user = url.user().or(config.user.as_deref());
        let destination = match user {
            Some(user) => format!("{user}@{}", url.host()),
            None => url.host().to_string(),
        };
        let socket = uuid::Uuid::new_v4().simple().to_string();
        let control_path = std::env::temp_dir().join(format!("tessera-{}", &socket[..12]));

        Self {
            destination,
            port: url.port(),
            control_path,
            config: config.clone(),
            timeout,
        }
    }

    fn common_options(&self) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".to_string(),
            format!("ControlPersist={}s", self.config.control_persist_secs),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        if let Some(identity) = &self.config.identity_file {
            opts.push("-i".to_string());
            opts.push(identity.clone());
        }
        for option in &self.config.options {
            opts.push("-o".to_string());
            opts.push(option.clone());
        }
        opts
    }

    fn ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = self.common_options();
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args.push(self.destination.clone());
        args.push(command.to_string());
        args
    }

    async fn scp(&self, from: String, to: String) -> SchedResult<()> {
        let mut args = self.common_options();
        args.push("-q".to_string());
        if let Some(port) = self.port {
            args.push("-P".to_string());
            args.push(port.to_string());
        }
        args.push(from.clone());
        args.push(to.clone());

        let output = exec("scp", &args, self.timeout).await?;
        if !output.success() {
            return Err(SchedError::Command {
                command: format!("scp {from} {to}"),
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    /// scp resolves relative paths against the login directory itself.
    fn scp_target(&self, remote: &str) -> String {
        let path = remote
            .strip_prefix("$HOME/")
            .or_else(|| remote.strip_prefix("~/"))
            .unwrap_or(remote);
        format!("{}:{}", self.destination, path)
    }

    fn scratch_name() -> String {
        format!(".tessera-stage-{}", uuid::Uuid::new_v4().simple())
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    fn target(&self) -> &str {
        &self.destination
    }

    async fn run(&self, command: &str) -> SchedResult<CommandOutput> {
        exec("ssh", &self.ssh_args(command), self.timeout).await
    }

    async fn stage_to_remote(&self, local: &Path, remote: &str, append: bool) -> SchedResult<()> {
        let local = local.to_string_lossy().to_string();
        if !append {
            return self.scp(local, self.scp_target(remote)).await;
        }

        let scratch = Self::scratch_name();
        self.scp(local, self.scp_target(&scratch)).await?;
        let command = format!(
            "cat {scratch} >> {} && rm -f {scratch}",
            dquote(remote)
        );
        let output = self.run(&command).await?;
        if !output.success() {
            return Err(SchedError::Command {
                command,
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn stage_from_remote(
        &self,
        remote: &str,
        local: &Path,
        append: bool,
    ) -> SchedResult<()> {
        if !append {
            return self
                .scp(self.scp_target(remote), local.to_string_lossy().to_string())
                .await;
        }

        let scratch = std::env::temp_dir().join(Self::scratch_name());
        self.scp(
            self.scp_target(remote),
            scratch.to_string_lossy().to_string(),
        )
        .await?;
        let data = tokio::fs::read(&scratch).await?;
        let _ = tokio::fs::remove_file(&scratch).await;

        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(local)
            .await?;
        file.write_all(&data).await?;
        Ok(())
    }

    async fn finalize(&self, kill: bool) -> SchedResult<()> {
        if !self.control_path.exists() {
            return Ok(());
        }
        let mut args = vec![
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-O".to_string(),
            if kill { "exit" } else { "stop" }.to_string(),
            self.destination.clone(),
        ];
        if let Some(port) = self.port {
            args.insert(0, port.to_string());
            args.insert(0, "-p".to_string());
        }
        match exec("ssh", &args, self.timeout).await {
            Ok(out) if !out.success() => {
                tracing::debug!("ssh master shutdown: {}", out.stderr.trim());
            }
            Err(e) => tracing::warn!("Failed to close ssh master for {}: {}", self.destination, e),
            Ok(_) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(url: &str) -> SshShell {
        let url = ResourceUrl::parse(url).unwrap();
        SshShell::new(&url, &SshConfig::default(), Duration::from_secs(5))
    }

    #[test]
    fn test_destination_and_args() {
        let sh = shell("slurm+ssh://bob@login1:2200");
        assert_eq!(sh.target(), "bob@login1");

        let args = sh.ssh_args("squeue -h");
        assert_eq!(args.last().unwrap(), "squeue -h");
        assert_eq!(args[args.len() - 2], "bob@login1");
        assert!(args.iter().any(|a| a == "ControlMaster=auto"));
        assert!(args.windows(2).any(|w| w[0] == "-p" && w[1] == "2200"));
    }

    #[test]
    fn test_user_from_config() {
        let url = ResourceUrl::parse("pbs://cluster").unwrap();
        let config = SshConfig {
            user: Some("carol".into()),
            ..SshConfig::default()
        };
        let sh = SshShell::new(&url, &config, Duration::from_secs(5));
        assert_eq!(sh.target(), "carol@cluster");
    }

    #[test]
    fn test_scp_target_strips_home() {
        let sh = shell("sge://head");
        assert_eq!(sh.scp_target("$HOME/run/in.dat"), "head:run/in.dat");
        assert_eq!(sh.scp_target("/abs/x"), "head:/abs/x");
    }
}
