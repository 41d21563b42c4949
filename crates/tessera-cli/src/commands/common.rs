//! Shared helpers for CLI commands.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use console::{StyledObject, style};

use tessera_sched::{
    AdaptorRegistry, JobDescription, JobHandle, JobId, JobService, JobState, ServiceConfig,
    SpmdVariation, TransferDirective,
};

/// Output format of the status command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

/// Job description options shared by `submit` and `script`.
#[derive(Debug, Clone, Default, Args)]
pub struct JobArgs {
    /// YAML job description to start from
    #[arg(long, value_name = "FILE")]
    pub description: Option<PathBuf>,

    /// Job name
    #[arg(long)]
    pub name: Option<String>,

    /// Queue or partition
    #[arg(long)]
    pub queue: Option<String>,

    /// Project or account to charge
    #[arg(long)]
    pub project: Option<String>,

    /// Wall time limit in minutes
    #[arg(long, value_name = "MINUTES")]
    pub walltime: Option<u32>,

    /// Total number of cores
    #[arg(long)]
    pub cpus: Option<u32>,

    /// Processes per host
    #[arg(long)]
    pub ppn: Option<u32>,

    /// Total number of GPUs
    #[arg(long)]
    pub gpus: Option<u32>,

    /// Memory in megabytes
    #[arg(long, value_name = "MB")]
    pub memory: Option<u64>,

    /// Working directory on the execution side
    #[arg(long)]
    pub workdir: Option<String>,

    /// Standard input file
    #[arg(long)]
    pub stdin: Option<String>,

    /// Standard output file
    #[arg(long)]
    pub stdout: Option<String>,

    /// Standard error file
    #[arg(long)]
    pub stderr: Option<String>,

    /// Environment variable (KEY=VALUE), repeatable
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub environment: Vec<String>,

    /// File transfer directive ("local > remote"), repeatable
    #[arg(long = "transfer", value_name = "DIRECTIVE")]
    pub transfers: Vec<String>,

    /// Candidate host, repeatable
    #[arg(long = "host")]
    pub hosts: Vec<String>,

    /// E-mail address notified about the job, repeatable
    #[arg(long = "contact")]
    pub contacts: Vec<String>,

    /// Parallel launch style (mpi, openmp, ...)
    #[arg(long)]
    pub spmd: Option<String>,

    /// Required CPU architecture
    #[arg(long)]
    pub cpu_arch: Option<String>,

    /// Required GPU architecture
    #[arg(long)]
    pub gpu_arch: Option<String>,

    /// Executable followed by its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl JobArgs {
    /// Build the job description these options describe.
    pub fn to_description(&self) -> Result<JobDescription> {
        let mut desc = match &self.description {
            Some(path) => {
                let source = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                serde_yaml_ng::from_str::<JobDescription>(&source)
                    .with_context(|| format!("Invalid job description in {}", path.display()))?
            }
            None => {
                let executable = self.command.first().ok_or_else(|| {
                    anyhow::anyhow!("Please provide a command or --description")
                })?;
                JobDescription::new(executable.clone())
            }
        };

        if let Some((executable, arguments)) = self.command.split_first() {
            desc.executable = executable.clone();
            desc.arguments = arguments.to_vec();
        }
        if let Some(name) = &self.name {
            desc.name = Some(name.clone());
        }
        if let Some(queue) = &self.queue {
            desc.queue = Some(queue.clone());
        }
        if let Some(project) = &self.project {
            desc.project = Some(project.clone());
        }
        if self.walltime.is_some() {
            desc.wall_time_limit = self.walltime;
        }
        if let Some(cpus) = self.cpus {
            desc.total_cpu_count = cpus;
        }
        if self.ppn.is_some() {
            desc.processes_per_host = self.ppn;
        }
        if self.gpus.is_some() {
            desc.total_gpu_count = self.gpus;
        }
        if self.memory.is_some() {
            desc.total_physical_memory = self.memory;
        }
        if let Some(dir) = &self.workdir {
            desc.working_directory = Some(dir.clone());
        }
        if let Some(path) = &self.stdin {
            desc.input = Some(path.clone());
        }
        if let Some(path) = &self.stdout {
            desc.output = Some(path.clone());
        }
        if let Some(path) = &self.stderr {
            desc.error = Some(path.clone());
        }
        for pair in &self.environment {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("Expected KEY=VALUE, got '{pair}'"))?;
            desc.environment.insert(key.to_string(), value.to_string());
        }
        for directive in &self.transfers {
            desc.file_transfer.push(TransferDirective::parse(directive)?);
        }
        desc.candidate_hosts.extend(self.hosts.iter().cloned());
        desc.job_contact.extend(self.contacts.iter().cloned());
        if let Some(spmd) = &self.spmd {
            desc.spmd_variation = Some(SpmdVariation::parse(spmd));
        }
        if let Some(arch) = &self.cpu_arch {
            desc.cpu_architecture = Some(arch.clone());
        }
        if let Some(arch) = &self.gpu_arch {
            desc.gpu_architecture = Some(arch.clone());
        }

        desc.validate()?;
        Ok(desc)
    }
}

/// Return the default config file (~/.tessera/config.yaml) when it exists.
pub fn default_config_file() -> Option<PathBuf> {
    let path = dirs::home_dir()?.join(".tessera").join("config.yaml");
    path.exists().then_some(path)
}

/// Load the service configuration.
pub fn load_config(path: Option<&Path>) -> Result<ServiceConfig> {
    let path = path.map(Path::to_path_buf).or_else(default_config_file);
    ServiceConfig::load(path.as_deref()).with_context(|| match &path {
        Some(p) => format!("Failed to load configuration from {}", p.display()),
        None => "Failed to load configuration".to_string(),
    })
}

/// Open a job service for a resource URL.
pub fn open_service(config: Option<&Path>, url: &str) -> Result<JobService> {
    let config = load_config(config)?;
    let registry = AdaptorRegistry::with_builtins();
    JobService::new(url, config, &registry)
        .with_context(|| format!("Failed to open job service for {url}"))
}

/// Open the service a job id belongs to and reconnect to the job.
pub async fn open_job(config: Option<&Path>, job_id: &str) -> Result<(JobService, JobHandle)> {
    let id = JobId::parse(job_id).map_err(|e| anyhow::anyhow!("Invalid job ID '{job_id}': {e}"))?;
    let service = open_service(config, id.url())?;
    let job = service
        .get_job(job_id)
        .await
        .with_context(|| format!("Failed to look up job {job_id}"))?;
    Ok((service, job))
}

/// A job state colored for terminal output.
pub fn styled_state(state: JobState) -> StyledObject<&'static str> {
    let name = state.name();
    match state {
        JobState::Done => style(name).green(),
        JobState::Failed | JobState::Canceled => style(name).red(),
        JobState::Pending | JobState::Suspended => style(name).yellow(),
        JobState::Running => style(name).cyan(),
        JobState::New | JobState::Unknown => style(name).dim(),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use tessera_sched::TransferOp;

    fn args(command: &[&str]) -> JobArgs {
        JobArgs {
            command: command.iter().map(|s| s.to_string()).collect(),
            ..JobArgs::default()
        }
    }

    #[test]
    fn test_command_and_options() {
        let mut job = args(&["/bin/echo", "-n", "hello"]);
        job.queue = Some("debug".into());
        job.cpus = Some(8);
        job.environment = vec!["OMP_NUM_THREADS=2".into()];
        job.transfers = vec!["in.dat > in.dat".into()];
        job.spmd = Some("mpi".into());

        let desc = job.to_description().unwrap();
        assert_eq!(desc.executable, "/bin/echo");
        assert_eq!(desc.arguments, vec!["-n", "hello"]);
        assert_eq!(desc.queue.as_deref(), Some("debug"));
        assert_eq!(desc.total_cpu_count, 8);
        assert_eq!(desc.environment["OMP_NUM_THREADS"], "2");
        assert_eq!(desc.file_transfer[0].op, TransferOp::CopyIn);
        assert_eq!(desc.spmd_variation, Some(SpmdVariation::Mpi));
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(args(&[]).to_description().is_err());

        let mut job = args(&["a"]);
        job.environment = vec!["NOEQUALS".into()];
        assert!(job.to_description().is_err());

        let mut job = args(&["a"]);
        job.transfers = vec!["a <> b".into()];
        assert!(job.to_description().is_err());

        let mut job = args(&["a"]);
        job.cpus = Some(0);
        assert!(job.to_description().is_err());
    }

    #[test]
    fn test_description_file_with_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "executable: /opt/sim\narguments: [run]\nqueue: long\ntotal_cpu_count: 16"
        )
        .unwrap();

        let job = JobArgs {
            description: Some(file.path().to_path_buf()),
            queue: Some("short".into()),
            ..JobArgs::default()
        };
        let desc = job.to_description().unwrap();
        assert_eq!(desc.executable, "/opt/sim");
        assert_eq!(desc.arguments, vec!["run"]);
        assert_eq!(desc.queue.as_deref(), Some("short"));
        assert_eq!(desc.total_cpu_count, 16);
    }
}
