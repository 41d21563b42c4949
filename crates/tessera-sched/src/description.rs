//! Backend independent job description.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{SchedError, SchedResult};
use crate::transfer::TransferDirective;

/// How a multi-process job is launched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpmdVariation {
    Mpi,
    OpenMp,
    MpichG,
    /// Site specific parallel environment.
    Other(String),
}

impl SpmdVariation {
    pub fn name(&self) -> &str {
        match self {
            SpmdVariation::Mpi => "mpi",
            SpmdVariation::OpenMp => "openmp",
            SpmdVariation::MpichG => "mpich-g",
            SpmdVariation::Other(name) => name,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "mpi" => SpmdVariation::Mpi,
            "openmp" | "omp" => SpmdVariation::OpenMp,
            "mpich-g" | "mpichg" => SpmdVariation::MpichG,
            _ => SpmdVariation::Other(s.to_string()),
        }
    }
}

impl fmt::Display for SpmdVariation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Description of a job, independent of the backend it runs on.
///
/// Built once with the `with_*` methods and not modified afterwards; every
/// adaptor reads the same description.
///
/// ```
/// use tessera_sched::JobDescription;
///
/// let desc = JobDescription::new("/bin/hostname")
///     .with_name("probe")
///     .with_queue("short")
///     .with_wall_time_limit(10)
///     .with_total_cpu_count(4);
/// assert!(desc.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescription {
    #[serde(default)]
    pub name: Option<String>,
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    /// Wall time limit in minutes.
    #[serde(default)]
    pub wall_time_limit: Option<u32>,
    #[serde(default = "default_cpu_count")]
    pub total_cpu_count: u32,
    #[serde(default)]
    pub total_gpu_count: Option<u32>,
    #[serde(default)]
    pub processes_per_host: Option<u32>,
    /// Memory in megabytes.
    #[serde(default)]
    pub total_physical_memory: Option<u64>,
    #[serde(default)]
    pub candidate_hosts: Vec<String>,
    /// E-mail addresses notified about state changes.
    #[serde(default)]
    pub job_contact: Vec<String>,
    #[serde(default)]
    pub file_transfer: Vec<TransferDirective>,
    #[serde(default)]
    pub spmd_variation: Option<SpmdVariation>,
    #[serde(default)]
    pub cpu_architecture: Option<String>,
    #[serde(default)]
    pub gpu_architecture: Option<String>,
}

fn default_cpu_count() -> u32 {
    1
}

impl JobDescription {
    /// Create a description that runs `executable` on a single core.
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            name: None,
            executable: executable.into(),
            arguments: Vec::new(),
            environment: BTreeMap::new(),
            working_directory: None,
            input: None,
            output: None,
            error: None,
            queue: None,
            project: None,
            wall_time_limit: None,
            total_cpu_count: default_cpu_count(),
            total_gpu_count: None,
            processes_per_host: None,
            total_physical_memory: None,
            candidate_hosts: Vec::new(),
            job_contact: Vec::new(),
            file_transfer: Vec::new(),
            spmd_variation: None,
            cpu_architecture: None,
            gpu_architecture: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_arguments<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_input(mut self, path: impl Into<String>) -> Self {
        self.input = Some(path.into());
        self
    }

    pub fn with_output(mut self, path: impl Into<String>) -> Self {
        self.output = Some(path.into());
        self
    }

    pub fn with_error(mut self, path: impl Into<String>) -> Self {
        self.error = Some(path.into());
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    /// Set the wall time limit in minutes.
    pub fn with_wall_time_limit(mut self, minutes: u32) -> Self {
        self.wall_time_limit = Some(minutes);
        self
    }

    pub fn with_total_cpu_count(mut self, cpus: u32) -> Self {
        self.total_cpu_count = cpus;
        self
    }

    pub fn with_total_gpu_count(mut self, gpus: u32) -> Self {
        self.total_gpu_count = Some(gpus);
        self
    }

    pub fn with_processes_per_host(mut self, ppn: u32) -> Self {
        self.processes_per_host = Some(ppn);
        self
    }

    /// Request memory in megabytes.
    pub fn with_total_physical_memory(mut self, megabytes: u64) -> Self {
        self.total_physical_memory = Some(megabytes);
        self
    }

    pub fn with_candidate_host(mut self, host: impl Into<String>) -> Self {
        self.candidate_hosts.push(host.into());
        self
    }

    pub fn with_job_contact(mut self, contact: impl Into<String>) -> Self {
        self.job_contact.push(contact.into());
        self
    }

    pub fn with_file_transfer(mut self, directive: TransferDirective) -> Self {
        self.file_transfer.push(directive);
        self
    }

    pub fn with_spmd_variation(mut self, variation: SpmdVariation) -> Self {
        self.spmd_variation = Some(variation);
        self
    }

    pub fn with_cpu_architecture(mut self, arch: impl Into<String>) -> Self {
        self.cpu_architecture = Some(arch.into());
        self
    }

    pub fn with_gpu_architecture(mut self, arch: impl Into<String>) -> Self {
        self.gpu_architecture = Some(arch.into());
        self
    }

    /// Check the invariants every backend relies on.
    pub fn validate(&self) -> SchedResult<()> {
        if self.executable.trim().is_empty() {
            return Err(SchedError::Parameter(
                "job description has no executable".into(),
            ));
        }
        if self.total_cpu_count == 0 {
            return Err(SchedError::Parameter(
                "total_cpu_count must be at least 1".into(),
            ));
        }
        if self.processes_per_host == Some(0) {
            return Err(SchedError::Parameter(
                "processes_per_host must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Job name, falling back to the executable's file name.
    pub fn display_name(&self) -> String {
        if let Some(name) = self.name.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.to_string();
        }
        self.executable
            .rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or("job")
            .to_string()
    }

    /// Resolve a path against the working directory when it is relative.
    pub fn resolve_path(&self, path: &str) -> String {
        match self.working_directory.as_deref() {
            Some(wd) if !is_absolute(path) => {
                format!("{}/{}", wd.trim_end_matches('/'), path)
            }
            _ => path.to_string(),
        }
    }

    pub fn resolved_output(&self) -> Option<String> {
        self.output.as_deref().map(|p| self.resolve_path(p))
    }

    pub fn resolved_error(&self) -> Option<String> {
        self.error.as_deref().map(|p| self.resolve_path(p))
    }

    pub fn resolved_input(&self) -> Option<String> {
        self.input.as_deref().map(|p| self.resolve_path(p))
    }

    /// Directives that run after the job has finished.
    pub fn stage_out(&self) -> impl Iterator<Item = &TransferDirective> {
        self.file_transfer.iter().filter(|d| !d.is_stage_in())
    }

    /// Directives that run before the job is submitted.
    pub fn stage_in(&self) -> impl Iterator<Item = &TransferDirective> {
        self.file_transfer.iter().filter(|d| d.is_stage_in())
    }
}

/// `$HOME/x` and `~/x` count as absolute: the shell expands them.
fn is_absolute(path: &str) -> bool {
    path.starts_with('/') || path.starts_with('$') || path.starts_with('~')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::TransferOp;

    #[test]
    fn test_defaults() {
        let desc = JobDescription::new("/bin/date");
        assert_eq!(desc.total_cpu_count, 1);
        assert!(desc.validate().is_ok());
        assert_eq!(desc.display_name(), "date");
    }

    #[test]
    fn test_validate_rejects_empty_executable() {
        let desc = JobDescription::new("  ");
        assert!(matches!(desc.validate(), Err(SchedError::Parameter(_))));

        let desc = JobDescription::new("a.out").with_total_cpu_count(0);
        assert!(desc.validate().is_err());
    }

    #[test]
    fn test_resolve_relative_paths() {
        let desc = JobDescription::new("a.out")
            .with_working_directory("/scratch/run1/")
            .with_output("job.out")
            .with_error("/var/log/job.err")
            .with_input("$HOME/in.txt");

        assert_eq!(desc.resolved_output().unwrap(), "/scratch/run1/job.out");
        assert_eq!(desc.resolved_error().unwrap(), "/var/log/job.err");
        assert_eq!(desc.resolved_input().unwrap(), "$HOME/in.txt");
    }

    #[test]
    fn test_stage_split() {
        let desc = JobDescription::new("a.out")
            .with_file_transfer(TransferDirective::new("in", TransferOp::CopyIn, "in"))
            .with_file_transfer(TransferDirective::new("out", TransferOp::AppendOut, "out"));
        assert_eq!(desc.stage_in().count(), 1);
        assert_eq!(desc.stage_out().count(), 1);
    }

    #[test]
    fn test_yaml_description() {
        let yaml = r#"
executable: /usr/bin/env
arguments: ["-i"]
queue: debug
spmd_variation: mpi
file_transfer:
  - "in.dat > /scratch/in.dat"
  - "log.txt<<log.txt"
"#;
        let desc: JobDescription = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(desc.total_cpu_count, 1);
        assert_eq!(desc.spmd_variation, Some(SpmdVariation::Mpi));
        assert_eq!(
            desc.file_transfer,
            vec![
                TransferDirective::new("in.dat", TransferOp::CopyIn, "/scratch/in.dat"),
                TransferDirective::new("log.txt", TransferOp::AppendOut, "log.txt"),
            ]
        );

        let rendered = serde_yaml_ng::to_string(&desc).unwrap();
        assert!(rendered.contains("in.dat > /scratch/in.dat"), "{rendered}");

        let bad = "executable: a\nfile_transfer: [\"a <> b\"]\n";
        let err = serde_yaml_ng::from_str::<JobDescription>(bad).unwrap_err();
        assert!(err.to_string().contains("mixed transfer directions"), "{err}");
    }
}
