//! Service configuration.
//!
//! Loaded from, in increasing precedence:
//! 1. Built-in defaults
//! 2. A YAML file
//! 3. Environment variables with the `TESSERA_` prefix (a `.env` file is
//!    read first if present)

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SchedError, SchedResult};

/// What happens when the backend disagrees with a locally issued cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelPolicy {
    /// Poll a canceled job once more and accept a different final state
    /// reported by the backend.
    #[default]
    MonitorAuthoritative,
    /// Never poll a job again once it has been canceled locally.
    KeepCanceled,
}

/// PBS implementation family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PbsFlavor {
    Pbs,
    PbsPro,
    Torque,
}

/// How SLURM jobs request cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlurmNodeSpec {
    /// Only `--ntasks`; the scheduler chooses the node count.
    #[default]
    Tasks,
    /// `--nodes` derived from the per-node core count plus `--ntasks`.
    NodesAndTasks,
}

/// Top level configuration of a job service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Delay between two monitor cycles.
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    /// How often `wait` looks at the cached state.
    #[serde(default = "default_wait_poll_interval_ms")]
    pub wait_poll_interval_ms: u64,

    /// Upper bound for any single shell command.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// How long `close` waits for the monitor task to exit.
    #[serde(default = "default_monitor_join_timeout_secs")]
    pub monitor_join_timeout_secs: u64,

    /// Attempts at the accounting fallback for jobs that left the queue.
    #[serde(default = "default_accounting_retries")]
    pub accounting_retries: u32,

    /// Initial delay between accounting attempts, doubled each time.
    #[serde(default = "default_accounting_backoff_ms")]
    pub accounting_backoff_ms: u64,

    #[serde(default)]
    pub cancel_policy: CancelPolicy,

    #[serde(default)]
    pub ssh: SshConfig,

    #[serde(default)]
    pub backend: BackendConfig,
}

/// OpenSSH transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Login name when the URL has none.
    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub identity_file: Option<String>,

    /// Lifetime of the multiplexed master connection.
    #[serde(default = "default_control_persist_secs")]
    pub control_persist_secs: u64,

    /// Passed to every `ssh`/`scp` call as `-o OPTION`.
    #[serde(default)]
    pub options: Vec<String>,
}

/// Backend specific knobs. Fields not relevant to the selected backend are
/// ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Cores per node, used to turn a core count into a node count.
    #[serde(default)]
    pub ppn: Option<u32>,

    /// Queue used when the description has none.
    #[serde(default)]
    pub queue: Option<String>,

    /// Project/account used when the description has none.
    #[serde(default)]
    pub project: Option<String>,

    /// Overrides the flavor implied by the URL scheme (`pbs://`).
    #[serde(default)]
    pub pbs_flavor: Option<PbsFlavor>,

    /// Cray systems request cores with `mppwidth`.
    #[serde(default)]
    pub cray: bool,

    #[serde(default)]
    pub slurm_node_spec: SlurmNodeSpec,

    /// SGE parallel environment per SPMD variation name (`mpi` → `orte`).
    #[serde(default)]
    pub sge_parallel_environments: BTreeMap<String, String>,

    /// SGE resource attributes that carry a memory request (`h_vmem`).
    #[serde(default)]
    pub sge_memory_attributes: Vec<String>,

    /// Condor universe.
    #[serde(default)]
    pub condor_universe: Option<String>,

    /// Modules loaded at the top of every job script.
    #[serde(default)]
    pub modules: Vec<String>,

    /// Raw directives appended after the generated ones (without prefix).
    #[serde(default)]
    pub extra_directives: Vec<String>,
}

fn default_monitor_interval_ms() -> u64 {
    10_000
}

fn default_wait_poll_interval_ms() -> u64 {
    500
}

fn default_command_timeout_secs() -> u64 {
    60
}

fn default_monitor_join_timeout_secs() -> u64 {
    5
}

fn default_accounting_retries() -> u32 {
    3
}

fn default_accounting_backoff_ms() -> u64 {
    1_000
}

fn default_control_persist_secs() -> u64 {
    600
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            monitor_interval_ms: default_monitor_interval_ms(),
            wait_poll_interval_ms: default_wait_poll_interval_ms(),
            command_timeout_secs: default_command_timeout_secs(),
            monitor_join_timeout_secs: default_monitor_join_timeout_secs(),
            accounting_retries: default_accounting_retries(),
            accounting_backoff_ms: default_accounting_backoff_ms(),
            cancel_policy: CancelPolicy::default(),
            ssh: SshConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: None,
            identity_file: None,
            control_persist_secs: default_control_persist_secs(),
            options: Vec::new(),
        }
    }
}

impl ServiceConfig {
    /// Parse a YAML document.
    pub fn from_yaml_str(yaml: &str) -> SchedResult<Self> {
        let config: ServiceConfig = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> SchedResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SchedError::Config(format!("cannot read {}: {e}", path.as_ref().display()))
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Defaults overridden by the environment.
    pub fn from_env() -> Self {
        Self::default().merge_env()
    }

    /// Load from `.env`, an optional file and the environment.
    pub fn load(config_file: Option<&Path>) -> SchedResult<Self> {
        dotenvy::dotenv().ok();

        let config = match config_file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        let config = config.merge_env();
        config.validate()?;
        Ok(config)
    }

    fn merge_env(mut self) -> Self {
        fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|v| v.parse().ok())
        }

        if let Some(v) = parsed("TESSERA_MONITOR_INTERVAL_MS") {
            self.monitor_interval_ms = v;
        }
        if let Some(v) = parsed("TESSERA_WAIT_POLL_INTERVAL_MS") {
            self.wait_poll_interval_ms = v;
        }
        if let Some(v) = parsed("TESSERA_COMMAND_TIMEOUT_SECS") {
            self.command_timeout_secs = v;
        }
        if let Some(v) = parsed("TESSERA_ACCOUNTING_RETRIES") {
            self.accounting_retries = v;
        }
        if let Ok(v) = std::env::var("TESSERA_CANCEL_POLICY") {
            match v.as_str() {
                "monitor_authoritative" => {
                    self.cancel_policy = CancelPolicy::MonitorAuthoritative;
                }
                "keep_canceled" => self.cancel_policy = CancelPolicy::KeepCanceled,
                other => tracing::warn!("Ignoring unknown TESSERA_CANCEL_POLICY '{}'", other),
            }
        }
        if let Ok(v) = std::env::var("TESSERA_SSH_USER") {
            self.ssh.user = Some(v);
        }
        if let Ok(v) = std::env::var("TESSERA_SSH_IDENTITY") {
            self.ssh.identity_file = Some(v);
        }
        if let Some(v) = parsed("TESSERA_PPN") {
            self.backend.ppn = Some(v);
        }
        if let Ok(v) = std::env::var("TESSERA_QUEUE") {
            self.backend.queue = Some(v);
        }
        if let Ok(v) = std::env::var("TESSERA_PROJECT") {
            self.backend.project = Some(v);
        }

        self
    }

    /// Reject values that would stall or spin the service.
    pub fn validate(&self) -> SchedResult<()> {
        if self.monitor_interval_ms == 0 {
            return Err(SchedError::Config(
                "monitor_interval_ms must be positive".into(),
            ));
        }
        if self.wait_poll_interval_ms == 0 {
            return Err(SchedError::Config(
                "wait_poll_interval_ms must be positive".into(),
            ));
        }
        if self.command_timeout_secs == 0 {
            return Err(SchedError::Config(
                "command_timeout_secs must be positive".into(),
            ));
        }
        if self.backend.ppn == Some(0) {
            return Err(SchedError::Config("backend.ppn must be positive".into()));
        }
        Ok(())
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval_ms = interval.as_millis().max(1) as u64;
        self
    }

    pub fn with_wait_poll_interval(mut self, interval: Duration) -> Self {
        self.wait_poll_interval_ms = interval.as_millis().max(1) as u64;
        self
    }

    pub fn with_cancel_policy(mut self, policy: CancelPolicy) -> Self {
        self.cancel_policy = policy;
        self
    }

    pub fn with_accounting(mut self, retries: u32, backoff: Duration) -> Self {
        self.accounting_retries = retries;
        self.accounting_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn monitor_join_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor_join_timeout_secs)
    }

    pub fn accounting_backoff(&self) -> Duration {
        Duration::from_millis(self.accounting_backoff_ms)
    }
}
