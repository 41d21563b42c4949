//! Error handling for the job lifecycle layer.

use thiserror::Error;

/// Result type for scheduler operations.
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur while describing, submitting or tracking jobs.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SchedError {
    /// A job description, transfer directive, job id or URL is malformed.
    #[error("Invalid parameter: {0}")]
    Parameter(String),

    /// The backend refused the job or answered with something unparseable.
    #[error("Submission failed: `{command}` exited with {exit_code}: {}", .stderr.trim())]
    Submission {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    /// A status, cancel or list command failed.
    #[error("Query failed: {command} - {message}")]
    Query { command: String, message: String },

    /// The shell could not run a command at all.
    #[error("Command failed: {command} - {message}")]
    Command { command: String, message: String },

    /// The backend does not implement the requested operation.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// The operation is not valid in the job's or service's current state.
    #[error("Incorrect state: expected {expected}, found {found}")]
    IncorrectState { expected: String, found: String },

    /// The backend knows nothing about the requested job.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// No adaptor is registered for the URL scheme.
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    /// A shell command exceeded its time budget.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML configuration could not be parsed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of [`SchedError`], used by the monitor to decide
/// when repeated failures mean the backend is unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Parameter,
    Submission,
    Query,
    Command,
    NotSupported,
    IncorrectState,
    JobNotFound,
    UnknownBackend,
    Timeout,
    Config,
    Io,
    Internal,
}

impl SchedError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedError::Parameter(_) => ErrorKind::Parameter,
            SchedError::Submission { .. } => ErrorKind::Submission,
            SchedError::Query { .. } => ErrorKind::Query,
            SchedError::Command { .. } => ErrorKind::Command,
            SchedError::NotSupported(_) => ErrorKind::NotSupported,
            SchedError::IncorrectState { .. } => ErrorKind::IncorrectState,
            SchedError::JobNotFound(_) => ErrorKind::JobNotFound,
            SchedError::UnknownBackend(_) => ErrorKind::UnknownBackend,
            SchedError::Timeout(_) => ErrorKind::Timeout,
            SchedError::Config(_) | SchedError::Yaml(_) => ErrorKind::Config,
            SchedError::Io(_) => ErrorKind::Io,
            SchedError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn incorrect_state(expected: impl Into<String>, found: impl ToString) -> Self {
        SchedError::IncorrectState {
            expected: expected.into(),
            found: found.to_string(),
        }
    }

    pub(crate) fn query(command: impl Into<String>, message: impl Into<String>) -> Self {
        SchedError::Query {
            command: command.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SchedError::JobNotFound("[slurm://hpc]-[42]".to_string());
        assert_eq!(err.to_string(), "Job not found: [slurm://hpc]-[42]");

        let err = SchedError::IncorrectState {
            expected: "New".to_string(),
            found: "Running".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Incorrect state: expected New, found Running"
        );

        let err = SchedError::Submission {
            command: "qsub job.pbs".to_string(),
            exit_code: 1,
            stdout: String::new(),
            stderr: "qsub: Unknown queue\n".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Submission failed: `qsub job.pbs` exited with 1: qsub: Unknown queue"
        );
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(
            SchedError::Timeout("qstat".into()).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            SchedError::query("squeue", "boom").kind(),
            ErrorKind::Query
        );
        let io = std::io::Error::other("broken pipe");
        assert_eq!(SchedError::from(io).kind(), ErrorKind::Io);
    }
}
