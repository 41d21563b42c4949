//! Globally unique job identifiers of the form `[<service url>]-[<native id>]`.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{SchedError, SchedResult};

static JOB_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^\[(.*)\]-\[(.*?)\]$").expect("static regex"));

/// Identifier combining the service URL and the backend's own job id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId {
    url: String,
    native: String,
}

impl JobId {
    pub fn new(url: impl Into<String>, native: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            native: native.into(),
        }
    }

    /// Parse `[url]-[native]`.
    pub fn parse(s: &str) -> SchedResult<Self> {
        let caps = JOB_ID_RE
            .captures(s.trim())
            .ok_or_else(|| SchedError::Parameter(format!("malformed job id '{s}'")))?;
        Ok(Self::new(&caps[1], &caps[2]))
    }

    /// URL of the service that submitted the job.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The backend's own identifier.
    pub fn native(&self) -> &str {
        &self.native
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]-[{}]", self.url, self.native)
    }
}

impl std::str::FromStr for JobId {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
