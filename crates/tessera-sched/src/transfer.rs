//! File transfer directives.
//!
//! A directive is written as `LOCAL OP REMOTE`:
//!
//! | Op   | Direction       | When             | Mode      |
//! |------|-----------------|------------------|-----------|
//! | `>`  | local → remote  | before the job   | overwrite |
//! | `>>` | local → remote  | before the job   | append    |
//! | `<`  | remote → local  | after the job    | overwrite |
//! | `<<` | remote → local  | after the job    | append    |

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{SchedError, SchedResult};

/// Transfer operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferOp {
    /// `>`
    CopyIn,
    /// `>>`
    AppendIn,
    /// `<`
    CopyOut,
    /// `<<`
    AppendOut,
}

impl TransferOp {
    /// Longest operators first so that `>>` is never read as `>`.
    const PARSE_ORDER: [TransferOp; 4] = [
        TransferOp::AppendOut,
        TransferOp::AppendIn,
        TransferOp::CopyOut,
        TransferOp::CopyIn,
    ];

    /// The operator as written in a directive.
    pub fn symbol(&self) -> &'static str {
        match self {
            TransferOp::CopyIn => ">",
            TransferOp::AppendIn => ">>",
            TransferOp::CopyOut => "<",
            TransferOp::AppendOut => "<<",
        }
    }

    /// Whether the file moves to the execution side before the job starts.
    pub fn is_stage_in(&self) -> bool {
        matches!(self, TransferOp::CopyIn | TransferOp::AppendIn)
    }

    /// Whether the destination is appended to instead of replaced.
    pub fn is_append(&self) -> bool {
        matches!(self, TransferOp::AppendIn | TransferOp::AppendOut)
    }
}

/// A parsed `LOCAL OP REMOTE` directive.
///
/// Serialized in its written form, so YAML descriptions list plain strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TransferDirective {
    pub local: String,
    pub op: TransferOp,
    pub remote: String,
}

impl TransferDirective {
    pub fn new(local: impl Into<String>, op: TransferOp, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            op,
            remote: remote.into(),
        }
    }

    /// Parse a single directive.
    pub fn parse(directive: &str) -> SchedResult<Self> {
        let lt = directive.matches('<').count();
        let gt = directive.matches('>').count();
        if lt > 2 || gt > 2 {
            return Err(SchedError::Parameter(format!(
                "too many transfer operators in '{directive}'"
            )));
        }
        if lt > 0 && gt > 0 {
            return Err(SchedError::Parameter(format!(
                "mixed transfer directions in '{directive}'"
            )));
        }

        for op in TransferOp::PARSE_ORDER {
            let Some((local, remote)) = directive.split_once(op.symbol()) else {
                continue;
            };
            let (local, remote) = (local.trim(), remote.trim());
            // "a < < b" splits into an operand that still carries an operator
            let stray = |s: &str| s.contains(['<', '>']);
            if local.is_empty() || remote.is_empty() || stray(local) || stray(remote) {
                return Err(SchedError::Parameter(format!(
                    "malformed transfer directive '{directive}'"
                )));
            }
            return Ok(Self::new(local, op, remote));
        }

        Err(SchedError::Parameter(format!(
            "no transfer operator in '{directive}'"
        )))
    }

    /// Parse a list of directives, failing on the first malformed one.
    pub fn parse_all<S: AsRef<str>>(directives: &[S]) -> SchedResult<Vec<Self>> {
        directives.iter().map(|d| Self::parse(d.as_ref())).collect()
    }

    pub fn is_stage_in(&self) -> bool {
        self.op.is_stage_in()
    }
}

impl fmt::Display for TransferDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.local, self.op.symbol(), self.remote)
    }
}

impl TryFrom<String> for TransferDirective {
    type Error = SchedError;

    fn try_from(directive: String) -> SchedResult<Self> {
        Self::parse(&directive)
    }
}

impl From<TransferDirective> for String {
    fn from(directive: TransferDirective) -> Self {
        directive.to_string()
    }
}

/// Render directives back to their `LOCAL OP REMOTE` form.
pub fn to_string_list(directives: &[TransferDirective]) -> Vec<String> {
    directives.iter().map(ToString::to_string).collect()
}
