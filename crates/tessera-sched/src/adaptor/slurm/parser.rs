//! Parsers for SLURM command output.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::adaptor::common::{capture, parse_timestamp};

static SBATCH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Submitted batch job (\d+)").expect("valid regex"));

/// One job as seen by `scontrol`, `squeue` or `sacct`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlurmJobRecord {
    pub job_id: String,
    pub state: String,
    pub exit_code: Option<i32>,
    pub nodes: Vec<String>,
    pub submitted: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
}

/// Parse sbatch output to extract the job id.
///
/// Expected format: "Submitted batch job 12345"
pub fn parse_sbatch_output(output: &str) -> Option<String> {
    capture(&SBATCH_RE, output)
}

/// Whether scontrol/scancel rejected the id as unknown.
pub fn is_invalid_job(stderr: &str) -> bool {
    stderr.contains("Invalid job id")
}

/// Parse `scontrol show job <id>`.
///
/// ```text
/// JobId=123 JobName=sim
///    JobState=COMPLETED Reason=None Dependency=(null)
///    ExitCode=0:0
///    SubmitTime=2024-01-15T10:29:00 EligibleTime=2024-01-15T10:29:00
///    StartTime=2024-01-15T10:30:00 EndTime=2024-01-15T10:35:00
///    NodeList=node[01-02]
/// ```
///
/// `EndTime` of a running job is the projected end; it is only kept once the
/// caller sees a final state.
pub fn parse_scontrol_output(output: &str) -> Option<SlurmJobRecord> {
    let mut rec = SlurmJobRecord::default();
    for token in output.split_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        match key {
            "JobId" if rec.job_id.is_empty() => rec.job_id = value.to_string(),
            "JobState" => rec.state = value.to_string(),
            "ExitCode" => rec.exit_code = parse_exit_code(value),
            "SubmitTime" => rec.submitted = parse_timestamp(value),
            "StartTime" => rec.started = parse_timestamp(value),
            "EndTime" => rec.ended = parse_timestamp(value),
            "NodeList" => rec.nodes = expand_nodelist(value),
            _ => {}
        }
    }
    if rec.job_id.is_empty() || rec.state.is_empty() {
        return None;
    }
    Some(rec)
}

/// Parse `squeue -h -o "%i|%T|%N"` output.
pub fn parse_squeue_output(output: &str) -> Vec<SlurmJobRecord> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.trim().split('|');
            let job_id = fields.next()?.trim();
            let state = fields.next()?.trim();
            if job_id.is_empty() || state.is_empty() {
                return None;
            }
            Some(SlurmJobRecord {
                job_id: job_id.to_string(),
                state: state.to_string(),
                nodes: fields.next().map(expand_nodelist).unwrap_or_default(),
                ..SlurmJobRecord::default()
            })
        })
        .collect()
}

/// Parse `sacct -P -o JobID,State,ExitCode,Submit,Start,End,NodeList`.
///
/// The header line and job steps (`123.batch`, `123.extern`, `123.0`) are
/// skipped; the allocation line carries the job's own state.
pub fn parse_sacct_output(output: &str) -> Option<SlurmJobRecord> {
    for line in output.lines().skip(1) {
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() < 7 {
            continue;
        }
        let job_id = fields[0].trim();
        if job_id.is_empty() || job_id.contains('.') {
            continue;
        }
        return Some(SlurmJobRecord {
            job_id: job_id.to_string(),
            state: fields[1].trim().to_string(),
            exit_code: parse_exit_code(fields[2]),
            submitted: parse_timestamp(fields[3]),
            started: parse_timestamp(fields[4]),
            ended: parse_timestamp(fields[5]),
            nodes: expand_nodelist(fields[6]),
        });
    }
    None
}

/// Parse exit code from SLURM format (e.g., "0:0" -> 0).
///
/// The part after the colon is the terminating signal; a job killed by a
/// signal reports `128 + signal` like a shell would.
pub fn parse_exit_code(value: &str) -> Option<i32> {
    let mut parts = value.trim().split(':');
    let code: i32 = parts.next()?.parse().ok()?;
    let signal: i32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    if code == 0 && signal != 0 {
        return Some(128 + signal);
    }
    Some(code)
}

/// Expand a SLURM host list: `node[01-03,07],gpu1` → `node01 node02 node03
/// node07 gpu1`. `(null)` and `None assigned` give no hosts.
pub fn expand_nodelist(value: &str) -> Vec<String> {
    let value = value.trim();
    if value.is_empty() || value == "(null)" || value.starts_with("None") {
        return Vec::new();
    }

    let mut hosts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in value.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                expand_group(&value[start..i], &mut hosts);
                start = i + 1;
            }
            _ => {}
        }
    }
    expand_group(&value[start..], &mut hosts);
    hosts
}

/// Ranges wider than this are kept literally instead of expanded.
const MAX_RANGE_SPAN: u64 = 65_536;

fn expand_group(group: &str, hosts: &mut Vec<String>) {
    let group = group.trim();
    if group.is_empty() {
        return;
    }
    let (Some(open), Some(close)) = (group.find('['), group.rfind(']')) else {
        hosts.push(group.to_string());
        return;
    };
    let prefix = &group[..open];
    let suffix = &group[close + 1..];
    for range in group[open + 1..close].split(',') {
        match range.split_once('-') {
            Some((lo, hi)) => {
                let width = lo.len();
                match (lo.parse::<u64>(), hi.parse::<u64>()) {
                    (Ok(lo), Ok(hi)) if lo <= hi && hi - lo < MAX_RANGE_SPAN => {
                        for n in lo..=hi {
                            hosts.push(format!("{prefix}{n:0width$}{suffix}"));
                        }
                    }
                    _ => hosts.push(format!("{prefix}{range}{suffix}")),
                }
            }
            None => hosts.push(format!("{prefix}{range}{suffix}")),
        }
    }
}

/// Ids from `squeue -h -o %i`.
pub fn parse_squeue_ids(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_parse_sbatch_output() {
        assert_eq!(
            parse_sbatch_output("Submitted batch job 12345"),
            Some("12345".to_string())
        );
        assert_eq!(
            parse_sbatch_output("Submitted batch job 12345 on cluster main\n"),
            Some("12345".to_string())
        );
        assert_eq!(parse_sbatch_output("Error: something"), None);
    }

    #[test]
    fn test_parse_scontrol_output() {
        let output = "JobId=123 JobName=sim
   UserId=alice(1000) GroupId=alice(1000) MCS_label=N/A
   JobState=FAILED Reason=NonZeroExitCode Dependency=(null)
   ExitCode=2:0
   SubmitTime=2024-01-15T10:29:00 EligibleTime=2024-01-15T10:29:00
   StartTime=2024-01-15T10:30:00 EndTime=2024-01-15T10:35:00 Deadline=N/A
   NodeList=node[01-02]
   BatchHost=node01
";
        let rec = parse_scontrol_output(output).unwrap();
        assert_eq!(rec.job_id, "123");
        assert_eq!(rec.state, "FAILED");
        assert_eq!(rec.exit_code, Some(2));
        assert_eq!(rec.nodes, vec!["node01", "node02"]);
        assert_eq!(rec.started.unwrap().minute(), 30);
        assert_eq!(rec.ended.unwrap().minute(), 35);

        assert!(parse_scontrol_output("").is_none());
    }

    #[test]
    fn test_parse_squeue_output() {
        let output = "12345|RUNNING|node01\n12346|PENDING|\n";
        let jobs = parse_squeue_output(output);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].job_id, "12345");
        assert_eq!(jobs[0].state, "RUNNING");
        assert_eq!(jobs[0].nodes, vec!["node01"]);
        assert_eq!(jobs[1].state, "PENDING");
        assert!(jobs[1].nodes.is_empty());
    }

    #[test]
    fn test_parse_sacct_output() {
        let output = "JobID|State|ExitCode|Submit|Start|End|NodeList
12345|COMPLETED|0:0|2024-01-15T10:29:00|2024-01-15T10:30:00|2024-01-15T10:35:00|node01
12345.batch|COMPLETED|0:0|2024-01-15T10:29:00|2024-01-15T10:30:00|2024-01-15T10:35:00|node01
";
        let rec = parse_sacct_output(output).unwrap();
        assert_eq!(rec.job_id, "12345");
        assert_eq!(rec.state, "COMPLETED");
        assert_eq!(rec.exit_code, Some(0));
        assert_eq!(rec.nodes, vec!["node01"]);

        assert!(parse_sacct_output("JobID|State|ExitCode|Submit|Start|End|NodeList\n").is_none());
    }

    #[test]
    fn test_parse_exit_code() {
        assert_eq!(parse_exit_code("0:0"), Some(0));
        assert_eq!(parse_exit_code("1:0"), Some(1));
        assert_eq!(parse_exit_code("0:9"), Some(137));
        assert_eq!(parse_exit_code(""), None);
    }

    #[test]
    fn test_expand_nodelist() {
        assert_eq!(
            expand_nodelist("node[01-03,07],gpu1"),
            vec!["node01", "node02", "node03", "node07", "gpu1"]
        );
        assert_eq!(expand_nodelist("c[8-10]"), vec!["c8", "c9", "c10"]);
        assert!(expand_nodelist("(null)").is_empty());
        assert!(expand_nodelist("None assigned").is_empty());
    }

    #[test]
    fn test_oversized_range_kept_literal() {
        assert_eq!(
            expand_nodelist("n[0-99999999999],m1"),
            vec!["n0-99999999999", "m1"]
        );
        assert_eq!(expand_nodelist("n[0-65535]").len(), 65_536);
    }
}
