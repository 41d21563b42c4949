//! Parsers for PBS command output.

use chrono::{DateTime, Utc};

use crate::adaptor::common::parse_timestamp;

/// Fields of one job as printed by `qstat -f` or `tracejob`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PbsJobRecord {
    /// Full id as printed (`12345.pbs-server`).
    pub job_id: String,
    pub job_state: String,
    pub exit_status: Option<i32>,
    pub exec_hosts: Vec<String>,
    pub created: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    /// Set when tracejob shows a `qdel` for the job.
    pub deleted: bool,
}

/// Parse qsub output to extract the native job id.
///
/// qsub prints the full id on its last line (`12345.pbs-server`, Torque may
/// add a domain). Only the numeric part before the first dot is kept.
pub fn parse_qsub_output(output: &str) -> Option<String> {
    let last = output.lines().rev().map(str::trim).find(|l| !l.is_empty())?;
    let id = last.split('.').next()?.trim();
    if id.is_empty() || !id.chars().next()?.is_ascii_digit() {
        return None;
    }
    Some(id.to_string())
}

/// Whether qstat/qdel/tracejob complained that the job does not exist.
pub fn is_unknown_job(stderr: &str) -> bool {
    stderr.contains("Unknown Job Id")
        || stderr.contains("does not exist")
        || stderr.contains("Couldn't find Job Id")
        || stderr.contains("Job has finished")
}

/// Parse qstat full output (`-f`). Several jobs may be listed.
///
/// ```text
/// Job Id: 12345.pbs-server
///     Job_Name = my_job
///     job_state = R
///     exec_host = node01/0+node01/1
///     Exit_status = 0
///     ctime = Mon Jan 15 10:29:00 2024
/// ```
///
/// Long values wrap onto lines starting with a tab; those are joined.
pub fn parse_qstat_full_output(output: &str) -> Vec<PbsJobRecord> {
    let mut records = Vec::new();
    let mut current: Option<PbsJobRecord> = None;
    let mut pending: Option<(String, String)> = None;

    let flush = |record: &mut Option<PbsJobRecord>, kv: &mut Option<(String, String)>| {
        if let (Some(rec), Some((key, value))) = (record.as_mut(), kv.take()) {
            apply_attribute(rec, &key, &value);
        }
    };

    for raw in output.lines() {
        if let Some(id) = raw.trim().strip_prefix("Job Id:") {
            flush(&mut current, &mut pending);
            if let Some(done) = current.take() {
                records.push(done);
            }
            current = Some(PbsJobRecord {
                job_id: id.trim().to_string(),
                ..PbsJobRecord::default()
            });
            continue;
        }

        if raw.starts_with('\t') && !raw.contains(" = ") {
            if let Some((_, value)) = pending.as_mut() {
                value.push_str(raw.trim());
            }
            continue;
        }

        if let Some((key, value)) = raw.split_once('=') {
            flush(&mut current, &mut pending);
            pending = Some((key.trim().to_string(), value.trim().to_string()));
        }
    }
    flush(&mut current, &mut pending);
    if let Some(done) = current {
        records.push(done);
    }
    records
}

fn apply_attribute(rec: &mut PbsJobRecord, key: &str, value: &str) {
    match key.to_ascii_lowercase().as_str() {
        "job_state" => rec.job_state = value.to_string(),
        "exit_status" => rec.exit_status = value.parse().ok(),
        "exec_host" => rec.exec_hosts = parse_exec_host(value),
        "ctime" => rec.created = parse_timestamp(value),
        "start_time" | "stime" => rec.started = parse_timestamp(value),
        "comp_time" | "obittime" => rec.finished = parse_timestamp(value),
        _ => {}
    }
}

/// `node01/0+node01/1+node02/0*4` → `[node01, node02]`.
pub fn parse_exec_host(value: &str) -> Vec<String> {
    let mut hosts: Vec<String> = Vec::new();
    for part in value.split('+') {
        let host = part.split('/').next().unwrap_or("").trim();
        if !host.is_empty() && !hosts.iter().any(|h| h == host) {
            hosts.push(host.to_string());
        }
    }
    hosts
}

/// Parse `tracejob` output for a job that has left the queue.
///
/// ```text
/// Job: 12345.pbs-server
///
/// 01/15/2024 10:29:00  S    enqueuing into batch, state 1 hop 1
/// 01/15/2024 10:30:00  S    Job Run at request of Scheduler@server on exec_host=node01/0
/// 01/15/2024 10:35:00  S    Exit_status=0 resources_used.cput=00:04:50
/// ```
pub fn parse_tracejob_output(output: &str) -> Option<PbsJobRecord> {
    let mut rec = PbsJobRecord::default();
    let mut seen_event = false;

    for line in output.lines() {
        let line = line.trim();

        if let Some(id) = line.strip_prefix("Job:") {
            rec.job_id = id.trim().to_string();
            continue;
        }
        if line.is_empty() {
            continue;
        }

        let timestamp = line
            .get(..19)
            .and_then(parse_timestamp)
            .or_else(|| line.get(..20).and_then(parse_timestamp));
        if timestamp.is_none() {
            continue;
        }
        seen_event = true;

        if rec.created.is_none() && line.contains("enqueuing") {
            rec.created = timestamp;
        }
        if let Some(pos) = line.find("exec_host=") {
            let rest = &line[pos + "exec_host=".len()..];
            let value = rest.split_whitespace().next().unwrap_or("");
            rec.exec_hosts = parse_exec_host(value);
            rec.started = rec.started.or(timestamp);
        }
        if let Some(pos) = line.find("Exit_status=") {
            let rest = &line[pos + "Exit_status=".len()..];
            let digits: String = rest
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '-')
                .collect();
            rec.exit_status = digits.parse().ok();
            rec.finished = timestamp;
        }
        if line.contains("deleted at request of") || line.contains("Job deleted") {
            rec.deleted = true;
            rec.finished = rec.finished.or(timestamp);
        }
    }

    if !seen_event {
        return None;
    }
    Some(rec)
}

/// Ids from `qstat -u <user>` brief output.
pub fn parse_qstat_ids(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|token| token.chars().next().is_some_and(|c| c.is_ascii_digit()))
        .filter_map(|token| token.split('.').next())
        .map(str::to_string)
        .collect()
}
