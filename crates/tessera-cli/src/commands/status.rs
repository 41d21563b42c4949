//! Status command implementation.

use std::path::Path;

use anyhow::Result;
use chrono::Utc;
use console::style;

use super::common::{OutputFormat, open_job, styled_state};

/// Execute the status command.
pub async fn execute(config: Option<&Path>, job_id: &str, format: OutputFormat) -> Result<()> {
    let (service, job) = open_job(config, job_id).await?;
    let record = job
        .record()
        .await?
        .ok_or_else(|| anyhow::anyhow!("No record for job {job_id}"))?;
    service.close().await?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    println!(
        "{} Job {} status: {}",
        style("→").cyan().bold(),
        style(job_id).dim(),
        styled_state(record.state).bold()
    );
    if let Some(native) = &record.native_state {
        println!("  Native state: {}", style(native).yellow());
    }
    if let Some(code) = record.exit_code {
        println!("  Exit code: {code}");
    }
    if !record.exec_hosts.is_empty() {
        println!("  Hosts: {}", record.exec_hosts.join(", "));
    }
    for (label, time) in [
        ("Created", record.created),
        ("Started", record.started),
        ("Finished", record.finished),
    ] {
        if let Some(time) = time {
            println!("  {label}: {}", time.format("%Y-%m-%d %H:%M:%S UTC"));
        }
    }
    if let Some(started) = record.started {
        let end = record.finished.unwrap_or_else(Utc::now);
        let elapsed = (end - started).num_seconds().max(0);
        println!(
            "  Elapsed: {}h {:02}m {:02}s",
            elapsed / 3600,
            (elapsed % 3600) / 60,
            elapsed % 60
        );
    }
    Ok(())
}
