//! Submit command implementation.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use console::style;

use super::common::{JobArgs, open_service};
use super::wait::wait_with_spinner;

/// Execute the submit command.
pub async fn execute(
    config: Option<&Path>,
    url: &str,
    job: JobArgs,
    do_wait: bool,
    timeout: Option<u64>,
) -> Result<()> {
    let desc = job.to_description()?;
    tracing::debug!(url, executable = %desc.executable, "Submitting job");
    let service = open_service(config, url)?;

    let mut handle = service.create_job(desc)?;
    handle.run().await.context("Submission failed")?;
    let id = handle
        .id()
        .ok_or_else(|| anyhow::anyhow!("Job has no id after submission"))?
        .to_string();

    println!("{} Submitted job {}", style("✓").green().bold(), style(&id).cyan());

    if do_wait {
        wait_with_spinner(&handle, timeout.map(Duration::from_secs)).await?;
    }

    service.close().await?;
    Ok(())
}
