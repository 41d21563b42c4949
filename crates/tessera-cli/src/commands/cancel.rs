//! Cancel command implementation.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;

use super::common::{open_job, styled_state};

/// Execute the cancel command.
pub async fn execute(config: Option<&Path>, job_id: &str) -> Result<()> {
    let (service, job) = open_job(config, job_id).await?;
    let before = job.state().await?;
    if before.is_final() {
        println!(
            "{} Job {} already finished: {}",
            style("→").cyan().bold(),
            style(job_id).dim(),
            styled_state(before)
        );
    } else {
        job.cancel()
            .await
            .with_context(|| format!("Failed to cancel {job_id}"))?;
        println!("{} Canceled job {}", style("✓").green().bold(), style(job_id).dim());
    }
    service.close().await?;
    Ok(())
}
