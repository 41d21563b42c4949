//! Wait command implementation.
//!
//! Reconnect to a job and block until it reaches a final state.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use tessera_sched::{JobHandle, JobState};

use super::common::{open_job, styled_state};

/// Execute the wait command.
pub async fn execute(config: Option<&Path>, job_id: &str, timeout: Option<u64>) -> Result<()> {
    let (service, job) = open_job(config, job_id).await?;
    println!(
        "{} Waiting for job {}{}",
        style("→").cyan().bold(),
        style(job_id).dim(),
        timeout.map(|t| format!(" (timeout: {t}s)")).unwrap_or_default()
    );
    let result = wait_with_spinner(&job, timeout.map(Duration::from_secs)).await;
    service.close().await?;
    result
}

/// Wait for `job`, showing its state on a spinner, and report the outcome.
pub async fn wait_with_spinner(job: &JobHandle, timeout: Option<Duration>) -> Result<()> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .map_err(|e| anyhow::anyhow!("Invalid progress template: {e}"))?,
    );
    spinner.enable_steady_tick(Duration::from_millis(100));

    let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
    let finished = loop {
        let state = job.state().await?;
        spinner.set_message(format!("Status: {} ...", state.name()));

        // short slices keep the spinner message current
        let slice = match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(tokio::time::Instant::now());
                if left.is_zero() {
                    break job.wait(Some(Duration::ZERO)).await?;
                }
                left.min(Duration::from_secs(2))
            }
            None => Duration::from_secs(2),
        };
        if job.wait(Some(slice)).await? {
            break true;
        }
        if job.is_gone().await? {
            break false;
        }
    };
    spinner.finish_and_clear();

    let state = job.state().await?;
    if !finished {
        if job.is_gone().await? {
            anyhow::bail!(
                "Job is no longer known to the scheduler (last state {})",
                state.name()
            );
        }
        anyhow::bail!("Timed out, job is still {}", state.name());
    }

    let exit = job
        .exit_code()
        .await?
        .map(|c| format!(" (exit code {c})"))
        .unwrap_or_default();
    if state == JobState::Done {
        println!("{} Job finished: {}{}", style("✓").green().bold(), styled_state(state), exit);
        Ok(())
    } else {
        println!("{} Job finished: {}{}", style("✗").red().bold(), styled_state(state), exit);
        anyhow::bail!("Job ended in state {}", state.name())
    }
}
