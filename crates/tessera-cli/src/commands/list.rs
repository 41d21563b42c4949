//! List command implementation.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;

use super::common::open_service;

/// Execute the list command.
pub async fn execute(config: Option<&Path>, url: &str) -> Result<()> {
    let service = open_service(config, url)?;
    let ids = service
        .list()
        .await
        .with_context(|| format!("Failed to list jobs on {url}"))?;
    service.close().await?;

    if ids.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }
    println!("{} {} job(s):\n", style("→").cyan().bold(), ids.len());
    for id in &ids {
        println!("  {id}");
    }
    Ok(())
}
