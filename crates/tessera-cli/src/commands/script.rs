//! Script command implementation.
//!
//! Render the batch script without submitting anything.

use std::path::Path;

use anyhow::{Context, Result};

use super::common::{JobArgs, open_service};

/// Execute the script command.
pub fn execute(config: Option<&Path>, url: &str, job: JobArgs) -> Result<()> {
    let desc = job.to_description()?;
    let service = open_service(config, url)?;
    let script = service
        .adaptor()
        .generate_script(&desc)
        .with_context(|| format!("Cannot express this job for {}", service.adaptor().name()))?;
    print!("{script}");
    Ok(())
}
