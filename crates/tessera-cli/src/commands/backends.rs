//! Backends command implementation.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use console::style;

use tessera_sched::adaptor::AdaptorContext;
use tessera_sched::shell;
use tessera_sched::{AdaptorRegistry, ResourceUrl};

use super::common::load_config;

/// Execute the backends command.
pub fn execute(config: Option<&Path>) -> Result<()> {
    let config = Arc::new(load_config(config)?);
    let registry = AdaptorRegistry::with_builtins();

    println!("{} Available backends:\n", style("Tessera").cyan().bold());
    for scheme in registry.available() {
        // adaptors only talk to the shell once a job is submitted
        let url = ResourceUrl::parse(&format!("{scheme}://localhost"))?;
        let adaptor = registry.create(AdaptorContext {
            shell: shell::connect(&url, &config),
            url,
            config: config.clone(),
        })?;
        let caps = adaptor.capabilities();
        let mark = |on: bool| if on { style("yes").green() } else { style("no").dim() };

        println!("  {} {}", style("●").green(), style(&scheme).bold());
        println!("    Adaptor: {}", adaptor.name());
        println!("    Suspend/resume: {}", mark(caps.suspend));
        println!("    Bulk status queries: {}", mark(caps.bulk_query));
        println!("    Accounting lookup: {}", mark(caps.accounting));
        println!();
    }
    Ok(())
}
