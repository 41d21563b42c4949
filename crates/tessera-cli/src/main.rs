//! Tessera Command-Line Interface
//!
//! Submit and track batch jobs on any supported scheduler:
//!
//! ```text
//! tessera submit slurm+ssh://login.cluster --queue debug --cpus 4 -- ./solver in.dat
//! tessera status '[slurm+ssh://login.cluster]-[4711]'
//! tessera wait '[slurm+ssh://login.cluster]-[4711]' --timeout 600
//! tessera script pbs://localhost --walltime 30 -- /bin/hostname
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use console::style;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::common::{JobArgs, OutputFormat};
use commands::{backends, cancel, list, script, status, submit, wait};

/// Tessera - uniform job submission for HPC batch schedulers
#[derive(Parser)]
#[command(name = "tessera")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (default: ~/.tessera/config.yaml if present)
    #[arg(short, long, env = "TESSERA_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a job
    Submit {
        /// Resource URL (slurm://host, pbs+ssh://user@host, ...)
        url: String,

        #[command(flatten)]
        job: JobArgs,

        /// Wait for the job to finish
        #[arg(short, long)]
        wait: bool,

        /// Timeout in seconds when waiting
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Show the state of a job
    Status {
        /// Job ID ([url]-[native id])
        job_id: String,

        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Wait for a job to finish
    Wait {
        /// Job ID ([url]-[native id])
        job_id: String,

        /// Timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Cancel a job
    Cancel {
        /// Job ID ([url]-[native id])
        job_id: String,
    },

    /// List the current user's jobs on a resource
    List {
        /// Resource URL
        url: String,
    },

    /// Print the batch script a job would be submitted with
    Script {
        /// Resource URL
        url: String,

        #[command(flatten)]
        job: JobArgs,
    },

    /// List available backends
    Backends,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let json = std::env::var("TESSERA_LOG_FORMAT").is_ok_and(|f| f == "json");
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = cli.config.as_deref();
    let result = match cli.command {
        Commands::Submit {
            url,
            job,
            wait: do_wait,
            timeout,
        } => submit::execute(config, &url, job, do_wait, timeout).await,

        Commands::Status { job_id, format } => status::execute(config, &job_id, format).await,

        Commands::Wait { job_id, timeout } => wait::execute(config, &job_id, timeout).await,

        Commands::Cancel { job_id } => cancel::execute(config, &job_id).await,

        Commands::List { url } => list::execute(config, &url).await,

        Commands::Script { url, job } => script::execute(config, &url, job),

        Commands::Backends => backends::execute(config),
    };

    // Handle errors
    if let Err(e) = result {
        eprintln!("{} {:#}", style("Error:").red().bold(), e);
        std::process::exit(1);
    }

    Ok(())
}
