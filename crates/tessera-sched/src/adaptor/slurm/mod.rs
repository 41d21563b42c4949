//! SLURM integration.
//!
//! Jobs are submitted with `sbatch`, tracked with `scontrol show job` (or
//! `squeue` for several jobs at once) and looked up in `sacct` once they
//! have left the controller's memory.

mod adapter;
mod parser;
mod templates;

pub use adapter::SlurmAdaptor;
pub use parser::expand_nodelist;
pub use templates::generate_slurm_script;
