//! PBS (Portable Batch System) family: OpenPBS, PBS Pro and Torque.
//!
//! The three flavors share the `qsub`/`qstat`/`qdel` command set but differ
//! in how resources are requested and how finished jobs are reported. Those
//! differences live in [`PbsDialect`]; the adapter itself is flavor agnostic.

mod adapter;
mod parser;
mod templates;

pub use adapter::{NodeRequest, PbsAdaptor, PbsDialect};
pub use templates::generate_pbs_script;
