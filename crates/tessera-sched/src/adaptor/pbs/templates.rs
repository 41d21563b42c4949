//! PBS batch script templates.

use crate::adaptor::common::{
    command_line, escape_command, escape_directive, format_walltime, node_count, project,
    prologue, queue, sanitize_name,
};
use crate::adaptor::pbs::adapter::{NodeRequest, PbsDialect};
use crate::config::BackendConfig;
use crate::description::{JobDescription, SpmdVariation};
use crate::error::SchedResult;

/// Generate a PBS batch script for a job.
pub fn generate_pbs_script(
    desc: &JobDescription,
    dialect: &PbsDialect,
    config: &BackendConfig,
) -> SchedResult<String> {
    desc.validate()?;

    let mut script = String::new();
    script.push_str("#!/bin/bash\n");

    // PBS has a 15 character limit for job names
    script.push_str(&format!(
        "#PBS -N {}\n",
        sanitize_name(&desc.display_name(), 15)
    ));

    if let Some(output) = desc.resolved_output() {
        script.push_str(&format!("#PBS -o {}\n", escape_directive(&output)));
    }
    if let Some(error) = desc.resolved_error() {
        script.push_str(&format!("#PBS -e {}\n", escape_directive(&error)));
    }
    if let Some(queue) = queue(desc, config) {
        script.push_str(&format!("#PBS -q {}\n", escape_directive(queue)));
    }
    if let Some(project) = project(desc, config) {
        script.push_str(&format!(
            "#PBS {} {}\n",
            dialect.project_flag(),
            escape_directive(project)
        ));
    }
    if let Some(minutes) = desc.wall_time_limit {
        script.push_str(&format!("#PBS -l walltime={}\n", format_walltime(minutes)));
    }

    script.push_str(&format!("#PBS -l {}\n", resource_request(desc, dialect, config)));

    if let Some(mem) = desc.total_physical_memory {
        script.push_str(&format!("#PBS -l mem={mem}mb\n"));
    }
    if !desc.job_contact.is_empty() {
        script.push_str(&format!(
            "#PBS -M {}\n#PBS -m abe\n",
            escape_directive(&desc.job_contact.join(","))
        ));
    }
    if dialect.workdir_directive() {
        if let Some(wd) = &desc.working_directory {
            script.push_str(&format!("#PBS -d {}\n", escape_directive(wd)));
        }
    }
    for directive in &config.extra_directives {
        script.push_str(&format!("#PBS {}\n", escape_directive(directive)));
    }

    script.push('\n');
    if desc.working_directory.is_none() {
        script.push_str("cd \\$PBS_O_WORKDIR\n");
    }
    script.push_str(&prologue(desc, config));

    let launcher = match desc.spmd_variation {
        Some(SpmdVariation::Mpi | SpmdVariation::MpichG) => {
            format!("mpirun -np {} ", desc.total_cpu_count)
        }
        _ => String::new(),
    };
    script.push_str(&launcher);
    script.push_str(&command_line(desc));
    if let Some(input) = desc.resolved_input() {
        script.push_str(&format!(" < {}", escape_command(&input)));
    }
    script.push('\n');

    Ok(script)
}

/// The `-l` resource request for cores, nodes and GPUs.
fn resource_request(desc: &JobDescription, dialect: &PbsDialect, config: &BackendConfig) -> String {
    let cpus = desc.total_cpu_count;
    // Without a known node size everything is requested on one node.
    let ppn = desc.processes_per_host.or(config.ppn).unwrap_or(cpus);
    let nodes = node_count(cpus, ppn);
    let cores_per_node = ppn.min(cpus);
    let gpus_per_node = desc.total_gpu_count.map(|g| g.div_ceil(nodes));

    match dialect.node_request() {
        NodeRequest::NodesPpn => {
            let mut req = format!("nodes={nodes}:ppn={cores_per_node}");
            if let Some(g) = gpus_per_node {
                req.push_str(&format!(":gpus={g}"));
            }
            req
        }
        NodeRequest::Select => {
            let mut req = format!("select={nodes}:ncpus={cores_per_node}");
            if let Some(g) = gpus_per_node {
                req.push_str(&format!(":ngpus={g}"));
            }
            if let Some(arch) = &desc.cpu_architecture {
                req.push_str(&format!(":arch={}", escape_directive(arch)));
            }
            req
        }
        NodeRequest::Cray => {
            let mut req = format!("mppwidth={cpus}");
            if desc.processes_per_host.or(config.ppn).is_some() {
                req.push_str(&format!(",mppnppn={cores_per_node}"));
            }
            req
        }
    }
}
