//! SLURM batch script templates.

use crate::adaptor::common::{
    command_line, escape_directive, format_walltime, node_count, project, prologue, queue,
    sanitize_name,
};
use crate::config::{BackendConfig, SlurmNodeSpec};
use crate::description::{JobDescription, SpmdVariation};
use crate::error::SchedResult;

/// Generate a SLURM batch script for a job.
pub fn generate_slurm_script(desc: &JobDescription, config: &BackendConfig) -> SchedResult<String> {
    desc.validate()?;

    let mut script = String::new();
    script.push_str("#!/bin/bash\n");

    // SLURM has a 64 character limit for job names
    script.push_str(&format!(
        "#SBATCH --job-name={}\n",
        sanitize_name(&desc.display_name(), 64)
    ));

    let cpus = desc.total_cpu_count;
    script.push_str(&format!("#SBATCH --ntasks={cpus}\n"));
    let ppn = desc.processes_per_host.or(config.ppn);
    if let (SlurmNodeSpec::NodesAndTasks, Some(ppn)) = (config.slurm_node_spec, ppn) {
        script.push_str(&format!("#SBATCH --nodes={}\n", node_count(cpus, ppn)));
    }
    if let Some(per_host) = desc.processes_per_host {
        script.push_str(&format!("#SBATCH --ntasks-per-node={per_host}\n"));
    }

    if let Some(wd) = &desc.working_directory {
        script.push_str(&format!("#SBATCH --chdir={}\n", escape_directive(wd)));
    }
    if let Some(output) = desc.resolved_output() {
        script.push_str(&format!("#SBATCH --output={}\n", escape_directive(&output)));
    }
    if let Some(error) = desc.resolved_error() {
        script.push_str(&format!("#SBATCH --error={}\n", escape_directive(&error)));
    }
    if let Some(input) = desc.resolved_input() {
        script.push_str(&format!("#SBATCH --input={}\n", escape_directive(&input)));
    }
    if let Some(minutes) = desc.wall_time_limit {
        script.push_str(&format!("#SBATCH --time={}\n", format_walltime(minutes)));
    }
    if let Some(queue) = queue(desc, config) {
        script.push_str(&format!("#SBATCH --partition={}\n", escape_directive(queue)));
    }
    if let Some(project) = project(desc, config) {
        script.push_str(&format!("#SBATCH --account={}\n", escape_directive(project)));
    }
    if let Some(gpus) = desc.total_gpu_count {
        match &desc.gpu_architecture {
            Some(arch) => script.push_str(&format!(
                "#SBATCH --gres=gpu:{}:{gpus}\n",
                escape_directive(arch)
            )),
            None => script.push_str(&format!("#SBATCH --gres=gpu:{gpus}\n")),
        }
    }
    if let Some(mem) = desc.total_physical_memory {
        script.push_str(&format!("#SBATCH --mem={mem}M\n"));
    }
    if !desc.job_contact.is_empty() {
        script.push_str(&format!(
            "#SBATCH --mail-user={}\n#SBATCH --mail-type=ALL\n",
            escape_directive(&desc.job_contact.join(","))
        ));
    }
    if !desc.candidate_hosts.is_empty() {
        script.push_str(&format!(
            "#SBATCH --nodelist={}\n",
            escape_directive(&desc.candidate_hosts.join(","))
        ));
    }
    if let Some(arch) = &desc.cpu_architecture {
        script.push_str(&format!("#SBATCH --constraint={}\n", escape_directive(arch)));
    }
    for directive in &config.extra_directives {
        script.push_str(&format!("#SBATCH {}\n", escape_directive(directive)));
    }

    script.push('\n');
    script.push_str(&prologue(desc, config));
    if matches!(
        desc.spmd_variation,
        Some(SpmdVariation::Mpi | SpmdVariation::MpichG)
    ) {
        script.push_str("srun ");
    }
    script.push_str(&command_line(desc));
    script.push('\n');

    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_script() {
        let desc = JobDescription::new("/bin/hostname");
        let script = generate_slurm_script(&desc, &BackendConfig::default()).unwrap();
        assert_eq!(
            script,
            "#!/bin/bash\n#SBATCH --job-name=hostname\n#SBATCH --ntasks=1\n\n/bin/hostname\n"
        );
    }

    #[test]
    fn test_full_script() {
        let desc = JobDescription::new("./lmp")
            .with_name("md run")
            .with_arguments(["-in", "in.lj"])
            .with_working_directory("/scratch/md")
            .with_output("md.out")
            .with_error("md.err")
            .with_queue("gpu")
            .with_project("chem42")
            .with_wall_time_limit(125)
            .with_total_cpu_count(64)
            .with_total_gpu_count(4)
            .with_gpu_architecture("a100")
            .with_total_physical_memory(32000)
            .with_candidate_host("gpu01")
            .with_candidate_host("gpu02")
            .with_spmd_variation(SpmdVariation::Mpi);
        let config = BackendConfig {
            ppn: Some(32),
            slurm_node_spec: SlurmNodeSpec::NodesAndTasks,
            modules: vec!["lammps/2023".into()],
            ..BackendConfig::default()
        };

        let script = generate_slurm_script(&desc, &config).unwrap();
        for line in [
            "#SBATCH --job-name=md_run\n",
            "#SBATCH --ntasks=64\n",
            "#SBATCH --nodes=2\n",
            "#SBATCH --chdir=/scratch/md\n",
            "#SBATCH --output=/scratch/md/md.out\n",
            "#SBATCH --error=/scratch/md/md.err\n",
            "#SBATCH --time=02:05:00\n",
            "#SBATCH --partition=gpu\n",
            "#SBATCH --account=chem42\n",
            "#SBATCH --gres=gpu:a100:4\n",
            "#SBATCH --mem=32000M\n",
            "#SBATCH --nodelist=gpu01,gpu02\n",
            "module load lammps/2023\n",
        ] {
            assert!(script.contains(line), "missing {line:?} in\n{script}");
        }
        assert!(script.ends_with("srun ./lmp -in in.lj\n"));
    }

    #[test]
    fn test_tasks_only_by_default() {
        let desc = JobDescription::new("a.out").with_total_cpu_count(17);
        let config = BackendConfig {
            ppn: Some(16),
            ..BackendConfig::default()
        };
        let script = generate_slurm_script(&desc, &config).unwrap();
        assert!(script.contains("--ntasks=17"));
        assert!(!script.contains("--nodes"));
    }
}
