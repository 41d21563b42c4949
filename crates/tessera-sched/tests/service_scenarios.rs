//! Service level scenarios against scripted scheduler output.
//!
//! The monitor interval is set far beyond the test run; polling happens
//! through `JobService::refresh` so every query is deterministic.

use std::sync::Arc;
use std::time::Duration;

use tessera_sched::shell::{CommandOutput, ScriptedShell};
use tessera_sched::{
    AdaptorRegistry, CancelPolicy, JobDescription, JobService, JobState, ResourceUrl, SchedError,
    ServiceConfig,
};

fn config() -> ServiceConfig {
    ServiceConfig::default()
        .with_monitor_interval(Duration::from_secs(3600))
        .with_accounting(1, Duration::from_millis(1))
}

fn service(url: &str, config: ServiceConfig, shell: &Arc<ScriptedShell>) -> JobService {
    JobService::with_shell(
        ResourceUrl::parse(url).unwrap(),
        config,
        &AdaptorRegistry::with_builtins(),
        shell.clone(),
    )
    .unwrap()
}

fn scontrol(id: &str, state: &str, exit: &str) -> CommandOutput {
    CommandOutput::ok(format!(
        "JobId={id} JobName=probe\n   JobState={state} Reason=None ExitCode={exit}\n   NodeList=n[01-02]\n"
    ))
}

#[tokio::test]
async fn test_failed_submission_leaves_job_new() {
    let shell = Arc::new(
        ScriptedShell::new().on("qsub", CommandOutput::failed(1, "qsub: Unknown queue: nope")),
    );
    let service = service("pbs://localhost", config(), &shell);
    let mut job = service
        .create_job(JobDescription::new("/bin/date").with_queue("nope"))
        .unwrap();

    let err = job.run().await.unwrap_err();
    assert!(matches!(err, SchedError::Submission { exit_code: 1, .. }));
    assert!(err.to_string().contains("Unknown queue"));
    assert!(job.id().is_none());
    assert_eq!(job.state().await.unwrap(), JobState::New);
    assert!(service.jobs().await.unwrap().is_empty());
    // the script file is removed even though qsub failed
    assert_eq!(shell.count("rm -f"), 1);
    service.close().await.unwrap();
}

#[tokio::test]
async fn test_pbs_node_request_rounds_up() {
    let shell = Arc::new(ScriptedShell::new().on("qsub", CommandOutput::ok("17.head\n")));
    let service = service("torque://localhost", config(), &shell);
    let mut job = service
        .create_job(
            JobDescription::new("solver")
                .with_total_cpu_count(17)
                .with_processes_per_host(16),
        )
        .unwrap();
    job.run().await.unwrap();

    assert_eq!(job.id().unwrap().to_string(), "[torque://localhost]-[17]");
    let written = shell.written();
    assert_eq!(written.len(), 1);
    let (path, script) = &written[0];
    assert!(path.ends_with(".pbs"), "{path}");
    assert!(script.contains("#PBS -l nodes=2:ppn=16\n"), "{script}");
    service.close().await.unwrap();
}

#[tokio::test]
async fn test_vanished_job_is_marked_gone() {
    let shell = Arc::new(
        ScriptedShell::new()
            .on("qsub", CommandOutput::ok("5.server\n"))
            .on("qstat", CommandOutput::failed(153, "qstat: Unknown Job Id 5.server")),
    );
    let service = service("pbspro://localhost", config(), &shell);
    let mut job = service.create_job(JobDescription::new("true")).unwrap();
    job.run().await.unwrap();

    service.refresh().await.unwrap();
    assert!(job.is_gone().await.unwrap());
    assert_eq!(job.state().await.unwrap(), JobState::Pending);
    // nothing will ever change, so wait gives up immediately
    assert!(!job.wait(None).await.unwrap());

    // gone jobs are not polled again
    service.refresh().await.unwrap();
    assert_eq!(shell.count("qstat"), 1);
    service.close().await.unwrap();
}

#[tokio::test]
async fn test_cancel_twice_issues_one_qdel() {
    let shell = Arc::new(ScriptedShell::new().on("qsub", CommandOutput::ok("7.server\n")));
    let service = service("pbs://localhost", config(), &shell);
    let mut job = service.create_job(JobDescription::new("true")).unwrap();
    job.run().await.unwrap();

    job.cancel().await.unwrap();
    job.cancel().await.unwrap();
    assert_eq!(shell.count("qdel"), 1);
    assert_eq!(job.state().await.unwrap(), JobState::Canceled);
    assert!(job.finished().await.unwrap().is_some());
    service.close().await.unwrap();
}

#[tokio::test]
async fn test_final_state_is_not_polled_again() {
    let shell = Arc::new(
        ScriptedShell::new()
            .on("sbatch", CommandOutput::ok("Submitted batch job 42\n"))
            .on("scontrol", scontrol("42", "COMPLETED", "0:0"))
            .on("scontrol", scontrol("42", "PENDING", "0:0")),
    );
    let service = service("slurm://localhost", config(), &shell);
    let mut job = service.create_job(JobDescription::new("true")).unwrap();
    job.run().await.unwrap();

    service.refresh().await.unwrap();
    assert_eq!(job.state().await.unwrap(), JobState::Done);
    assert_eq!(job.exit_code().await.unwrap(), Some(0));
    assert_eq!(job.execution_hosts().await.unwrap(), vec!["n01", "n02"]);

    service.refresh().await.unwrap();
    assert_eq!(shell.count("scontrol"), 1);
    assert_eq!(job.state().await.unwrap(), JobState::Done);
    service.close().await.unwrap();
}

#[tokio::test]
async fn test_cancel_race_backend_wins() {
    let shell = Arc::new(
        ScriptedShell::new()
            .on("sbatch", CommandOutput::ok("Submitted batch job 9\n"))
            .on("scontrol", scontrol("9", "RUNNING", "0:0"))
            .on("scontrol", scontrol("9", "COMPLETED", "0:0")),
    );
    let service = service("slurm://localhost", config(), &shell);
    let mut events = service.subscribe();
    let mut job = service.create_job(JobDescription::new("true")).unwrap();
    job.run().await.unwrap();
    service.refresh().await.unwrap();
    assert_eq!(job.state().await.unwrap(), JobState::Running);

    job.cancel().await.unwrap();
    assert_eq!(job.state().await.unwrap(), JobState::Canceled);
    service.refresh().await.unwrap();
    assert_eq!(job.state().await.unwrap(), JobState::Done);

    let mut seen = Vec::new();
    while let Ok(change) = events.try_recv() {
        seen.push((change.old, change.new));
    }
    assert_eq!(
        seen,
        vec![
            (JobState::New, JobState::Pending),
            (JobState::Pending, JobState::Running),
            (JobState::Running, JobState::Canceled),
            (JobState::Canceled, JobState::Done),
        ]
    );
    service.close().await.unwrap();
}

#[tokio::test]
async fn test_cancel_race_keep_canceled() {
    let shell = Arc::new(
        ScriptedShell::new()
            .on("sbatch", CommandOutput::ok("Submitted batch job 9\n"))
            .on("scontrol", scontrol("9", "RUNNING", "0:0"))
            .on("scontrol", scontrol("9", "COMPLETED", "0:0")),
    );
    let config = config().with_cancel_policy(CancelPolicy::KeepCanceled);
    let service = service("slurm://localhost", config, &shell);
    let mut job = service.create_job(JobDescription::new("true")).unwrap();
    job.run().await.unwrap();
    service.refresh().await.unwrap();

    job.cancel().await.unwrap();
    service.refresh().await.unwrap();
    assert_eq!(job.state().await.unwrap(), JobState::Canceled);
    assert_eq!(shell.count("scontrol"), 1);
    service.close().await.unwrap();
}

#[tokio::test]
async fn test_bulk_query_falls_back_per_job() {
    let shell = Arc::new(
        ScriptedShell::new()
            .on("sbatch", CommandOutput::ok("Submitted batch job 1\n"))
            .on("sbatch", CommandOutput::ok("Submitted batch job 2\n"))
            .on("squeue -h -j", CommandOutput::ok("1|RUNNING|c[1-2]\n"))
            .on("scontrol", scontrol("2", "FAILED", "3:0")),
    );
    let service = service("slurm://localhost", config(), &shell);
    let mut first = service.create_job(JobDescription::new("a")).unwrap();
    let mut second = service.create_job(JobDescription::new("b")).unwrap();
    first.run().await.unwrap();
    second.run().await.unwrap();

    service.refresh().await.unwrap();
    assert_eq!(first.state().await.unwrap(), JobState::Running);
    assert_eq!(first.execution_hosts().await.unwrap(), vec!["c1", "c2"]);
    assert_eq!(second.state().await.unwrap(), JobState::Failed);
    assert_eq!(second.exit_code().await.unwrap(), Some(3));
    assert_eq!(shell.count("squeue"), 1);
    assert_eq!(shell.count("scontrol show job 2"), 1);
    assert_eq!(shell.count("scontrol show job 1"), 0);
    service.close().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_untracked_job() {
    let shell = Arc::new(ScriptedShell::new().on(
        "bjobs",
        CommandOutput::ok("311|RUN|-|node7\n"),
    ));
    let service = service("lsf://localhost", config(), &shell);
    let job = service.get_job("[lsf://localhost]-[311]").await.unwrap();
    assert!(job.description().is_none());
    assert_eq!(job.state().await.unwrap(), JobState::Running);
    assert_eq!(job.execution_hosts().await.unwrap(), vec!["node7"]);
    assert_eq!(service.jobs().await.unwrap().len(), 1);
    service.close().await.unwrap();
}

#[tokio::test]
async fn test_use_after_close() {
    let shell = Arc::new(ScriptedShell::new().on("qsub", CommandOutput::ok("3.srv\n")));
    let service = service("pbs://localhost", config(), &shell);
    let mut job = service.create_job(JobDescription::new("true")).unwrap();
    job.run().await.unwrap();
    service.close().await.unwrap();

    assert!(shell.is_finalized());
    for result in [
        job.cancel().await,
        job.wait(Some(Duration::ZERO)).await.map(|_| ()),
        job.state().await.map(|_| ()),
        service.refresh().await,
    ] {
        assert!(matches!(result, Err(SchedError::IncorrectState { .. })));
    }
}
