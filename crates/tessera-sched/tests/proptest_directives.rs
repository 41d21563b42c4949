//! Property-based tests for transfer directives, job ids and state mapping.

use std::sync::Arc;

use proptest::prelude::*;
use tessera_sched::adaptor::AdaptorContext;
use tessera_sched::adaptor::noop::NoopAdaptor;
use tessera_sched::adaptor::slurm::SlurmAdaptor;
use tessera_sched::shell::ScriptedShell;
use tessera_sched::transfer::to_string_list;
use tessera_sched::{
    JobId, JobState, ResourceUrl, SchedError, SchedulerAdaptor, ServiceConfig, TransferDirective,
    TransferOp,
};

fn arb_op() -> impl Strategy<Value = TransferOp> {
    prop_oneof![
        Just(TransferOp::CopyIn),
        Just(TransferOp::AppendIn),
        Just(TransferOp::CopyOut),
        Just(TransferOp::AppendOut),
    ]
}

/// Paths without operators or surrounding whitespace.
fn arb_path() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_./$~-]{1,24}"
}

fn arb_state() -> impl Strategy<Value = JobState> {
    prop_oneof![
        Just(JobState::Pending),
        Just(JobState::Running),
        Just(JobState::Suspended),
        Just(JobState::Done),
        Just(JobState::Failed),
        Just(JobState::Canceled),
    ]
}

proptest! {
    #[test]
    fn directive_roundtrip(local in arb_path(), op in arb_op(), remote in arb_path()) {
        let text = format!("{local} {} {remote}", op.symbol());
        let parsed = TransferDirective::parse(&text).unwrap();
        prop_assert_eq!(&parsed, &TransferDirective::new(local, op, remote));
        prop_assert_eq!(parsed.to_string(), text);
        prop_assert_eq!(parsed.is_stage_in(), op.is_stage_in());
    }

    #[test]
    fn directive_list_roundtrip(
        directives in prop::collection::vec((arb_path(), arb_op(), arb_path()), 0..6),
    ) {
        let directives: Vec<TransferDirective> = directives
            .into_iter()
            .map(|(local, op, remote)| TransferDirective::new(local, op, remote))
            .collect();
        let rendered = to_string_list(&directives);
        prop_assert_eq!(TransferDirective::parse_all(&rendered).unwrap(), directives);
    }

    #[test]
    fn directive_tolerates_missing_spaces(local in arb_path(), op in arb_op(), remote in arb_path()) {
        let parsed = TransferDirective::parse(&format!("{local}{}{remote}", op.symbol())).unwrap();
        prop_assert_eq!(parsed.op, op);
        prop_assert_eq!(parsed.local, local);
        prop_assert_eq!(parsed.remote, remote);
    }

    #[test]
    fn three_operators_are_rejected(
        local in arb_path(),
        remote in arb_path(),
        arrow in prop_oneof![Just('<'), Just('>')],
        count in 3usize..6,
    ) {
        let ops: String = std::iter::repeat_n(arrow, count).collect();
        let result = TransferDirective::parse(&format!("{local} {ops} {remote}"));
        prop_assert!(matches!(result, Err(SchedError::Parameter(_))));
    }

    #[test]
    fn job_id_roundtrip(url in "[^\\]]*", native in "[^\\]]*") {
        let id = JobId::new(url.clone(), native.clone());
        let parsed = JobId::parse(&id.to_string()).unwrap();
        prop_assert_eq!(parsed.url(), url.as_str());
        prop_assert_eq!(parsed.native(), native.as_str());
        prop_assert_eq!(parsed, id);
    }

    #[test]
    fn job_id_roundtrip_service_urls(
        scheme in "(slurm|pbs|sge|lsf|condor)",
        host in "[a-z][a-z0-9.-]{0,16}",
        native in "[0-9]{1,7}(\\.[a-z]{1,8})?",
    ) {
        let id = JobId::new(format!("{scheme}://{host}"), native.clone());
        let parsed = JobId::parse(&id.to_string()).unwrap();
        prop_assert_eq!(parsed.native(), native.as_str());
        prop_assert_eq!(parsed, id);
    }

    #[test]
    fn noop_state_names_map_back(state in arb_state()) {
        let noop = NoopAdaptor::new();
        prop_assert_eq!(noop.translate_state(state.name(), None), state);
    }

    #[test]
    fn slurm_never_reports_new(token in "\\PC{0,16}", exit in proptest::option::of(-1i32..300)) {
        let ctx = AdaptorContext {
            url: ResourceUrl::parse("slurm://localhost").unwrap(),
            config: Arc::new(ServiceConfig::default()),
            shell: Arc::new(ScriptedShell::new()),
        };
        let slurm = SlurmAdaptor::new(ctx);
        prop_assert_ne!(slurm.translate_state(&token, exit), JobState::New);
    }
}
