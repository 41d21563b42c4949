//! Background polling of active jobs.
//!
//! One task per service. Each cycle snapshots the jobs that need polling,
//! queries the backend without holding the job table, then applies the
//! results record by record.

use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::description::JobDescription;
use crate::error::ErrorKind;
use crate::job_id::JobId;
use crate::service::ServiceInner;
use crate::state::{JobInfo, JobState};

/// Consecutive failing cycles with distinct error kinds before the monitor
/// stops itself.
const GIVE_UP_AFTER: usize = 3;

/// Handle on a running monitor task.
pub(crate) struct MonitorHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub(crate) fn spawn(inner: &Arc<ServiceInner>) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let interval = inner.config.monitor_interval();
        let task = tokio::spawn(run(Arc::downgrade(inner), interval, stop_rx));
        debug!("Job monitor started for {} (every {:?})", inner.url, interval);
        Self { stop, task }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the task and wait for it, aborting it after `timeout`.
    pub(crate) async fn shutdown(self, timeout: Duration) {
        let _ = self.stop.send(true);
        let mut task = self.task;
        if tokio::time::timeout(timeout, &mut task).await.is_err() {
            warn!("Job monitor did not stop within {:?}, aborting it", timeout);
            task.abort();
        }
    }
}

async fn run(inner: Weak<ServiceInner>, interval: Duration, mut stop: watch::Receiver<bool>) {
    // jobs were just submitted or looked up; the first poll can wait
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures = FailureStreak::default();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }

        // the service is gone once every handle has been dropped
        let Some(inner) = inner.upgrade() else {
            break;
        };
        // accounting retries can take a while; a stop request cuts them short
        let outcome = tokio::select! {
            outcome = poll_once(&inner) => outcome,
            _ = stop.changed() => break,
        };
        drop(inner);
        if outcome.polled > 0 {
            debug!(
                "Polled {} jobs, {} answered, {} errors",
                outcome.polled,
                outcome.succeeded,
                outcome.errors.len()
            );
        }

        if failures.record(&outcome) {
            error!(
                "Job monitor giving up after {} failing cycles ({:?})",
                GIVE_UP_AFTER, failures.kinds
            );
            break;
        }
    }
    debug!("Job monitor stopped");
}

/// What one polling cycle saw.
#[derive(Debug, Default)]
pub(crate) struct CycleOutcome {
    pub(crate) polled: usize,
    pub(crate) succeeded: usize,
    pub(crate) errors: Vec<ErrorKind>,
}

#[derive(Debug, Default)]
struct FailureStreak {
    cycles: usize,
    kinds: Vec<ErrorKind>,
}

impl FailureStreak {
    /// Returns true when the monitor should stop.
    fn record(&mut self, outcome: &CycleOutcome) -> bool {
        if outcome.errors.is_empty() || outcome.succeeded > 0 {
            self.cycles = 0;
            self.kinds.clear();
            return false;
        }
        self.cycles += 1;
        for kind in &outcome.errors {
            if !self.kinds.contains(kind) {
                self.kinds.push(*kind);
            }
        }
        self.cycles >= GIVE_UP_AFTER && self.kinds.len() >= GIVE_UP_AFTER
    }
}

/// Run one polling cycle over every job that needs it.
pub(crate) async fn poll_once(inner: &ServiceInner) -> CycleOutcome {
    let snapshot: Vec<(JobId, JobInfo)> = {
        let table = inner.table.lock().await;
        table
            .values()
            .filter(|rec| rec.needs_poll())
            .map(|rec| (rec.id.clone(), rec.last_info()))
            .collect()
    };
    let mut outcome = CycleOutcome {
        polled: snapshot.len(),
        ..CycleOutcome::default()
    };
    if snapshot.is_empty() {
        return outcome;
    }

    let queries: Vec<(String, JobInfo)> = snapshot
        .iter()
        .map(|(id, info)| (id.native().to_string(), info.clone()))
        .collect();
    let results = inner.adaptor.fetch_bulk(&queries).await;

    let policy = inner.config.cancel_policy;
    let mut changes: Vec<(JobId, JobState, JobState, Option<JobDescription>)> = Vec::new();
    for ((id, _), (_, result)) in snapshot.iter().zip(results) {
        match result {
            Ok(Some(info)) => {
                outcome.succeeded += 1;
                let mut table = inner.table.lock().await;
                let Some(record) = table.get_mut(id) else {
                    continue;
                };
                if let Some((old, new)) = record.apply(info, policy) {
                    let description = (new == JobState::Done)
                        .then(|| record.description.clone())
                        .flatten();
                    changes.push((id.clone(), old, new, description));
                }
            }
            Ok(None) => {
                outcome.succeeded += 1;
                let mut table = inner.table.lock().await;
                if let Some(record) = table.get_mut(id) {
                    if !record.gone {
                        warn!(
                            "Job {} vanished from the backend, last state {}",
                            id, record.state
                        );
                    }
                    record.gone = true;
                    record.reconcile = false;
                }
            }
            Err(e) => {
                warn!("Status query for job {} failed: {}", id, e);
                outcome.errors.push(e.kind());
            }
        }
    }

    for (id, old, new, description) in changes {
        inner.notify(&id, old, new);
        if let Some(desc) = description {
            stage_out(inner, &id, &desc).await;
        }
    }
    outcome
}

/// Copy `<`/`<<` directives back once a job is done. Failures are logged;
/// the job itself succeeded.
async fn stage_out(inner: &ServiceInner, id: &JobId, desc: &JobDescription) {
    for directive in desc.stage_out() {
        let remote = desc.resolve_path(&directive.remote);
        let local = Path::new(&directive.local);
        match inner
            .shell
            .stage_from_remote(&remote, local, directive.op.is_append())
            .await
        {
            Ok(()) => debug!("Staged out {} for job {}", directive, id),
            Err(e) => warn!("Stage out '{}' for job {} failed: {}", directive, id, e),
        }
    }
}
