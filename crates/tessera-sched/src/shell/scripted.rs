//! Shell that answers from a transcript instead of running anything.
//!
//! Used by the test suites and by `tessera script --dry-run` to replay
//! scheduler output captured on real systems.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{CommandOutput, RemoteShell};
use crate::error::SchedResult;

struct Rule {
    pattern: String,
    responses: VecDeque<CommandOutput>,
}

#[derive(Default)]
struct Transcript {
    rules: Vec<Rule>,
    commands: Vec<String>,
    written: Vec<(String, String)>,
    staged: Vec<String>,
    finalized: bool,
}

/// Canned responses keyed by a substring of the command.
///
/// The first rule whose pattern occurs in the command answers it. A rule
/// with several responses hands them out in order and keeps repeating the
/// last one. Commands no rule matches succeed with empty output.
///
/// ```
/// use tessera_sched::shell::{CommandOutput, RemoteShell, ScriptedShell};
///
/// # tokio_test(async {
/// let shell = ScriptedShell::new()
///     .on("sbatch", CommandOutput::ok("Submitted batch job 7\n"));
/// let out = shell.run("sbatch /tmp/job.sh").await.unwrap();
/// assert_eq!(out.stdout.trim(), "Submitted batch job 7");
/// assert_eq!(shell.count("sbatch"), 1);
/// # });
/// # fn tokio_test<F: std::future::Future>(f: F) {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f);
/// # }
/// ```
#[derive(Default)]
pub struct ScriptedShell {
    transcript: Mutex<Transcript>,
}

impl ScriptedShell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`respond`](Self::respond).
    pub fn on(self, pattern: impl Into<String>, output: CommandOutput) -> Self {
        self.respond(pattern, output);
        self
    }

    /// Queue a response for commands containing `pattern`.
    pub fn respond(&self, pattern: impl Into<String>, output: CommandOutput) {
        let pattern = pattern.into();
        let mut t = self.lock();
        match t.rules.iter_mut().find(|r| r.pattern == pattern) {
            Some(rule) => rule.responses.push_back(output),
            None => t.rules.push(Rule {
                pattern,
                responses: VecDeque::from([output]),
            }),
        }
    }

    /// Every command run so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Number of commands run that contain `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.lock()
            .commands
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }

    /// `(path, content)` of every write.
    pub fn written(&self) -> Vec<(String, String)> {
        self.lock().written.clone()
    }

    /// Descriptions of every staging call.
    pub fn staged(&self) -> Vec<String> {
        self.lock().staged.clone()
    }

    pub fn is_finalized(&self) -> bool {
        self.lock().finalized
    }

    fn lock(&self) -> MutexGuard<'_, Transcript> {
        self.transcript
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl RemoteShell for ScriptedShell {
    fn target(&self) -> &str {
        "scripted"
    }

    async fn run(&self, command: &str) -> SchedResult<CommandOutput> {
        let mut t = self.lock();
        t.commands.push(command.to_string());

        let response = t
            .rules
            .iter_mut()
            .find(|r| command.contains(&r.pattern))
            .and_then(|rule| {
                if rule.responses.len() > 1 {
                    rule.responses.pop_front()
                } else {
                    rule.responses.front().cloned()
                }
            });
        Ok(response.unwrap_or_default())
    }

    async fn write_to_remote(&self, content: &str, path: &str) -> SchedResult<()> {
        self.lock()
            .written
            .push((path.to_string(), content.to_string()));
        Ok(())
    }

    async fn stage_to_remote(&self, local: &Path, remote: &str, append: bool) -> SchedResult<()> {
        let op = if append { ">>" } else { ">" };
        self.lock()
            .staged
            .push(format!("{} {op} {remote}", local.display()));
        Ok(())
    }

    async fn stage_from_remote(
        &self,
        remote: &str,
        local: &Path,
        append: bool,
    ) -> SchedResult<()> {
        let op = if append { "<<" } else { "<" };
        self.lock()
            .staged
            .push(format!("{} {op} {remote}", local.display()));
        Ok(())
    }

    async fn finalize(&self, _kill: bool) -> SchedResult<()> {
        self.lock().finalized = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_responses_in_order_then_repeat_last() {
        let shell = ScriptedShell::new()
            .on("qstat", CommandOutput::ok("first"))
            .on("qstat", CommandOutput::ok("second"));

        assert_eq!(shell.run("qstat -f1 1").await.unwrap().stdout, "first");
        assert_eq!(shell.run("qstat -f1 1").await.unwrap().stdout, "second");
        assert_eq!(shell.run("qstat -f1 1").await.unwrap().stdout, "second");
        assert_eq!(shell.count("qstat"), 3);
    }

    #[tokio::test]
    async fn test_unmatched_succeeds_empty() {
        let shell = ScriptedShell::new();
        let out = shell.run("mkdir -p /x").await.unwrap();
        assert!(out.success());
        assert!(out.stdout.is_empty());
    }

    #[tokio::test]
    async fn test_records_writes() {
        let shell = ScriptedShell::new();
        shell.write_to_remote("#!/bin/sh\n", "/tmp/a.sh").await.unwrap();
        assert_eq!(
            shell.written(),
            vec![("/tmp/a.sh".to_string(), "#!/bin/sh\n".to_string())]
        );
    }
}
