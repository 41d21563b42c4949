use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{CommandOutput, RemoteShell};
use crate::error::SchedResult;

/// Serializes every call to the wrapped shell.
pub struct SerialShell {
    inner: Arc<dyn RemoteShell>,
    lock: Mutex<()>,
}

impl SerialShell {
    pub fn new(inner: Arc<dyn RemoteShell>) -> Self {
        Self {
            inner,
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl RemoteShell for SerialShell {
    fn target(&self) -> &str {
        self.inner.target()
    }

    async fn run(&self, command: &str) -> SchedResult<CommandOutput> {
        let _guard = self.lock.lock().await;
        self.inner.run(command).await
    }

    async fn write_to_remote(&self, content: &str, path: &str) -> SchedResult<()> {
        let _guard = self.lock.lock().await;
        self.inner.write_to_remote(content, path).await
    }

    async fn stage_to_remote(&self, local: &Path, remote: &str, append: bool) -> SchedResult<()> {
        let _guard = self.lock.lock().await;
        self.inner.stage_to_remote(local, remote, append).await
    }

    async fn stage_from_remote(
        &self,
        remote: &str,
        local: &Path,
        append: bool,
    ) -> SchedResult<()> {
        let _guard = self.lock.lock().await;
        self.inner.stage_from_remote(remote, local, append).await
    }

    async fn finalize(&self, kill: bool) -> SchedResult<()> {
        let _guard = self.lock.lock().await;
        self.inner.finalize(kill).await
    }
}
