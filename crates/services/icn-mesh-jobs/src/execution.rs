use anyhow::Result;
use icn_types::{ExecutionReport, TaskSpec, WorkerId};

/// Runs an awarded task on the winning worker and reports the outcome.
///
/// Implementations may take arbitrarily long; the marketplace bounds each
/// call by the task's execution timeout.
#[async_trait::async_trait]
pub trait ExecutionClient: Send + Sync {
    async fn execute(&self, task: &TaskSpec, worker: &WorkerId) -> Result<ExecutionReport>;
}
