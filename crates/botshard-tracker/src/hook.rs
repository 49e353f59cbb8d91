//! One-time side effects after an agent is created.

use async_trait::async_trait;
use botshard_state::{AgentResult, Registration};

/// Runs exactly once per registration, right after it becomes COMPLETED.
///
/// Failures are logged; they do not undo the completion.
#[async_trait]
pub trait PostCreateHook: Send + Sync {
    async fn on_agent_created(
        &self,
        registration: &Registration,
        agent: &AgentResult,
    ) -> anyhow::Result<()>;
}

/// Hook that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

#[async_trait]
impl PostCreateHook for NoopHook {
    async fn on_agent_created(
        &self,
        _registration: &Registration,
        _agent: &AgentResult,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
