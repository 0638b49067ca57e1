//! Lifecycle hooks for agent runs.
//!
//! Hooks are an interface with optional methods: every method has a
//! default no-op body, so implementors override only what they observe.
//! [`HookChain`] combines several hook implementations, running them
//! serially in registration order and shorting on the first error.
//!
//! Hook failures are not advisory. A failing `prepare_step` or
//! `on_step_finish` aborts the run; a failing terminal hook propagates
//! to the caller and suppresses the terminal event.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::gateway::ToolChoice;
use crate::manifest::ProviderConfig;
use crate::message::Message;
use crate::runner::RunResult;
use crate::state::StepRecord;

/// Read-only view of the loop handed to [`AgentHooks::prepare_step`].
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    /// The step about to execute (1-based).
    pub step_number: usize,
    /// Steps committed so far.
    pub steps: &'a [StepRecord],
    /// The working conversation.
    pub messages: &'a [Message],
    /// Provider routing of the manifest.
    pub provider: &'a ProviderConfig,
}

/// Adjustments a `prepare_step` hook may apply to the upcoming step.
#[derive(Debug, Clone, Default)]
pub struct PrepareStep {
    /// Replacement for the working conversation.
    pub messages: Option<Vec<Message>>,
    /// Tool selection directive for this step.
    pub tool_choice: Option<ToolChoice>,
    /// Restrict the offered tools to this subset of names.
    pub active_tools: Option<Vec<String>>,
}

impl PrepareStep {
    /// Merge another adjustment over this one; set fields win.
    fn merge(&mut self, other: Self) {
        if other.messages.is_some() {
            self.messages = other.messages;
        }
        if other.tool_choice.is_some() {
            self.tool_choice = other.tool_choice;
        }
        if other.active_tools.is_some() {
            self.active_tools = other.active_tools;
        }
    }

    /// Whether any field is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.messages.is_none() && self.tool_choice.is_none() && self.active_tools.is_none()
    }
}

/// Lifecycle hooks invoked by the step loop and the orchestrator.
///
/// All methods default to no-ops.
#[async_trait]
pub trait AgentHooks: Send + Sync {
    /// Called before each model step. May rewrite the working messages,
    /// direct tool choice, or restrict the active tools.
    async fn prepare_step(&self, ctx: StepContext<'_>) -> Result<Option<PrepareStep>> {
        let _ = ctx;
        Ok(None)
    }

    /// Called after a step is committed. An error aborts the run.
    async fn on_step_finish(&self, step: &StepRecord) -> Result<()> {
        let _ = step;
        Ok(())
    }

    /// Called before a sub-agent invocation. An error cancels the child
    /// and fails the invoking tool call.
    async fn on_sub_agent_start(&self, manifest_id: &str, tool_call_id: &str) -> Result<()> {
        let _ = (manifest_id, tool_call_id);
        Ok(())
    }

    /// Called after a sub-agent invocation with its terminal status.
    async fn on_sub_agent_end(
        &self,
        manifest_id: &str,
        tool_call_id: &str,
        status: &str,
    ) -> Result<()> {
        let _ = (manifest_id, tool_call_id, status);
        Ok(())
    }

    /// Called when a run completes.
    async fn on_complete(&self, result: &RunResult) -> Result<()> {
        let _ = result;
        Ok(())
    }

    /// Called when a run suspends.
    async fn on_suspend(&self, run_id: &str) -> Result<()> {
        let _ = run_id;
        Ok(())
    }

    /// Called when a run fails.
    async fn on_error(&self, run_id: &str, error: &Error) -> Result<()> {
        let _ = (run_id, error);
        Ok(())
    }

    /// Called when a run is cancelled.
    async fn on_cancelled(&self, run_id: &str) -> Result<()> {
        let _ = run_id;
        Ok(())
    }
}

/// Hooks that do nothing. Useful as a default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

#[async_trait]
impl AgentHooks for NoopHooks {}

/// A chain of hooks run serially in registration order.
///
/// `prepare_step` results merge field-wise with later hooks winning;
/// every other method shorts on the first error.
#[derive(Clone, Default)]
pub struct HookChain {
    hooks: Vec<Arc<dyn AgentHooks>>,
}

impl HookChain {
    /// Create an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook to the chain.
    #[must_use]
    pub fn with(mut self, hooks: Arc<dyn AgentHooks>) -> Self {
        self.hooks.push(hooks);
        self
    }

    /// Append a hook in place.
    pub fn push(&mut self, hooks: Arc<dyn AgentHooks>) {
        self.hooks.push(hooks);
    }

    /// Number of registered hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl std::fmt::Debug for HookChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookChain")
            .field("len", &self.hooks.len())
            .finish()
    }
}

#[async_trait]
impl AgentHooks for HookChain {
    async fn prepare_step(&self, ctx: StepContext<'_>) -> Result<Option<PrepareStep>> {
        let mut merged = PrepareStep::default();
        for hooks in &self.hooks {
            if let Some(prep) = hooks.prepare_step(ctx).await? {
                merged.merge(prep);
            }
        }
        Ok((!merged.is_empty()).then_some(merged))
    }

    async fn on_step_finish(&self, step: &StepRecord) -> Result<()> {
        for hooks in &self.hooks {
            hooks.on_step_finish(step).await?;
        }
        Ok(())
    }

    async fn on_sub_agent_start(&self, manifest_id: &str, tool_call_id: &str) -> Result<()> {
        for hooks in &self.hooks {
            hooks.on_sub_agent_start(manifest_id, tool_call_id).await?;
        }
        Ok(())
    }

    async fn on_sub_agent_end(
        &self,
        manifest_id: &str,
        tool_call_id: &str,
        status: &str,
    ) -> Result<()> {
        for hooks in &self.hooks {
            hooks
                .on_sub_agent_end(manifest_id, tool_call_id, status)
                .await?;
        }
        Ok(())
    }

    async fn on_complete(&self, result: &RunResult) -> Result<()> {
        for hooks in &self.hooks {
            hooks.on_complete(result).await?;
        }
        Ok(())
    }

    async fn on_suspend(&self, run_id: &str) -> Result<()> {
        for hooks in &self.hooks {
            hooks.on_suspend(run_id).await?;
        }
        Ok(())
    }

    async fn on_error(&self, run_id: &str, error: &Error) -> Result<()> {
        for hooks in &self.hooks {
            hooks.on_error(run_id, error).await?;
        }
        Ok(())
    }

    async fn on_cancelled(&self, run_id: &str) -> Result<()> {
        for hooks in &self.hooks {
            hooks.on_cancelled(run_id).await?;
        }
        Ok(())
    }
}
