//! Sub-agent invocation as a tool.
//!
//! Every sub-agent reference on a manifest generates one tool. Calling
//! it spawns a full nested run of the child manifest: its cancellation
//! scope chains to the caller's, its events are forwarded upward under
//! the caller's attribution, and its terminal outcome maps back into a
//! tool outcome. A suspended child propagates as the suspended variant,
//! carrying its run id and any nested suspension stacks.

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::manifest::{AgentManifest, SubAgentRef};
use crate::runner::{RunEvent, RunOutcome};
use crate::runtime::{self, RunEnv};
use crate::state::ParentContext;

use super::{SuspendedTool, ToolContext, ToolDefinition, ToolExecutor, ToolFailure, ToolOutcome};

/// Default argument schema of a generated sub-agent tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SubAgentArgs {
    /// The prompt for the sub-agent.
    pub prompt: String,
    /// Additional context forwarded to the sub-agent.
    #[serde(default)]
    pub context: Option<Value>,
}

/// Build the tool definition for a sub-agent reference.
pub(super) fn definition(reference: &SubAgentRef, child: &AgentManifest) -> ToolDefinition {
    let description = reference.description.clone().unwrap_or_else(|| {
        format!(
            "Delegate a task to the '{}' agent. {}",
            child.id,
            child.system_prompt.as_deref().unwrap_or_default()
        )
        .trim_end()
        .to_owned()
    });
    let schema = serde_json::to_value(schemars::schema_for!(SubAgentArgs))
        .unwrap_or_else(|_| json!({"type": "object"}));
    ToolDefinition::new(&reference.id, description, schema)
}

/// The generated executor for one sub-agent reference.
pub(super) struct SubAgentTool {
    child: Arc<AgentManifest>,
    env: RunEnv,
}

impl SubAgentTool {
    pub(super) const fn new(child: Arc<AgentManifest>, env: RunEnv) -> Self {
        Self { child, env }
    }

    async fn fire_start_hook(&self, tool_call_id: &str) -> Result<(), ToolFailure> {
        if let Some(hooks) = &self.env.manifest.hooks {
            hooks
                .on_sub_agent_start(&self.child.id, tool_call_id)
                .await
                .map_err(|err| {
                    ToolFailure::new(format!(
                        "sub-agent start hook failed: {err}"
                    ))
                    .with_code("hook_failed")
                })?;
        }
        Ok(())
    }

    async fn fire_end_hook(&self, tool_call_id: &str, status: &str) -> Result<(), ToolFailure> {
        if let Some(hooks) = &self.env.manifest.hooks {
            hooks
                .on_sub_agent_end(&self.child.id, tool_call_id, status)
                .await
                .map_err(|err| {
                    ToolFailure::new(format!("sub-agent end hook failed: {err}"))
                        .with_code("hook_failed")
                })?;
        }
        Ok(())
    }
}

#[async_trait]
impl ToolExecutor for SubAgentTool {
    async fn execute(&self, input: Value, ctx: ToolContext<'_>) -> ToolOutcome {
        let args: SubAgentArgs = match serde_json::from_value(input) {
            Ok(args) => args,
            Err(err) => {
                return ToolOutcome::Error(
                    ToolFailure::new(format!("invalid sub-agent arguments: {err}"))
                        .with_code("invalid_input"),
                );
            }
        };

        // Abort of the caller propagates down; a child failure or
        // timeout never aborts the caller.
        let child_cancel = self.env.cancellation.child_token();

        if let Err(failure) = self.fire_start_hook(ctx.tool_call_id).await {
            child_cancel.cancel();
            return ToolOutcome::Error(failure);
        }

        self.env.sink.emit(RunEvent::SubAgentStarted {
            manifest_id: self.child.id.clone(),
            tool_call_id: ctx.tool_call_id.to_owned(),
        });

        // Arm the per-child deadline as a cancellation source on the
        // child only.
        let guard = {
            let token = child_cancel.clone();
            let timeout = self.child.effective_timeout();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                token.cancel();
            })
        };

        let parent = ParentContext {
            run_id: self.env.run_id.clone(),
            manifest_id: self.env.manifest.id.clone(),
            tool_call_id: ctx.tool_call_id.to_owned(),
        };
        let sink = self.env.sink.attributed(&self.env.manifest.id);
        let outcome = runtime::run_child(
            &self.env,
            Arc::clone(&self.child),
            args.prompt,
            args.context,
            parent,
            child_cancel,
            sink,
        )
        .await;
        guard.abort();

        let status = outcome.status();
        debug!(child = %self.child.id, status, "Sub-agent finished");
        self.env.sink.emit(RunEvent::SubAgentFinished {
            manifest_id: self.child.id.clone(),
            tool_call_id: ctx.tool_call_id.to_owned(),
            status: status.to_owned(),
        });

        if let Err(failure) = self.fire_end_hook(ctx.tool_call_id, status).await {
            return ToolOutcome::Error(failure);
        }

        match outcome {
            RunOutcome::Complete(result) => ToolOutcome::Success(json!({
                "text": result.text,
                "output": result.output,
            })),
            RunOutcome::Suspended {
                run_id,
                suspensions,
                suspension_stacks,
            } => ToolOutcome::Suspended(Box::new(SuspendedTool {
                suspensions,
                run_id,
                manifest_id: self.child.id.clone(),
                manifest_version: self.child.version.clone(),
                suspension_stacks,
            })),
            RunOutcome::Error { error, .. } => ToolOutcome::Error(ToolFailure::new(format!(
                "Sub-agent '{}' failed: {error}",
                self.child.id
            ))),
            RunOutcome::Cancelled { .. } => ToolOutcome::Error(ToolFailure::new(format!(
                "Sub-agent '{}' was cancelled",
                self.child.id
            ))),
            RunOutcome::AlreadyRunning { .. } => ToolOutcome::Error(ToolFailure::new(format!(
                "Sub-agent '{}' is already running",
                self.child.id
            ))),
        }
    }
}
