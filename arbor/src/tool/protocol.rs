//! Tools retrieved from external protocol servers.
//!
//! The runtime consumes protocol servers schema-only: a source lists
//! named tools with parameter schemas and a call handler. Handler
//! failures never abort a run; the wrapper below translates them into
//! error outcomes.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

use super::{ToolContext, ToolDefinition, ToolExecutor, ToolFailure, ToolOutcome};

/// Executes calls against one tool on a protocol server.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Call the tool. Failures surface as `Err` and are encoded into
    /// error results by the harness wrapper.
    async fn call(&self, input: Value) -> Result<Value>;
}

/// A tool exposed by a protocol server.
#[derive(Clone)]
pub struct ProtocolTool {
    /// Name, description, and parameter schema.
    pub definition: ToolDefinition,
    /// The call handler.
    pub handler: Arc<dyn ProtocolHandler>,
}

impl std::fmt::Debug for ProtocolTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolTool")
            .field("name", &self.definition.name)
            .finish_non_exhaustive()
    }
}

/// A configured protocol server, queried for its tool list at run
/// start.
#[async_trait]
pub trait ProtocolToolSource: Send + Sync {
    /// Server name, for logging.
    fn name(&self) -> &str;

    /// List the tools the server currently exposes.
    async fn list_tools(&self) -> Result<Vec<ProtocolTool>>;
}

/// Adapter that runs a [`ProtocolHandler`] under the common executor
/// interface, mapping thrown failures into error outcomes.
pub(super) struct ProtocolExecutor {
    pub(super) tool_name: String,
    pub(super) handler: Arc<dyn ProtocolHandler>,
}

#[async_trait]
impl ToolExecutor for ProtocolExecutor {
    async fn execute(&self, input: Value, _ctx: ToolContext<'_>) -> ToolOutcome {
        match self.handler.call(input).await {
            Ok(value) => ToolOutcome::Success(value),
            Err(err) => {
                tracing::warn!(tool = %self.tool_name, error = %err, "Protocol tool failed");
                ToolOutcome::Error(ToolFailure::new(err.to_string()).with_code("protocol_error"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    struct Flaky;

    #[async_trait]
    impl ProtocolHandler for Flaky {
        async fn call(&self, input: Value) -> Result<Value> {
            if input["fail"].as_bool().unwrap_or(false) {
                Err(Error::upstream("server unreachable"))
            } else {
                Ok(json!({"ok": true}))
            }
        }
    }

    #[tokio::test]
    async fn handler_failures_become_error_outcomes() {
        let executor = ProtocolExecutor {
            tool_name: "remote".into(),
            handler: Arc::new(Flaky),
        };
        let cancellation = CancellationToken::new();
        let ctx = ToolContext {
            cancellation: &cancellation,
            messages: &[],
            step_number: 1,
            manifest_id: "root",
            tool_call_id: "c1",
        };

        let ok = executor.execute(json!({"fail": false}), ctx).await;
        assert!(matches!(ok, ToolOutcome::Success(_)));

        let failed = executor.execute(json!({"fail": true}), ctx).await;
        let ToolOutcome::Error(failure) = failed else {
            panic!("expected error outcome");
        };
        assert_eq!(failure.code.as_deref(), Some("protocol_error"));
        assert!(!failure.retryable);
    }
}
