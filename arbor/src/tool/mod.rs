//! Tools and the dispatch harness.
//!
//! Three tool flavors share one executor interface: tools declared on a
//! manifest, tools retrieved from protocol servers, and tools generated
//! from sub-agent references. An executor never unwinds to signal
//! suspension; it returns the [`ToolOutcome::Suspended`] variant and the
//! harness short-circuits on it.

mod harness;
mod output;
mod protocol;
mod sub_agent;

pub use harness::{DispatchOutcome, RunTool, ToolSet};
pub use output::OutputValidator;
pub use protocol::{ProtocolHandler, ProtocolTool, ProtocolToolSource};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::message::Message;
use crate::state::{Suspension, SuspensionStack};

/// Serializable view of a tool offered to the model.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    /// Tool name.
    pub name: String,
    /// Description that helps the model decide when to call the tool.
    pub description: String,
    /// JSON schema of the parameters.
    pub parameters: Value,
}

impl ToolDefinition {
    /// Create a new definition.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Execution context handed to a tool executor.
#[derive(Debug, Clone, Copy)]
pub struct ToolContext<'a> {
    /// The run's cancellation token. Long-running executors must honor
    /// it.
    pub cancellation: &'a CancellationToken,
    /// The conversation up to this call.
    pub messages: &'a [Message],
    /// The step number issuing the call.
    pub step_number: usize,
    /// Manifest id of the calling agent.
    pub manifest_id: &'a str,
    /// Id of the tool call being executed.
    pub tool_call_id: &'a str,
}

/// A tool failure, encoded into a tool-result part. The run continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolFailure {
    /// Human-readable failure message.
    pub message: String,
    /// Optional machine-readable code.
    pub code: Option<String>,
    /// Whether the model may sensibly retry the call.
    pub retryable: bool,
}

impl ToolFailure {
    /// Create a non-retryable failure.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: false,
        }
    }

    /// Attach a failure code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Mark the failure retryable.
    #[must_use]
    pub const fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

/// A suspension bubbling up from a sub-agent invocation.
#[derive(Debug, Clone)]
pub struct SuspendedTool {
    /// The child run's own pending approvals.
    pub suspensions: Vec<Suspension>,
    /// Run id of the suspended child.
    pub run_id: String,
    /// Manifest id of the suspended child.
    pub manifest_id: String,
    /// Manifest version of the suspended child.
    pub manifest_version: String,
    /// Stacks rooted at the child, traversing its own descendants.
    pub suspension_stacks: Vec<SuspensionStack>,
}

/// Outcome of one tool execution.
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    /// The tool produced a value.
    Success(Value),
    /// The tool failed; encoded as an error result, the run continues.
    Error(ToolFailure),
    /// A sub-agent below this call suspended. The harness stops the
    /// batch and propagates.
    Suspended(Box<SuspendedTool>),
}

impl ToolOutcome {
    /// Shorthand for a successful outcome.
    #[must_use]
    pub const fn success(value: Value) -> Self {
        Self::Success(value)
    }

    /// Shorthand for a failed outcome.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ToolFailure::new(message))
    }
}

/// A tool implementation.
///
/// Deterministic input should yield deterministic output; side effects
/// belong to the tool.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Execute the tool with parsed JSON input.
    async fn execute(&self, input: Value, ctx: ToolContext<'_>) -> ToolOutcome;
}
