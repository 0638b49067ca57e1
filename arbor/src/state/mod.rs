//! Persisted run state.
//!
//! One [`RunState`] record exists per run, keyed by its run id. It holds
//! the conversation, the per-step history, the run's own pending
//! approvals, the suspension stacks that traverse its descendants, and
//! the results injected by completing children. States round-trip
//! losslessly through serialization; only externalized blob urls may be
//! re-issued on read.

mod memory;
mod store;

pub use memory::MemoryStateStore;
pub use store::{delete_recursive, LockAcquisition, LockHandle, StateStore};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gateway::FinishReason;
use crate::message::{ContentPart, Message};
use crate::usage::Usage;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Status of a persisted run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The run holds its lock and is executing.
    Running,
    /// The run finished with a result. Terminal.
    Completed,
    /// The run is waiting on approvals or child results.
    Suspended,
    /// The run failed. Terminal.
    Error,
    /// The run was cancelled. Terminal.
    Cancelled,
}

impl RunStatus {
    /// Whether this status admits no further transitions except delete.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    /// String form used in events and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Suspended => "suspended",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool call extracted from a model response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Unique identifier of the call.
    pub id: String,
    /// Name of the tool.
    pub name: String,
    /// Canonical JSON input string.
    pub input: String,
}

impl ToolCallRecord {
    /// Parse the canonical input string back into a value.
    pub fn input_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(&self.input)
    }
}

/// Record of one model step and the tool executions it induced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// Text produced by the model.
    pub text: String,
    /// Reasoning segments, in order.
    #[serde(default)]
    pub reasoning: Vec<String>,
    /// Tool calls issued by the model.
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    /// Tool results observed during the step.
    #[serde(default)]
    pub tool_results: Vec<ContentPart>,
    /// Why the model stopped.
    pub finish_reason: FinishReason,
    /// Token usage for the step.
    #[serde(default)]
    pub usage: Usage,
    /// Provider warnings.
    #[serde(default)]
    pub warnings: Vec<String>,
    /// When the step completed, ms since epoch.
    pub timestamp_ms: u64,
}

impl StepRecord {
    /// Whether the step contains a call to the named tool.
    #[must_use]
    pub fn called_tool(&self, name: &str) -> bool {
        self.tool_calls.iter().any(|call| call.name == name)
    }
}

/// A pending human-in-the-loop approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suspension {
    /// Identifier an approval must quote.
    pub approval_id: String,
    /// The tool call awaiting the decision.
    pub tool_call_id: String,
    /// Name of the tool awaiting the decision.
    pub tool_name: String,
    /// The proposed input.
    pub input: Value,
}

/// The human's decision on a pending approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    /// Identifier of the approval being answered.
    pub approval_id: String,
    /// Whether the call was approved.
    pub approved: bool,
    /// Optional payload supplied with the decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ApprovalResponse {
    /// Create an approval decision.
    #[must_use]
    pub fn new(approval_id: impl Into<String>, approved: bool) -> Self {
        Self {
            approval_id: approval_id.into(),
            approved,
            data: None,
        }
    }

    /// Attach a payload to the decision.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// One level of a suspension stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackEntry {
    /// Manifest id at this level.
    pub manifest_id: String,
    /// Manifest version at this level.
    pub manifest_version: String,
    /// Run id whose persisted state belongs to this level.
    pub state_id: String,
    /// The tool call that descended into the next level. `None` only on
    /// the last entry, which is the suspension site itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl StackEntry {
    /// An intermediate entry awaiting the named tool call.
    #[must_use]
    pub fn awaiting(
        manifest_id: impl Into<String>,
        manifest_version: impl Into<String>,
        state_id: impl Into<String>,
        tool_call_id: impl Into<String>,
    ) -> Self {
        Self {
            manifest_id: manifest_id.into(),
            manifest_version: manifest_version.into(),
            state_id: state_id.into(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    /// A leaf entry: the level that actually suspended.
    #[must_use]
    pub fn leaf(
        manifest_id: impl Into<String>,
        manifest_version: impl Into<String>,
        state_id: impl Into<String>,
    ) -> Self {
        Self {
            manifest_id: manifest_id.into(),
            manifest_version: manifest_version.into(),
            state_id: state_id.into(),
            tool_call_id: None,
        }
    }
}

/// An ordered path from a root run down to the run that suspended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspensionStack {
    /// Entries from root to the suspension site. Length >= 2.
    pub agents: Vec<StackEntry>,
    /// The pending approval at the deepest level.
    pub suspension: Suspension,
}

impl SuspensionStack {
    /// Whether this stack satisfies its structural invariants: at least
    /// two entries, a leaf without a pending call, and every other entry
    /// carrying one.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.agents.len() >= 2
            && self
                .agents
                .last()
                .is_some_and(|leaf| leaf.tool_call_id.is_none())
            && self.agents[..self.agents.len() - 1]
                .iter()
                .all(|entry| entry.tool_call_id.is_some())
    }

    /// Rewrite this stack so it starts at an original root path.
    #[must_use]
    pub fn rerooted(mut self, prefix: &[StackEntry]) -> Self {
        let mut agents = prefix.to_vec();
        agents.append(&mut self.agents);
        Self {
            agents,
            suspension: self.suspension,
        }
    }
}

/// Back-reference from a child run to its caller. Ids only; the parent
/// is reached by lookup in the state store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentContext {
    /// Run id of the caller.
    pub run_id: String,
    /// Manifest id of the caller.
    pub manifest_id: String,
    /// The caller's tool call that spawned this run.
    pub tool_call_id: String,
}

/// The persisted record of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// Run id; also the storage key.
    pub run_id: String,
    /// Id of the manifest driving this run.
    pub manifest_id: String,
    /// Version of the manifest driving this run.
    pub manifest_version: String,
    /// Current status.
    pub status: RunStatus,
    /// The conversation.
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Per-step history.
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    /// Number of steps taken so far, accumulated across resumes.
    #[serde(default)]
    pub step_number: usize,
    /// Output-validation retries consumed.
    #[serde(default)]
    pub output_retries: usize,
    /// This run's own pending approvals.
    #[serde(default)]
    pub suspensions: Vec<Suspension>,
    /// Stacks rooted here that traverse suspended descendants.
    #[serde(default)]
    pub suspension_stacks: Vec<SuspensionStack>,
    /// Tool results injected by completed children, awaiting the next
    /// resume. Drained in insertion order.
    #[serde(default)]
    pub pending_tool_results: Vec<ContentPart>,
    /// Run ids of children, for recursive deletion.
    #[serde(default)]
    pub child_run_ids: Vec<String>,
    /// Back-reference to the caller, if this run is a child.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentContext>,
    /// Terminal error message when `status == Error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Execution time accumulated over resumes, in milliseconds.
    #[serde(default)]
    pub elapsed_ms: u64,
    /// Creation time, ms since epoch.
    pub created_at_ms: u64,
    /// Last update time, ms since epoch.
    pub updated_at_ms: u64,
}

impl RunState {
    /// Create a fresh running state.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        manifest_id: impl Into<String>,
        manifest_version: impl Into<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            run_id: run_id.into(),
            manifest_id: manifest_id.into(),
            manifest_version: manifest_version.into(),
            status: RunStatus::Running,
            messages: Vec::new(),
            steps: Vec::new(),
            step_number: 0,
            output_retries: 0,
            suspensions: Vec::new(),
            suspension_stacks: Vec::new(),
            pending_tool_results: Vec::new(),
            child_run_ids: Vec::new(),
            parent: None,
            error: None,
            elapsed_ms: 0,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    /// Refresh the update timestamp.
    pub fn touch(&mut self) {
        self.updated_at_ms = now_ms();
    }

    /// Find the index of the suspension stack matching an approval id.
    #[must_use]
    pub fn find_stack(&self, approval_id: &str) -> Option<usize> {
        self.suspension_stacks
            .iter()
            .position(|stack| stack.suspension.approval_id == approval_id)
    }

    /// Find the index of an own suspension matching an approval id.
    #[must_use]
    pub fn find_suspension(&self, approval_id: &str) -> Option<usize> {
        self.suspensions
            .iter()
            .position(|s| s.approval_id == approval_id)
    }

    /// Whether anything is still pending on this run.
    #[must_use]
    pub fn has_pending_work(&self) -> bool {
        !self.suspensions.is_empty() || !self.suspension_stacks.is_empty()
    }

    /// Total usage summed over all committed steps.
    #[must_use]
    pub fn total_usage(&self) -> Usage {
        self.steps
            .iter()
            .fold(Usage::zero(), |acc, step| acc + step.usage)
    }
}
