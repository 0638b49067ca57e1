//! Run events and terminal outcomes.
//!
//! A run is observed as an ordered event stream: one `AgentStarted`,
//! then step/tool/sub-agent events and content deltas, then exactly one
//! `Finished` carrying the terminal [`RunOutcome`].

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::gateway::FinishReason;
use crate::state::{StepRecord, Suspension, SuspensionStack};
use crate::usage::Usage;

/// The result of a completed run.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Run id.
    pub run_id: String,
    /// Manifest that produced the result.
    pub manifest_id: String,
    /// Provider name used.
    pub provider: String,
    /// Model id used.
    pub model: String,
    /// Text of the final step.
    pub text: String,
    /// Validated structured output, when the output tool was used.
    pub output: Option<Value>,
    /// All committed steps.
    pub steps: Vec<StepRecord>,
    /// Usage summed over all steps.
    pub total_usage: Usage,
    /// Finish reason of the final step.
    pub finish_reason: FinishReason,
}

/// The single terminal value of a run stream.
#[derive(Debug)]
pub enum RunOutcome {
    /// The run completed with a result.
    Complete(Box<RunResult>),
    /// The run is waiting on approvals or descendants.
    Suspended {
        /// Run id.
        run_id: String,
        /// The run's own pending approvals.
        suspensions: Vec<Suspension>,
        /// Stacks traversing suspended descendants.
        suspension_stacks: Vec<SuspensionStack>,
    },
    /// The run failed.
    Error {
        /// Run id, when one was allocated before the failure.
        run_id: String,
        /// The failure.
        error: Error,
    },
    /// The run was cancelled.
    Cancelled {
        /// Run id.
        run_id: String,
    },
    /// Another invocation holds the run's lock.
    AlreadyRunning {
        /// Run id.
        run_id: String,
    },
}

impl RunOutcome {
    /// The run id this outcome belongs to.
    #[must_use]
    pub fn run_id(&self) -> &str {
        match self {
            Self::Complete(result) => &result.run_id,
            Self::Suspended { run_id, .. }
            | Self::Error { run_id, .. }
            | Self::Cancelled { run_id }
            | Self::AlreadyRunning { run_id } => run_id,
        }
    }

    /// Terminal status string, as persisted and logged.
    #[must_use]
    pub const fn status(&self) -> &'static str {
        match self {
            Self::Complete(_) => "completed",
            Self::Suspended { .. } => "suspended",
            Self::Error { .. } => "error",
            Self::Cancelled { .. } => "cancelled",
            Self::AlreadyRunning { .. } => "already_running",
        }
    }

    /// Unwrap a completed result, panicking otherwise. Test helper.
    #[must_use]
    pub fn expect_complete(self) -> RunResult {
        match self {
            Self::Complete(result) => *result,
            other => panic!("expected a completed run, got {}", other.status()),
        }
    }
}

/// An event observed on a run stream.
#[derive(Debug)]
pub enum RunEvent {
    /// A run began executing (fresh or resumed).
    AgentStarted {
        /// Run id; also the persisted state's key.
        run_id: String,
        /// Manifest id of the run.
        manifest_id: String,
        /// Manifest version of the run.
        manifest_version: String,
        /// For nested runs, the manifest the events are attributed to.
        parent_manifest_id: Option<String>,
        /// Event time, ms since epoch.
        timestamp_ms: u64,
    },
    /// A model step is starting.
    StepStarted {
        /// Step number (1-based, accumulated across resumes).
        step: usize,
    },
    /// Text produced by the model.
    TextDelta {
        /// The text chunk.
        delta: String,
    },
    /// Reasoning produced by the model.
    ReasoningDelta {
        /// The reasoning chunk.
        delta: String,
    },
    /// A tool call is being dispatched.
    ToolCallStarted {
        /// Tool call id.
        id: String,
        /// Tool name.
        name: String,
    },
    /// A tool call produced a result.
    ToolCallFinished {
        /// Tool call id.
        id: String,
        /// Tool name.
        name: String,
        /// Whether the result encodes a failure.
        is_error: bool,
    },
    /// A sub-agent invocation began.
    SubAgentStarted {
        /// Manifest id of the sub-agent.
        manifest_id: String,
        /// The caller's tool call that spawned it.
        tool_call_id: String,
    },
    /// A sub-agent invocation reached a terminal status.
    SubAgentFinished {
        /// Manifest id of the sub-agent.
        manifest_id: String,
        /// The caller's tool call that spawned it.
        tool_call_id: String,
        /// Terminal status string.
        status: String,
    },
    /// A step was committed.
    StepFinished {
        /// Step number.
        step: usize,
        /// The committed record.
        record: Box<StepRecord>,
    },
    /// The terminal value. Exactly one per stream, always last.
    Finished(RunOutcome),
}

/// Sender half of a run's event stream.
///
/// Cloneable and cheap; a disabled sink drops everything. Forwarded
/// child events are re-attributed so nested activity appears under the
/// caller's manifest.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<RunEvent>>,
    attribution: Option<String>,
}

impl EventSink {
    /// Create a sink/receiver pair.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Some(tx),
                attribution: None,
            },
            rx,
        )
    }

    /// A sink that drops every event.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Derive a sink that attributes forwarded events to the given
    /// caller manifest.
    #[must_use]
    pub fn attributed(&self, parent_manifest_id: impl Into<String>) -> Self {
        Self {
            tx: self.tx.clone(),
            attribution: Some(parent_manifest_id.into()),
        }
    }

    /// Emit an event. Dropped receivers are ignored; a consumer walking
    /// away must not fail the run.
    pub fn emit(&self, mut event: RunEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Some(attribution) = &self.attribution
            && let RunEvent::AgentStarted {
                parent_manifest_id, ..
            } = &mut event
        {
            *parent_manifest_id = Some(attribution.clone());
        }
        let _ = tx.send(event);
    }
}
