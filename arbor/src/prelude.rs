//! Convenience re-exports of the public surface.

pub use crate::error::{Error, Result};
pub use crate::gateway::{
    CompletionRequest, CompletionsGateway, FinishReason, MockGateway, TextResponse, ToolChoice,
};
pub use crate::hooks::{AgentHooks, HookChain, NoopHooks, PrepareStep, StepContext};
pub use crate::manifest::{
    AgentManifest, AgentManifestBuilder, ManifestKey, ManifestSet, OutputToolDef, ProviderConfig,
    StopCondition, SubAgentRef, TextOnlyBehavior, ToolDef,
};
pub use crate::message::{ContentPart, Message, MessageContent, Role, ToolOutput};
pub use crate::runner::{
    EventSink, LoopExit, LoopOutcome, ResumeMode, RunEvent, RunOutcome, RunResult, Runner,
    StackResumer, StepLoop,
};
pub use crate::runtime::{AgentRequest, RequestInput, RunEnv, RunStream, Runtime, RuntimeDeps};
pub use crate::state::{
    delete_recursive, ApprovalResponse, LockAcquisition, LockHandle, MemoryStateStore,
    ParentContext, RunState, RunStatus, StackEntry, StateStore, StepRecord, Suspension,
    SuspensionStack, ToolCallRecord,
};
pub use crate::tool::{
    ProtocolHandler, ProtocolTool, ProtocolToolSource, SuspendedTool, ToolContext, ToolDefinition,
    ToolExecutor, ToolFailure, ToolOutcome, ToolSet,
};
pub use crate::usage::Usage;
