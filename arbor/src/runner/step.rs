//! The single-agent step loop.
//!
//! One drive of the loop alternates model steps with tool execution
//! until a stop condition fires, the model emits approval requests, a
//! descendant suspends, the deadline passes, or the run is cancelled.
//! All mutable per-run state lives in the persisted [`RunState`], which
//! the loop receives, advances, and hands back with its outcome.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::Error;
use crate::gateway::{CompletionRequest, FinishReason, TextResponse, ToolChoice};
use crate::hooks::StepContext;
use crate::manifest::{AgentManifest, ManifestSet, StopCondition, TextOnlyBehavior, DEFAULT_TIMEOUT};
use crate::message::{ContentPart, Message, Role};
use crate::runtime::{RunEnv, RuntimeDeps};
use crate::state::{
    now_ms, ApprovalResponse, RunState, RunStatus, StackEntry, StepRecord, Suspension,
    SuspensionStack, ToolCallRecord,
};
use crate::tool::{DispatchOutcome, SuspendedTool, ToolSet};

use super::events::{EventSink, RunEvent, RunResult};

/// How a saved run re-enters the loop.
#[derive(Debug)]
pub enum ResumeMode {
    /// Answer one of the run's own pending approvals.
    Approval(ApprovalResponse),
    /// Drain pending child results into a tool message and continue.
    Continue,
    /// Append a user message to a completed conversation and continue.
    Reply(Message),
}

/// Terminal value of one drive of the loop.
#[derive(Debug)]
pub enum LoopOutcome {
    /// A stop condition fired; the run completed.
    Complete(Box<RunResult>),
    /// The run suspended on approvals or a suspended descendant.
    Suspended {
        /// The run's own pending approvals.
        suspensions: Vec<Suspension>,
        /// Stacks rooted at this run.
        suspension_stacks: Vec<SuspensionStack>,
    },
    /// The drive failed.
    Error(Error),
    /// The drive was cancelled cooperatively.
    Cancelled,
}

/// A drive's outcome together with the state to persist.
#[derive(Debug)]
pub struct LoopExit {
    /// The advanced run state. Its status reflects the outcome.
    pub state: RunState,
    /// The terminal value.
    pub outcome: LoopOutcome,
}

/// The seam between the orchestrator, the stack resumer, and the loop.
///
/// The resumer only needs "run this saved agent and give me its exit",
/// which keeps multi-level resume testable against a scripted fake.
#[async_trait]
pub trait StepLoop: Send + Sync {
    /// Re-enter the loop for a saved run.
    async fn resume(
        &self,
        manifest: Arc<AgentManifest>,
        state: RunState,
        mode: ResumeMode,
    ) -> LoopExit;
}

/// The production step loop.
pub struct Runner {
    pub(crate) deps: Arc<RuntimeDeps>,
    pub(crate) manifests: Arc<ManifestSet>,
    pub(crate) sink: EventSink,
    pub(crate) cancellation: CancellationToken,
    pub(crate) timeout_override: Option<Duration>,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner").finish_non_exhaustive()
    }
}

impl Runner {
    /// Create a runner bound to one orchestration.
    #[must_use]
    pub fn new(
        deps: Arc<RuntimeDeps>,
        manifests: Arc<ManifestSet>,
        sink: EventSink,
        cancellation: CancellationToken,
        timeout_override: Option<Duration>,
    ) -> Self {
        Self {
            deps,
            manifests,
            sink,
            cancellation,
            timeout_override,
        }
    }

    /// Drive a freshly initialized state.
    pub async fn start(&self, manifest: Arc<AgentManifest>, state: RunState) -> LoopExit {
        self.drive(manifest, state).await
    }

    async fn drive(&self, manifest: Arc<AgentManifest>, state: RunState) -> LoopExit {
        let span = info_span!(
            "agent",
            agent.id = %manifest.id,
            agent.model = %manifest.provider.model,
            run = %state.run_id,
        );
        self.drive_inner(manifest, state).instrument(span).await
    }

    async fn drive_inner(&self, manifest: Arc<AgentManifest>, mut state: RunState) -> LoopExit {
        let start = Instant::now();
        let accumulated = state.elapsed_ms;
        let limit = self
            .timeout_override
            .or(manifest.timeout)
            .unwrap_or(DEFAULT_TIMEOUT);
        let limit_ms = limit.as_millis() as u64;

        let env = RunEnv {
            run_id: state.run_id.clone(),
            manifest: Arc::clone(&manifest),
            manifests: Arc::clone(&self.manifests),
            deps: Arc::clone(&self.deps),
            sink: self.sink.clone(),
            cancellation: self.cancellation.clone(),
            timeout_override: self.timeout_override,
            children: Arc::default(),
        };

        let tool_set = match ToolSet::assemble(&env).await {
            Ok(set) => set,
            Err(err) => return self.exit_error(state, err, start, accumulated),
        };
        let stop_when = manifest.effective_stop_when();
        let mut output: Option<Value> = None;

        loop {
            if self.cancellation.is_cancelled() {
                return self.exit_cancelled(state, start, accumulated);
            }

            let elapsed = accumulated + start.elapsed().as_millis() as u64;
            if elapsed > limit_ms {
                warn!(elapsed, limit_ms, "Run deadline exceeded");
                return self.exit_error(state, Error::timeout(elapsed, limit_ms), start, accumulated);
            }

            state.step_number += 1;
            debug!(step = state.step_number, "Starting step");
            self.sink.emit(RunEvent::StepStarted {
                step: state.step_number,
            });

            // The prepare-step hook may rewrite the working messages,
            // direct tool choice, or restrict the offered tools.
            let mut tool_choice: Option<ToolChoice> = None;
            let mut active_tools: Option<Vec<String>> = None;
            if let Some(hooks) = &manifest.hooks {
                let ctx = StepContext {
                    step_number: state.step_number,
                    steps: &state.steps,
                    messages: &state.messages,
                    provider: &manifest.provider,
                };
                match hooks.prepare_step(ctx).await {
                    Ok(Some(prep)) => {
                        if let Some(messages) = prep.messages {
                            state.messages = messages;
                        }
                        tool_choice = prep.tool_choice;
                        active_tools = prep.active_tools;
                    }
                    Ok(None) => {}
                    Err(err) => return self.exit_error(state, err, start, accumulated),
                }
            }

            let request = CompletionRequest {
                manifest_id: manifest.id.clone(),
                provider: manifest.provider.clone(),
                messages: state.messages.clone(),
                tools: tool_set.definitions(active_tools.as_deref()),
                tool_choice,
            };

            let response = tokio::select! {
                () = self.cancellation.cancelled() => {
                    return self.exit_cancelled(state, start, accumulated);
                }
                result = self.deps.gateway.complete(request) => match result {
                    Ok(response) => response,
                    Err(err) => {
                        error!(error = %err, step = state.step_number, "Completion failed");
                        return self.exit_error(state, err, start, accumulated);
                    }
                },
            };

            self.emit_deltas(&response);

            // Any approval request in the response suspends the run;
            // all of them are harvested into independent suspensions.
            let harvested = harvest_suspensions(&response);
            if !harvested.is_empty() {
                state.messages.push(assistant_message(&response));
                state.suspensions.extend(harvested);
                return self.exit_suspended(state, start, accumulated);
            }

            let calls = extract_tool_calls(&response);
            let mut tool_results = Vec::new();
            if !calls.is_empty() {
                match tool_set
                    .dispatch(&calls, &env, &state.messages, state.step_number)
                    .await
                {
                    DispatchOutcome::Completed(results) => {
                        merge_children(&env, &mut state);
                        tool_results = results;
                    }
                    DispatchOutcome::Suspended {
                        tool_call_id,
                        inner,
                    } => {
                        // Partial results of this batch are discarded:
                        // the assistant message commits without a tool
                        // message.
                        merge_children(&env, &mut state);
                        state.messages.push(assistant_message(&response));
                        let stacks =
                            stacks_from_child(&state, &manifest, &tool_call_id, *inner);
                        state.suspension_stacks.extend(stacks);
                        return self.exit_suspended(state, start, accumulated);
                    }
                }
                if self.cancellation.is_cancelled() {
                    return self.exit_cancelled(state, start, accumulated);
                }
            }

            // Structured-output validation with bounded retries.
            if let Some(validator) = tool_set.output_validator()
                && let Some(call) = calls.iter().find(|c| c.name == validator.name())
            {
                let validation = call
                    .input_value()
                    .map_err(|err| err.to_string())
                    .and_then(|value| validator.validate(&value).map(|()| value));
                match validation {
                    Ok(value) => output = Some(value),
                    Err(violations) => {
                        if manifest.retry_on_invalid_output
                            && state.output_retries < manifest.max_output_retries
                        {
                            state.output_retries += 1;
                            debug!(
                                retry = state.output_retries,
                                "Output validation failed; retrying"
                            );
                            state.messages.push(assistant_message(&response));
                            state.messages.push(Message::user(format!(
                                "The arguments for tool '{}' did not match its schema: {violations}. \
                                 Call '{}' again with corrected arguments.",
                                validator.name(),
                                validator.name(),
                            )));
                            // The step and its tool results are not committed.
                            continue;
                        }
                        return self.exit_error(
                            state,
                            Error::output_validation(violations),
                            start,
                            accumulated,
                        );
                    }
                }
            }

            // Commit the step.
            let record = StepRecord {
                text: response.text_content(),
                reasoning: extract_reasoning(&response),
                tool_calls: calls.clone(),
                tool_results: tool_results.clone(),
                finish_reason: response.finish_reason,
                usage: response.usage,
                warnings: response.warnings.clone(),
                timestamp_ms: now_ms(),
            };
            state.steps.push(record);
            let committed = state.steps.last().expect("just pushed");
            if let Some(hooks) = &manifest.hooks
                && let Err(err) = hooks.on_step_finish(committed).await
            {
                return self.exit_error(state, err, start, accumulated);
            }
            self.sink.emit(RunEvent::StepFinished {
                step: state.step_number,
                record: Box::new(committed.clone()),
            });

            // Stop conditions, then the text-only default.
            let mut stop = stop_when.iter().any(|condition| match condition {
                StopCondition::StepCount(count) => state.step_number >= *count,
                StopCondition::ToolUse(name) => {
                    state.steps.iter().any(|step| step.called_tool(name))
                }
            });
            if response.finish_reason != FinishReason::ToolCalls
                && manifest.on_text_only == TextOnlyBehavior::Stop
            {
                stop = true;
            }

            if stop {
                state.messages.push(assistant_message(&response));
                if !tool_results.is_empty() {
                    state.messages.push(Message::tool_results(tool_results));
                }
                return self.exit_complete(state, &manifest, output, start, accumulated);
            }

            state.messages.push(assistant_message(&response));
            if !tool_results.is_empty() {
                state.messages.push(Message::tool_results(tool_results));
            }
        }
    }

    fn emit_deltas(&self, response: &TextResponse) {
        for part in &response.content {
            match part {
                ContentPart::Text { text } if !text.is_empty() => {
                    self.sink.emit(RunEvent::TextDelta {
                        delta: text.clone(),
                    });
                }
                ContentPart::Reasoning { text } if !text.is_empty() => {
                    self.sink.emit(RunEvent::ReasoningDelta {
                        delta: text.clone(),
                    });
                }
                _ => {}
            }
        }
    }

    fn exit_complete(
        &self,
        mut state: RunState,
        manifest: &AgentManifest,
        output: Option<Value>,
        start: Instant,
        accumulated: u64,
    ) -> LoopExit {
        finalize(&mut state, start, accumulated);
        state.status = RunStatus::Completed;
        let last = state.steps.last();
        let result = RunResult {
            run_id: state.run_id.clone(),
            manifest_id: manifest.id.clone(),
            provider: manifest.provider.provider.clone(),
            model: manifest.provider.model.clone(),
            text: last.map(|step| step.text.clone()).unwrap_or_default(),
            output,
            steps: state.steps.clone(),
            total_usage: state.total_usage(),
            finish_reason: last.map_or(FinishReason::Stop, |step| step.finish_reason),
        };
        info!(
            steps = state.step_number,
            tokens = result.total_usage.total_tokens,
            "Run completed"
        );
        LoopExit {
            state,
            outcome: LoopOutcome::Complete(Box::new(result)),
        }
    }

    fn exit_suspended(&self, mut state: RunState, start: Instant, accumulated: u64) -> LoopExit {
        finalize(&mut state, start, accumulated);
        state.status = RunStatus::Suspended;
        info!(
            suspensions = state.suspensions.len(),
            stacks = state.suspension_stacks.len(),
            "Run suspended"
        );
        LoopExit {
            outcome: LoopOutcome::Suspended {
                suspensions: state.suspensions.clone(),
                suspension_stacks: state.suspension_stacks.clone(),
            },
            state,
        }
    }

    fn exit_error(
        &self,
        mut state: RunState,
        err: Error,
        start: Instant,
        accumulated: u64,
    ) -> LoopExit {
        if err.is_cancelled() {
            return self.exit_cancelled(state, start, accumulated);
        }
        finalize(&mut state, start, accumulated);
        if state.status == RunStatus::Running {
            state.status = RunStatus::Error;
            state.error = Some(err.to_string());
        }
        LoopExit {
            state,
            outcome: LoopOutcome::Error(err),
        }
    }

    fn exit_cancelled(&self, mut state: RunState, start: Instant, accumulated: u64) -> LoopExit {
        finalize(&mut state, start, accumulated);
        state.status = RunStatus::Cancelled;
        info!("Run cancelled");
        LoopExit {
            state,
            outcome: LoopOutcome::Cancelled,
        }
    }
}

#[async_trait]
impl StepLoop for Runner {
    async fn resume(
        &self,
        manifest: Arc<AgentManifest>,
        mut state: RunState,
        mode: ResumeMode,
    ) -> LoopExit {
        match mode {
            ResumeMode::Approval(response) => {
                let Some(index) = state.find_suspension(&response.approval_id) else {
                    return LoopExit {
                        state,
                        outcome: LoopOutcome::Error(Error::bad_request(
                            "approval does not match any pending suspension",
                        )),
                    };
                };
                state.suspensions.remove(index);
                state.messages.push(Message::approval_response(
                    &response.approval_id,
                    response.approved,
                    response.data,
                ));
            }
            ResumeMode::Continue => {
                if state.pending_tool_results.is_empty() {
                    return LoopExit {
                        state,
                        outcome: LoopOutcome::Error(Error::bad_request(
                            "run has no pending tool results to continue with",
                        )),
                    };
                }
                let results = std::mem::take(&mut state.pending_tool_results);
                state.messages.push(Message::tool_results(results));
            }
            ResumeMode::Reply(message) => {
                state.messages.push(message);
            }
        }
        state.status = RunStatus::Running;
        self.drive(manifest, state).await
    }
}

fn finalize(state: &mut RunState, start: Instant, accumulated: u64) {
    state.elapsed_ms = accumulated + start.elapsed().as_millis() as u64;
    state.touch();
}

fn assistant_message(response: &TextResponse) -> Message {
    Message::with_parts(Role::Assistant, response.content.clone())
}

fn extract_tool_calls(response: &TextResponse) -> Vec<ToolCallRecord> {
    response
        .content
        .iter()
        .filter_map(|part| match part {
            ContentPart::ToolCall { id, name, input } => Some(ToolCallRecord {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            }),
            _ => None,
        })
        .collect()
}

fn extract_reasoning(response: &TextResponse) -> Vec<String> {
    response
        .content
        .iter()
        .filter_map(|part| match part {
            ContentPart::Reasoning { text } => Some(text.clone()),
            _ => None,
        })
        .collect()
}

fn harvest_suspensions(response: &TextResponse) -> Vec<Suspension> {
    response
        .content
        .iter()
        .filter_map(|part| match part {
            ContentPart::ApprovalRequest {
                approval_id,
                tool_call_id,
                tool_name,
                input,
            } => Some(Suspension {
                approval_id: approval_id.clone(),
                tool_call_id: tool_call_id.clone(),
                tool_name: tool_name.clone(),
                input: input.clone(),
            }),
            _ => None,
        })
        .collect()
}

fn merge_children(env: &RunEnv, state: &mut RunState) {
    for child in env.take_children() {
        if !state.child_run_ids.contains(&child) {
            state.child_run_ids.push(child);
        }
    }
}

/// Build the stacks a suspended child contributes to its caller: one
/// per child-own suspension (caller entry plus a child leaf) and one
/// per nested stack (re-rooted under the caller entry).
fn stacks_from_child(
    state: &RunState,
    manifest: &AgentManifest,
    tool_call_id: &str,
    inner: SuspendedTool,
) -> Vec<SuspensionStack> {
    let SuspendedTool {
        suspensions,
        run_id,
        manifest_id,
        manifest_version,
        suspension_stacks,
    } = inner;

    let self_entry = StackEntry::awaiting(
        &manifest.id,
        &manifest.version,
        &state.run_id,
        tool_call_id,
    );

    let mut stacks = Vec::with_capacity(suspensions.len() + suspension_stacks.len());
    for suspension in suspensions {
        stacks.push(SuspensionStack {
            agents: vec![
                self_entry.clone(),
                StackEntry::leaf(&manifest_id, &manifest_version, &run_id),
            ],
            suspension,
        });
    }
    for stack in suspension_stacks {
        stacks.push(stack.rerooted(std::slice::from_ref(&self_entry)));
    }
    stacks
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn suspended_tool(own: usize, nested: usize) -> SuspendedTool {
        let suspensions = (0..own)
            .map(|i| Suspension {
                approval_id: format!("own-{i}"),
                tool_call_id: format!("tc-{i}"),
                tool_name: "deploy".into(),
                input: json!({}),
            })
            .collect();
        let suspension_stacks = (0..nested)
            .map(|i| SuspensionStack {
                agents: vec![
                    StackEntry::awaiting("child", "1", "child-run", format!("nested-{i}")),
                    StackEntry::leaf("grandchild", "1", "grandchild-run"),
                ],
                suspension: Suspension {
                    approval_id: format!("deep-{i}"),
                    tool_call_id: format!("deep-tc-{i}"),
                    tool_name: "deep".into(),
                    input: json!({}),
                },
            })
            .collect();
        SuspendedTool {
            suspensions,
            run_id: "child-run".into(),
            manifest_id: "child".into(),
            manifest_version: "1".into(),
            suspension_stacks,
        }
    }

    #[test]
    fn child_own_suspensions_become_two_level_stacks() {
        let state = RunState::new("root-run", "root", "1");
        let manifest = AgentManifest::builder("root").build();

        let stacks = stacks_from_child(&state, &manifest, "tc0", suspended_tool(2, 0));
        assert_eq!(stacks.len(), 2);
        for stack in &stacks {
            assert!(stack.is_well_formed());
            assert_eq!(stack.agents.len(), 2);
            assert_eq!(stack.agents[0].state_id, "root-run");
            assert_eq!(stack.agents[0].tool_call_id.as_deref(), Some("tc0"));
            assert_eq!(stack.agents[1].state_id, "child-run");
        }
    }

    #[test]
    fn nested_stacks_are_rerooted_under_the_caller() {
        let state = RunState::new("root-run", "root", "1");
        let manifest = AgentManifest::builder("root").build();

        let stacks = stacks_from_child(&state, &manifest, "tc0", suspended_tool(0, 1));
        assert_eq!(stacks.len(), 1);
        let stack = &stacks[0];
        assert!(stack.is_well_formed());
        assert_eq!(stack.agents.len(), 3);
        assert_eq!(stack.agents[0].manifest_id, "root");
        assert_eq!(stack.agents[1].manifest_id, "child");
        assert_eq!(stack.agents[2].manifest_id, "grandchild");
    }

    #[test]
    fn tool_calls_and_suspensions_extracted_from_response() {
        let response = TextResponse {
            content: vec![
                ContentPart::text("working"),
                ContentPart::tool_call("c1", "echo", &json!({"x": 1})),
                ContentPart::ApprovalRequest {
                    approval_id: "k1".into(),
                    tool_call_id: "c2".into(),
                    tool_name: "deploy".into(),
                    input: json!({}),
                },
            ],
            finish_reason: FinishReason::ToolCalls,
            usage: crate::usage::Usage::zero(),
            warnings: Vec::new(),
        };

        let calls = extract_tool_calls(&response);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "echo");

        let harvested = harvest_suspensions(&response);
        assert_eq!(harvested.len(), 1);
        assert_eq!(harvested[0].approval_id, "k1");
    }
}
