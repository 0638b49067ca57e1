//! Multi-level resume across a suspension stack.
//!
//! An approval targets the deepest agent of one saved stack. The
//! resumer replays that agent, then walks the stack upward: each
//! completed child becomes a synthetic tool result on its parent, each
//! re-suspension re-roots the fresh stacks onto the original root path,
//! and the root either resumes, stays suspended on remaining work, or
//! completes.
//!
//! The resumer drives agents through the [`StepLoop`] seam only, so the
//! whole propagation is testable against a scripted fake.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::manifest::ManifestSet;
use crate::message::{ContentPart, ToolOutput};
use crate::state::{
    ApprovalResponse, LockAcquisition, RunState, RunStatus, StackEntry, StateStore,
    SuspensionStack,
};

use super::step::{LoopExit, LoopOutcome, ResumeMode, StepLoop};

/// Resumes a saved suspension stack from an approval response.
pub struct StackResumer {
    store: Arc<dyn StateStore>,
    manifests: Arc<ManifestSet>,
    step_loop: Arc<dyn StepLoop>,
    lock_ttl: Duration,
}

impl std::fmt::Debug for StackResumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackResumer").finish_non_exhaustive()
    }
}

impl StackResumer {
    /// Create a resumer.
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        manifests: Arc<ManifestSet>,
        step_loop: Arc<dyn StepLoop>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            store,
            manifests,
            step_loop,
            lock_ttl,
        }
    }

    /// Resume the stack matching the approval and propagate the deepest
    /// result upward. Returns the advanced root state and the terminal
    /// outcome; the caller persists the root.
    ///
    /// # Errors
    ///
    /// Unrecoverable failures only: a malformed stack or a missing
    /// pending call id ([`Error::Internal`]), a missing manifest or
    /// state ([`Error::NotFound`]), or an inner level that turns out
    /// cancelled or already running ([`Error::BadRequest`]).
    pub async fn resume(&self, mut root: RunState, approval: ApprovalResponse) -> Result<LoopExit> {
        let Some(stack_index) = root.find_stack(&approval.approval_id) else {
            return Err(Error::bad_request(
                "approval does not match any pending suspension",
            ));
        };
        let stack = root.suspension_stacks[stack_index].clone();
        if stack.agents.len() < 2 {
            return Err(Error::internal("invalid suspension stack"));
        }
        let depth = stack.agents.len();
        info!(
            approval = %approval.approval_id,
            depth,
            root_run = %root.run_id,
            "Resuming suspension stack"
        );

        // Deepest replay: the approval answers the leaf's own pending
        // suspension.
        let mut exit = self
            .run_level(&stack.agents[depth - 1], ResumeMode::Approval(approval))
            .await?;

        // Walk the ancestors from the leaf's parent up to the root.
        for i in (0..depth - 1).rev() {
            let parent_entry = &stack.agents[i];
            let child_entry = &stack.agents[i + 1];
            let is_root = i == 0;

            match exit.outcome {
                LoopOutcome::Suspended {
                    suspensions,
                    suspension_stacks,
                } => {
                    // The level at i+1 suspended again. Re-root all of
                    // its fresh work onto the original path and save it
                    // on the root, replacing the resolved stack.
                    let prefix = &stack.agents[..=i];
                    let mut new_stacks = Vec::new();
                    for suspension in suspensions {
                        let mut agents = prefix.to_vec();
                        agents.push(StackEntry::leaf(
                            &child_entry.manifest_id,
                            &child_entry.manifest_version,
                            &child_entry.state_id,
                        ));
                        new_stacks.push(SuspensionStack { agents, suspension });
                    }
                    for child_stack in suspension_stacks {
                        new_stacks.push(child_stack.rerooted(prefix));
                    }
                    debug!(level = i + 1, stacks = new_stacks.len(), "Level re-suspended");
                    return Ok(self.exit_resuspended(root, &stack, new_stacks));
                }

                LoopOutcome::Cancelled => {
                    return Err(Error::bad_request(
                        "resumed run was cancelled; the suspension stack cannot settle",
                    ));
                }

                LoopOutcome::Complete(_) | LoopOutcome::Error(_) => {
                    // The child settled; its value or failure satisfies
                    // the parent's awaited call either way.
                    let Some(call_id) = parent_entry.tool_call_id.clone() else {
                        return Err(Error::internal(
                            "suspension stack entry is missing its pending tool call id",
                        ));
                    };
                    let part = synthetic_result(&call_id, &child_entry.manifest_id, &exit.outcome);

                    if is_root {
                        root.pending_tool_results.push(part);
                        remove_stacks_through(&mut root.suspension_stacks, &call_id);
                        if root.has_pending_work() {
                            debug!("Root keeps other pending work; staying suspended");
                            root.status = RunStatus::Suspended;
                            root.touch();
                            return Ok(suspended_exit(root));
                        }
                        let manifest = self
                            .manifests
                            .require(&crate::manifest::ManifestKey::new(
                                &parent_entry.manifest_id,
                                &parent_entry.manifest_version,
                            ))?;
                        return Ok(self
                            .step_loop
                            .resume(manifest, root, ResumeMode::Continue)
                            .await);
                    }

                    // Intermediate parent: deliver the result, then
                    // either surface its remaining work at the root or
                    // resume it in continue mode.
                    let handle = match self
                        .store
                        .acquire_lock(&parent_entry.state_id, self.lock_ttl)
                        .await?
                    {
                        LockAcquisition::Acquired(handle) => handle,
                        LockAcquisition::AlreadyHeld => {
                            return Err(Error::bad_request(format!(
                                "run '{}' is already running",
                                parent_entry.state_id
                            )));
                        }
                    };
                    let result = self.settle_parent(parent_entry, &stack, i, part).await;
                    let settled = match result {
                        Ok(settled) => settled,
                        Err(err) => {
                            let _ = self.store.release_lock(&handle).await;
                            return Err(err);
                        }
                    };
                    self.store.release_lock(&handle).await?;
                    match settled {
                        Settled::StillSuspended(new_stacks) => {
                            return Ok(self.exit_resuspended(root, &stack, new_stacks));
                        }
                        Settled::Resumed(next_exit) => exit = next_exit,
                    }
                }
            }
        }

        Err(Error::internal("suspension stack propagation fell through"))
    }

    /// Deliver a synthetic result to an intermediate parent and either
    /// leave it suspended (remaining work re-rooted onto the root) or
    /// resume it.
    async fn settle_parent(
        &self,
        parent_entry: &StackEntry,
        stack: &SuspensionStack,
        level: usize,
        part: ContentPart,
    ) -> Result<Settled> {
        let call_id = parent_entry
            .tool_call_id
            .as_deref()
            .ok_or_else(|| Error::internal("intermediate entry lost its pending tool call id"))?;

        let parent = self.store.get(&parent_entry.state_id).await?.ok_or_else(|| {
            Error::not_found(format!("run state '{}' does not exist", parent_entry.state_id))
        })?;
        let mut parent = self.store.refresh_content(parent).await?;

        parent.pending_tool_results.push(part);
        remove_stacks_through(&mut parent.suspension_stacks, call_id);

        if parent.has_pending_work() {
            parent.status = RunStatus::Suspended;
            parent.touch();
            self.store.put(&parent).await?;

            // Surface the parent's remaining work at the root under the
            // original path above it.
            let prefix = &stack.agents[..level];
            let mut new_stacks: Vec<SuspensionStack> = parent
                .suspension_stacks
                .iter()
                .map(|s| s.clone().rerooted(prefix))
                .collect();
            for suspension in &parent.suspensions {
                let covered = new_stacks
                    .iter()
                    .any(|s| s.suspension.approval_id == suspension.approval_id);
                if !covered {
                    let mut agents = prefix.to_vec();
                    agents.push(StackEntry::leaf(
                        &parent_entry.manifest_id,
                        &parent_entry.manifest_version,
                        &parent_entry.state_id,
                    ));
                    new_stacks.push(SuspensionStack {
                        agents,
                        suspension: suspension.clone(),
                    });
                }
            }
            return Ok(Settled::StillSuspended(new_stacks));
        }

        let manifest = self.manifests.require(&crate::manifest::ManifestKey::new(
            &parent_entry.manifest_id,
            &parent_entry.manifest_version,
        ))?;
        let exit = self
            .step_loop
            .resume(manifest, parent, ResumeMode::Continue)
            .await;
        self.store.put(&exit.state).await?;
        Ok(Settled::Resumed(exit))
    }

    /// Replay one non-root level: lock it, load its state, drive it,
    /// persist the advanced state, unlock.
    async fn run_level(&self, entry: &StackEntry, mode: ResumeMode) -> Result<LoopExit> {
        let manifest = self.manifests.require(&crate::manifest::ManifestKey::new(
            &entry.manifest_id,
            &entry.manifest_version,
        ))?;
        let handle = match self.store.acquire_lock(&entry.state_id, self.lock_ttl).await? {
            LockAcquisition::Acquired(handle) => handle,
            LockAcquisition::AlreadyHeld => {
                return Err(Error::bad_request(format!(
                    "run '{}' is already running",
                    entry.state_id
                )));
            }
        };

        let result = async {
            let state = self.store.get(&entry.state_id).await?.ok_or_else(|| {
                Error::not_found(format!("run state '{}' does not exist", entry.state_id))
            })?;
            let state = self.store.refresh_content(state).await?;
            let exit = self.step_loop.resume(manifest, state, mode).await;
            self.store.put(&exit.state).await?;
            Ok(exit)
        }
        .await;

        self.store.release_lock(&handle).await?;
        result
    }

    /// Replace the resolved stack on the root with re-rooted fresh
    /// stacks and report the root as suspended.
    fn exit_resuspended(
        &self,
        mut root: RunState,
        resolved: &SuspensionStack,
        new_stacks: Vec<SuspensionStack>,
    ) -> LoopExit {
        root.suspension_stacks
            .retain(|s| s.suspension.approval_id != resolved.suspension.approval_id);
        for stack in new_stacks {
            if root.find_stack(&stack.suspension.approval_id).is_none() {
                root.suspension_stacks.push(stack);
            }
        }
        root.status = RunStatus::Suspended;
        root.touch();
        suspended_exit(root)
    }
}

enum Settled {
    /// The parent keeps pending work; propagation stops after these
    /// stacks are surfaced at the root.
    StillSuspended(Vec<SuspensionStack>),
    /// The parent resumed; propagation continues with its exit.
    Resumed(LoopExit),
}

fn suspended_exit(state: RunState) -> LoopExit {
    LoopExit {
        outcome: LoopOutcome::Suspended {
            suspensions: state.suspensions.clone(),
            suspension_stacks: state.suspension_stacks.clone(),
        },
        state,
    }
}

/// Drop every stack awaiting the given call: once the call has a
/// result, nothing beneath it can still be suspended.
fn remove_stacks_through(stacks: &mut Vec<SuspensionStack>, call_id: &str) {
    stacks.retain(|stack| {
        stack
            .agents
            .first()
            .and_then(|entry| entry.tool_call_id.as_deref())
            != Some(call_id)
    });
}

/// Encode a settled child as the tool result its parent awaits. The
/// child's manifest id doubles as the tool name; an error still answers
/// the call, flagged as a failure.
fn synthetic_result(call_id: &str, child_manifest_id: &str, outcome: &LoopOutcome) -> ContentPart {
    match outcome {
        LoopOutcome::Complete(result) => ContentPart::tool_result(
            call_id,
            child_manifest_id,
            ToolOutput::Json {
                value: json!({"text": result.text, "output": result.output}),
            },
        ),
        LoopOutcome::Error(error) => ContentPart::tool_result(
            call_id,
            child_manifest_id,
            ToolOutput::ErrorText {
                value: error.to_string(),
            },
        ),
        LoopOutcome::Suspended { .. } | LoopOutcome::Cancelled => ContentPart::tool_result(
            call_id,
            child_manifest_id,
            ToolOutput::ErrorText {
                value: "child run did not settle".to_owned(),
            },
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RunResult;
    use crate::state::Suspension;
    use serde_json::json;

    #[test]
    fn synthetic_result_encodes_completion_and_error() {
        let result = RunResult {
            run_id: "child-run".into(),
            manifest_id: "child".into(),
            provider: "openai".into(),
            model: "gpt-4o".into(),
            text: "done".into(),
            output: Some(json!({"k": 1})),
            steps: Vec::new(),
            total_usage: crate::usage::Usage::zero(),
            finish_reason: crate::gateway::FinishReason::Stop,
        };
        let part = synthetic_result("tc1", "child", &LoopOutcome::Complete(Box::new(result)));
        let ContentPart::ToolResult {
            id,
            name,
            output,
            is_error,
        } = part
        else {
            panic!("expected tool result");
        };
        assert_eq!(id, "tc1");
        assert_eq!(name, "child");
        assert!(!is_error);
        assert_eq!(
            output,
            ToolOutput::Json {
                value: json!({"text": "done", "output": {"k": 1}})
            }
        );

        let part = synthetic_result(
            "tc1",
            "child",
            &LoopOutcome::Error(Error::upstream("model unavailable")),
        );
        let ContentPart::ToolResult { is_error, .. } = part else {
            panic!("expected tool result");
        };
        assert!(is_error);
    }

    #[test]
    fn stacks_through_a_settled_call_are_removed() {
        let make = |call: &str, approval: &str| SuspensionStack {
            agents: vec![
                StackEntry::awaiting("mid", "1", "mid-run", call),
                StackEntry::leaf("leaf", "1", "leaf-run"),
            ],
            suspension: Suspension {
                approval_id: approval.into(),
                tool_call_id: "c".into(),
                tool_name: "t".into(),
                input: json!({}),
            },
        };
        let mut stacks = vec![make("tc1", "k1"), make("tc1", "k2"), make("tc9", "k3")];
        remove_stacks_through(&mut stacks, "tc1");
        assert_eq!(stacks.len(), 1);
        assert_eq!(stacks[0].suspension.approval_id, "k3");
    }
}
