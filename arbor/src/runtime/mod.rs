//! The stream orchestrator: the runtime's public front door.
//!
//! Every entry point returns a [`RunStream`] that yields events in
//! causal order and terminates with exactly one
//! [`RunEvent::Finished`]. Lock acquisition, cancellation plumbing,
//! terminal persistence, and terminal hooks all live here; the step
//! loop and the stack resumer stay free of them.

mod deps;

pub use deps::{RunEnv, RuntimeDeps};

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::gateway::CompletionsGateway;
use crate::hooks::AgentHooks;
use crate::manifest::{AgentManifest, ManifestSet};
use crate::message::Message;
use crate::runner::{
    EventSink, LoopExit, LoopOutcome, ResumeMode, RunEvent, RunOutcome, Runner, StackResumer,
    StepLoop,
};
use crate::state::{
    delete_recursive, now_ms, ApprovalResponse, LockAcquisition, ParentContext, RunState,
    RunStatus, StateStore,
};

/// Slack added to the per-run timeout when sizing the lock TTL, so the
/// lock always outlives the deadline.
const LOCK_TTL_MARGIN: Duration = Duration::from_secs(60);

/// The input of a fresh run.
#[derive(Debug, Clone)]
pub enum RequestInput {
    /// A single user prompt.
    Prompt(String),
    /// A prepared initial conversation.
    Messages(Vec<Message>),
}

/// A request to start a fresh run.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Prompt or initial messages.
    pub input: RequestInput,
    /// Caller context appended to the conversation.
    pub context: Option<Value>,
    /// Per-run deadline override.
    pub timeout: Option<Duration>,
}

impl AgentRequest {
    /// A request from a single prompt.
    #[must_use]
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self {
            input: RequestInput::Prompt(prompt.into()),
            context: None,
            timeout: None,
        }
    }

    /// A request from prepared messages.
    #[must_use]
    pub const fn messages(messages: Vec<Message>) -> Self {
        Self {
            input: RequestInput::Messages(messages),
            context: None,
            timeout: None,
        }
    }

    /// Attach caller context.
    #[must_use]
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Override the per-run deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// The event stream of one runtime invocation.
///
/// Yields events in causal order and ends right after the single
/// [`RunEvent::Finished`].
#[derive(Debug)]
pub struct RunStream {
    rx: mpsc::UnboundedReceiver<RunEvent>,
}

impl RunStream {
    /// Receive the next event.
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        self.rx.recv().await
    }

    /// Drain the stream and return the terminal outcome.
    pub async fn collect_outcome(mut self) -> RunOutcome {
        while let Some(event) = self.rx.recv().await {
            if let RunEvent::Finished(outcome) = event {
                return outcome;
            }
        }
        RunOutcome::Error {
            run_id: String::new(),
            error: Error::internal("run stream ended without a terminal outcome"),
        }
    }

    /// Drain the stream, collecting all events; the last one is the
    /// terminal. Test helper.
    pub async fn collect_events(mut self) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            let last = matches!(event, RunEvent::Finished(_));
            events.push(event);
            if last {
                break;
            }
        }
        events
    }
}

impl Stream for RunStream {
    type Item = RunEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

enum EntryKind {
    Fresh { request: AgentRequest },
    Reply { run_id: String, message: Message },
    Approve { run_id: String, response: ApprovalResponse },
    Continue { run_id: String },
}

impl EntryKind {
    fn run_id(&self) -> Option<&str> {
        match self {
            Self::Fresh { .. } => None,
            Self::Reply { run_id, .. }
            | Self::Approve { run_id, .. }
            | Self::Continue { run_id } => Some(run_id),
        }
    }
}

/// The agent execution runtime.
///
/// Holds the shared dependency set; manifests are supplied and
/// validated per request.
#[derive(Debug, Clone)]
pub struct Runtime {
    deps: Arc<RuntimeDeps>,
}

impl Runtime {
    /// Create a runtime over a state store and a completions gateway.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, gateway: Arc<dyn CompletionsGateway>) -> Self {
        Self {
            deps: Arc::new(RuntimeDeps::new(store, gateway)),
        }
    }

    /// Create a runtime from a prepared dependency set.
    #[must_use]
    pub fn from_deps(deps: RuntimeDeps) -> Self {
        Self {
            deps: Arc::new(deps),
        }
    }

    /// Start a fresh run of the root manifest.
    #[must_use]
    pub fn run(
        &self,
        manifests: Vec<AgentManifest>,
        root_id: &str,
        request: AgentRequest,
    ) -> RunStream {
        self.spawn(manifests, root_id, EntryKind::Fresh { request })
    }

    /// Append a user message to a completed run and continue it.
    #[must_use]
    pub fn reply(
        &self,
        manifests: Vec<AgentManifest>,
        root_id: &str,
        run_id: &str,
        message: Message,
    ) -> RunStream {
        self.spawn(
            manifests,
            root_id,
            EntryKind::Reply {
                run_id: run_id.to_owned(),
                message,
            },
        )
    }

    /// Submit an approval decision against a suspended run.
    #[must_use]
    pub fn approve(
        &self,
        manifests: Vec<AgentManifest>,
        root_id: &str,
        run_id: &str,
        response: ApprovalResponse,
    ) -> RunStream {
        self.spawn(
            manifests,
            root_id,
            EntryKind::Approve {
                run_id: run_id.to_owned(),
                response,
            },
        )
    }

    /// Resume a suspended run whose child suspensions have all
    /// resolved into pending tool results.
    #[must_use]
    pub fn resume_children(
        &self,
        manifests: Vec<AgentManifest>,
        root_id: &str,
        run_id: &str,
    ) -> RunStream {
        self.spawn(
            manifests,
            root_id,
            EntryKind::Continue {
                run_id: run_id.to_owned(),
            },
        )
    }

    /// Cancel an active run. Returns whether a run was executing under
    /// this id; cancellation of descendants follows the token chain.
    #[must_use]
    pub fn cancel(&self, run_id: &str) -> bool {
        self.deps.cancel_active(run_id)
    }

    /// Delete a run's state, optionally with all of its descendants.
    pub async fn delete(&self, run_id: &str, recursive: bool) -> Result<()> {
        if recursive {
            delete_recursive(self.deps.store.as_ref(), run_id).await
        } else {
            self.deps.store.delete(run_id).await
        }
    }

    fn spawn(
        &self,
        manifests: Vec<AgentManifest>,
        root_id: &str,
        entry: EntryKind,
    ) -> RunStream {
        let (sink, rx) = EventSink::channel();
        let deps = Arc::clone(&self.deps);
        let root_id = root_id.to_owned();
        tokio::spawn(async move {
            let outcome = dispatch_entry(deps, manifests, &root_id, entry, sink.clone()).await;
            sink.emit(RunEvent::Finished(outcome));
        });
        RunStream { rx }
    }
}

async fn dispatch_entry(
    deps: Arc<RuntimeDeps>,
    manifests: Vec<AgentManifest>,
    root_id: &str,
    entry: EntryKind,
    sink: EventSink,
) -> RunOutcome {
    let known_run_id = entry.run_id().unwrap_or_default().to_owned();
    let manifests = match ManifestSet::validate(manifests, root_id) {
        Ok(set) => Arc::new(set),
        Err(error) => {
            return RunOutcome::Error {
                run_id: known_run_id,
                error,
            };
        }
    };
    let manifest = Arc::clone(manifests.root());
    let cancellation = CancellationToken::new();

    match entry {
        EntryKind::Fresh { request } => {
            let run_id = Uuid::new_v4().to_string();
            orchestrate(
                deps,
                manifests,
                manifest,
                run_id,
                Mode::Fresh {
                    request,
                    parent: None,
                },
                cancellation,
                sink,
            )
            .await
        }
        EntryKind::Reply { run_id, message } => {
            orchestrate(
                deps,
                manifests,
                manifest,
                run_id,
                Mode::Reply(message),
                cancellation,
                sink,
            )
            .await
        }
        EntryKind::Approve { run_id, response } => {
            orchestrate(
                deps,
                manifests,
                manifest,
                run_id,
                Mode::Approve(response),
                cancellation,
                sink,
            )
            .await
        }
        EntryKind::Continue { run_id } => {
            orchestrate(
                deps,
                manifests,
                manifest,
                run_id,
                Mode::Continue,
                cancellation,
                sink,
            )
            .await
        }
    }
}

enum Mode {
    Fresh {
        request: AgentRequest,
        parent: Option<ParentContext>,
    },
    Reply(Message),
    Approve(ApprovalResponse),
    Continue,
}

/// Spawn a nested run for a sub-agent invocation. Called from the
/// generated sub-agent tool; boxing here breaks the recursive future
/// type between the loop and the orchestrator.
pub(crate) async fn run_child(
    env: &RunEnv,
    child: Arc<AgentManifest>,
    prompt: String,
    context: Option<Value>,
    parent: ParentContext,
    cancellation: CancellationToken,
    sink: EventSink,
) -> RunOutcome {
    let run_id = Uuid::new_v4().to_string();
    env.record_child(&run_id);
    let request = AgentRequest {
        input: RequestInput::Prompt(prompt),
        context,
        timeout: None,
    };
    Box::pin(orchestrate(
        Arc::clone(&env.deps),
        Arc::clone(&env.manifests),
        child,
        run_id,
        Mode::Fresh {
            request,
            parent: Some(parent),
        },
        cancellation,
        sink,
    ))
    .await
}

#[allow(clippy::too_many_lines)]
async fn orchestrate(
    deps: Arc<RuntimeDeps>,
    manifests: Arc<ManifestSet>,
    manifest: Arc<AgentManifest>,
    run_id: String,
    mode: Mode,
    cancellation: CancellationToken,
    sink: EventSink,
) -> RunOutcome {
    let timeout_override = match &mode {
        Mode::Fresh { request, .. } => request.timeout,
        _ => None,
    };
    let timeout = timeout_override.unwrap_or_else(|| manifest.effective_timeout());
    let lock_ttl = timeout + LOCK_TTL_MARGIN;

    let handle = match deps.store.acquire_lock(&run_id, lock_ttl).await {
        Ok(LockAcquisition::Acquired(handle)) => handle,
        Ok(LockAcquisition::AlreadyHeld) => {
            debug!(run = %run_id, "Lock already held");
            return RunOutcome::AlreadyRunning { run_id };
        }
        Err(error) => return RunOutcome::Error { run_id, error },
    };
    deps.register_active(&run_id, cancellation.clone());

    let outcome = orchestrate_locked(
        &deps,
        &manifests,
        &manifest,
        &run_id,
        mode,
        &cancellation,
        &sink,
        timeout_override,
        lock_ttl,
    )
    .await;

    if let Err(error) = deps.store.release_lock(&handle).await {
        warn!(run = %run_id, %error, "Failed to release run lock");
    }
    deps.unregister_active(&run_id);

    if !matches!(outcome, RunOutcome::AlreadyRunning { .. })
        && let Err(error) = fire_terminal_hooks(&manifest, &deps, &outcome).await
    {
        // A failing terminal hook suppresses the terminal value; the
        // persisted status keeps what was already written.
        warn!(run = %run_id, %error, "Terminal hook failed");
        return RunOutcome::Error { run_id, error };
    }

    outcome
}

#[allow(clippy::too_many_arguments)]
async fn orchestrate_locked(
    deps: &Arc<RuntimeDeps>,
    manifests: &Arc<ManifestSet>,
    manifest: &Arc<AgentManifest>,
    run_id: &str,
    mode: Mode,
    cancellation: &CancellationToken,
    sink: &EventSink,
    timeout_override: Option<Duration>,
    lock_ttl: Duration,
) -> RunOutcome {
    let error_outcome = |error: Error| RunOutcome::Error {
        run_id: run_id.to_owned(),
        error,
    };

    // Create or load the persisted state.
    let (state, mode) = match mode {
        Mode::Fresh { request, parent } => {
            let mut state = RunState::new(run_id, &manifest.id, &manifest.version);
            state.parent = parent;
            state.messages = initial_messages(manifest, &request);
            if let Err(error) = deps.store.put(&state).await {
                return error_outcome(error);
            }
            (state, LoadedMode::Fresh)
        }
        other => {
            let state = match deps.store.get(run_id).await {
                Ok(Some(state)) => state,
                Ok(None) => {
                    return error_outcome(Error::not_found(format!(
                        "run state '{run_id}' does not exist"
                    )));
                }
                Err(error) => return error_outcome(error),
            };
            let state = match deps.store.refresh_content(state).await {
                Ok(state) => state,
                Err(error) => return error_outcome(error),
            };
            if state.manifest_id != manifest.id || state.manifest_version != manifest.version {
                return error_outcome(Error::bad_request(format!(
                    "run '{run_id}' belongs to manifest '{}@{}', not '{}@{}'",
                    state.manifest_id, state.manifest_version, manifest.id, manifest.version
                )));
            }
            let loaded = match other {
                Mode::Reply(message) => {
                    if state.status != RunStatus::Completed {
                        return error_outcome(Error::bad_request(format!(
                            "reply requires a completed run; '{run_id}' is {}",
                            state.status
                        )));
                    }
                    LoadedMode::Reply(message)
                }
                Mode::Approve(response) => {
                    if state.status != RunStatus::Suspended {
                        return error_outcome(Error::bad_request(format!(
                            "approval requires a suspended run; '{run_id}' is {}",
                            state.status
                        )));
                    }
                    if state.find_stack(&response.approval_id).is_some() {
                        LoadedMode::ApproveStack(response)
                    } else if state.find_suspension(&response.approval_id).is_some() {
                        LoadedMode::ApproveDirect(response)
                    } else {
                        return error_outcome(Error::bad_request(
                            "approval does not match any pending suspension",
                        ));
                    }
                }
                Mode::Continue => {
                    if state.status != RunStatus::Suspended {
                        return error_outcome(Error::bad_request(format!(
                            "continue requires a suspended run; '{run_id}' is {}",
                            state.status
                        )));
                    }
                    if state.has_pending_work() {
                        return error_outcome(Error::bad_request(
                            "run still has unresolved suspensions",
                        ));
                    }
                    LoadedMode::Continue
                }
                Mode::Fresh { .. } => unreachable!("fresh handled above"),
            };
            (state, loaded)
        }
    };

    sink.emit(RunEvent::AgentStarted {
        run_id: run_id.to_owned(),
        manifest_id: manifest.id.clone(),
        manifest_version: manifest.version.clone(),
        parent_manifest_id: None,
        timestamp_ms: now_ms(),
    });
    info!(run = %run_id, agent = %manifest.id, "Run started");

    let runner = Runner::new(
        Arc::clone(deps),
        Arc::clone(manifests),
        sink.clone(),
        cancellation.clone(),
        timeout_override,
    );

    let exit: LoopExit = match mode {
        LoadedMode::Fresh => runner.start(Arc::clone(manifest), state).await,
        LoadedMode::Reply(message) => {
            runner
                .resume(Arc::clone(manifest), state, ResumeMode::Reply(message))
                .await
        }
        LoadedMode::ApproveDirect(response) => {
            runner
                .resume(Arc::clone(manifest), state, ResumeMode::Approval(response))
                .await
        }
        LoadedMode::Continue => {
            runner
                .resume(Arc::clone(manifest), state, ResumeMode::Continue)
                .await
        }
        LoadedMode::ApproveStack(response) => {
            let resumer = StackResumer::new(
                Arc::clone(&deps.store),
                Arc::clone(manifests),
                Arc::new(runner),
                lock_ttl,
            );
            match resumer.resume(state, response).await {
                Ok(exit) => exit,
                // Unrecoverable resume failures leave the persisted
                // root untouched.
                Err(error) => return error_outcome(error),
            }
        }
    };

    if let Err(error) = deps.store.put(&exit.state).await {
        return error_outcome(error);
    }

    match exit.outcome {
        LoopOutcome::Complete(result) => RunOutcome::Complete(result),
        LoopOutcome::Suspended {
            suspensions,
            suspension_stacks,
        } => RunOutcome::Suspended {
            run_id: run_id.to_owned(),
            suspensions,
            suspension_stacks,
        },
        LoopOutcome::Error(error) => error_outcome(error),
        LoopOutcome::Cancelled => RunOutcome::Cancelled {
            run_id: run_id.to_owned(),
        },
    }
}

enum LoadedMode {
    Fresh,
    Reply(Message),
    ApproveDirect(ApprovalResponse),
    ApproveStack(ApprovalResponse),
    Continue,
}

fn initial_messages(manifest: &AgentManifest, request: &AgentRequest) -> Vec<Message> {
    let mut messages = Vec::new();
    if let Some(prompt) = &manifest.system_prompt
        && !prompt.is_empty()
    {
        messages.push(Message::system(prompt));
    }
    match &request.input {
        RequestInput::Prompt(prompt) => {
            let text = match &request.context {
                Some(context) => format!(
                    "{prompt}\n\nAdditional context provided:\n{}",
                    serde_json::to_string_pretty(context).unwrap_or_default()
                ),
                None => prompt.clone(),
            };
            messages.push(Message::user(text));
        }
        RequestInput::Messages(initial) => {
            messages.extend(initial.iter().cloned());
            if let Some(context) = &request.context {
                messages.push(Message::user(format!(
                    "Additional context provided:\n{}",
                    serde_json::to_string_pretty(context).unwrap_or_default()
                )));
            }
        }
    }
    messages
}

async fn fire_terminal_hooks(
    manifest: &AgentManifest,
    deps: &RuntimeDeps,
    outcome: &RunOutcome,
) -> Result<()> {
    let layers: [Option<&dyn AgentHooks>; 2] = [
        manifest.hooks.as_deref(),
        (!deps.observers.is_empty()).then_some(&deps.observers as &dyn AgentHooks),
    ];
    for hooks in layers.into_iter().flatten() {
        match outcome {
            RunOutcome::Complete(result) => hooks.on_complete(result).await?,
            RunOutcome::Suspended { run_id, .. } => hooks.on_suspend(run_id).await?,
            RunOutcome::Error { run_id, error } => hooks.on_error(run_id, error).await?,
            RunOutcome::Cancelled { run_id } => hooks.on_cancelled(run_id).await?,
            RunOutcome::AlreadyRunning { .. } => {}
        }
    }
    Ok(())
}
