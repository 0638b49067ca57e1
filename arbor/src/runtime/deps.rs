//! Shared dependencies and the per-run execution environment.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::gateway::CompletionsGateway;
use crate::hooks::HookChain;
use crate::manifest::{AgentManifest, ManifestSet};
use crate::runner::EventSink;
use crate::state::StateStore;
use crate::tool::ProtocolToolSource;

/// Dependencies shared by every run the runtime drives: the state
/// store, the completions gateway, configured protocol servers, and
/// runtime-level observers. Also tracks the cancellation token of each
/// active run so `cancel(run_id)` can reach it.
pub struct RuntimeDeps {
    /// Run-state persistence.
    pub store: Arc<dyn StateStore>,
    /// The completions gateway.
    pub gateway: Arc<dyn CompletionsGateway>,
    /// Protocol servers queried for tools at run start.
    pub protocol_sources: Vec<Arc<dyn ProtocolToolSource>>,
    /// Observers invoked for every run, after manifest hooks.
    pub observers: HookChain,
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl RuntimeDeps {
    /// Create dependencies around a store and gateway.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, gateway: Arc<dyn CompletionsGateway>) -> Self {
        Self {
            store,
            gateway,
            protocol_sources: Vec::new(),
            observers: HookChain::new(),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Register a protocol server.
    #[must_use]
    pub fn with_protocol_source(mut self, source: Arc<dyn ProtocolToolSource>) -> Self {
        self.protocol_sources.push(source);
        self
    }

    /// Register a runtime-level observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn crate::hooks::AgentHooks>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Track an active run's cancellation token.
    pub(crate) fn register_active(&self, run_id: &str, token: CancellationToken) {
        self.active
            .lock()
            .expect("active-run registry poisoned")
            .insert(run_id.to_owned(), token);
    }

    /// Stop tracking a run.
    pub(crate) fn unregister_active(&self, run_id: &str) {
        self.active
            .lock()
            .expect("active-run registry poisoned")
            .remove(run_id);
    }

    /// Trigger cancellation of an active run. Returns whether a run was
    /// actually executing under this id.
    pub(crate) fn cancel_active(&self, run_id: &str) -> bool {
        let active = self.active.lock().expect("active-run registry poisoned");
        if let Some(token) = active.get(run_id) {
            token.cancel();
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for RuntimeDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeDeps")
            .field("protocol_sources", &self.protocol_sources.len())
            .field("observers", &self.observers)
            .finish_non_exhaustive()
    }
}

/// Everything one executing run carries: identity, configuration,
/// shared dependencies, the event sink, and its cancellation scope.
#[derive(Debug, Clone)]
pub struct RunEnv {
    /// Run id of the executing agent.
    pub run_id: String,
    /// Manifest of the executing agent.
    pub manifest: Arc<AgentManifest>,
    /// The validated manifest set shared by the whole run tree.
    pub manifests: Arc<ManifestSet>,
    /// Shared dependencies.
    pub deps: Arc<RuntimeDeps>,
    /// Event sink for this run's stream.
    pub sink: EventSink,
    /// Cancellation scope. Children derive linked tokens from it.
    pub cancellation: CancellationToken,
    /// Per-run deadline override from request options.
    pub timeout_override: Option<Duration>,
    /// Run ids of children spawned during the current drive, drained
    /// into the persisted state at step boundaries.
    pub children: Arc<Mutex<Vec<String>>>,
}

impl RunEnv {
    /// Record a spawned child run id.
    pub(crate) fn record_child(&self, run_id: &str) {
        self.children
            .lock()
            .expect("child-run registry poisoned")
            .push(run_id.to_owned());
    }

    /// Drain child run ids recorded since the last call.
    pub(crate) fn take_children(&self) -> Vec<String> {
        std::mem::take(
            &mut *self
                .children
                .lock()
                .expect("child-run registry poisoned"),
        )
    }
}
