//! Agent manifests: the immutable configuration of an agent.
//!
//! A manifest bundles everything the runtime needs to drive one agent:
//! provider config, system prompt, tool declarations, sub-agent
//! references, stop conditions, retry caps, timeouts, and lifecycle
//! hooks. Manifests are supplied per request and never mutated after
//! validation.

mod set;

pub use set::{ManifestKey, ManifestSet};

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::hooks::AgentHooks;
use crate::tool::ToolExecutor;

/// Default per-run deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default maximum number of output-validation retries.
pub const DEFAULT_OUTPUT_RETRIES: usize = 3;

/// Default step cap when no stop condition is configured.
pub const DEFAULT_MAX_STEPS: usize = 20;

/// Provider routing for the completions gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Provider identifier (e.g. "openai", "anthropic").
    pub provider: String,
    /// Model identifier (e.g. "gpt-4o", "claude-sonnet-4-5").
    pub model: String,
}

impl ProviderConfig {
    /// Create a new provider config.
    #[must_use]
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::new("openai", "gpt-4o")
    }
}

/// A condition that ends the step loop with a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopCondition {
    /// Stop once the step number reaches this count.
    StepCount(usize),
    /// Stop once any committed step contains a call to the named tool.
    ToolUse(String),
}

/// What to do when the model responds with text only (no tool calls).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextOnlyBehavior {
    /// Treat a text-only response as the final answer.
    #[default]
    Stop,
    /// Keep looping; stop conditions alone end the run.
    Continue,
}

/// A reference from one manifest to a sub-agent it may invoke as a tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAgentRef {
    /// Id of the referenced manifest.
    pub id: String,
    /// Version of the referenced manifest.
    pub version: String,
    /// Description offered to the model alongside the generated tool.
    pub description: Option<String>,
}

impl SubAgentRef {
    /// Create a new sub-agent reference.
    #[must_use]
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            description: None,
        }
    }

    /// Attach a description for the generated tool.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// The manifest key this reference points at.
    #[must_use]
    pub fn key(&self) -> ManifestKey {
        ManifestKey::new(&self.id, &self.version)
    }
}

/// A tool declared directly on a manifest.
#[derive(Clone)]
pub struct ToolDef {
    /// Tool name, offered to the model for function calling.
    pub name: String,
    /// Description that helps the model decide when to call the tool.
    pub description: String,
    /// JSON schema for the tool's parameters.
    pub parameters: Value,
    /// Local executor. A tool without one produces an error result when
    /// called.
    pub executor: Option<Arc<dyn ToolExecutor>>,
}

impl ToolDef {
    /// Create a new tool declaration with an executor.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        executor: Arc<dyn ToolExecutor>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            executor: Some(executor),
        }
    }

    /// Create a schema-only tool declaration (no local executor).
    #[must_use]
    pub fn declaration(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            executor: None,
        }
    }
}

impl std::fmt::Debug for ToolDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDef")
            .field("name", &self.name)
            .field("has_executor", &self.executor.is_some())
            .finish_non_exhaustive()
    }
}

/// The distinguished tool whose argument schema defines a run's
/// structured output.
#[derive(Debug, Clone)]
pub struct OutputToolDef {
    /// Tool name.
    pub name: String,
    /// Description offered to the model.
    pub description: String,
    /// JSON schema the tool's input is validated against.
    pub schema: Value,
}

impl OutputToolDef {
    /// Create a new output tool definition.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
        }
    }
}

/// The immutable configuration of an agent.
#[derive(Clone)]
pub struct AgentManifest {
    /// Manifest id. Unique within a manifest set.
    pub id: String,
    /// Manifest version. Each id maps to exactly one version per set.
    pub version: String,
    /// Provider routing.
    pub provider: ProviderConfig,
    /// System prompt prepended to fresh conversations.
    pub system_prompt: Option<String>,
    /// Tools declared directly on this manifest.
    pub tools: Vec<ToolDef>,
    /// Sub-agents this agent may invoke.
    pub sub_agents: Vec<SubAgentRef>,
    /// Optional structured-output tool.
    pub output_tool: Option<OutputToolDef>,
    /// Conditions that end the loop. Empty means a step cap of
    /// [`DEFAULT_MAX_STEPS`].
    pub stop_when: Vec<StopCondition>,
    /// Maximum output-validation retries.
    pub max_output_retries: usize,
    /// Whether invalid output is retried at all.
    pub retry_on_invalid_output: bool,
    /// Per-run deadline, accumulated across resumes.
    pub timeout: Option<Duration>,
    /// Behavior when a response has no tool calls.
    pub on_text_only: TextOnlyBehavior,
    /// Lifecycle hooks.
    pub hooks: Option<Arc<dyn AgentHooks>>,
}

impl AgentManifest {
    /// Start building a manifest with the given id.
    #[must_use]
    pub fn builder(id: impl Into<String>) -> AgentManifestBuilder {
        AgentManifestBuilder::new(id)
    }

    /// The key identifying this manifest within a set.
    #[must_use]
    pub fn key(&self) -> ManifestKey {
        ManifestKey::new(&self.id, &self.version)
    }

    /// Effective stop conditions: the configured list, or the default
    /// step cap when none are configured.
    #[must_use]
    pub fn effective_stop_when(&self) -> Vec<StopCondition> {
        if self.stop_when.is_empty() {
            vec![StopCondition::StepCount(DEFAULT_MAX_STEPS)]
        } else {
            self.stop_when.clone()
        }
    }

    /// Effective deadline for a run of this manifest, before per-run
    /// overrides.
    #[must_use]
    pub fn effective_timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }
}

impl std::fmt::Debug for AgentManifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentManifest")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("provider", &self.provider)
            .field("tools", &self.tools.len())
            .field("sub_agents", &self.sub_agents)
            .finish_non_exhaustive()
    }
}

/// Builder for [`AgentManifest`].
#[derive(Debug)]
pub struct AgentManifestBuilder {
    manifest: AgentManifest,
}

impl AgentManifestBuilder {
    fn new(id: impl Into<String>) -> Self {
        Self {
            manifest: AgentManifest {
                id: id.into(),
                version: "1".to_owned(),
                provider: ProviderConfig::default(),
                system_prompt: None,
                tools: Vec::new(),
                sub_agents: Vec::new(),
                output_tool: None,
                stop_when: Vec::new(),
                max_output_retries: DEFAULT_OUTPUT_RETRIES,
                retry_on_invalid_output: true,
                timeout: None,
                on_text_only: TextOnlyBehavior::default(),
                hooks: None,
            },
        }
    }

    /// Set the manifest version (default `"1"`).
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.manifest.version = version.into();
        self
    }

    /// Set the provider config.
    #[must_use]
    pub fn provider(mut self, provider: ProviderConfig) -> Self {
        self.manifest.provider = provider;
        self
    }

    /// Set the model, keeping the current provider name.
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.manifest.provider.model = model.into();
        self
    }

    /// Set the system prompt.
    #[must_use]
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.manifest.system_prompt = Some(prompt.into());
        self
    }

    /// Declare a tool.
    #[must_use]
    pub fn tool(mut self, tool: ToolDef) -> Self {
        self.manifest.tools.push(tool);
        self
    }

    /// Reference a sub-agent.
    #[must_use]
    pub fn sub_agent(mut self, reference: SubAgentRef) -> Self {
        self.manifest.sub_agents.push(reference);
        self
    }

    /// Configure the structured-output tool. Calling it becomes a stop
    /// condition unless one for it is already present.
    #[must_use]
    pub fn output_tool(mut self, def: OutputToolDef) -> Self {
        self.manifest.output_tool = Some(def);
        self
    }

    /// Add a stop condition.
    #[must_use]
    pub fn stop_when(mut self, condition: StopCondition) -> Self {
        self.manifest.stop_when.push(condition);
        self
    }

    /// Set the per-run deadline.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.manifest.timeout = Some(timeout);
        self
    }

    /// Set the maximum output-validation retries.
    #[must_use]
    pub const fn max_output_retries(mut self, retries: usize) -> Self {
        self.manifest.max_output_retries = retries;
        self
    }

    /// Enable or disable output-validation retries.
    #[must_use]
    pub const fn retry_on_invalid_output(mut self, retry: bool) -> Self {
        self.manifest.retry_on_invalid_output = retry;
        self
    }

    /// Set the text-only behavior.
    #[must_use]
    pub const fn on_text_only(mut self, behavior: TextOnlyBehavior) -> Self {
        self.manifest.on_text_only = behavior;
        self
    }

    /// Attach lifecycle hooks.
    #[must_use]
    pub fn hooks(mut self, hooks: Arc<dyn AgentHooks>) -> Self {
        self.manifest.hooks = Some(hooks);
        self
    }

    /// Finish the manifest.
    #[must_use]
    pub fn build(mut self) -> AgentManifest {
        if let Some(output) = &self.manifest.output_tool {
            let covered = self
                .manifest
                .stop_when
                .iter()
                .any(|c| matches!(c, StopCondition::ToolUse(name) if *name == output.name));
            if !covered {
                self.manifest
                    .stop_when
                    .push(StopCondition::ToolUse(output.name.clone()));
            }
        }
        self.manifest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_defaults() {
        let manifest = AgentManifest::builder("writer").build();
        assert_eq!(manifest.version, "1");
        assert_eq!(
            manifest.effective_stop_when(),
            vec![StopCondition::StepCount(DEFAULT_MAX_STEPS)]
        );
        assert_eq!(manifest.effective_timeout(), DEFAULT_TIMEOUT);
        assert_eq!(manifest.max_output_retries, DEFAULT_OUTPUT_RETRIES);
        assert!(manifest.retry_on_invalid_output);
    }

    #[test]
    fn output_tool_implies_stop_condition() {
        let manifest = AgentManifest::builder("extractor")
            .output_tool(OutputToolDef::new(
                "submit",
                "Record the extracted fields",
                json!({"type": "object"}),
            ))
            .build();
        assert!(
            manifest
                .stop_when
                .iter()
                .any(|c| matches!(c, StopCondition::ToolUse(name) if name == "submit"))
        );
    }

    #[test]
    fn explicit_stop_condition_not_duplicated() {
        let manifest = AgentManifest::builder("extractor")
            .stop_when(StopCondition::ToolUse("submit".into()))
            .output_tool(OutputToolDef::new("submit", "Record", json!({"type": "object"})))
            .build();
        assert_eq!(manifest.stop_when.len(), 1);
    }
}
