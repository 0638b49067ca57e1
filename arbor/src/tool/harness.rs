//! Per-run tool set assembly and dispatch.
//!
//! The set is assembled once per drive: manifest tools, protocol-server
//! tools, the optional output tool, and one generated tool per
//! sub-agent reference. Dispatch executes a response's calls strictly
//! in input order; when a call suspends, the remaining calls are
//! skipped and the results accumulated so far are discarded for the
//! step.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::Result;
use crate::message::{ContentPart, ToolOutput};
use crate::runner::RunEvent;
use crate::runtime::RunEnv;
use crate::state::ToolCallRecord;

use super::output::OutputValidator;
use super::protocol::ProtocolExecutor;
use super::sub_agent::{self, SubAgentTool};
use super::{SuspendedTool, ToolContext, ToolDefinition, ToolExecutor, ToolOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToolKind {
    Function,
    Protocol,
    Output,
    SubAgent,
}

/// One tool resolved for the current run.
pub struct RunTool {
    definition: ToolDefinition,
    executor: Option<Arc<dyn ToolExecutor>>,
    kind: ToolKind,
}

impl RunTool {
    /// The tool's definition as offered to the model.
    #[must_use]
    pub const fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    /// Whether this is the structured-output tool.
    #[must_use]
    pub fn is_output(&self) -> bool {
        self.kind == ToolKind::Output
    }
}

impl std::fmt::Debug for RunTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunTool")
            .field("name", &self.definition.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Outcome of dispatching one response's tool calls.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Every call produced a result part, in input order.
    Completed(Vec<ContentPart>),
    /// A call suspended. Earlier results are discarded; the assistant
    /// message is still committed without a tool message.
    Suspended {
        /// The call whose sub-agent suspended.
        tool_call_id: String,
        /// The propagated suspension.
        inner: Box<SuspendedTool>,
    },
}

/// The tools available to one run.
#[derive(Debug)]
pub struct ToolSet {
    tools: Vec<RunTool>,
    output: Option<OutputValidator>,
}

impl ToolSet {
    /// Assemble the set for a run: manifest tools, protocol-server
    /// tools, the output tool, and generated sub-agent tools.
    pub async fn assemble(env: &RunEnv) -> Result<Self> {
        let manifest = &env.manifest;
        let mut tools = Vec::new();

        for def in &manifest.tools {
            tools.push(RunTool {
                definition: ToolDefinition::new(&def.name, &def.description, def.parameters.clone()),
                executor: def.executor.clone(),
                kind: ToolKind::Function,
            });
        }

        for source in &env.deps.protocol_sources {
            let listed = source.list_tools().await?;
            debug!(server = source.name(), tools = listed.len(), "Listed protocol tools");
            for tool in listed {
                tools.push(RunTool {
                    executor: Some(Arc::new(ProtocolExecutor {
                        tool_name: tool.definition.name.clone(),
                        handler: Arc::clone(&tool.handler),
                    })),
                    definition: tool.definition,
                    kind: ToolKind::Protocol,
                });
            }
        }

        let output = manifest
            .output_tool
            .as_ref()
            .map(OutputValidator::compile)
            .transpose()?;
        if let Some(def) = &manifest.output_tool {
            tools.push(RunTool {
                definition: ToolDefinition::new(&def.name, &def.description, def.schema.clone()),
                executor: None,
                kind: ToolKind::Output,
            });
        }

        for reference in &manifest.sub_agents {
            let child = env.manifests.require(&reference.key())?;
            tools.push(RunTool {
                definition: sub_agent::definition(reference, &child),
                executor: Some(Arc::new(SubAgentTool::new(child, env.clone()))),
                kind: ToolKind::SubAgent,
            });
        }

        Ok(Self { tools, output })
    }

    /// Definitions offered to the model, optionally filtered by an
    /// active-tools restriction.
    #[must_use]
    pub fn definitions(&self, active: Option<&[String]>) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .filter(|tool| {
                active.is_none_or(|names| names.iter().any(|n| *n == tool.definition.name))
            })
            .map(|tool| tool.definition.clone())
            .collect()
    }

    /// Look up a tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RunTool> {
        self.tools.iter().find(|tool| tool.definition.name == name)
    }

    /// The output-tool validator, when the manifest configures one.
    #[must_use]
    pub const fn output_validator(&self) -> Option<&OutputValidator> {
        self.output.as_ref()
    }

    /// Execute a response's tool calls in input order.
    ///
    /// Suspension short-circuits: the remaining calls do not run and
    /// the results accumulated so far are discarded for this step.
    pub async fn dispatch(
        &self,
        calls: &[ToolCallRecord],
        env: &RunEnv,
        messages: &[crate::message::Message],
        step_number: usize,
    ) -> DispatchOutcome {
        let mut results = Vec::with_capacity(calls.len());

        for call in calls {
            env.sink.emit(RunEvent::ToolCallStarted {
                id: call.id.clone(),
                name: call.name.clone(),
            });

            let Some(tool) = self.get(&call.name) else {
                warn!(tool = %call.name, "Unknown tool");
                results.push(error_text_result(call, format!("Unknown tool: {}", call.name)));
                self.finish_event(env, call, true);
                continue;
            };

            let input = match call.input_value() {
                Ok(value) => value,
                Err(err) => {
                    results.push(error_json_result(
                        call,
                        &format!("invalid tool input: {err}"),
                        Some("invalid_input"),
                    ));
                    self.finish_event(env, call, true);
                    continue;
                }
            };

            if tool.kind == ToolKind::Output {
                // Captured, not executed; validation belongs to the loop.
                results.push(ContentPart::tool_result(
                    &call.id,
                    &call.name,
                    ToolOutput::Json { value: input },
                ));
                self.finish_event(env, call, false);
                continue;
            }

            let Some(executor) = &tool.executor else {
                results.push(error_text_result(
                    call,
                    format!("Tool '{}' has no executor", call.name),
                ));
                self.finish_event(env, call, true);
                continue;
            };

            let ctx = ToolContext {
                cancellation: &env.cancellation,
                messages,
                step_number,
                manifest_id: &env.manifest.id,
                tool_call_id: &call.id,
            };

            match executor.execute(input, ctx).await {
                ToolOutcome::Success(value) => {
                    let output = match value {
                        Value::String(text) => ToolOutput::Text { value: text },
                        other => ToolOutput::Json { value: other },
                    };
                    results.push(ContentPart::tool_result(&call.id, &call.name, output));
                    self.finish_event(env, call, false);
                }
                ToolOutcome::Error(failure) => {
                    warn!(tool = %call.name, error = %failure.message, "Tool failed");
                    results.push(error_json_result(
                        call,
                        &failure.message,
                        failure.code.as_deref(),
                    ));
                    self.finish_event(env, call, true);
                }
                ToolOutcome::Suspended(inner) => {
                    debug!(tool = %call.name, call = %call.id, "Tool suspended; stopping batch");
                    return DispatchOutcome::Suspended {
                        tool_call_id: call.id.clone(),
                        inner,
                    };
                }
            }
        }

        DispatchOutcome::Completed(results)
    }

    fn finish_event(&self, env: &RunEnv, call: &ToolCallRecord, is_error: bool) {
        env.sink.emit(RunEvent::ToolCallFinished {
            id: call.id.clone(),
            name: call.name.clone(),
            is_error,
        });
    }
}

fn error_text_result(call: &ToolCallRecord, message: String) -> ContentPart {
    ContentPart::tool_result(&call.id, &call.name, ToolOutput::ErrorText { value: message })
}

fn error_json_result(call: &ToolCallRecord, message: &str, code: Option<&str>) -> ContentPart {
    ContentPart::tool_result(
        &call.id,
        &call.name,
        ToolOutput::ErrorJson {
            value: json!({"error": message, "code": code}),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockGateway;
    use crate::manifest::{AgentManifest, ManifestSet, OutputToolDef, ToolDef};
    use crate::runner::EventSink;
    use crate::runtime::RuntimeDeps;
    use crate::state::MemoryStateStore;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct Echo;

    #[async_trait]
    impl ToolExecutor for Echo {
        async fn execute(&self, input: Value, _ctx: ToolContext<'_>) -> ToolOutcome {
            ToolOutcome::Success(input["x"].clone())
        }
    }

    struct Failing;

    #[async_trait]
    impl ToolExecutor for Failing {
        async fn execute(&self, _input: Value, _ctx: ToolContext<'_>) -> ToolOutcome {
            ToolOutcome::Error(super::super::ToolFailure::new("boom").with_code("e_boom"))
        }
    }

    struct Suspending;

    #[async_trait]
    impl ToolExecutor for Suspending {
        async fn execute(&self, _input: Value, _ctx: ToolContext<'_>) -> ToolOutcome {
            ToolOutcome::Suspended(Box::new(SuspendedTool {
                suspensions: Vec::new(),
                run_id: "child-run".into(),
                manifest_id: "child".into(),
                manifest_version: "1".into(),
                suspension_stacks: Vec::new(),
            }))
        }
    }

    fn env_with(manifest: AgentManifest) -> RunEnv {
        let manifests =
            Arc::new(ManifestSet::validate(vec![manifest], "root").expect("valid set"));
        let manifest = Arc::clone(manifests.root());
        RunEnv {
            run_id: "run-1".into(),
            manifest,
            manifests,
            deps: Arc::new(RuntimeDeps::new(
                Arc::new(MemoryStateStore::new()),
                Arc::new(MockGateway::new()),
            )),
            sink: EventSink::disabled(),
            cancellation: CancellationToken::new(),
            timeout_override: None,
            children: Arc::default(),
        }
    }

    fn call(id: &str, name: &str, input: &str) -> ToolCallRecord {
        ToolCallRecord {
            id: id.into(),
            name: name.into(),
            input: input.into(),
        }
    }

    #[tokio::test]
    async fn string_success_becomes_text_others_json() {
        let manifest = AgentManifest::builder("root")
            .tool(ToolDef::new("echo", "Echo x back", json!({"type": "object"}), Arc::new(Echo)))
            .build();
        let env = env_with(manifest);
        let set = ToolSet::assemble(&env).await.unwrap();

        let outcome = set
            .dispatch(
                &[
                    call("c1", "echo", r#"{"x":"A"}"#),
                    call("c2", "echo", r#"{"x":{"n":1}}"#),
                ],
                &env,
                &[],
                1,
            )
            .await;

        let DispatchOutcome::Completed(results) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(results.len(), 2);
        let ContentPart::ToolResult { output, .. } = &results[0] else {
            panic!("expected tool result");
        };
        assert_eq!(*output, ToolOutput::Text { value: "A".into() });
        let ContentPart::ToolResult { output, .. } = &results[1] else {
            panic!("expected tool result");
        };
        assert_eq!(*output, ToolOutput::Json { value: json!({"n": 1}) });
    }

    #[tokio::test]
    async fn unknown_tool_is_a_synthetic_error_result() {
        let env = env_with(AgentManifest::builder("root").build());
        let set = ToolSet::assemble(&env).await.unwrap();

        let DispatchOutcome::Completed(results) =
            set.dispatch(&[call("c1", "ghost", "{}")], &env, &[], 1).await
        else {
            panic!("expected completion");
        };
        let ContentPart::ToolResult { output, is_error, .. } = &results[0] else {
            panic!("expected tool result");
        };
        assert!(is_error);
        assert_eq!(
            *output,
            ToolOutput::ErrorText {
                value: "Unknown tool: ghost".into()
            }
        );
    }

    #[tokio::test]
    async fn failures_become_error_json() {
        let manifest = AgentManifest::builder("root")
            .tool(ToolDef::new("bad", "Always fails", json!({"type": "object"}), Arc::new(Failing)))
            .build();
        let env = env_with(manifest);
        let set = ToolSet::assemble(&env).await.unwrap();

        let DispatchOutcome::Completed(results) =
            set.dispatch(&[call("c1", "bad", "{}")], &env, &[], 1).await
        else {
            panic!("expected completion");
        };
        let ContentPart::ToolResult { output, is_error, .. } = &results[0] else {
            panic!("expected tool result");
        };
        assert!(is_error);
        assert_eq!(
            *output,
            ToolOutput::ErrorJson {
                value: json!({"error": "boom", "code": "e_boom"})
            }
        );
    }

    #[tokio::test]
    async fn suspension_discards_earlier_results() {
        let manifest = AgentManifest::builder("root")
            .tool(ToolDef::new("echo", "Echo", json!({"type": "object"}), Arc::new(Echo)))
            .tool(ToolDef::new("wait", "Suspends", json!({"type": "object"}), Arc::new(Suspending)))
            .tool(ToolDef::new("late", "Never runs", json!({"type": "object"}), Arc::new(Failing)))
            .build();
        let env = env_with(manifest);
        let set = ToolSet::assemble(&env).await.unwrap();

        let outcome = set
            .dispatch(
                &[
                    call("c1", "echo", r#"{"x":"A"}"#),
                    call("c2", "wait", "{}"),
                    call("c3", "late", "{}"),
                ],
                &env,
                &[],
                1,
            )
            .await;

        let DispatchOutcome::Suspended { tool_call_id, inner } = outcome else {
            panic!("expected suspension");
        };
        assert_eq!(tool_call_id, "c2");
        assert_eq!(inner.run_id, "child-run");
    }

    #[tokio::test]
    async fn output_tool_input_is_captured_not_executed() {
        let manifest = AgentManifest::builder("root")
            .output_tool(OutputToolDef::new("submit", "Record", json!({"type": "object"})))
            .build();
        let env = env_with(manifest);
        let set = ToolSet::assemble(&env).await.unwrap();
        assert!(set.get("submit").is_some_and(RunTool::is_output));

        let DispatchOutcome::Completed(results) = set
            .dispatch(&[call("c1", "submit", r#"{"answer":"42"}"#)], &env, &[], 1)
            .await
        else {
            panic!("expected completion");
        };
        let ContentPart::ToolResult { output, is_error, .. } = &results[0] else {
            panic!("expected tool result");
        };
        assert!(!is_error);
        assert_eq!(
            *output,
            ToolOutput::Json {
                value: json!({"answer": "42"})
            }
        );
    }

    #[tokio::test]
    async fn active_tools_filter_definitions() {
        let manifest = AgentManifest::builder("root")
            .tool(ToolDef::new("echo", "Echo", json!({"type": "object"}), Arc::new(Echo)))
            .tool(ToolDef::new("bad", "Fails", json!({"type": "object"}), Arc::new(Failing)))
            .build();
        let env = env_with(manifest);
        let set = ToolSet::assemble(&env).await.unwrap();

        assert_eq!(set.definitions(None).len(), 2);
        let filtered = set.definitions(Some(&["echo".to_owned()]));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "echo");
    }
}
