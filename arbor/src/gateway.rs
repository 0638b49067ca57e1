//! The completions gateway consumed by the step loop.
//!
//! The runtime never talks to a model provider directly; it issues one
//! bounded completion per step through [`CompletionsGateway`] and
//! interprets the returned content parts. [`MockGateway`] scripts
//! responses per manifest id and is the test double used throughout the
//! crate's own suite.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::manifest::ProviderConfig;
use crate::message::{ContentPart, Message};
use crate::tool::ToolDefinition;
use crate::usage::Usage;

/// How the model is asked to pick tools for a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    /// The model decides freely.
    Auto,
    /// The model must not call tools.
    None,
    /// The model must call some tool.
    Required,
    /// The model must call the named tool.
    Tool(String),
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    /// Natural end of the response.
    Stop,
    /// The response was cut off by a length limit.
    Length,
    /// The model issued tool calls.
    ToolCalls,
    /// Content was filtered by the provider.
    ContentFilter,
    /// The provider reported an error finish.
    Error,
    /// Anything else.
    Other,
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool-calls",
            Self::ContentFilter => "content-filter",
            Self::Error => "error",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// A single-step completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Id of the manifest issuing the request, for routing and logging.
    pub manifest_id: String,
    /// Provider routing.
    pub provider: ProviderConfig,
    /// The conversation so far.
    pub messages: Vec<Message>,
    /// Tools offered for this step, already filtered by any active-tools
    /// restriction.
    pub tools: Vec<ToolDefinition>,
    /// Tool selection directive, if any.
    pub tool_choice: Option<ToolChoice>,
}

/// The model's response to one completion request.
#[derive(Debug, Clone)]
pub struct TextResponse {
    /// Assistant content parts: text, reasoning, tool calls, and
    /// possibly tool-approval requests.
    pub content: Vec<ContentPart>,
    /// Why generation stopped.
    pub finish_reason: FinishReason,
    /// Token usage for this step.
    pub usage: Usage,
    /// Provider warnings worth recording.
    pub warnings: Vec<String>,
}

impl TextResponse {
    /// A plain text response finishing with `stop`.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentPart::text(text)],
            finish_reason: FinishReason::Stop,
            usage: Usage::zero(),
            warnings: Vec::new(),
        }
    }

    /// A response issuing the given tool calls.
    #[must_use]
    pub fn tool_calls(calls: Vec<(&str, &str, Value)>) -> Self {
        let content = calls
            .into_iter()
            .map(|(id, name, input)| ContentPart::tool_call(id, name, &input))
            .collect();
        Self {
            content,
            finish_reason: FinishReason::ToolCalls,
            usage: Usage::zero(),
            warnings: Vec::new(),
        }
    }

    /// A response suspending on a tool-approval request.
    #[must_use]
    pub fn approval_request(
        approval_id: impl Into<String>,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        input: Value,
    ) -> Self {
        Self {
            content: vec![ContentPart::ApprovalRequest {
                approval_id: approval_id.into(),
                tool_call_id: tool_call_id.into(),
                tool_name: tool_name.into(),
                input,
            }],
            finish_reason: FinishReason::ToolCalls,
            usage: Usage::zero(),
            warnings: Vec::new(),
        }
    }

    /// Prepend a text part to the response content.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.content.insert(0, ContentPart::text(text));
        self
    }

    /// Prepend a reasoning part to the response content.
    #[must_use]
    pub fn with_reasoning(mut self, text: impl Into<String>) -> Self {
        self.content.insert(0, ContentPart::reasoning(text));
        self
    }

    /// Attach usage to the response.
    #[must_use]
    pub const fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    /// Override the finish reason.
    #[must_use]
    pub const fn with_finish_reason(mut self, reason: FinishReason) -> Self {
        self.finish_reason = reason;
        self
    }

    /// Concatenated text content of the response.
    #[must_use]
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Whether the response contains any tool-call parts.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.content
            .iter()
            .any(|part| matches!(part, ContentPart::ToolCall { .. }))
    }
}

/// A gateway that produces one bounded completion per call.
///
/// The step loop always requests exactly one model step; stop-condition
/// evaluation and tool execution live in the runtime, not the gateway.
/// Implementations surface provider failures as [`Error::Upstream`].
#[async_trait]
pub trait CompletionsGateway: Send + Sync {
    /// Issue a completion for the given request.
    async fn complete(&self, request: CompletionRequest) -> Result<TextResponse>;
}

enum MockReply {
    Response(Box<TextResponse>),
    Failure(String),
}

/// A scripted gateway for tests.
///
/// Responses are queued per manifest id and consumed in order; asking
/// for a step with an exhausted script is an upstream error, which keeps
/// tests deterministic. Every request is journaled for assertions.
#[derive(Default)]
pub struct MockGateway {
    scripts: Mutex<HashMap<String, VecDeque<MockReply>>>,
    journal: Mutex<Vec<CompletionRequest>>,
}

impl MockGateway {
    /// Create an empty mock gateway.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue responses for the given manifest id.
    pub fn script(&self, manifest_id: impl Into<String>, responses: Vec<TextResponse>) {
        let mut scripts = self.scripts.lock().expect("mock gateway scripts poisoned");
        scripts
            .entry(manifest_id.into())
            .or_default()
            .extend(responses.into_iter().map(|r| MockReply::Response(Box::new(r))));
    }

    /// Queue an upstream failure for the given manifest id.
    pub fn script_failure(&self, manifest_id: impl Into<String>, message: impl Into<String>) {
        let mut scripts = self.scripts.lock().expect("mock gateway scripts poisoned");
        scripts
            .entry(manifest_id.into())
            .or_default()
            .push_back(MockReply::Failure(message.into()));
    }

    /// All requests seen so far, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.journal.lock().expect("mock gateway journal poisoned").clone()
    }

    /// Number of requests issued for one manifest id.
    #[must_use]
    pub fn request_count(&self, manifest_id: &str) -> usize {
        self.journal
            .lock()
            .expect("mock gateway journal poisoned")
            .iter()
            .filter(|r| r.manifest_id == manifest_id)
            .count()
    }
}

impl std::fmt::Debug for MockGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockGateway").finish_non_exhaustive()
    }
}

#[async_trait]
impl CompletionsGateway for MockGateway {
    async fn complete(&self, request: CompletionRequest) -> Result<TextResponse> {
        let manifest_id = request.manifest_id.clone();
        self.journal
            .lock()
            .expect("mock gateway journal poisoned")
            .push(request);

        let reply = {
            let mut scripts = self.scripts.lock().expect("mock gateway scripts poisoned");
            scripts.get_mut(&manifest_id).and_then(VecDeque::pop_front)
        };

        match reply {
            Some(MockReply::Response(response)) => Ok(*response),
            Some(MockReply::Failure(message)) => Err(Error::upstream(message)),
            None => Err(Error::upstream(format!(
                "no scripted response for manifest '{manifest_id}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(manifest_id: &str) -> CompletionRequest {
        CompletionRequest {
            manifest_id: manifest_id.to_owned(),
            provider: ProviderConfig::default(),
            messages: vec![Message::user("hi")],
            tools: Vec::new(),
            tool_choice: None,
        }
    }

    #[tokio::test]
    async fn scripted_responses_consumed_in_order() {
        let gateway = MockGateway::new();
        gateway.script(
            "a",
            vec![TextResponse::text("first"), TextResponse::text("second")],
        );

        let r1 = gateway.complete(request("a")).await.unwrap();
        assert_eq!(r1.text_content(), "first");
        let r2 = gateway.complete(request("a")).await.unwrap();
        assert_eq!(r2.text_content(), "second");

        let err = gateway.complete(request("a")).await.unwrap_err();
        assert!(matches!(err, Error::Upstream(_)));
        assert_eq!(gateway.request_count("a"), 3);
    }

    #[tokio::test]
    async fn scripts_are_routed_by_manifest_id() {
        let gateway = MockGateway::new();
        gateway.script("a", vec![TextResponse::text("for a")]);
        gateway.script("b", vec![TextResponse::text("for b")]);

        let r = gateway.complete(request("b")).await.unwrap();
        assert_eq!(r.text_content(), "for b");
    }

    #[test]
    fn tool_call_response_shape() {
        let response =
            TextResponse::tool_calls(vec![("c1", "echo", json!({"x": "A"}))]).with_usage(Usage::new(3, 1));
        assert!(response.has_tool_calls());
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        assert_eq!(response.usage.total_tokens, 4);
    }
}
