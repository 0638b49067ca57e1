//! Message and content-part types for agent-model communication.
//!
//! A [`Message`] carries either a plain string or an ordered sequence of
//! [`ContentPart`]s. Tool-call inputs are stored as canonical JSON strings
//! so that a round-trip through persistence reproduces the exact call the
//! model issued.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message providing instructions.
    System,
    /// User message.
    User,
    /// Assistant (model) message.
    Assistant,
    /// Tool results message.
    Tool,
}

impl Role {
    /// Get the string representation of the role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// Output of a tool call, tagged by shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ToolOutput {
    /// Plain text output.
    Text {
        /// The text value.
        value: String,
    },
    /// Structured JSON output.
    Json {
        /// The JSON value.
        value: Value,
    },
    /// A failure described as text.
    ErrorText {
        /// The error message.
        value: String,
    },
    /// A failure described as JSON (`{error, code}`).
    ErrorJson {
        /// The error payload.
        value: Value,
    },
    /// Rich content output (nested parts).
    Content {
        /// The content parts.
        value: Vec<ContentPart>,
    },
}

impl ToolOutput {
    /// Check whether this output encodes a failure.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::ErrorText { .. } | Self::ErrorJson { .. })
    }
}

/// A single part of a message's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ContentPart {
    /// Plain text.
    Text {
        /// The text.
        text: String,
    },
    /// Model reasoning text.
    Reasoning {
        /// The reasoning text.
        text: String,
    },
    /// A tool call issued by the model. The input is a canonical JSON
    /// string, preserved byte-for-byte across persistence.
    ToolCall {
        /// Unique identifier of the call.
        id: String,
        /// Name of the tool being called.
        name: String,
        /// Canonical JSON input string.
        input: String,
    },
    /// The result of a tool call.
    ToolResult {
        /// Identifier of the call this result answers.
        id: String,
        /// Name of the tool.
        name: String,
        /// The output payload.
        output: ToolOutput,
        /// Whether the tool failed.
        #[serde(default)]
        is_error: bool,
    },
    /// A file reference. Large binary data lives in external storage;
    /// the url is refreshed when state is read back.
    File {
        /// MIME type of the file.
        media_type: String,
        /// Location of the data.
        url: String,
    },
    /// A source citation.
    Source {
        /// Location of the source.
        url: String,
        /// Optional human-readable title.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    /// A model-emitted request for human approval of a tool call. Its
    /// presence in a response suspends the run.
    #[serde(rename = "tool-approval-request")]
    ApprovalRequest {
        /// Identifier the approval must quote to resume.
        approval_id: String,
        /// The tool call awaiting approval.
        tool_call_id: String,
        /// Name of the tool awaiting approval.
        tool_name: String,
        /// The proposed input.
        input: Value,
    },
    /// The human's answer to an approval request, injected on resume.
    #[serde(rename = "tool-approval-response")]
    ApprovalResponse {
        /// Identifier of the approval being answered.
        approval_id: String,
        /// Whether the call was approved.
        approved: bool,
        /// Optional payload supplied with the decision.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}

impl ContentPart {
    /// Create a text part.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create a reasoning part.
    #[must_use]
    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::Reasoning { text: text.into() }
    }

    /// Create a tool-call part, canonicalizing the input to a JSON string.
    #[must_use]
    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, input: &Value) -> Self {
        Self::ToolCall {
            id: id.into(),
            name: name.into(),
            input: input.to_string(),
        }
    }

    /// Create a successful tool-result part.
    #[must_use]
    pub fn tool_result(id: impl Into<String>, name: impl Into<String>, output: ToolOutput) -> Self {
        let is_error = output.is_error();
        Self::ToolResult {
            id: id.into(),
            name: name.into(),
            output,
            is_error,
        }
    }
}

/// Content of a message: a plain string or an ordered part sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text content.
    Text(String),
    /// Structured content parts.
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Collect the concatenated text of this content.
    #[must_use]
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// View the content parts, if structured.
    #[must_use]
    pub fn parts(&self) -> &[ContentPart] {
        match self {
            Self::Text(_) => &[],
            Self::Parts(parts) => parts,
        }
    }
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender.
    pub role: Role,
    /// Content of the message.
    pub content: MessageContent,
}

impl Message {
    /// Create a new system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(content.into()),
        }
    }

    /// Create a new user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(content.into()),
        }
    }

    /// Create a new plain-text assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(content.into()),
        }
    }

    /// Create a message with structured parts. An assistant message whose
    /// content is a single text part collapses to a plain string.
    #[must_use]
    pub fn with_parts(role: Role, mut parts: Vec<ContentPart>) -> Self {
        if parts.len() == 1
            && matches!(parts[0], ContentPart::Text { .. })
            && let Some(ContentPart::Text { text }) = parts.pop()
        {
            return Self {
                role,
                content: MessageContent::Text(text),
            };
        }
        Self {
            role,
            content: MessageContent::Parts(parts),
        }
    }

    /// Create a tool message carrying result parts.
    #[must_use]
    pub const fn tool_results(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Parts(parts),
        }
    }

    /// Create a user message answering an approval request.
    #[must_use]
    pub fn approval_response(approval_id: impl Into<String>, approved: bool, data: Option<Value>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Parts(vec![ContentPart::ApprovalResponse {
                approval_id: approval_id.into(),
                approved,
                data,
            }]),
        }
    }

    /// Get the concatenated text content of the message.
    #[must_use]
    pub fn text(&self) -> String {
        self.content.text()
    }

    /// Iterate the tool-call parts of this message.
    pub fn tool_calls(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.content.parts().iter().filter_map(|part| match part {
            ContentPart::ToolCall { id, name, input } => {
                Some((id.as_str(), name.as_str(), input.as_str()))
            }
            _ => None,
        })
    }
}
