use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextContent {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageContent {
    /// Base64 encoded image bytes
    pub data: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningContent {
    pub text: String,
    #[serde(default)]
    pub redacted: bool,
    /// Provider signature that must accompany the reasoning when it is replayed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// A function call emitted by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallContent {
    pub id: String,
    pub fn_name: String,
    pub fn_args: Value,
    /// Set when the call cannot be executed as emitted, e.g. undecodable arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCallContent {
    pub fn new<I: Into<String>, N: Into<String>>(id: I, fn_name: N, fn_args: Value) -> Self {
        Self {
            id: id.into(),
            fn_name: fn_name.into(),
            fn_args,
            error: None,
        }
    }

    pub fn with_error<S: Into<String>>(mut self, error: S) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// The outcome of executing a [`ToolCallContent`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultContent {
    pub id: String,
    pub fn_name: String,
    pub result: String,
    #[serde(default)]
    pub error: bool,
    pub call: ToolCallContent,
}

impl ToolResultContent {
    pub fn success<S: Into<String>>(call: &ToolCallContent, result: S) -> Self {
        Self {
            id: call.id.clone(),
            fn_name: call.fn_name.clone(),
            result: result.into(),
            error: false,
            call: call.clone(),
        }
    }

    pub fn failure<S: Into<String>>(call: &ToolCallContent, message: S) -> Self {
        Self {
            error: true,
            ..Self::success(call, message)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
/// Content passed inside a message
pub enum ContentBlock {
    Text(TextContent),
    ToolCall(ToolCallContent),
    ToolResult(ToolResultContent),
    Reasoning(ReasoningContent),
    Image(ImageContent),
}

impl ContentBlock {
    pub fn text<S: Into<String>>(text: S) -> Self {
        ContentBlock::Text(TextContent { text: text.into() })
    }

    pub fn image<S: Into<String>, T: Into<String>>(data: S, mime_type: T) -> Self {
        ContentBlock::Image(ImageContent {
            data: data.into(),
            mime_type: mime_type.into(),
        })
    }

    pub fn reasoning<S: Into<String>>(text: S) -> Self {
        ContentBlock::Reasoning(ReasoningContent {
            text: text.into(),
            redacted: false,
            signature: None,
        })
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text(text) => Some(&text.text),
            _ => None,
        }
    }

    pub fn as_tool_call(&self) -> Option<&ToolCallContent> {
        match self {
            ContentBlock::ToolCall(call) => Some(call),
            _ => None,
        }
    }

    pub fn as_tool_result(&self) -> Option<&ToolResultContent> {
        match self {
            ContentBlock::ToolResult(result) => Some(result),
            _ => None,
        }
    }

    pub fn as_reasoning(&self) -> Option<&ReasoningContent> {
        match self {
            ContentBlock::Reasoning(reasoning) => Some(reasoning),
            _ => None,
        }
    }

    pub fn as_image(&self) -> Option<&ImageContent> {
        match self {
            ContentBlock::Image(image) => Some(image),
            _ => None,
        }
    }
}
