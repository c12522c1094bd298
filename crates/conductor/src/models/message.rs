use super::content::{
    ContentBlock, ImageContent, ReasoningContent, TextContent, ToolCallContent, ToolResultContent,
};
use super::role::Role;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
/// A message to or from an LLM
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: Role,
    pub created: i64,
    pub content: Vec<ContentBlock>,
}

impl Message {
    fn with_role(role: Role) -> Self {
        Message {
            id: None,
            role,
            created: Utc::now().timestamp(),
            content: Vec::new(),
        }
    }

    /// Create a new user message with the current timestamp
    pub fn user() -> Self {
        Self::with_role(Role::User)
    }

    /// Create a new assistant message with the current timestamp
    pub fn assistant() -> Self {
        Self::with_role(Role::Assistant)
    }

    /// Create a new system message with the current timestamp
    pub fn system() -> Self {
        Self::with_role(Role::System)
    }

    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Assign a fresh id unless one is already present
    pub fn ensure_id(mut self) -> Self {
        if self.id.is_none() {
            self.id = Some(Uuid::new_v4().to_string());
        }
        self
    }

    /// Add any ContentBlock to the message
    pub fn with_content(mut self, content: ContentBlock) -> Self {
        self.content.push(content);
        self
    }

    /// Add text content to the message
    pub fn with_text<S: Into<String>>(self, text: S) -> Self {
        self.with_content(ContentBlock::text(text))
    }

    /// Add image content to the message
    pub fn with_image<S: Into<String>, T: Into<String>>(self, data: S, mime_type: T) -> Self {
        self.with_content(ContentBlock::image(data, mime_type))
    }

    /// Add reasoning content to the message
    pub fn with_reasoning<S: Into<String>>(self, text: S) -> Self {
        self.with_content(ContentBlock::reasoning(text))
    }

    /// Add a tool call to the message
    pub fn with_tool_call<I: Into<String>, N: Into<String>>(
        self,
        id: I,
        fn_name: N,
        fn_args: Value,
    ) -> Self {
        self.with_content(ContentBlock::ToolCall(ToolCallContent::new(
            id, fn_name, fn_args,
        )))
    }

    /// Add a tool result to the message
    pub fn with_tool_result(self, result: ToolResultContent) -> Self {
        self.with_content(ContentBlock::ToolResult(result))
    }

    pub fn texts(&self) -> Vec<&TextContent> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn tool_calls(&self) -> Vec<&ToolCallContent> {
        self.content
            .iter()
            .filter_map(ContentBlock::as_tool_call)
            .collect()
    }

    pub fn tool_results(&self) -> Vec<&ToolResultContent> {
        self.content
            .iter()
            .filter_map(ContentBlock::as_tool_result)
            .collect()
    }

    pub fn reasoning(&self) -> Vec<&ReasoningContent> {
        self.content
            .iter()
            .filter_map(ContentBlock::as_reasoning)
            .collect()
    }

    pub fn images(&self) -> Vec<&ImageContent> {
        self.content
            .iter()
            .filter_map(ContentBlock::as_image)
            .collect()
    }

    /// All text blocks joined by newlines
    pub fn text(&self) -> String {
        self.texts()
            .iter()
            .map(|text| text.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn has_tool_calls(&self) -> bool {
        self.content
            .iter()
            .any(|block| matches!(block, ContentBlock::ToolCall(_)))
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}
