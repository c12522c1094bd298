use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ops::AddAssign;
use std::sync::Arc;

use super::errors::ProviderError;
use super::factory::ProviderType;
use super::retry::RetryPolicy;
use crate::models::message::Message;
use crate::models::tool::{SchemaError, ToolSpec};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_write_tokens: u32,
    pub cache_read_tokens: u32,
}

impl Usage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            ..Default::default()
        }
    }

    pub fn with_cache(mut self, cache_write_tokens: u32, cache_read_tokens: u32) -> Self {
        self.cache_write_tokens = cache_write_tokens;
        self.cache_read_tokens = cache_read_tokens;
        self
    }

    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
    }
}

/// A model response together with what it cost
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub message: Message,
    pub usage: Usage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

impl Completion {
    pub fn new(message: Message, usage: Usage) -> Self {
        Self {
            message,
            usage,
            stop_reason: None,
        }
    }

    pub fn with_stop_reason<S: Into<String>>(mut self, stop_reason: S) -> Self {
        self.stop_reason = Some(stop_reason.into());
        self
    }
}

/// Progress report emitted after every network chunk of a streamed completion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Text received in this chunk
    pub delta: String,
    /// All text received so far
    pub buffer: String,
    pub usage: Usage,
    pub stop_reason: Option<String>,
}

pub type StreamCallback = Arc<dyn Fn(&StreamChunk) + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "name")]
pub enum ToolChoice {
    #[default]
    Auto,
    Required,
    Tool(String),
}

/// A provider agnostic completion request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionConfig {
    pub system: Vec<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub tool_choice: ToolChoice,
    pub stream: bool,
}

impl CompletionConfig {
    pub fn new(system: Vec<String>, messages: Vec<Message>) -> Self {
        Self {
            system,
            messages,
            ..Default::default()
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool_choice(mut self, tool_choice: ToolChoice) -> Self {
        self.tool_choice = tool_choice;
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// System prompts joined into one block, for wire formats with a single system slot
    pub fn system_prompt(&self) -> Option<String> {
        let prompts: Vec<&str> = self
            .system
            .iter()
            .map(String::as_str)
            .filter(|prompt| !prompt.trim().is_empty())
            .collect();
        if prompts.is_empty() {
            None
        } else {
            Some(prompts.join("\n\n"))
        }
    }
}

/// Base trait for AI providers (OpenAI, Anthropic, etc)
#[async_trait]
pub trait Provider: Send + Sync {
    fn provider_type(&self) -> ProviderType;

    fn model(&self) -> &str;

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    /// Translate canonical history into the provider's message list
    fn convert_messages(&self, messages: &[Message]) -> Vec<Value>;

    /// Translate tool specs into the provider's tool declarations
    fn convert_tools(&self, tools: &[ToolSpec]) -> Result<Vec<Value>, SchemaError>;

    /// Build the full request body
    fn convert_config(&self, config: &CompletionConfig) -> Result<Value, ProviderError>;

    /// Make a single attempt at a completion. Retries and cancellation are handled by
    /// [`make_completion_request`](super::retry::make_completion_request).
    async fn complete(
        &self,
        config: &CompletionConfig,
        on_chunk: Option<&StreamCallback>,
    ) -> Result<Completion, ProviderError>;
}
