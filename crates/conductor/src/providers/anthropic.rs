use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use super::base::{Completion, CompletionConfig, Provider, StreamCallback, ToolChoice, Usage};
use super::configs::{AnthropicProviderConfig, ANTHROPIC_DEFAULT_MAX_TOKENS};
use super::errors::ProviderError;
use super::factory::{validate_host, ProviderType};
use super::retry::RetryPolicy;
use super::utils::{
    consume_sse, convert_image, error_from_body, error_from_response, tool_call_from_parts,
    ImageFormat, StreamAccumulator,
};
use crate::models::content::{ContentBlock, ReasoningContent};
use crate::models::message::Message;
use crate::models::role::Role;
use crate::models::tool::{SchemaError, ToolSpec};

pub const ANTHROPIC_API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    config: AnthropicProviderConfig,
}

impl AnthropicProvider {
    pub fn new(mut config: AnthropicProviderConfig) -> Result<Self> {
        config.host = validate_host(&config.host)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    async fn post(&self, payload: &Value) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/v1/messages", self.config.host);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_API_VERSION)
            .json(payload)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(error_from_response(response, is_anthropic_rate_limit).await)
        }
    }
}

fn is_anthropic_rate_limit(error: &Value) -> bool {
    matches!(
        error.get("type").and_then(Value::as_str),
        Some("rate_limit_error") | Some("overloaded_error")
    )
}

fn get_usage(usage: &Value) -> Usage {
    let read = |key: &str| usage[key].as_u64().unwrap_or(0) as u32;
    Usage::new(read("input_tokens"), read("output_tokens")).with_cache(
        read("cache_creation_input_tokens"),
        read("cache_read_input_tokens"),
    )
}

fn block_to_message_content(block: &ContentBlock) -> Option<Value> {
    match block {
        ContentBlock::Text(text) if text.text.is_empty() => None,
        ContentBlock::Text(text) => Some(json!({"type": "text", "text": text.text})),
        ContentBlock::Image(image) => Some(convert_image(image, &ImageFormat::Anthropic)),
        ContentBlock::ToolCall(call) => Some(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.fn_name,
            "input": if call.fn_args.is_object() { call.fn_args.clone() } else { json!({}) },
        })),
        ContentBlock::ToolResult(result) => Some(json!({
            "type": "tool_result",
            "tool_use_id": result.id,
            "content": result.result,
            "is_error": result.error,
        })),
        ContentBlock::Reasoning(reasoning) if reasoning.redacted => Some(json!({
            "type": "redacted_thinking",
            "data": reasoning.text,
        })),
        // Thinking can only be replayed with the signature that came with it
        ContentBlock::Reasoning(reasoning) => reasoning.signature.as_ref().map(|signature| {
            json!({
                "type": "thinking",
                "thinking": reasoning.text,
                "signature": signature,
            })
        }),
    }
}

fn response_block_to_content(block: &Value) -> Option<ContentBlock> {
    match block["type"].as_str()? {
        "text" => Some(ContentBlock::text(block["text"].as_str().unwrap_or_default())),
        "tool_use" => {
            let id = block["id"].as_str().unwrap_or_default().to_string();
            let name = block["name"].as_str().unwrap_or_default().to_string();
            let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
            Some(ContentBlock::ToolCall(tool_call_from_parts(
                id,
                name,
                &input.to_string(),
            )))
        }
        "thinking" => Some(ContentBlock::Reasoning(ReasoningContent {
            text: block["thinking"].as_str().unwrap_or_default().to_string(),
            redacted: false,
            signature: block["signature"].as_str().map(str::to_string),
        })),
        "redacted_thinking" => Some(ContentBlock::Reasoning(ReasoningContent {
            text: block["data"].as_str().unwrap_or_default().to_string(),
            redacted: true,
            signature: None,
        })),
        _ => None,
    }
}

fn into_completion(
    content: Vec<ContentBlock>,
    usage: Usage,
    stop_reason: Option<String>,
) -> Result<Completion, ProviderError> {
    let has_output = content
        .iter()
        .any(|block| matches!(block, ContentBlock::Text(_) | ContentBlock::ToolCall(_)));
    if !has_output {
        return Err(ProviderError::InvalidResponse(
            "Anthropic response contained neither text nor tool use".to_string(),
        ));
    }

    let mut message = Message::assistant();
    message.content = content;
    let mut completion = Completion::new(message, usage);
    completion.stop_reason = stop_reason;
    Ok(completion)
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Anthropic
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.config.retry
    }

    fn convert_messages(&self, messages: &[Message]) -> Vec<Value> {
        let mut anthropic_messages = Vec::new();

        for message in messages {
            // Only a top level system prompt is accepted, inline system notes go in as user text
            let role = match message.role {
                Role::Assistant => "assistant",
                Role::User | Role::System => "user",
            };

            // Tool results must lead the content of a user turn
            let (results, others): (Vec<&ContentBlock>, Vec<&ContentBlock>) = message
                .content
                .iter()
                .partition(|block| matches!(block, ContentBlock::ToolResult(_)));
            let content: Vec<Value> = results
                .into_iter()
                .chain(others)
                .filter_map(block_to_message_content)
                .collect();

            if !content.is_empty() {
                anthropic_messages.push(json!({
                    "role": role,
                    "content": content,
                }));
            }
        }

        anthropic_messages
    }

    fn convert_tools(&self, tools: &[ToolSpec]) -> Result<Vec<Value>, SchemaError> {
        let mut tool_names = HashSet::new();
        tools
            .iter()
            .map(|tool| {
                if !tool_names.insert(&tool.name) {
                    return Err(SchemaError(format!("Duplicate tool name: {}", tool.name)));
                }
                Ok(json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.input_schema()?,
                }))
            })
            .collect()
    }

    fn convert_config(&self, config: &CompletionConfig) -> Result<Value, ProviderError> {
        let mut payload = json!({
            "model": self.config.model,
            "messages": self.convert_messages(&config.messages),
            "max_tokens": self.config.max_tokens.unwrap_or(ANTHROPIC_DEFAULT_MAX_TOKENS),
        });

        if let Some(system) = config.system_prompt() {
            payload["system"] = json!(system);
        }
        if !config.tools.is_empty() {
            payload["tools"] = json!(self.convert_tools(&config.tools)?);
            payload["tool_choice"] = match &config.tool_choice {
                ToolChoice::Auto => json!({"type": "auto"}),
                ToolChoice::Required => json!({"type": "any"}),
                ToolChoice::Tool(name) => json!({"type": "tool", "name": name}),
            };
        }
        if let Some(temp) = self.config.temperature {
            payload["temperature"] = json!(temp);
        }
        if config.stream {
            payload["stream"] = json!(true);
        }

        Ok(payload)
    }

    async fn complete(
        &self,
        config: &CompletionConfig,
        on_chunk: Option<&StreamCallback>,
    ) -> Result<Completion, ProviderError> {
        let payload = self.convert_config(config)?;
        tracing::debug!(
            provider = %self.provider_type(),
            model = %self.config.model,
            stream = config.stream,
            "sending completion request"
        );

        let response = self.post(&payload).await?;

        if config.stream {
            return consume_sse(response, AnthropicStreamAccumulator::default(), on_chunk).await;
        }

        let data: Value = response.json().await?;
        if data["type"] == "error" {
            return Err(error_from_body(200, &data, is_anthropic_rate_limit));
        }

        let content = data["content"]
            .as_array()
            .ok_or_else(|| ProviderError::InvalidResponse("missing content array".to_string()))?
            .iter()
            .filter_map(response_block_to_content)
            .collect();

        into_completion(
            content,
            get_usage(&data["usage"]),
            data["stop_reason"].as_str().map(str::to_string),
        )
    }
}

/// A content block being assembled from stream deltas
#[derive(Debug)]
enum PartialBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input: String,
    },
    Thinking {
        text: String,
        signature: Option<String>,
    },
    RedactedThinking(String),
}

/// Accumulates Anthropic message stream events. Blocks are keyed by their `index` and
/// finished in index order.
#[derive(Debug, Default)]
pub struct AnthropicStreamAccumulator {
    blocks: BTreeMap<u64, PartialBlock>,
    usage: Usage,
    stop_reason: Option<String>,
}

impl StreamAccumulator for AnthropicStreamAccumulator {
    fn apply(&mut self, data: &Value) -> Result<Option<String>, ProviderError> {
        let index = data["index"].as_u64().unwrap_or(0);

        match data["type"].as_str().unwrap_or_default() {
            "message_start" => {
                self.usage = get_usage(&data["message"]["usage"]);
            }
            "content_block_start" => {
                let block = &data["content_block"];
                let partial = match block["type"].as_str().unwrap_or_default() {
                    "tool_use" => PartialBlock::ToolUse {
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                        input: String::new(),
                    },
                    "thinking" => PartialBlock::Thinking {
                        text: block["thinking"].as_str().unwrap_or_default().to_string(),
                        signature: None,
                    },
                    "redacted_thinking" => PartialBlock::RedactedThinking(
                        block["data"].as_str().unwrap_or_default().to_string(),
                    ),
                    _ => PartialBlock::Text(block["text"].as_str().unwrap_or_default().to_string()),
                };
                self.blocks.insert(index, partial);
            }
            "content_block_delta" => {
                let delta = &data["delta"];
                let block = self.blocks.get_mut(&index).ok_or_else(|| {
                    ProviderError::Stream(format!("delta for unknown content block {}", index))
                })?;
                match (delta["type"].as_str().unwrap_or_default(), block) {
                    ("text_delta", PartialBlock::Text(text)) => {
                        let fragment = delta["text"].as_str().unwrap_or_default();
                        text.push_str(fragment);
                        return Ok(Some(fragment.to_string()));
                    }
                    ("input_json_delta", PartialBlock::ToolUse { input, .. }) => {
                        input.push_str(delta["partial_json"].as_str().unwrap_or_default());
                    }
                    ("thinking_delta", PartialBlock::Thinking { text, .. }) => {
                        text.push_str(delta["thinking"].as_str().unwrap_or_default());
                    }
                    ("signature_delta", PartialBlock::Thinking { signature, .. }) => {
                        *signature = delta["signature"].as_str().map(str::to_string);
                    }
                    (kind, _) => {
                        tracing::debug!(kind, index, "ignoring mismatched stream delta");
                    }
                }
            }
            "message_delta" => {
                if let Some(reason) = data["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(reason.to_string());
                }
                if let Some(output) = data["usage"]["output_tokens"].as_u64() {
                    self.usage.output_tokens = output as u32;
                }
            }
            "error" => return Err(error_from_body(200, data, is_anthropic_rate_limit)),
            // ping, content_block_stop, message_stop
            _ => {}
        }

        Ok(None)
    }

    fn usage(&self) -> Usage {
        self.usage
    }

    fn stop_reason(&self) -> Option<String> {
        self.stop_reason.clone()
    }

    fn finish(self) -> Result<Completion, ProviderError> {
        let content = self
            .blocks
            .into_values()
            .map(|block| match block {
                PartialBlock::Text(text) => ContentBlock::text(text),
                PartialBlock::ToolUse { id, name, input } => {
                    ContentBlock::ToolCall(tool_call_from_parts(id, name, &input))
                }
                PartialBlock::Thinking { text, signature } => {
                    ContentBlock::Reasoning(ReasoningContent {
                        text,
                        redacted: false,
                        signature,
                    })
                }
                PartialBlock::RedactedThinking(data) => ContentBlock::Reasoning(ReasoningContent {
                    text: data,
                    redacted: true,
                    signature: None,
                }),
            })
            .collect();

        into_completion(content, self.usage, self.stop_reason)
    }
}
