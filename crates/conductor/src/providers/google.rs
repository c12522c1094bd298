use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;

use super::base::{Completion, CompletionConfig, Provider, StreamCallback, ToolChoice, Usage};
use super::configs::GoogleProviderConfig;
use super::errors::ProviderError;
use super::factory::{validate_host, ProviderType};
use super::retry::RetryPolicy;
use super::utils::{
    consume_sse, error_from_body, error_from_response, sanitize_function_name, StreamAccumulator,
};
use crate::models::content::{ContentBlock, ReasoningContent, ToolCallContent};
use crate::models::message::Message;
use crate::models::role::Role;
use crate::models::tool::{SchemaError, ToolSpec};

pub struct GoogleProvider {
    client: Client,
    config: GoogleProviderConfig,
}

impl GoogleProvider {
    pub fn new(mut config: GoogleProviderConfig) -> Result<Self> {
        config.host = validate_host(&config.host)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    async fn post(&self, payload: &Value, stream: bool) -> Result<reqwest::Response, ProviderError> {
        let url = if stream {
            format!(
                "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
                self.config.host, self.config.model
            )
        } else {
            format!(
                "{}/v1beta/models/{}:generateContent",
                self.config.host, self.config.model
            )
        };

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(payload)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(error_from_response(response, is_google_rate_limit).await)
        }
    }
}

fn is_google_rate_limit(error: &Value) -> bool {
    error.get("status").and_then(Value::as_str) == Some("RESOURCE_EXHAUSTED")
        || error.get("code").and_then(Value::as_u64) == Some(429)
}

fn get_usage(data: &Value) -> Usage {
    let usage = &data["usageMetadata"];
    let read = |key: &str| usage[key].as_u64().unwrap_or(0) as u32;
    Usage::new(read("promptTokenCount"), read("candidatesTokenCount"))
        .with_cache(0, read("cachedContentTokenCount"))
}

/// Gemini function calls carry no ids, so each one is given a fresh id
fn function_call_block(call: &Value) -> ContentBlock {
    let id = format!("call_{}", nanoid::nanoid!());
    let name = call["name"].as_str().unwrap_or_default();
    let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
    ContentBlock::ToolCall(ToolCallContent::new(id, name, args))
}

/// Convert the parts of the first candidate into content blocks
fn parts_to_content(data: &Value) -> Vec<ContentBlock> {
    let Some(parts) = data["candidates"][0]["content"]["parts"].as_array() else {
        return Vec::new();
    };

    parts
        .iter()
        .filter_map(|part| {
            if let Some(call) = part.get("functionCall") {
                return Some(function_call_block(call));
            }
            let text = part.get("text").and_then(Value::as_str)?;
            if part["thought"].as_bool().unwrap_or(false) {
                Some(ContentBlock::Reasoning(ReasoningContent {
                    text: text.to_string(),
                    redacted: false,
                    signature: None,
                }))
            } else {
                Some(ContentBlock::text(text))
            }
        })
        .collect()
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
            "Gemini response contained neither text nor function calls".to_string(),
        ));
    }

    let mut message = Message::assistant();
    message.content = content;
    let mut completion = Completion::new(message, usage);
    completion.stop_reason = stop_reason;
    Ok(completion)
}

#[async_trait]
impl Provider for GoogleProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Google
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.config.retry
    }

    fn convert_messages(&self, messages: &[Message]) -> Vec<Value> {
        let mut contents = Vec::new();

        for message in messages {
            let role = match message.role {
                Role::Assistant => "model",
                Role::User | Role::System => "user",
            };

            let parts: Vec<Value> = message
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text(text) if text.text.is_empty() => None,
                    ContentBlock::Text(text) => Some(json!({"text": text.text})),
                    ContentBlock::Image(image) => Some(json!({
                        "inlineData": {"mimeType": image.mime_type, "data": image.data}
                    })),
                    ContentBlock::ToolCall(call) => Some(json!({
                        "functionCall": {
                            "name": sanitize_function_name(&call.fn_name),
                            "args": if call.fn_args.is_object() { call.fn_args.clone() } else { json!({}) },
                        }
                    })),
                    ContentBlock::ToolResult(result) => {
                        let key = if result.error { "error" } else { "content" };
                        let mut response = serde_json::Map::new();
                        response.insert(key.to_string(), json!(result.result));
                        Some(json!({
                            "functionResponse": {
                                "name": sanitize_function_name(&result.fn_name),
                                "response": response,
                            }
                        }))
                    }
                    ContentBlock::Reasoning(_) => None,
                })
                .collect();

            if !parts.is_empty() {
                contents.push(json!({"role": role, "parts": parts}));
            }
        }

        contents
    }

    fn convert_tools(&self, tools: &[ToolSpec]) -> Result<Vec<Value>, SchemaError> {
        let mut tool_names = HashSet::new();
        let mut declarations = Vec::new();

        for tool in tools {
            if !tool_names.insert(&tool.name) {
                return Err(SchemaError(format!("Duplicate tool name: {}", tool.name)));
            }

            let mut declaration = json!({
                "name": sanitize_function_name(&tool.name),
                "description": tool.description,
            });
            // Gemini rejects object schemas without properties
            if !tool.params.is_empty() {
                declaration["parameters"] = tool.input_schema()?;
            }
            declarations.push(declaration);
        }

        Ok(vec![json!({ "functionDeclarations": declarations })])
    }

    fn convert_config(&self, config: &CompletionConfig) -> Result<Value, ProviderError> {
        let mut payload = json!({
            "contents": self.convert_messages(&config.messages),
        });

        if let Some(system) = config.system_prompt() {
            payload["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        if !config.tools.is_empty() {
            payload["tools"] = json!(self.convert_tools(&config.tools)?);
            payload["toolConfig"] = match &config.tool_choice {
                ToolChoice::Auto => json!({"functionCallingConfig": {"mode": "AUTO"}}),
                ToolChoice::Required => json!({"functionCallingConfig": {"mode": "ANY"}}),
                ToolChoice::Tool(name) => json!({
                    "functionCallingConfig": {
                        "mode": "ANY",
                        "allowedFunctionNames": [sanitize_function_name(name)],
                    }
                }),
            };
        }

        let mut generation_config = serde_json::Map::new();
        if let Some(temp) = self.config.temperature {
            generation_config.insert("temperature".to_string(), json!(temp));
        }
        if let Some(tokens) = self.config.max_tokens {
            generation_config.insert("maxOutputTokens".to_string(), json!(tokens));
        }
        if !generation_config.is_empty() {
            payload["generationConfig"] = Value::Object(generation_config);
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

        let response = self.post(&payload, config.stream).await?;

        if config.stream {
            return consume_sse(response, GoogleStreamAccumulator::default(), on_chunk).await;
        }

        let data: Value = response.json().await?;
        if data.get("error").is_some() {
            return Err(error_from_body(200, &data, is_google_rate_limit));
        }

        into_completion(
            parts_to_content(&data),
            get_usage(&data),
            data["candidates"][0]["finishReason"]
                .as_str()
                .map(str::to_string),
        )
    }
}

/// Gemini streams whole response objects; text parts are appended and function calls
/// arrive complete
#[derive(Debug, Default)]
pub struct GoogleStreamAccumulator {
    content: Vec<ContentBlock>,
    usage: Usage,
    stop_reason: Option<String>,
}

impl StreamAccumulator for GoogleStreamAccumulator {
    fn apply(&mut self, data: &Value) -> Result<Option<String>, ProviderError> {
        if data.get("error").is_some() {
            return Err(error_from_body(200, data, is_google_rate_limit));
        }
        if data.get("usageMetadata").is_some() {
            self.usage = get_usage(data);
        }
        if let Some(reason) = data["candidates"][0]["finishReason"].as_str() {
            self.stop_reason = Some(reason.to_string());
        }

        let mut delta = String::new();
        for block in parts_to_content(data) {
            if let ContentBlock::Text(text) = &block {
                delta.push_str(&text.text);
                if let Some(ContentBlock::Text(last)) = self.content.last_mut() {
                    last.text.push_str(&text.text);
                    continue;
                }
            }
            self.content.push(block);
        }

        Ok(if delta.is_empty() { None } else { Some(delta) })
    }

    fn usage(&self) -> Usage {
        self.usage
    }

    fn stop_reason(&self) -> Option<String> {
        self.stop_reason.clone()
    }

    fn finish(self) -> Result<Completion, ProviderError> {
        into_completion(self.content, self.usage, self.stop_reason)
    }
}
