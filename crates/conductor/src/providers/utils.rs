use futures::StreamExt;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};

use super::base::{Completion, StreamCallback, StreamChunk, ToolChoice, Usage};
use super::errors::ProviderError;
use crate::models::content::{ContentBlock, ImageContent, ToolCallContent};
use crate::models::message::Message;
use crate::models::tool::{SchemaError, ToolSpec};

lazy_static! {
    static ref INVALID_FUNCTION_CHARS: Regex = Regex::new(r"[^a-zA-Z0-9_-]").unwrap();
    static ref VALID_FUNCTION_NAME: Regex = Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap();
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub enum ImageFormat {
    OpenAi,
    Anthropic,
}

/// Convert an image content into an image json based on format
pub fn convert_image(image: &ImageContent, image_format: &ImageFormat) -> Value {
    match image_format {
        ImageFormat::OpenAi => json!({
            "type": "image_url",
            "image_url": {
                "url": format!("data:{};base64,{}", image.mime_type, image.data)
            }
        }),
        ImageFormat::Anthropic => json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": image.mime_type,
                "data": image.data,
            }
        }),
    }
}

/// Convert canonical history to OpenAI's chat message list.
///
/// Tool results become `role: tool` messages placed ahead of any other content of the
/// same message, so they directly follow the assistant turn that requested them.
pub fn messages_to_openai_spec(messages: &[Message]) -> Vec<Value> {
    let mut messages_spec = Vec::new();

    for message in messages {
        let mut texts = Vec::new();
        let mut images = Vec::new();
        let mut tool_calls = Vec::new();
        let mut output = Vec::new();

        for content in &message.content {
            match content {
                ContentBlock::Text(text) => {
                    if !text.text.is_empty() {
                        texts.push(text.text.clone());
                    }
                }
                ContentBlock::Image(image) => images.push(convert_image(image, &ImageFormat::OpenAi)),
                ContentBlock::ToolCall(call) => {
                    tool_calls.push(json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": sanitize_function_name(&call.fn_name),
                            "arguments": call.fn_args.to_string(),
                        }
                    }));
                }
                ContentBlock::ToolResult(result) => {
                    let content = if result.error {
                        // A tool result error is shown as output so the model can interpret it
                        format!("The tool call returned the following error:\n{}", result.result)
                    } else {
                        result.result.clone()
                    };
                    output.push(json!({
                        "role": "tool",
                        "content": content,
                        "tool_call_id": result.id,
                    }));
                }
                ContentBlock::Reasoning(_) => {}
            }
        }

        let mut converted = json!({ "role": message.role });
        if !images.is_empty() {
            let mut parts: Vec<Value> = texts
                .iter()
                .map(|text| json!({"type": "text", "text": text}))
                .collect();
            parts.extend(images);
            converted["content"] = json!(parts);
        } else if !texts.is_empty() {
            converted["content"] = json!(texts.join("\n"));
        }
        if !tool_calls.is_empty() {
            converted["tool_calls"] = json!(tool_calls);
        }

        if converted.get("content").is_some() || converted.get("tool_calls").is_some() {
            output.push(converted);
        }
        messages_spec.extend(output);
    }

    messages_spec
}

/// Convert tool specs to OpenAI's function declarations
pub fn tools_to_openai_spec(tools: &[ToolSpec]) -> Result<Vec<Value>, SchemaError> {
    let mut tool_names = HashSet::new();
    let mut result = Vec::new();

    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(SchemaError(format!("Duplicate tool name: {}", tool.name)));
        }

        result.push(json!({
            "type": "function",
            "function": {
                "name": sanitize_function_name(&tool.name),
                "description": tool.description,
                "parameters": tool.input_schema()?,
            }
        }));
    }

    Ok(result)
}

pub fn tool_choice_to_openai_spec(tool_choice: &ToolChoice) -> Value {
    match tool_choice {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::Required => json!("required"),
        ToolChoice::Tool(name) => json!({
            "type": "function",
            "function": {"name": sanitize_function_name(name)}
        }),
    }
}

/// Build a tool call block from wire fields, recording why it cannot be executed if the
/// name is invalid or the arguments do not decode
pub fn tool_call_from_parts(id: String, name: String, arguments: &str) -> ToolCallContent {
    if !is_valid_function_name(&name) {
        let error = format!(
            "The provided function name '{}' had invalid characters, it must match this regex [a-zA-Z0-9_-]+",
            name
        );
        return ToolCallContent::new(id, name, Value::Null).with_error(error);
    }

    let arguments = if arguments.trim().is_empty() { "{}" } else { arguments };
    match serde_json::from_str::<Value>(arguments) {
        Ok(params) => ToolCallContent::new(id, name, params),
        Err(e) => {
            let error = format!("Could not interpret tool use parameters for id {}: {}", id, e);
            ToolCallContent::new(id, name, Value::Null).with_error(error)
        }
    }
}

/// Convert OpenAI's API response to a canonical assistant message
pub fn openai_response_to_message(response: &Value) -> Result<Message, ProviderError> {
    let original = &response["choices"][0]["message"];
    let mut message = Message::assistant();

    // An empty string is as good as no content
    if let Some(text) = original
        .get("content")
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
    {
        message = message.with_text(text);
    }

    if let Some(tool_calls) = original.get("tool_calls").and_then(Value::as_array) {
        for tool_call in tool_calls {
            let id = tool_call["id"].as_str().unwrap_or_default().to_string();
            let function_name = tool_call["function"]["name"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            let arguments = tool_call["function"]["arguments"]
                .as_str()
                .unwrap_or_default();
            message = message.with_content(ContentBlock::ToolCall(tool_call_from_parts(
                id,
                function_name,
                arguments,
            )));
        }
    }

    if message.is_empty() {
        return Err(ProviderError::InvalidResponse(
            "response contained neither content nor tool calls".to_string(),
        ));
    }
    Ok(message)
}

pub fn get_openai_usage(data: &Value) -> Usage {
    let usage = &data["usage"];
    let read = |value: &Value| value.as_u64().unwrap_or(0) as u32;
    Usage::new(read(&usage["prompt_tokens"]), read(&usage["completion_tokens"]))
        .with_cache(0, read(&usage["prompt_tokens_details"]["cached_tokens"]))
}

pub fn sanitize_function_name(name: &str) -> String {
    INVALID_FUNCTION_CHARS.replace_all(name, "_").to_string()
}

pub fn is_valid_function_name(name: &str) -> bool {
    VALID_FUNCTION_NAME.is_match(name)
}

pub fn check_context_length_error(error: &Value) -> Option<ProviderError> {
    let code = error.get("code").and_then(Value::as_str).unwrap_or_default();
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("Unknown error");
    if code == "context_length_exceeded"
        || code == "string_above_max_length"
        || message.contains("prompt is too long")
    {
        Some(ProviderError::ContextLengthExceeded(message.to_string()))
    } else {
        None
    }
}

/// Map an error body to a [`ProviderError`]. `is_rate_limit` recognises the provider's own
/// rate-limit error shape, which is honoured regardless of the HTTP status.
pub fn error_from_body(status: u16, body: &Value, is_rate_limit: fn(&Value) -> bool) -> ProviderError {
    let error = body.get("error").unwrap_or(body);
    let message = match error.get("message").and_then(Value::as_str) {
        Some(message) => message.to_string(),
        None => error.to_string(),
    };

    if status == 429 || is_rate_limit(error) {
        ProviderError::RateLimited { status, message }
    } else if let Some(err) = check_context_length_error(error) {
        err
    } else {
        ProviderError::Api { status, message }
    }
}

/// Read a non-success HTTP response into a [`ProviderError`]
pub async fn error_from_response(
    response: reqwest::Response,
    is_rate_limit: fn(&Value) -> bool,
) -> ProviderError {
    let status = response.status().as_u16();
    let text = match response.text().await {
        Ok(text) => text,
        Err(e) => return ProviderError::Http(e),
    };
    let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
    error_from_body(status, &body, is_rate_limit)
}

/// Folds the `data:` payloads of a server-sent event stream into a completion
pub trait StreamAccumulator {
    /// Apply one decoded payload, returning any text it added
    fn apply(&mut self, data: &Value) -> Result<Option<String>, ProviderError>;

    fn usage(&self) -> Usage;

    fn stop_reason(&self) -> Option<String>;

    /// Build the final completion from everything accumulated
    fn finish(self) -> Result<Completion, ProviderError>;
}

/// Extract the payload of an SSE `data:` line; other fields and comments yield `None`
pub fn sse_data(line: &str) -> Option<&str> {
    let line = line.trim_end_matches(['\r', '\n']);
    let data = line.strip_prefix("data:")?.trim_start();
    if data.is_empty() || data == "[DONE]" {
        None
    } else {
        Some(data)
    }
}

fn feed_line<A: StreamAccumulator>(
    accumulator: &mut A,
    line: &[u8],
) -> Result<Option<String>, ProviderError> {
    let line = std::str::from_utf8(line)
        .map_err(|e| ProviderError::Stream(format!("invalid UTF-8 in stream: {e}")))?;
    match sse_data(line) {
        Some(data) => {
            let value: Value = serde_json::from_str(data)
                .map_err(|e| ProviderError::Stream(format!("invalid JSON in stream: {e}")))?;
            accumulator.apply(&value)
        }
        None => Ok(None),
    }
}

/// Drive a streamed response to completion, reporting progress after every network chunk
pub async fn consume_sse<A: StreamAccumulator>(
    response: reqwest::Response,
    mut accumulator: A,
    on_chunk: Option<&StreamCallback>,
) -> Result<Completion, ProviderError> {
    let mut byte_stream = response.bytes_stream();
    // Bytes, not a String, so multi-byte characters split across chunks survive
    let mut pending: Vec<u8> = Vec::new();
    let mut buffer = String::new();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk?;
        pending.extend_from_slice(&chunk);

        let mut delta = String::new();
        while let Some(newline_pos) = pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = pending.drain(..=newline_pos).collect();
            if let Some(text) = feed_line(&mut accumulator, &line)? {
                delta.push_str(&text);
            }
        }

        buffer.push_str(&delta);
        if let Some(callback) = on_chunk {
            callback(&StreamChunk {
                delta,
                buffer: buffer.clone(),
                usage: accumulator.usage(),
                stop_reason: accumulator.stop_reason(),
            });
        }
    }

    if !pending.is_empty() {
        feed_line(&mut accumulator, &pending)?;
    }

    accumulator.finish()
}

#[derive(Debug, Default)]
struct ToolCallBuilder {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulates OpenAI chat completion chunks. Tool call fragments are keyed by their
/// `index` since ids and names only arrive in the first fragment.
#[derive(Debug, Default)]
pub struct OpenAiStreamAccumulator {
    text: String,
    tool_calls: BTreeMap<u64, ToolCallBuilder>,
    usage: Usage,
    stop_reason: Option<String>,
}

impl StreamAccumulator for OpenAiStreamAccumulator {
    fn apply(&mut self, data: &Value) -> Result<Option<String>, ProviderError> {
        if data.get("error").is_some() {
            return Err(error_from_body(200, data, is_openai_rate_limit));
        }

        if let Some(usage) = data.get("usage").filter(|usage| !usage.is_null()) {
            self.usage = get_openai_usage(&json!({ "usage": usage }));
        }

        let choice = &data["choices"][0];
        if let Some(reason) = choice["finish_reason"].as_str() {
            self.stop_reason = Some(reason.to_string());
        }

        let delta = &choice["delta"];
        if let Some(tool_calls) = delta["tool_calls"].as_array() {
            for fragment in tool_calls {
                let index = fragment["index"].as_u64().unwrap_or(0);
                let builder = self.tool_calls.entry(index).or_default();
                if let Some(id) = fragment["id"].as_str() {
                    builder.id = id.to_string();
                }
                if let Some(name) = fragment["function"]["name"].as_str() {
                    builder.name.push_str(name);
                }
                if let Some(arguments) = fragment["function"]["arguments"].as_str() {
                    builder.arguments.push_str(arguments);
                }
            }
        }

        match delta["content"].as_str() {
            Some(content) if !content.is_empty() => {
                self.text.push_str(content);
                Ok(Some(content.to_string()))
            }
            _ => Ok(None),
        }
    }

    fn usage(&self) -> Usage {
        self.usage
    }

    fn stop_reason(&self) -> Option<String> {
        self.stop_reason.clone()
    }

    fn finish(self) -> Result<Completion, ProviderError> {
        let mut message = Message::assistant();
        if !self.text.is_empty() {
            message = message.with_text(self.text);
        }
        for builder in self.tool_calls.into_values() {
            message = message.with_content(ContentBlock::ToolCall(tool_call_from_parts(
                builder.id,
                builder.name,
                &builder.arguments,
            )));
        }
        if message.is_empty() {
            return Err(ProviderError::InvalidResponse(
                "stream ended without content or tool calls".to_string(),
            ));
        }

        let mut completion = Completion::new(message, self.usage);
        completion.stop_reason = self.stop_reason;
        Ok(completion)
    }
}

pub fn is_openai_rate_limit(error: &Value) -> bool {
    let code = error.get("code").and_then(Value::as_str);
    let kind = error.get("type").and_then(Value::as_str);
    code == Some("rate_limit_exceeded") || kind == Some("rate_limit_exceeded")
}
