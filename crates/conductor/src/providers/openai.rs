use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

use super::base::{Completion, CompletionConfig, Provider, StreamCallback};
use super::configs::OpenAiProviderConfig;
use super::errors::ProviderError;
use super::factory::{validate_host, ProviderType};
use super::retry::RetryPolicy;
use super::utils::{
    consume_sse, error_from_body, error_from_response, get_openai_usage, is_openai_rate_limit,
    messages_to_openai_spec, openai_response_to_message, tool_choice_to_openai_spec,
    tools_to_openai_spec, OpenAiStreamAccumulator,
};
use crate::models::message::Message;
use crate::models::tool::{SchemaError, ToolSpec};

pub struct OpenAiProvider {
    client: Client,
    config: OpenAiProviderConfig,
}

impl OpenAiProvider {
    pub fn new(mut config: OpenAiProviderConfig) -> Result<Self> {
        config.host = validate_host(&config.host)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    async fn post(&self, payload: &Value) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.config.host);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(payload)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(error_from_response(response, is_openai_rate_limit).await)
        }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::OpenAi
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.config.retry
    }

    fn convert_messages(&self, messages: &[Message]) -> Vec<Value> {
        messages_to_openai_spec(messages)
    }

    fn convert_tools(&self, tools: &[ToolSpec]) -> Result<Vec<Value>, SchemaError> {
        tools_to_openai_spec(tools)
    }

    fn convert_config(&self, config: &CompletionConfig) -> Result<Value, ProviderError> {
        let mut messages_array: Vec<Value> = config
            .system
            .iter()
            .filter(|prompt| !prompt.trim().is_empty())
            .map(|prompt| json!({"role": "system", "content": prompt}))
            .collect();
        messages_array.extend(self.convert_messages(&config.messages));

        let mut payload = json!({
            "model": self.config.model,
            "messages": messages_array,
        });

        if !config.tools.is_empty() {
            payload["tools"] = json!(self.convert_tools(&config.tools)?);
            payload["tool_choice"] = tool_choice_to_openai_spec(&config.tool_choice);
        }
        if let Some(temp) = self.config.temperature {
            payload["temperature"] = json!(temp);
        }
        if let Some(tokens) = self.config.max_tokens {
            payload["max_tokens"] = json!(tokens);
        }
        if config.stream {
            payload["stream"] = json!(true);
            payload["stream_options"] = json!({"include_usage": true});
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
            return consume_sse(response, OpenAiStreamAccumulator::default(), on_chunk).await;
        }

        let data: Value = response.json().await?;
        // Some compatible endpoints report errors with a 200 status
        if data.get("error").is_some() {
            return Err(error_from_body(200, &data, is_openai_rate_limit));
        }

        let message = openai_response_to_message(&data)?;
        let mut completion = Completion::new(message, get_openai_usage(&data));
        completion.stop_reason = data["choices"][0]["finish_reason"]
            .as_str()
            .map(str::to_string);
        Ok(completion)
    }
}
