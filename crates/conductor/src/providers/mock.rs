use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use super::base::{Completion, CompletionConfig, Provider, StreamCallback, StreamChunk, Usage};
use super::errors::ProviderError;
use super::factory::ProviderType;
use super::retry::RetryPolicy;
use crate::models::message::Message;
use crate::models::tool::{SchemaError, ToolSpec};

/// A mock provider that returns pre-configured responses for testing
pub struct MockProvider {
    responses: Mutex<VecDeque<Result<Completion, ProviderError>>>,
    requests: Mutex<Vec<CompletionConfig>>,
    delay: Option<Duration>,
    retry_policy: RetryPolicy,
}

impl MockProvider {
    /// Create a new mock provider with a sequence of responses
    pub fn new(responses: Vec<Message>) -> Self {
        Self {
            responses: Mutex::new(
                responses
                    .into_iter()
                    .map(|message| Ok(Completion::new(message, Usage::new(10, 5))))
                    .collect(),
            ),
            requests: Mutex::new(Vec::new()),
            delay: None,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn push_completion(self, completion: Completion) -> Self {
        self.responses.lock().unwrap().push_back(Ok(completion));
        self
    }

    pub fn push_error(self, error: ProviderError) -> Self {
        self.responses.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Every request the provider has seen, oldest first
    pub fn requests(&self) -> Vec<CompletionConfig> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::OpenAi
    }

    fn model(&self) -> &str {
        "mock"
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    fn convert_messages(&self, messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|message| json!({"role": message.role, "content": message.text()}))
            .collect()
    }

    fn convert_tools(&self, tools: &[ToolSpec]) -> Result<Vec<Value>, SchemaError> {
        tools
            .iter()
            .map(|tool| Ok(json!({"name": tool.name, "schema": tool.input_schema()?})))
            .collect()
    }

    fn convert_config(&self, config: &CompletionConfig) -> Result<Value, ProviderError> {
        Ok(json!({
            "messages": self.convert_messages(&config.messages),
            "tools": self.convert_tools(&config.tools)?,
        }))
    }

    async fn complete(
        &self,
        config: &CompletionConfig,
        on_chunk: Option<&StreamCallback>,
    ) -> Result<Completion, ProviderError> {
        self.convert_config(config)?;
        self.requests.lock().unwrap().push(config.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.responses.lock().unwrap().pop_front();
        let completion = match next {
            Some(result) => result?,
            // Return empty response if no more pre-configured responses
            None => Completion::new(Message::assistant().with_text(""), Usage::default()),
        };

        if let Some(callback) = on_chunk {
            let text = completion.message.text();
            callback(&StreamChunk {
                delta: text.clone(),
                buffer: text,
                usage: completion.usage,
                stop_reason: completion.stop_reason.clone(),
            });
        }

        Ok(completion)
    }
}
