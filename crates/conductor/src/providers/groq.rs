use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use super::base::{Completion, CompletionConfig, Provider, StreamCallback};
use super::configs::GroqProviderConfig;
use super::errors::ProviderError;
use super::factory::ProviderType;
use super::openai::OpenAiProvider;
use super::retry::RetryPolicy;
use crate::models::message::Message;
use crate::models::tool::{SchemaError, ToolSpec};

/// Groq serves an OpenAI compatible chat completions API, so requests are shaped and
/// parsed by the OpenAI adapter
pub struct GroqProvider {
    inner: OpenAiProvider,
}

impl GroqProvider {
    pub fn new(config: GroqProviderConfig) -> Result<Self> {
        Ok(Self {
            inner: OpenAiProvider::new(config)?,
        })
    }
}

#[async_trait]
impl Provider for GroqProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Groq
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.inner.retry_policy()
    }

    fn convert_messages(&self, messages: &[Message]) -> Vec<Value> {
        self.inner.convert_messages(messages)
    }

    fn convert_tools(&self, tools: &[ToolSpec]) -> Result<Vec<Value>, SchemaError> {
        self.inner.convert_tools(tools)
    }

    fn convert_config(&self, config: &CompletionConfig) -> Result<Value, ProviderError> {
        self.inner.convert_config(config)
    }

    async fn complete(
        &self,
        config: &CompletionConfig,
        on_chunk: Option<&StreamCallback>,
    ) -> Result<Completion, ProviderError> {
        self.inner.complete(config, on_chunk).await
    }
}
