use serde::{Deserialize, Serialize};

use super::factory::ProviderType;
use super::retry::RetryPolicy;

pub const OPENAI_DEFAULT_HOST: &str = "https://api.openai.com";
pub const ANTHROPIC_DEFAULT_HOST: &str = "https://api.anthropic.com";
pub const GROQ_DEFAULT_HOST: &str = "https://api.groq.com/openai";
pub const GOOGLE_DEFAULT_HOST: &str = "https://generativelanguage.googleapis.com";

// Anthropic rejects requests without max_tokens
pub const ANTHROPIC_DEFAULT_MAX_TOKENS: u32 = 4096;

// Unified enum to wrap different provider configurations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ProviderConfig {
    OpenAi(OpenAiProviderConfig),
    Anthropic(AnthropicProviderConfig),
    Groq(GroqProviderConfig),
    Google(GoogleProviderConfig),
}

impl ProviderConfig {
    pub fn provider_type(&self) -> ProviderType {
        match self {
            ProviderConfig::OpenAi(_) => ProviderType::OpenAi,
            ProviderConfig::Anthropic(_) => ProviderType::Anthropic,
            ProviderConfig::Groq(_) => ProviderType::Groq,
            ProviderConfig::Google(_) => ProviderType::Google,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            ProviderConfig::OpenAi(config) => &config.model,
            ProviderConfig::Anthropic(config) => &config.model,
            ProviderConfig::Groq(config) => &config.model,
            ProviderConfig::Google(config) => &config.model,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAiProviderConfig {
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl OpenAiProviderConfig {
    pub fn new<K: Into<String>, M: Into<String>>(api_key: K, model: M) -> Self {
        Self {
            host: OPENAI_DEFAULT_HOST.to_string(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: None,
            max_tokens: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnthropicProviderConfig {
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl AnthropicProviderConfig {
    pub fn new<K: Into<String>, M: Into<String>>(api_key: K, model: M) -> Self {
        Self {
            host: ANTHROPIC_DEFAULT_HOST.to_string(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: None,
            max_tokens: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// Groq speaks the OpenAI wire format, so it shares the OpenAI configuration shape
pub type GroqProviderConfig = OpenAiProviderConfig;

impl GroqProviderConfig {
    pub fn groq<K: Into<String>, M: Into<String>>(api_key: K, model: M) -> Self {
        Self {
            host: GROQ_DEFAULT_HOST.to_string(),
            ..Self::new(api_key, model)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoogleProviderConfig {
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl GoogleProviderConfig {
    pub fn new<K: Into<String>, M: Into<String>>(api_key: K, model: M) -> Self {
        Self {
            host: GOOGLE_DEFAULT_HOST.to_string(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: None,
            max_tokens: None,
            retry: RetryPolicy::default(),
        }
    }
}
