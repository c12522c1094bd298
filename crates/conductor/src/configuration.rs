use ::config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use crate::middleware::DEFAULT_MAX_MIDDLEWARE_RETRIES;
use crate::providers::configs::{
    AnthropicProviderConfig, GoogleProviderConfig, GroqProviderConfig, OpenAiProviderConfig,
    ProviderConfig, ANTHROPIC_DEFAULT_HOST, GOOGLE_DEFAULT_HOST, GROQ_DEFAULT_HOST,
    OPENAI_DEFAULT_HOST,
};
use crate::providers::factory::ProviderType;
use crate::providers::retry::RetryPolicy;

pub const ENV_PREFIX: &str = "CONDUCTOR";
pub const DEFAULT_MAX_TOOL_ROUNDS: u32 = 25;

pub const OPENAI_DEFAULT_MODEL: &str = "gpt-4o";
pub const ANTHROPIC_DEFAULT_MODEL: &str = "claude-3-5-sonnet-latest";
pub const GROQ_DEFAULT_MODEL: &str = "llama-3.3-70b-versatile";
pub const GOOGLE_DEFAULT_MODEL: &str = "gemini-1.5-flash";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {env_var}")]
    MissingEnvVar { env_var: String },
    #[error("Configuration error: {0}")]
    Other(#[from] ::config::ConfigError),
}

/// Map a configuration key to the environment variable that sets it
pub fn to_env_var(field: &str) -> String {
    let key = match field {
        "provider" => "provider.type".to_string(),
        // Only provider settings have required fields
        field if !field.contains('.') => format!("provider.{}", field),
        field => field.to_string(),
    };
    format!("{}_{}", ENV_PREFIX, key.replace('.', "__").to_uppercase())
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentSettings {
    /// Newest messages sent per request; everything when unset
    #[serde(default)]
    pub history_limit: Option<usize>,
    #[serde(default = "default_max_middleware_retries")]
    pub max_middleware_retries: u32,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    #[serde(default)]
    pub stream: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            history_limit: None,
            max_middleware_retries: default_max_middleware_retries(),
            max_tool_rounds: default_max_tool_rounds(),
            stream: false,
        }
    }
}

fn default_max_middleware_retries() -> u32 {
    DEFAULT_MAX_MIDDLEWARE_RETRIES
}

fn default_max_tool_rounds() -> u32 {
    DEFAULT_MAX_TOOL_ROUNDS
}

/// Fields shared by every provider. Host and model fall back to the provider's defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProviderFields {
    #[serde(default)]
    pub host: Option<String>,
    pub api_key: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum ProviderSettings {
    OpenAi(ProviderFields),
    Anthropic(ProviderFields),
    Groq(ProviderFields),
    Google(ProviderFields),
}

impl ProviderSettings {
    pub fn provider_type(&self) -> ProviderType {
        match self {
            ProviderSettings::OpenAi(_) => ProviderType::OpenAi,
            ProviderSettings::Anthropic(_) => ProviderType::Anthropic,
            ProviderSettings::Groq(_) => ProviderType::Groq,
            ProviderSettings::Google(_) => ProviderType::Google,
        }
    }

    pub fn into_config(self) -> ProviderConfig {
        match self {
            ProviderSettings::OpenAi(fields) => {
                let (host, model) = fields.resolve(OPENAI_DEFAULT_HOST, OPENAI_DEFAULT_MODEL);
                ProviderConfig::OpenAi(OpenAiProviderConfig {
                    host,
                    api_key: fields.api_key,
                    model,
                    temperature: fields.temperature,
                    max_tokens: fields.max_tokens,
                    retry: fields.retry,
                })
            }
            ProviderSettings::Anthropic(fields) => {
                let (host, model) =
                    fields.resolve(ANTHROPIC_DEFAULT_HOST, ANTHROPIC_DEFAULT_MODEL);
                ProviderConfig::Anthropic(AnthropicProviderConfig {
                    host,
                    api_key: fields.api_key,
                    model,
                    temperature: fields.temperature,
                    max_tokens: fields.max_tokens,
                    retry: fields.retry,
                })
            }
            ProviderSettings::Groq(fields) => {
                let (host, model) = fields.resolve(GROQ_DEFAULT_HOST, GROQ_DEFAULT_MODEL);
                ProviderConfig::Groq(GroqProviderConfig {
                    host,
                    api_key: fields.api_key,
                    model,
                    temperature: fields.temperature,
                    max_tokens: fields.max_tokens,
                    retry: fields.retry,
                })
            }
            ProviderSettings::Google(fields) => {
                let (host, model) = fields.resolve(GOOGLE_DEFAULT_HOST, GOOGLE_DEFAULT_MODEL);
                ProviderConfig::Google(GoogleProviderConfig {
                    host,
                    api_key: fields.api_key,
                    model,
                    temperature: fields.temperature,
                    max_tokens: fields.max_tokens,
                    retry: fields.retry,
                })
            }
        }
    }
}

impl ProviderFields {
    fn resolve(&self, default_host: &str, default_model: &str) -> (String, String) {
        (
            self.host.clone().unwrap_or_else(|| default_host.to_string()),
            self.model.clone().unwrap_or_else(|| default_model.to_string()),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub agent: AgentSettings,
    pub provider: ProviderSettings,
}

impl Settings {
    /// Defaults overlaid with `CONDUCTOR_*` environment variables
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Defaults, then the TOML file at `path` if given, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("agent.max_middleware_retries", DEFAULT_MAX_MIDDLEWARE_RETRIES)?
            .set_default("agent.max_tool_rounds", DEFAULT_MAX_TOOL_ROUNDS)?
            .set_default("agent.stream", false)?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        match config.try_deserialize::<Self>() {
            Ok(settings) => Ok(settings),
            Err(err) => {
                tracing::debug!(error = ?err, "configuration error");

                let message = err.to_string();
                if message.starts_with("missing field") {
                    // "missing field `api_key`"
                    let field = message
                        .trim_start_matches("missing field `")
                        .split('`')
                        .next()
                        .unwrap_or_default();
                    Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(field),
                    })
                } else if let ::config::ConfigError::NotFound(field) = &err {
                    Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(field),
                    })
                } else {
                    Err(ConfigError::Other(err))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::fs;

    fn clean_env() {
        for (key, _) in env::vars() {
            if key.starts_with("CONDUCTOR_") {
                env::remove_var(&key);
            }
        }
    }

    #[test]
    #[serial]
    fn test_default_settings() {
        clean_env();
        env::set_var("CONDUCTOR_PROVIDER__TYPE", "openai");
        env::set_var("CONDUCTOR_PROVIDER__API_KEY", "test-key");

        let settings = Settings::new().unwrap();
        assert_eq!(settings.agent, AgentSettings::default());
        assert_eq!(settings.provider.provider_type(), ProviderType::OpenAi);

        match settings.provider.into_config() {
            ProviderConfig::OpenAi(config) => {
                assert_eq!(config.host, OPENAI_DEFAULT_HOST);
                assert_eq!(config.api_key, "test-key");
                assert_eq!(config.model, OPENAI_DEFAULT_MODEL);
                assert_eq!(config.temperature, None);
                assert_eq!(config.retry, RetryPolicy::default());
            }
            other => panic!("Expected OpenAI provider, got {:?}", other),
        }

        clean_env();
    }

    #[test]
    #[serial]
    fn test_environment_override() {
        clean_env();
        env::set_var("CONDUCTOR_PROVIDER__TYPE", "anthropic");
        env::set_var("CONDUCTOR_PROVIDER__API_KEY", "sk-ant");
        env::set_var("CONDUCTOR_PROVIDER__MODEL", "claude-3-haiku-20240307");
        env::set_var("CONDUCTOR_PROVIDER__TEMPERATURE", "0.7");
        env::set_var("CONDUCTOR_PROVIDER__MAX_TOKENS", "2000");
        env::set_var("CONDUCTOR_PROVIDER__RETRY__MAX_ATTEMPTS", "2");
        env::set_var("CONDUCTOR_AGENT__MAX_TOOL_ROUNDS", "3");
        env::set_var("CONDUCTOR_AGENT__HISTORY_LIMIT", "10");

        let settings = Settings::new().unwrap();
        assert_eq!(settings.agent.max_tool_rounds, 3);
        assert_eq!(settings.agent.history_limit, Some(10));
        assert_eq!(settings.agent.max_middleware_retries, 5);

        match settings.provider.into_config() {
            ProviderConfig::Anthropic(config) => {
                assert_eq!(config.host, ANTHROPIC_DEFAULT_HOST);
                assert_eq!(config.model, "claude-3-haiku-20240307");
                assert_eq!(config.temperature, Some(0.7));
                assert_eq!(config.max_tokens, Some(2000));
                assert_eq!(config.retry.max_attempts, 2);
                assert_eq!(config.retry.base_delay_ms, 1000);
            }
            other => panic!("Expected Anthropic provider, got {:?}", other),
        }

        clean_env();
    }

    #[test]
    #[serial]
    fn test_toml_file_then_environment() {
        clean_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conductor.toml");
        fs::write(
            &path,
            "[agent]\nstream = true\n\n[provider]\ntype = \"google\"\napi_key = \"from-file\"\n",
        )
        .unwrap();
        env::set_var("CONDUCTOR_PROVIDER__API_KEY", "from-env");

        let settings = Settings::load(Some(&path)).unwrap();
        assert!(settings.agent.stream);
        match settings.provider.into_config() {
            ProviderConfig::Google(config) => {
                assert_eq!(config.api_key, "from-env");
                assert_eq!(config.model, GOOGLE_DEFAULT_MODEL);
                assert_eq!(config.host, GOOGLE_DEFAULT_HOST);
            }
            other => panic!("Expected Google provider, got {:?}", other),
        }

        clean_env();
    }

    #[test]
    #[serial]
    fn test_missing_api_key_names_env_var() {
        clean_env();
        env::set_var("CONDUCTOR_PROVIDER__TYPE", "groq");

        match Settings::new() {
            Err(ConfigError::MissingEnvVar { env_var }) => {
                assert_eq!(env_var, "CONDUCTOR_PROVIDER__API_KEY")
            }
            other => panic!("Expected MissingEnvVar, got {:?}", other),
        }

        clean_env();
    }

    #[test]
    #[serial]
    fn test_missing_provider_names_type_var() {
        clean_env();

        match Settings::new() {
            Err(ConfigError::MissingEnvVar { env_var }) => {
                assert_eq!(env_var, "CONDUCTOR_PROVIDER__TYPE")
            }
            other => panic!("Expected MissingEnvVar, got {:?}", other),
        }
    }

    #[test]
    fn test_to_env_var() {
        assert_eq!(to_env_var("agent.max_tool_rounds"), "CONDUCTOR_AGENT__MAX_TOOL_ROUNDS");
        assert_eq!(to_env_var("api_key"), "CONDUCTOR_PROVIDER__API_KEY");
    }
}
