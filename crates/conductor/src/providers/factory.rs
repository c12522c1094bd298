use super::{
    anthropic::AnthropicProvider, base::Provider, configs::ProviderConfig,
    google::GoogleProvider, groq::GroqProvider, openai::OpenAiProvider,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum_macros::{Display, EnumIter};

#[derive(EnumIter, Display, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProviderType {
    OpenAi,
    Anthropic,
    Groq,
    Google,
}

pub fn get_provider(config: ProviderConfig) -> Result<Arc<dyn Provider>> {
    match config {
        ProviderConfig::OpenAi(openai_config) => Ok(Arc::new(OpenAiProvider::new(openai_config)?)),
        ProviderConfig::Anthropic(anthropic_config) => {
            Ok(Arc::new(AnthropicProvider::new(anthropic_config)?))
        }
        ProviderConfig::Groq(groq_config) => Ok(Arc::new(GroqProvider::new(groq_config)?)),
        ProviderConfig::Google(google_config) => Ok(Arc::new(GoogleProvider::new(google_config)?)),
    }
}

/// Parse and normalise a configured host, rejecting anything that is not an http(s) URL
pub(crate) fn validate_host(host: &str) -> Result<String> {
    let url = url::Url::parse(host)?;
    if !matches!(url.scheme(), "http" | "https") {
        anyhow::bail!("Unsupported scheme in provider host: {}", host);
    }
    Ok(host.trim_end_matches('/').to_string())
}
