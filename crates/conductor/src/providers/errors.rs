use thiserror::Error;

use crate::models::tool::SchemaError;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// A single attempt hit a rate limit; retried by the request driver
    #[error("Rate limited ({status}): {message}")]
    RateLimited { status: u16, message: String },

    #[error("Rate limit persisted after {attempts} attempts")]
    RateLimitExhausted { attempts: u32 },

    #[error("Request aborted")]
    RequestAborted,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request failed: {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Context length exceeded. Message: {0}")]
    ContextLengthExceeded(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

impl ProviderError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ProviderError::RateLimited { .. })
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::InvalidResponse(err.to_string())
    }
}
