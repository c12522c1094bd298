use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::base::{Completion, CompletionConfig, Provider, StreamCallback};
use super::errors::ProviderError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;

/// Exponential backoff applied when a provider reports a rate limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    /// `min(2^attempt * base, max)`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = 2u64
            .checked_pow(attempt)
            .and_then(|factor| factor.checked_mul(self.base_delay_ms))
            .unwrap_or(u64::MAX)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Drive a completion through rate-limit retries until it succeeds, fails terminally,
/// or `cancel` fires.
pub async fn make_completion_request(
    provider: &dyn Provider,
    config: &CompletionConfig,
    on_chunk: Option<&StreamCallback>,
    cancel: &CancellationToken,
) -> Result<Completion, ProviderError> {
    let policy = provider.retry_policy();
    let mut attempt: u32 = 0;

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::RequestAborted),
            result = provider.complete(config, on_chunk) => result,
        };

        match result {
            Err(err) if err.is_rate_limit() => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    tracing::error!(
                        provider = %provider.provider_type(),
                        attempts = attempt,
                        "rate limit persisted, giving up"
                    );
                    return Err(ProviderError::RateLimitExhausted { attempts: attempt });
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                tracing::warn!(
                    provider = %provider.provider_type(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "rate limited, backing off"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ProviderError::RequestAborted),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            other => return other,
        }
    }
}
