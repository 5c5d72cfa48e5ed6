use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;

use troupe_core::config::{ModelConfig, RetryConfig};
use troupe_core::error::{Result, TroupeError};
use troupe_core::traits::LlmClient;
use troupe_core::types::*;

/// Wraps a client and retries transient failures with jittered
/// exponential backoff.
pub struct RetryingClient {
    inner: Box<dyn LlmClient>,
    policy: RetryConfig,
}

impl RetryingClient {
    pub fn new(inner: Box<dyn LlmClient>, policy: RetryConfig) -> Self {
        Self { inner, policy }
    }
}

/// Rate limits, server errors and transport hiccups are worth another try.
fn is_transient(e: &TroupeError) -> bool {
    let TroupeError::LlmRequest(msg) = e else {
        return false;
    };
    match http_status(msg) {
        Some(code) => code == 408 || code == 429 || code >= 500,
        None => {
            let msg = msg.to_ascii_lowercase();
            msg.contains("timeout") || msg.contains("timed out") || msg.contains("connection")
        }
    }
}

/// Status code from an `HTTP <code> ...` error message.
fn http_status(msg: &str) -> Option<u16> {
    let rest = msg.strip_prefix("HTTP ")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Delay schedule for successive retries.
struct Backoff<'a> {
    policy: &'a RetryConfig,
    attempt: u32,
}

impl<'a> Backoff<'a> {
    fn new(policy: &'a RetryConfig) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Next delay, or `None` once the retry budget is spent.
    fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_retries {
            return None;
        }
        let factor = 1u64.checked_shl(self.attempt).unwrap_or(u64::MAX);
        let base = self
            .policy
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.policy.max_backoff_ms);
        self.attempt += 1;
        // +/- 20% jitter
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        Some(Duration::from_millis((base as f64 * jitter) as u64))
    }
}

impl LlmClient for RetryingClient {
    fn chat(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<LlmResponse>> {
        let config = config.clone();
        Box::pin(async move {
            let mut backoff = Backoff::new(&self.policy);
            loop {
                let err = match self.inner.chat(&config, messages.clone()).await {
                    Ok(response) => return Ok(response),
                    Err(e) => e,
                };
                if !is_transient(&err) {
                    return Err(err);
                }
                let Some(delay) = backoff.next_delay() else {
                    return Err(err);
                };
                warn!(
                    model = %config.model_id,
                    attempt = backoff.attempt,
                    max_retries = self.policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying LLM request"
                );
                tokio::time::sleep(delay).await;
            }
        })
    }
}
