//! Retry with exponential backoff for network and filesystem sinks

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Message fragments that mark an error as transient regardless of code.
const TRANSIENT_FRAGMENTS: [&str; 4] = ["timeout", "connection", "network", "temporarily"];

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Additional error codes treated as retryable.
    pub retryable_codes: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            retryable_codes: Vec::new(),
        }
    }
}

/// Retry executor for operations that may fail transiently.
#[derive(Debug, Clone, Default)]
pub struct RetryManager {
    config: RetryConfig,
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay before retry `attempt` (0-based): `min(base * factor^k, max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay.as_millis() as f64;
        let scaled = base * self.config.backoff_factor.powi(attempt as i32);
        let capped = scaled.min(self.config.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Whether an error qualifies for another attempt.
    pub fn is_retryable(&self, error: &Error) -> bool {
        if error.is_retryable() {
            return true;
        }
        if self.config.retryable_codes.iter().any(|c| c == error.code()) {
            return true;
        }
        let message = error.to_string().to_lowercase();
        TRANSIENT_FRAGMENTS.iter().any(|f| message.contains(f))
    }

    /// Run `operation` with backoff. Non-retryable errors and the final
    /// attempt's error are propagated unchanged.
    pub async fn execute<F, Fut, T>(&self, name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation = name, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if attempt >= self.config.max_retries || !self.is_retryable(&error) {
                        return Err(error);
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation = name,
                        attempt,
                        %error,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after failure"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
