//! Exponential backoff shared by the RPC client and the side-effect pool.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Errors that can tell whether another attempt might succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts after the first one; 0 disables retrying.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Wait before retry number `retry`, counting from 1. Retry 0 is the
    /// first attempt and does not wait.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let Some(exponent) = retry.checked_sub(1) else {
            return Duration::ZERO;
        };
        let factor = self.backoff_multiplier.max(1.0).powi(exponent.min(64) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        if !millis.is_finite() || millis >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(millis as u64)
    }
}

/// Run `operation` until it succeeds, fails with a permanent error or runs
/// out of retries. The last error is returned.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let mut retry = 0;
    loop {
        let err = match operation().await {
            Ok(value) => {
                if retry > 0 {
                    tracing::info!("'{}' succeeded on retry {}", operation_name, retry);
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !err.is_retryable() || retry >= config.max_retries {
            if retry > 0 {
                tracing::error!(
                    "'{}' failed after {} attempts: {}",
                    operation_name,
                    retry + 1,
                    err
                );
            }
            return Err(err);
        }

        retry += 1;
        let delay = config.delay_for_attempt(retry);
        tracing::warn!(
            "'{}' failed ({}), retry {}/{} in {:?}",
            operation_name,
            err,
            retry,
            config.max_retries,
            delay
        );
        tokio::time::sleep(delay).await;
    }
}
