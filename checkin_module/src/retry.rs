use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::extractor::ModelError;

/// Bounded retry with exponential backoff around model calls.
///
/// Authorization failures are terminal and propagate immediately; timeouts,
/// malformed output and transient provider errors are retried up to the
/// bound, after which a distinguished `AiUnavailable` failure surfaces so
/// callers can substitute the fixed fallback message.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("model authorization failed: {0}")]
    Unauthorized(ModelError),
    #[error("ai unavailable after {attempts} attempts: {last}")]
    AiUnavailable { attempts: u32, last: ModelError },
}

impl RetryPolicy {
    /// For tests: no sleeping between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
        }
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ModelError>>,
    {
        let mut last_error: Option<ModelError> = None;
        for attempt in 1..=self.max_attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_terminal() => {
                    warn!("{} failed with terminal error: {}", label, err);
                    return Err(RetryError::Unauthorized(err));
                }
                Err(err) => {
                    warn!(
                        "{} attempt {}/{} failed: {}",
                        label, attempt, self.max_attempts, err
                    );
                    last_error = Some(err);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.delay_for(attempt)).await;
                    }
                }
            }
        }
        Err(RetryError::AiUnavailable {
            attempts: self.max_attempts,
            last: last_error
                .unwrap_or_else(|| ModelError::Http("no attempts made".to_string())),
        })
    }

    /// Delay before the retry following `attempt` (1-based): base doubling
    /// per attempt.
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}
