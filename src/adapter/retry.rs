//! Bounded retry with exponential backoff for model backend calls.

use crate::error::AdapterError;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// How a single backend call went wrong.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    /// Worth another attempt: transport errors, 429, 5xx.
    #[error("transient: {0}")]
    Transient(String),

    /// The backend refused the request; retrying will not help.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The backend answered, but not in a shape we understand.
    #[error("malformed: {0}")]
    Malformed(String),
}

/// Attempt budget and base delay for one adapter call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay after the given failed attempt (1-based): base, 2·base, 4·base...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exponent)
    }
}

/// Run `op` until it succeeds, fails permanently, or the attempts run out.
///
/// `op` receives the 1-based attempt number.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, AdapterError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(ClientError::Transient(message)) => {
                warn!(
                    "{} attempt {}/{} failed: {}",
                    label, attempt, max_attempts, message
                );
                if attempt == max_attempts {
                    return Err(AdapterError::TransientFailure {
                        attempts: max_attempts,
                        message,
                    });
                }
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
            Err(ClientError::Rejected(message)) => return Err(AdapterError::Unavailable(message)),
            Err(ClientError::Malformed(message)) => {
                return Err(AdapterError::MalformedOutput(message))
            }
        }
    }

    Err(AdapterError::TransientFailure {
        attempts: max_attempts,
        message: format!("{} made no attempt", label),
    })
}
