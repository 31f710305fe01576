//! Exponential-backoff retry wrapper for fallible async operations.
//!
//! Retryability is decided per error through the [`Retryable`] trait: a known
//! network error code, a transient HTTP status, or a tell-tale message.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

// ---

/// Network error codes worth retrying.
pub const RETRYABLE_CODES: &[&str] = &[
    "ECONNRESET",
    "ETIMEDOUT",
    "ENOTFOUND",
    "ECONNREFUSED",
    "EHOSTUNREACH",
    "EPIPE",
    "EAI_AGAIN",
];

/// HTTP statuses worth retrying.
pub const RETRYABLE_STATUSES: &[u16] = &[408, 429, 500, 502, 503, 504];

/// Lower-cased message fragments that mark an error as transient.
pub const RETRYABLE_MESSAGES: &[&str] = &[
    "network",
    "timeout",
    "connection",
    "econnreset",
    "socket hang up",
];

/// Classification hooks for errors passed through [`RetryHandler`].
pub trait Retryable: std::fmt::Display {
    /// errno-style code of the underlying failure, if any.
    fn error_code(&self) -> Option<&'static str> {
        None
    }

    /// HTTP status of the failed response, if any.
    fn http_status(&self) -> Option<u16> {
        None
    }

    /// Failures no retry can fix, such as a request that could not be built.
    fn is_permanent(&self) -> bool {
        false
    }

    /// Text matched against [`RETRYABLE_MESSAGES`]; `None` skips the message check.
    fn retry_message(&self) -> Option<String> {
        Some(self.to_string())
    }

    fn is_retryable(&self) -> bool {
        // ---
        if self.is_permanent() {
            return false;
        }
        if let Some(code) = self.error_code() {
            if RETRYABLE_CODES.contains(&code) {
                return true;
            }
        }
        if let Some(status) = self.http_status() {
            if RETRYABLE_STATUSES.contains(&status) {
                return true;
            }
        }
        self.retry_message().is_some_and(|message| {
            let message = message.to_lowercase();
            RETRYABLE_MESSAGES.iter().any(|m| message.contains(m))
        })
    }
}

/// Backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    // ---
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound (exclusive) of the random jitter added to each delay.
    pub jitter_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            jitter_max: Duration::from_millis(1000),
        }
    }
}

/// Failure returned by [`RetryHandler::execute`].
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Every attempt failed with a retryable error.
    #[error("operation failed after {retries} retries: {source}")]
    Exhausted {
        retries: u32,
        #[source]
        source: E,
    },

    /// The first failure was not retryable.
    #[error(transparent)]
    Fatal(E),
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// The error of the final attempt.
    pub fn last_error(&self) -> &E {
        match self {
            RetryError::Exhausted { source, .. } => source,
            RetryError::Fatal(e) => e,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { source, .. } => source,
            RetryError::Fatal(e) => e,
        }
    }
}

/// Runs an operation until it succeeds, fails non-retryably, or runs out of retries.
#[derive(Debug, Clone)]
pub struct RetryHandler {
    policy: RetryPolicy,
}

impl RetryHandler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Same policy, capped to `max_attempts` total attempts.
    pub fn with_max_attempts(&self, max_attempts: u32) -> Self {
        // ---
        let mut policy = self.policy.clone();
        policy.max_retries = policy.max_retries.min(max_attempts.saturating_sub(1));
        Self { policy }
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        // ---
        let factor = 2u32.saturating_pow(attempt);
        self.policy
            .initial_delay
            .saturating_mul(factor)
            .min(self.policy.max_delay)
    }

    fn delay(&self, attempt: u32) -> Duration {
        // ---
        let jitter_ms = self.policy.jitter_max.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..jitter_ms))
        };
        self.base_delay(attempt) + jitter
    }

    /// Run `op`, retrying retryable failures with exponential backoff.
    pub async fn execute<T, E, F, Fut>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::error::Error + 'static,
    {
        // ---
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(RetryError::Fatal(e)),
                Err(e) if attempt >= self.policy.max_retries => {
                    return Err(RetryError::Exhausted {
                        retries: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retryable failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
