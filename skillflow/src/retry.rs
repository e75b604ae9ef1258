//! Retry execution with error classification and capped backoff.
//!
//! Call failures are classified from their message text and metadata;
//! only categories listed in the policy's `retry_on` set are retried.
//! The abort signal is honoured before every attempt and during backoff
//! sleeps, so a cancelled run never waits out a pending retry.

use crate::cancellation::AbortSignal;
use crate::errors::EngineError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Failure categories, in classification priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The run budget was exhausted. Never retried.
    BudgetExceeded,
    /// Authentication or authorization failure.
    AuthError,
    /// Missing model or resource.
    NotFound,
    /// Provider rate limiting.
    RateLimit,
    /// Provider-side 5xx-class failure.
    ServerError,
    /// A call attempt exceeded its deadline.
    Timeout,
    /// A response could not be parsed as the expected JSON.
    JsonParse,
    /// Anything else.
    Unknown,
}

/// Classifies an error from its variant and message text.
///
/// Text matching happens in priority order: budget, auth, not-found,
/// rate-limit, server, timeout, JSON parse, unknown.
#[must_use]
pub fn classify(error: &EngineError) -> ErrorCategory {
    match error {
        EngineError::BudgetExceeded { .. } => return ErrorCategory::BudgetExceeded,
        EngineError::Timeout(_) => return ErrorCategory::Timeout,
        _ => {}
    }

    let text = error.to_string().to_ascii_lowercase();
    if text.contains("budget") {
        ErrorCategory::BudgetExceeded
    } else if text.contains("401")
        || text.contains("403")
        || text.contains("unauthorized")
        || text.contains("forbidden")
        || text.contains("invalid api key")
        || text.contains("authentication")
    {
        ErrorCategory::AuthError
    } else if text.contains("404") || text.contains("not found") || text.contains("no such model") {
        ErrorCategory::NotFound
    } else if text.contains("429")
        || text.contains("rate limit")
        || text.contains("rate_limit")
        || text.contains("too many requests")
        || text.contains("quota")
    {
        ErrorCategory::RateLimit
    } else if text.contains("500")
        || text.contains("502")
        || text.contains("503")
        || text.contains("529")
        || text.contains("server error")
        || text.contains("internal error")
        || text.contains("overloaded")
        || text.contains("service unavailable")
        || text.contains("bad gateway")
    {
        ErrorCategory::ServerError
    } else if text.contains("timeout") || text.contains("timed out") || text.contains("deadline") {
        ErrorCategory::Timeout
    } else if text.contains("json") || text.contains("parse") || text.contains("unexpected token") {
        ErrorCategory::JsonParse
    } else {
        ErrorCategory::Unknown
    }
}

/// Extracts a "Retry-After: N" hint (seconds) from failure text.
#[must_use]
pub fn retry_after_hint(text: &str) -> Option<u64> {
    let lower = text.to_ascii_lowercase();
    let idx = lower.find("retry-after").or_else(|| lower.find("retry after"))?;
    let rest = &lower[idx + "retry-after".len()..];
    let digits: String = rest
        .chars()
        .skip_while(|c| *c == ':' || c.is_whitespace())
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

/// Configuration for the retry executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap applied after backoff growth and jitter.
    pub max_delay: Duration,
    /// Exponential growth factor.
    pub multiplier: f64,
    /// Categories that are retried; everything else propagates at once.
    pub retry_on: Vec<ErrorCategory>,
    /// Per-attempt deadline, separate from the run's abort signal.
    pub attempt_timeout: Duration,
    /// Whether to add up to 10% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            retry_on: vec![
                ErrorCategory::RateLimit,
                ErrorCategory::ServerError,
                ErrorCategory::Timeout,
            ],
            attempt_timeout: Duration::from_secs(120),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Preset for LLM calls where rate limiting dominates.
    #[must_use]
    pub fn llm_rate_limit() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// Preset for LLM calls where provider 5xx errors dominate.
    #[must_use]
    pub fn llm_server_error() -> Self {
        Self {
            max_attempts: 4,
            ..Self::default()
        }
    }

    /// Preset for ordinary tool calls.
    #[must_use]
    pub fn tool_call() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            attempt_timeout: Duration::from_secs(30),
            ..Self::default()
        }
    }

    /// Preset for external tool-protocol (MCP) calls.
    #[must_use]
    pub fn mcp_call() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(60),
            ..Self::default()
        }
    }

    /// Sets the attempt count.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Disables jitter, for deterministic tests.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Sets the per-attempt deadline.
    #[must_use]
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Computes the backoff delay before retry number `attempt`
    /// (0-based): `min(initial * multiplier^attempt + jitter, max)`.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let jitter = if self.jitter && base > 0.0 {
            rand::thread_rng().gen_range(0.0..=base * 0.10)
        } else {
            0.0
        };
        Duration::from_secs_f64((base + jitter).min(self.max_delay.as_secs_f64()))
    }
}

/// Successful result of a retried operation.
#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    /// The attempt function's value.
    pub value: T,
    /// How many attempts were made (1 = first try succeeded).
    pub attempts: u32,
    /// Total time slept between attempts.
    pub total_delay: Duration,
}

/// Runs `attempt_fn` under the policy until it succeeds, exhausts its
/// attempts, or hits a non-retryable failure.
///
/// Each attempt is wrapped in its own deadline. Cancellation is checked
/// before every attempt and interrupts backoff sleeps immediately.
///
/// # Errors
///
/// Propagates the last attempt's error, a [`EngineError::Timeout`] for
/// an attempt that exceeded its deadline, or
/// [`EngineError::Cancelled`] when the abort signal fires.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    abort: &AbortSignal,
    mut attempt_fn: F,
) -> Result<RetryOutcome<T>, EngineError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, EngineError>>,
{
    let mut total_delay = Duration::ZERO;
    let mut attempts = 0u32;

    loop {
        if abort.is_aborted() {
            return Err(cancelled(abort));
        }

        let result = match tokio::time::timeout(policy.attempt_timeout, attempt_fn()).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(policy.attempt_timeout)),
        };
        attempts += 1;

        let error = match result {
            Ok(value) => {
                return Ok(RetryOutcome {
                    value,
                    attempts,
                    total_delay,
                })
            }
            Err(error) => error,
        };

        if matches!(error, EngineError::Cancelled(_)) {
            return Err(error);
        }

        let category = classify(&error);
        if attempts >= policy.max_attempts || !policy.retry_on.contains(&category) {
            return Err(error);
        }

        let mut delay = policy.backoff_delay(attempts - 1);
        if let Some(secs) = retry_after_hint(&error.to_string()) {
            delay = delay.max(Duration::from_secs(secs));
        }

        debug!(
            attempt = attempts,
            category = ?category,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying after transient failure"
        );

        total_delay += delay;
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = abort.fired() => return Err(cancelled(abort)),
        }
    }
}

fn cancelled(abort: &AbortSignal) -> EngineError {
    EngineError::Cancelled(abort.reason().unwrap_or_else(|| "aborted".to_string()))
}
