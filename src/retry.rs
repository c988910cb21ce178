//! Transient-failure retry for Azure DevOps calls.
//!
//! ADO throttles aggressively (429 plus `Retry-After`) and its 5xx blips
//! usually clear within a few seconds, so the policy here leans on more
//! attempts with a short first delay rather than long waits. Only errors
//! classified transient by [`is_retryable_error`] are retried; a 404 on a
//! deleted work item or a bad JSON patch surfaces immediately.
//!
//! # Examples
//!
//! ```rust,no_run
//! use ado_mcp::retry::{retry_transient, RetryConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryConfig { max_attempts: 2, ..RetryConfig::default() };
//! let value = retry_transient(policy, || async {
//!     Ok::<_, ado_mcp::Error>(7)
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;

/// Retry policy for ADO calls.
///
/// The delay doubles after each failed attempt, from `base_delay` up to
/// `max_delay`, and every sleep is scattered by ±20% so the items of one
/// bulk operation do not re-hit a throttling service in lockstep.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total tries, the first one included.
    pub max_attempts: u32,

    /// Sleep before the second try.
    pub base_delay: Duration,

    /// Ceiling on any single sleep.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    /// Tuned for ADO's throttling behavior: four tries covers the common
    /// one-or-two-window 429 burst without stretching a bulk call past its
    /// HTTP timeout budget.
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(20),
        }
    }
}

impl RetryConfig {
    /// Sleep before the retry that follows failed attempt `attempt`
    /// (1-based).
    fn backoff(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(16);
        let uncapped = self.base_delay.saturating_mul(1u32 << doublings);
        let capped = uncapped.min(self.max_delay);
        // ±20% scatter
        capped.mul_f64(0.8 + rand::random::<f64>() * 0.4)
    }
}

/// Determine if an error is transient and worth retrying.
///
/// 5xx statuses, 429s, timeouts, and transport-level failures retry; 4xx
/// statuses other than 429, validation errors, and configuration problems
/// do not.
pub fn is_retryable_error(error: &Error) -> bool {
    match error {
        Error::Upstream { status, .. } => *status >= 500,
        Error::RateLimited(_) => true,
        Error::Timeout => true,
        Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        _ => false,
    }
}

/// Run `operation`, retrying while it fails with a transient error and
/// attempts remain. The error that stops the loop is the one returned,
/// whether it was non-retryable or simply the last straw.
pub async fn retry_transient<F, Fut, T>(config: RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let budget = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !is_retryable_error(&err) || attempt >= budget {
            return Err(err);
        }
        tokio::time::sleep(config.backoff(attempt)).await;
        attempt += 1;
    }
}
