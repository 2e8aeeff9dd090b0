// ABOUTME: Utility functions shared by sources, sinks and the backend client
// ABOUTME: Provides bounded retry with fixed or linear backoff and URL sanitizing

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{SyncError, SyncResult};

/// How the delay grows between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every retry
    #[default]
    Fixed,
    /// Delay grows by the base delay each attempt (d, 2d, 3d, ...)
    Linear,
}

/// Bounded retry policy for connection-level operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 = no retries, just initial attempt)
    pub max_retries: u32,
    /// Base delay before the first retry
    pub delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(5),
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    /// A policy that performs exactly one attempt.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::ZERO,
            backoff: Backoff::Fixed,
        }
    }

    /// Delay to wait after the given failed attempt (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Linear => self.delay * (attempt + 1),
        }
    }
}

/// Retry an async operation with bounded backoff
///
/// Executes the operation and retries it while it fails with a retryable
/// [`SyncError`] (see [`SyncError::is_retryable`]). Non-retryable errors are
/// returned immediately so that partially applied multi-step operations are
/// never replayed.
///
/// # Arguments
///
/// * `operation` - Async function to retry (FnMut returning Future\<Output = SyncResult\<T\>\>)
/// * `policy` - Retry count and backoff
/// * `operation_name` - Name of the operation for logging
///
/// # Returns
///
/// Returns the successful result or the last error after all retries exhausted.
///
/// # Examples
///
/// ```no_run
/// # use appointment_sync::utils::{retry_with_backoff, RetryPolicy};
/// # use appointment_sync::error::SyncResult;
/// # async fn example() -> SyncResult<()> {
/// let value = retry_with_backoff(
///     || async { Ok("connected") },
///     RetryPolicy::default(),
///     "connect",
/// )
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T>(
    mut operation: F,
    policy: RetryPolicy,
    operation_name: &str,
) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = SyncResult<T>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name,
                    attempt + 1,
                    policy.max_retries + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() && policy.max_retries > 0 {
                    tracing::error!(
                        "{} failed after {} attempts",
                        operation_name,
                        policy.max_retries + 1
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Run a future with a deadline, mapping the timeout to the given error.
pub async fn with_timeout<T, F>(
    limit: Duration,
    future: F,
    on_timeout: impl FnOnce() -> SyncError,
) -> SyncResult<T>
where
    F: std::future::Future<Output = SyncResult<T>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout()),
    }
}

/// Sanitize a connection URL by masking the password component
pub fn sanitize_url(url: &str) -> String {
    if let Ok(mut parsed) = url::Url::parse(url) {
        if parsed.password().is_some() {
            let _ = parsed.set_password(Some("***"));
        }
        parsed.to_string()
    } else {
        // Not a URL (e.g. a plain file path for SQLite)
        url.to_string()
    }
}
