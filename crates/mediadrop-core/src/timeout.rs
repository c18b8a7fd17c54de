//! Deadline racing for async operations.
//!
//! [`with_timeout`] runs an operation against a timer; whichever finishes first
//! decides the outcome. When the timer wins the operation future is dropped and
//! [`Error::TimedOut`] is returned. Work that cannot be preempted (a blocking
//! engine call on the blocking pool) keeps running in the background; pair it
//! with [`with_timeout_cancelling`] so the call is told to stop.
//!
//! The wrapper nests freely: the orchestrator uses it around the whole engine
//! call (hours) and around the artwork fallback step (seconds).

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Race `operation` against a `limit` deadline.
///
/// The operation's own result or error propagates unchanged when it finishes
/// first.
pub async fn with_timeout<T, F>(limit: Duration, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => {
            debug!(limit_secs = limit.as_secs_f64(), "Operation lost the race against its deadline");
            Err(Error::TimedOut { after: limit })
        }
    }
}

/// Like [`with_timeout`], but also cancels `token` when the deadline wins.
///
/// Use this when the operation hands `token` to work that outlives the future,
/// such as a blocking engine call.
pub async fn with_timeout_cancelling<T, F>(
    limit: Duration,
    token: &CancellationToken,
    operation: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let result = with_timeout(limit, operation).await;
    if matches!(result, Err(Error::TimedOut { .. })) {
        token.cancel();
    }
    result
}

/// Whether an error came from a lost deadline race.
#[must_use]
pub const fn is_timeout(error: &Error) -> bool {
    matches!(error, Error::TimedOut { .. })
}
