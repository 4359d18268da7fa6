//! Bounded, cancellable retry for control socket readiness.
//!
//! The VM process creates its control socket some time after the supervisor
//! accepts the start job. Until then, connecting fails with `NotFound` (no
//! socket file yet) or `ConnectionRefused` (stale file, nobody listening).
//! Both are treated as "not ready yet" and retried on a fixed interval.

use crate::errors::{VmletError, VmletResult};
use std::future::Future;
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

/// Readiness retry parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first attempt.
    pub grace: Duration,
    /// Delay between a failed attempt and the next one.
    pub interval: Duration,
    /// Total attempts, including the first. At least 1.
    pub max_attempts: u32,
    /// Upper bound on a single connect attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(500),
            interval: Duration::from_millis(500),
            max_attempts: 20,
            attempt_timeout: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    /// Worst-case time spent waiting between attempts, excluding attempt time.
    pub fn max_wait(&self) -> Duration {
        self.grace + self.interval * self.max_attempts.saturating_sub(1)
    }
}

/// Run `attempt` until it succeeds, fails permanently, or runs out of attempts.
///
/// Only errors for which [`VmletError::is_transient`] holds are retried.
/// `exhausted` builds the error returned after the last transient failure.
/// Every wait is raced against `cancel`. Returns the value and the 1-based
/// attempt number that produced it.
pub async fn retry_transient<T, F, Fut, E>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    stage: &str,
    mut attempt: F,
    exhausted: E,
) -> VmletResult<(T, u32)>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = VmletResult<T>>,
    E: FnOnce(u32) -> VmletError,
{
    let max_attempts = policy.max_attempts.max(1);

    sleep_or_cancel(policy.grace, cancel, stage).await?;

    for n in 1..=max_attempts {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(VmletError::Cancelled(stage.to_string())),
            result = attempt(n) => result,
        };

        match result {
            Ok(value) => return Ok((value, n)),
            Err(e) if e.is_transient() => {
                tracing::debug!(attempt = n, max_attempts, error = %e, "Not ready, retrying");
                if n < max_attempts {
                    sleep_or_cancel(policy.interval, cancel, stage).await?;
                }
            }
            Err(e) => return Err(e),
        }
    }

    Err(exhausted(max_attempts))
}

async fn sleep_or_cancel(
    duration: Duration,
    cancel: &CancellationToken,
    stage: &str,
) -> VmletResult<()> {
    if duration.is_zero() {
        if cancel.is_cancelled() {
            return Err(VmletError::Cancelled(stage.to_string()));
        }
        return Ok(());
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(VmletError::Cancelled(stage.to_string())),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Connect to a Unix socket, retrying while it is not ready.
pub async fn connect_with_retry(
    path: &Path,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> VmletResult<UnixStream> {
    let (stream, attempts) = retry_transient(
        policy,
        cancel,
        "monitor_connect",
        |_| connect_once(path, policy.attempt_timeout),
        |attempts| VmletError::ConnectExhausted {
            path: path.to_path_buf(),
            attempts,
        },
    )
    .await?;

    tracing::info!(socket = %path.display(), attempts, "Control socket connected");
    Ok(stream)
}

async fn connect_once(path: &Path, timeout: Duration) -> VmletResult<UnixStream> {
    match tokio::time::timeout(timeout, UnixStream::connect(path)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(classify_connect_error(path, e)),
        Err(_) => Err(VmletError::ConnectTransient {
            path: path.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", timeout),
            ),
        }),
    }
}

fn classify_connect_error(path: &Path, e: io::Error) -> VmletError {
    match e.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
            VmletError::ConnectTransient {
                path: path.to_path_buf(),
                source: e,
            }
        }
        _ => VmletError::ConnectFatal {
            path: path.to_path_buf(),
            source: e,
        },
    }
}
