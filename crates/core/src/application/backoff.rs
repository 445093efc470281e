// Bounded exponential backoff
use crate::error::{QueueError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// First delay between attempts (50ms)
pub const BACKOFF_BEGIN: Duration = Duration::from_millis(50);

/// Delay ceiling (2s)
pub const BACKOFF_UPPER: Duration = Duration::from_secs(2);

/// Floor and ceiling of the retry delay.
///
/// Injected into every backend and worker pool so tests can shrink both to
/// about a millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub begin: Duration,
    pub upper: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            begin: BACKOFF_BEGIN,
            upper: BACKOFF_UPPER,
        }
    }
}

impl BackoffConfig {
    pub fn new(begin: Duration, upper: Duration) -> Self {
        Self { begin, upper }
    }

    /// Delay before attempt `k + 1` after `k` consecutive failures:
    /// `min(begin * 2^(k-1), upper)`, no jitter
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.begin
            .checked_mul(1u32 << exp)
            .map_or(self.upper, |d| d.min(self.upper))
    }
}

/// Outcome of one attempt
#[derive(Debug, PartialEq, Eq)]
pub enum Attempt<T> {
    /// Stop retrying with this value
    Done(T),
    /// Sleep and call again
    Retry,
}

/// Run `f` until it returns `Attempt::Done` or an error.
///
/// Cancellation and the deadline are checked before every attempt and while
/// sleeping: `Err(Cancelled)` if `cancel` fires first, `Err(DeadlineExceeded)`
/// if `deadline` passes first. An error from `f` stops the loop at once.
pub async fn backoff_ret_err<T, F, Fut>(
    cancel: &CancellationToken,
    config: BackoffConfig,
    deadline: Option<Instant>,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Attempt<T>>>,
{
    let mut delay = config.begin;
    loop {
        if cancel.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(QueueError::DeadlineExceeded);
        }

        if let Attempt::Done(value) = f().await? {
            return Ok(value);
        }

        trace!(delay_ms = delay.as_millis() as u64, "Backing off before retry");
        tokio::select! {
            _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            _ = wait_deadline(deadline) => return Err(QueueError::DeadlineExceeded),
            _ = sleep(delay) => {
                delay = (delay * 2).min(config.upper);
            }
        }
    }
}

/// Error-only form of [`backoff_ret_err`]: `f` returns `Ok(true)` to retry
pub async fn backoff_err<F, Fut>(
    cancel: &CancellationToken,
    config: BackoffConfig,
    deadline: Option<Instant>,
    mut f: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    backoff_ret_err(cancel, config, deadline, || {
        let fut = f();
        async move {
            Ok(if fut.await? {
                Attempt::Retry
            } else {
                Attempt::Done(())
            })
        }
    })
    .await
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(d) => sleep_until(d).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_delay_doubles_and_caps() {
        let cfg = BackoffConfig::default();
        assert_eq!(cfg.delay_for(1), Duration::from_millis(50));
        assert_eq!(cfg.delay_for(2), Duration::from_millis(100));
        assert_eq!(cfg.delay_for(3), Duration::from_millis(200));
        assert_eq!(cfg.delay_for(6), Duration::from_millis(1600));
        assert_eq!(cfg.delay_for(7), BACKOFF_UPPER);
        assert_eq!(cfg.delay_for(200), BACKOFF_UPPER);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeps_follow_exponential_schedule() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let value = backoff_ret_err(&CancellationToken::new(), BackoffConfig::default(), None, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Ok(if n < 4 { Attempt::Retry } else { Attempt::Done(n) })
        })
        .await;

        assert_eq!(assert_ok!(value), 4);
        // 50 + 100 + 200 + 400
        assert_eq!(start.elapsed(), Duration::from_millis(750));
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_failures_with_tiny_backoff() {
        let cfg = BackoffConfig::new(Duration::from_millis(1), Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let res = backoff_err(&CancellationToken::new(), cfg, None, || async {
            Ok(calls.fetch_add(1, Ordering::SeqCst) < 5)
        })
        .await;

        assert_ok!(res);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert!(start.elapsed() <= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_tiny_backoff_real_clock_sanity() {
        let cfg = BackoffConfig::new(Duration::from_millis(1), Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let start = std::time::Instant::now();

        assert_ok!(
            backoff_err(&CancellationToken::new(), cfg, None, || async {
                Ok(calls.fetch_add(1, Ordering::SeqCst) < 5)
            })
            .await
        );
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let deadline = Instant::now() + Duration::from_millis(300);
        let res = backoff_err(&CancellationToken::new(), BackoffConfig::default(), Some(deadline), || async {
            Ok(true)
        })
        .await;
        assert!(matches!(assert_err!(res), QueueError::DeadlineExceeded));
        // deadline is hit while sleeping, not one full delay later
        assert_eq!(Instant::now(), deadline);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);

        let res = backoff_err(&cancel, BackoffConfig::default(), None, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        })
        .await;

        assert!(matches!(res, Err(QueueError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_error_stops_retrying() {
        let calls = AtomicU32::new(0);
        let res: Result<()> = backoff_ret_err(&CancellationToken::new(), BackoffConfig::default(), None, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(QueueError::Backend("connection refused".to_string()))
        })
        .await;
        assert!(matches!(res, Err(QueueError::Backend(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
