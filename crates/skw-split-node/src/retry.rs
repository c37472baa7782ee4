use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::config::SplitConfig;
use crate::error::SplitError;
use crate::round::RoundCancel;

/// Exponential backoff: `base`, `2*base`, `4*base`, ... never above `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    pub fn from_config(config: &SplitConfig) -> Self {
        Self {
            base: config.retry_backoff,
            max: config.max_backoff,
            max_attempts: config.max_retries,
        }
    }

    /// delay after the `attempt`-th failure, counting from 1
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Run `op_fn` until it succeeds, fails with a non-retryable error, or
/// `backoff.max_attempts` attempts are used up. Running out of attempts is a
/// `DeliveryTimeout` on `op_name`.
pub async fn retry<F, Fut, T>(
    op_name: &str,
    backoff: Backoff,
    cancel: &RoundCancel,
    op_fn: F,
) -> Result<T, SplitError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, SplitError>>,
{
    let started = Instant::now();
    let mut attempts = 0;
    loop {
        cancel.check()?;
        attempts += 1;

        match op_fn().await {
            Ok(result) => return Ok(result),
            Err(err) if !err.kind().is_retryable() => return Err(err),
            Err(err) if attempts < backoff.max_attempts => {
                let delay = backoff.delay(attempts);
                log::debug!(
                    "{} failed with error: {}. Retrying in {}ms (attempt {}/{})",
                    op_name, err, delay.as_millis(), attempts, backoff.max_attempts
                );
                sleep(delay).await;
            }
            Err(err) => {
                log::warn!("{} failed after {} attempts: {}", op_name, attempts, err);
                return Err(SplitError::DeliveryTimeout {
                    topic: op_name.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::ErrorKind;

    fn backoff(max_attempts: u32) -> Backoff {
        Backoff {
            base: Duration::from_millis(1),
            max: Duration::from_millis(4),
            max_attempts,
        }
    }

    #[test]
    fn delay_doubles_and_caps() {
        let b = Backoff { base: Duration::from_millis(200), max: Duration::from_secs(1), max_attempts: 10 };
        assert_eq!(b.delay(1), Duration::from_millis(200));
        assert_eq!(b.delay(2), Duration::from_millis(400));
        assert_eq!(b.delay(3), Duration::from_millis(800));
        assert_eq!(b.delay(4), Duration::from_secs(1));
        assert_eq!(b.delay(64), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let res = retry("send", backoff(3), &RoundCancel::new(), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(SplitError::Transport("busy".into()))
            } else {
                Ok(7)
            }
        }).await;

        assert_eq!(res, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_at_max_attempts() {
        let calls = AtomicU32::new(0);
        let res: Result<(), _> = retry("send", backoff(3), &RoundCancel::new(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SplitError::Transport("busy".into()))
        }).await;

        assert_eq!(res.unwrap_err().kind(), ErrorKind::DeliveryTimeout);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let res: Result<(), _> = retry("send", backoff(3), &RoundCancel::new(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SplitError::Rejected("too large".into()))
        }).await;

        assert_eq!(res, Err(SplitError::Rejected("too large".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_before_first_attempt() {
        let cancel = RoundCancel::new();
        cancel.cancel();
        let res = retry("send", backoff(3), &cancel, || async { Ok(1) }).await;
        assert_eq!(res, Err(SplitError::Cancelled));
    }
}
