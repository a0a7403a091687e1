//! Exponential-backoff retry and deadline primitives for external calls.

use {
    rand::Rng,
    std::{fmt::Debug, future::Future, time::Duration},
};

/// Error types that can tell whether another attempt has a chance of
/// succeeding. Retry loops consult this instead of matching on concrete
/// variants.
pub trait Retryable {
    fn retryable(&self) -> bool;
}

/// Exponential-backoff policy: `delay_n = min(base * 2^n, cap)`.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub max_retries: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .checked_mul(1_u32.checked_shl(attempt).unwrap_or(u32::MAX))
            .unwrap_or(self.cap);
        exp.min(self.cap)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// retry budget is exhausted. The closure receives the zero-based attempt
/// number.
pub async fn retry<T, E, F, Fut>(policy: &Backoff, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Debug,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_retries && err.retryable() => {
                let delay = policy.delay(attempt);
                tracing::debug!(?err, attempt, ?delay, "transient error, backing off");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Error raised when an operation exceeds its deadline.
#[derive(Debug, thiserror::Error)]
#[error("operation timed out after {0:?}")]
pub struct TimedOut(pub Duration);

/// Races `fut` against a timer. The underlying operation is not forcibly
/// killed; dropping the future is the cancellation we get.
pub async fn with_timeout<T, E, F>(limit: Duration, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<TimedOut>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(E::from(TimedOut(limit))),
    }
}

/// Full jitter: a uniformly random duration in `[0, d]`.
pub fn jittered(d: Duration) -> Duration {
    if d.is_zero() {
        return d;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=d.as_millis() as u64))
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::atomic::{AtomicU32, Ordering},
    };

    #[derive(Debug)]
    struct Transient;

    impl Retryable for Transient {
        fn retryable(&self) -> bool {
            true
        }
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = Backoff {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(30),
            max_retries: 10,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(20), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, Transient> = retry(&Backoff::default(), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Transient)
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let policy = Backoff {
            max_retries: 3,
            ..Default::default()
        };
        let result: Result<(), Transient> = retry(&policy, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Transient) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_maps_to_error() {
        #[derive(Debug)]
        enum Error {
            TimedOut,
        }
        impl From<TimedOut> for Error {
            fn from(_: TimedOut) -> Self {
                Error::TimedOut
            }
        }

        let result: Result<(), Error> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::TimedOut)));
    }
}
