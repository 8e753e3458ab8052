use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::analysis::AnalysisError;

/// Delay schedule between attempts
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    exponential: bool,
    jitter: bool,
}

impl Backoff {
    /// Constant delay, for local tools where waiting longer changes nothing.
    pub fn fixed(base: Duration) -> Self {
        Self {
            base,
            exponential: false,
            jitter: false,
        }
    }

    /// Doubling delay with +/-25% jitter, for network-class failures.
    pub fn exponential(base: Duration) -> Self {
        Self {
            base,
            exponential: true,
            jitter: true,
        }
    }

    /// Delay before the next call once `attempt` calls have failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut delay = if self.exponential {
            // Shift capped well below overflow; saturating_mul bounds the rest.
            let factor = 1u32 << attempt.saturating_sub(1).min(16);
            self.base.saturating_mul(factor)
        } else {
            self.base
        };
        if self.jitter {
            delay = delay.mul_f64(rand::thread_rng().gen_range(0.75..=1.25));
        }
        delay
    }
}

/// Attempt budget and per-call timeout for one stage boundary
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub call_timeout: Duration,
}

/// Hard ceiling on calls for one operation. Rate-limit waits do not consume
/// the transient budget, so without this a persistently throttling backend
/// would hold a frame forever.
pub fn total_call_cap(max_attempts: u32) -> u32 {
    max_attempts.max(1).saturating_mul(3)
}

/// Runs `op` under the analysis retry taxonomy: a call that outlives the
/// policy timeout counts as transient, transients are retried with backoff,
/// rate limits wait out the advertised delay without consuming the budget,
/// fatal errors return immediately.
pub async fn with_retries<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, AnalysisError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AnalysisError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let cap = total_call_cap(max_attempts);
    let mut attempt = 0u32;
    let mut calls = 0u32;
    loop {
        calls += 1;
        let err = match tokio::time::timeout(policy.call_timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => err,
            Err(elapsed) => AnalysisError::transient(elapsed),
        };
        match err {
            AnalysisError::RateLimited { retry_after } => {
                if calls >= cap {
                    return Err(AnalysisError::RateLimited { retry_after });
                }
                debug!(pause_ms = retry_after.as_millis() as u64, "rate limited, waiting");
                tokio::time::sleep(retry_after).await;
            }
            AnalysisError::Fatal { .. } => return Err(err),
            AnalysisError::Transient { .. } => {
                attempt += 1;
                if attempt >= max_attempts || calls >= cap {
                    return Err(err);
                }
                let delay = policy.backoff.delay(attempt);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Backoff::fixed(Duration::from_millis(1)),
            call_timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn fixed_backoff_never_grows() {
        let backoff = Backoff::fixed(Duration::from_millis(250));
        assert_eq!(backoff.delay(1), Duration::from_millis(250));
        assert_eq!(backoff.delay(7), Duration::from_millis(250));
    }

    #[test]
    fn exponential_backoff_doubles_within_jitter_bounds() {
        let backoff = Backoff::exponential(Duration::from_millis(100));
        for (attempt, nominal_ms) in [(1u32, 100u64), (2, 200), (3, 400)] {
            let delay = backoff.delay(attempt);
            let lo = Duration::from_millis(nominal_ms * 3 / 4);
            let hi = Duration::from_millis(nominal_ms * 5 / 4);
            assert!(
                delay >= lo && delay <= hi,
                "attempt {attempt}: {delay:?} outside [{lo:?}, {hi:?}]"
            );
        }
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let backoff = Backoff::exponential(Duration::from_secs(1));
        let _ = backoff.delay(u32::MAX);
    }

    #[test]
    fn call_cap_scales_with_budget() {
        assert_eq!(total_call_cap(3), 9);
        assert_eq!(total_call_cap(0), 3);
    }

    #[tokio::test]
    async fn success_passes_through() {
        let result: Result<u32, _> = with_retries(&policy(3), || async { Ok(7) }).await;
        assert_eq!(result.ok(), Some(7));
    }

    #[tokio::test]
    async fn transient_failures_consume_the_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(&policy(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AnalysisError::transient(std::io::Error::other("flaky"))) }
        })
        .await;
        assert!(matches!(result, Err(AnalysisError::Transient { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(&policy(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(AnalysisError::Fatal {
                    reason: "bad key".into(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(AnalysisError::Fatal { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limits_spare_the_budget_but_hit_the_cap() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(&policy(2), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(AnalysisError::RateLimited {
                    retry_after: Duration::from_millis(1),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(AnalysisError::RateLimited { .. })));
        // Cap is 3x the attempt budget, well past the budget itself.
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn rate_limit_then_success_recovers() {
        let calls = AtomicU32::new(0);
        let result = with_retries(&policy(2), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n <= 3 {
                    Err(AnalysisError::RateLimited {
                        retry_after: Duration::from_millis(1),
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        // Three throttled calls exceed the transient budget of two; only the
        // cap applies to them.
        assert_eq!(result.ok(), Some(4));
    }

    #[tokio::test]
    async fn timed_out_call_counts_as_transient() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 2,
            backoff: Backoff::fixed(Duration::from_millis(1)),
            call_timeout: Duration::from_millis(10),
        };
        let result: Result<(), _> = with_retries(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }
        })
        .await;
        assert!(matches!(result, Err(AnalysisError::Transient { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
