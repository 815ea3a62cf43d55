//! Backoff policy and retry loop for starting the supervised process.

use std::time::Duration;

use kiln_types::{KilnError, Result};

/// Backoff policy controlling the delay between start attempts.
#[derive(Debug, Clone)]
pub enum BackoffPolicy {
    /// Fixed delay between attempts.
    Fixed(Duration),
    /// Exponential backoff: base * 2^attempt, capped at max.
    Exponential { base: Duration, max: Duration },
    /// No delay between attempts.
    None,
}

impl BackoffPolicy {
    /// Compute the delay after a given failed attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::Fixed(d) => *d,
            BackoffPolicy::Exponential { base, max } => {
                let millis = (base.as_millis() as u64)
                    .saturating_mul(2u64.saturating_pow(attempt as u32));
                Duration::from_millis(millis).min(*max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(250),
            max: Duration::from_secs(5),
        }
    }
}

/// Call `f` up to `attempts` times, sleeping per `policy` between failures.
///
/// Every failure is logged. When all attempts fail the result is
/// [`KilnError::StartAttemptsExhausted`], which callers treat as fatal.
pub async fn with_start_retry<T, F, Fut>(
    f: F,
    attempts: usize,
    policy: &BackoffPolicy,
    command: &str,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    for attempt in 0..attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::warn!(
                    command = %command,
                    attempt = attempt + 1,
                    error = %e,
                    "Process start failed"
                );
                if attempt + 1 < attempts {
                    tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                }
            }
        }
    }
    Err(KilnError::StartAttemptsExhausted {
        command: command.to_string(),
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn success_on_first_try() {
        let value = with_start_retry(|| async { Ok(7) }, 3, &BackoffPolicy::None, "node")
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();

        let result = with_start_retry(
            move || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(KilnError::Process {
                            command: "node".into(),
                            message: "ETXTBSY".into(),
                        })
                    } else {
                        Ok(())
                    }
                }
            },
            3,
            &BackoffPolicy::None,
            "node",
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_attempts_are_fatal() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();

        let err = with_start_retry(
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(KilnError::Process {
                        command: "node".into(),
                        message: "not found".into(),
                    })
                }
            },
            2,
            &BackoffPolicy::None,
            "node",
        )
        .await
        .unwrap_err();

        assert!(err.is_fatal());
        assert!(matches!(err, KilnError::StartAttemptsExhausted { attempts: 2, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = BackoffPolicy::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(64), Duration::from_millis(500));
    }

    #[test]
    fn fixed_and_none_policies() {
        let fixed = BackoffPolicy::Fixed(Duration::from_millis(200));
        assert_eq!(fixed.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(fixed.delay_for_attempt(9), Duration::from_millis(200));
        assert_eq!(BackoffPolicy::None.delay_for_attempt(3), Duration::ZERO);
    }
}
