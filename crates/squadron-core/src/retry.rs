//! Bounded exponential backoff with full jitter for transient forge-API
//! errors (resolves the "what's the retry policy" open question).

use rand::Rng;

/// `delay = min(max_delay, base_delay * 2^attempt) * uniform(0.5, 1.0)`
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let exp = self.base_delay_ms.saturating_mul(1u64 << attempt.min(20));
        let capped = exp.min(self.max_delay_ms);
        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        std::time::Duration::from_millis((capped as f64 * jitter) as u64)
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

/// Run `f` with the given backoff policy, retrying transient errors.
/// `is_transient` decides whether a given error should be retried.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    policy: &BackoffPolicy,
    mut f: F,
    is_transient: P,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    loop {
        match f(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if is_transient(&e) && !policy.is_exhausted(attempt) => {
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_never_exceeds_max() {
        let policy = BackoffPolicy {
            base_delay_ms: 1000,
            max_delay_ms: 4000,
            max_attempts: 10,
        };
        for attempt in 0..10 {
            let d = policy.delay_for_attempt(attempt);
            assert!(d.as_millis() as u64 <= 4000);
        }
    }

    #[test]
    fn exhaustion_respects_max_attempts() {
        let policy = BackoffPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        assert!(policy.is_exhausted(4));
    }

    #[tokio::test]
    async fn retry_with_backoff_stops_on_permanent_error() {
        let policy = BackoffPolicy {
            base_delay_ms: 1,
            max_delay_ms: 2,
            max_attempts: 5,
        };
        let mut calls = 0;
        let result: Result<(), &str> = retry_with_backoff(
            &policy,
            |_attempt| {
                calls += 1;
                std::future::ready(Err("permanent"))
            },
            |_e| false,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn retry_with_backoff_succeeds_after_transient_failures() {
        let policy = BackoffPolicy {
            base_delay_ms: 1,
            max_delay_ms: 2,
            max_attempts: 5,
        };
        let mut calls = 0;
        let result = retry_with_backoff(
            &policy,
            |attempt| {
                calls += 1;
                std::future::ready(if attempt < 2 {
                    Err("transient")
                } else {
                    Ok(42)
                })
            },
            |_e| true,
        )
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls, 3);
    }
}
