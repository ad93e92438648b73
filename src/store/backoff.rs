//! Bounded exponential backoff for backend provisioning.
//!
//! Only idempotent setup steps go through here. Regular KV operations surface
//! their failures immediately.

use std::future::Future;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Total time budget; no attempt starts after it is spent.
    pub max_elapsed: Duration,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            max_elapsed: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    fn next_interval(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier).min(self.max_interval)
    }
}

/// Outcome of one attempt. Only `Transient` failures are retried.
#[derive(Debug)]
pub enum Attempt<E> {
    Transient(E),
    Permanent(E),
}

/// Runs `op` until it succeeds, fails permanently, or the policy budget runs out.
/// The last transient error is returned when the budget is exhausted.
pub async fn retry<T, E, F, Fut>(policy: &BackoffPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Attempt<E>>>,
{
    let started = Instant::now();
    let mut interval = policy.initial_interval;
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(Attempt::Permanent(err)) => return Err(err),
            Err(Attempt::Transient(err)) => {
                if started.elapsed() + interval > policy.max_elapsed {
                    log::warn!("giving up after {} attempts", attempt);
                    return Err(err);
                }
                log::debug!("attempt {} not ready, retrying in {:?}", attempt, interval);
                tokio::time::sleep(interval).await;
                interval = policy.next_interval(interval);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(4),
            max_elapsed: Duration::from_millis(200),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_interval_is_capped() {
        let policy = BackoffPolicy::default();
        let mut interval = policy.initial_interval;
        for _ in 0..20 {
            interval = policy.next_interval(interval);
        }
        assert_eq!(interval, policy.max_interval);
    }

    #[tokio::test]
    async fn test_retries_transient_until_ready() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<u32, &str> = retry(&fast_policy(), || async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(Attempt::Transient("not active"))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_permanent_stops_immediately() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), &str> = retry(&fast_policy(), || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Attempt::Permanent("access denied"))
        })
        .await;
        assert_eq!(result, Err("access denied"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_is_bounded() {
        let policy = BackoffPolicy {
            max_elapsed: Duration::from_millis(20),
            ..fast_policy()
        };
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), &str> = retry(&policy, || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Attempt::Transient("not active"))
        })
        .await;
        assert_eq!(result, Err("not active"));
        assert!(calls.load(Ordering::SeqCst) > 1);
    }
}
