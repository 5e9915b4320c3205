//! Silent reconnect policy.
//!
//! After an unexpected drop the manager retries the remembered device a small
//! number of times, waiting an increasing delay before each attempt. When the
//! budget is spent the user has to pick the device again.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use crate::config::ReconnectConfig;

/// How many silent attempts to make and how long to wait before each.
///
/// # Example
///
/// ```rust
/// use edge_link::link::ReconnectPolicy;
/// use std::time::Duration;
///
/// let policy = ReconnectPolicy::new(2, vec![Duration::from_millis(500), Duration::from_millis(1500)]);
/// assert_eq!(policy.delay_for(1), Duration::from_millis(500));
/// assert_eq!(policy.delay_for(2), Duration::from_millis(1500));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts before giving up. Zero disables silent reconnect.
    pub max_attempts: u32,
    /// Delay before attempt `n` is `delays[n - 1]`; the last entry repeats.
    pub delays: Vec<Duration>,
}

impl ReconnectPolicy {
    /// `delays[i]` precedes attempt `i + 1`; the last delay repeats.
    pub fn new(max_attempts: u32, delays: Vec<Duration>) -> Self {
        Self {
            max_attempts,
            delays,
        }
    }

    /// Delay before the 1-based `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        self.delays
            .get(index)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or_default()
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            delays: config
                .delays_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        }
    }
}

/// A link that can be re-established.
#[async_trait]
pub trait Recoverable<E>: Send + Sync {
    /// Makes attempt number `attempt` (1-based).
    async fn recover(&self, attempt: u32) -> Result<(), E>;

    /// Checked before every wait and attempt; `false` abandons the loop.
    fn still_wanted(&self) -> bool {
        true
    }
}

/// How a retry loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<E> {
    /// Attempt `attempt` succeeded
    Recovered { attempt: u32 },
    /// Every attempt failed; carries the last error
    Exhausted { attempts: u32, last_error: Option<E> },
    /// The link stopped being wanted (user disconnect, close)
    Abandoned,
}

/// Runs `recoverable` under `policy`: wait, attempt, repeat.
pub async fn retry_with_policy<E, R>(recoverable: &R, policy: &ReconnectPolicy) -> RetryOutcome<E>
where
    R: Recoverable<E> + ?Sized,
    E: std::fmt::Display,
{
    let mut last_error = None;
    for attempt in 1..=policy.max_attempts {
        if !recoverable.still_wanted() {
            return RetryOutcome::Abandoned;
        }
        sleep(policy.delay_for(attempt)).await;
        if !recoverable.still_wanted() {
            return RetryOutcome::Abandoned;
        }

        match recoverable.recover(attempt).await {
            Ok(()) => return RetryOutcome::Recovered { attempt },
            Err(e) => {
                tracing::warn!(attempt, max = policy.max_attempts, error = %e, "Reconnect attempt failed");
                last_error = Some(e);
            }
        }
    }
    RetryOutcome::Exhausted {
        attempts: policy.max_attempts,
        last_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::time::Instant;

    struct Flaky {
        succeed_on: u32,
        calls: AtomicU32,
        wanted: AtomicBool,
    }

    #[async_trait]
    impl Recoverable<String> for Flaky {
        async fn recover(&self, attempt: u32) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if attempt == self.succeed_on {
                Ok(())
            } else {
                Err(format!("attempt {attempt} failed"))
            }
        }

        fn still_wanted(&self) -> bool {
            self.wanted.load(Ordering::SeqCst)
        }
    }

    fn flaky(succeed_on: u32) -> Flaky {
        Flaky {
            succeed_on,
            calls: AtomicU32::new(0),
            wanted: AtomicBool::new(true),
        }
    }

    #[test]
    fn test_last_delay_repeats() {
        let policy = ReconnectPolicy::new(4, vec![Duration::from_millis(10), Duration::from_millis(30)]);
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(3), Duration::from_millis(30));
        assert_eq!(ReconnectPolicy::new(1, vec![]).delay_for(1), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_on_second_attempt_after_both_delays() {
        let policy = ReconnectPolicy::default();
        let target = flaky(2);
        let start = Instant::now();

        let outcome = retry_with_policy(&target, &policy).await;
        assert_eq!(outcome, RetryOutcome::Recovered { attempt: 2 });
        assert!(start.elapsed() >= Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_budget() {
        let policy = ReconnectPolicy::default();
        let target = flaky(99);

        let outcome = retry_with_policy(&target, &policy).await;
        assert_eq!(
            outcome,
            RetryOutcome::Exhausted {
                attempts: 2,
                last_error: Some("attempt 2 failed".to_string()),
            }
        );
        assert_eq!(target.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandons_when_no_longer_wanted() {
        let target = flaky(1);
        target.wanted.store(false, Ordering::SeqCst);
        let outcome = retry_with_policy(&target, &ReconnectPolicy::default()).await;
        assert_eq!(outcome, RetryOutcome::Abandoned);
        assert_eq!(target.calls.load(Ordering::SeqCst), 0);
    }
}
