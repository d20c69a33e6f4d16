//! Restart-with-backoff supervision for stages.
//!
//! A stage returning a transient error is restarted with exponential
//! backoff, indefinitely; the backoff cap is the only throttle. A
//! permanent error stops supervision and surfaces to the flow, which
//! terminates. `Ok` means the stage is done and is not restarted.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::stage::{Stage, StageError};

/// Exponential backoff configuration for stage restarts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first restart.
    pub initial_backoff: Duration,
    /// Upper bound on the delay between restarts.
    pub max_backoff: Duration,
    /// Backoff multiplier per attempt (2.0 doubles).
    pub multiplier: f64,
    /// Jitter factor in `0.0..=1.0`, randomising each delay to avoid
    /// synchronised restarts.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A fixed-interval policy with no growth and no jitter.
    #[must_use]
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial_backoff: interval,
            max_backoff: interval,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// The delay before restart attempt `attempt` (1-based); attempt 0
    /// yields no delay.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // attempt counts stay small
    #[allow(clippy::cast_possible_wrap)]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt as i32).saturating_sub(1);
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let clamped = base.min(self.max_backoff.as_secs_f64());

        let jitter = self.jitter.clamp(0.0, 1.0);
        let offset = if jitter > 0.0 {
            clamped * rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            0.0
        };
        Duration::from_secs_f64((clamped + offset).max(0.0))
    }
}

/// Runs `stage` to completion under `policy`.
///
/// Each serve call gets a child token of `ctx`. Transient failures sleep
/// the policy's delay (abandoned early if `ctx` is cancelled) and serve
/// again without re-connecting; the stage keeps its channels across
/// restarts.
///
/// # Errors
///
/// Returns the stage's [`StageError::Permanent`] (or
/// [`StageError::NotConnected`]) unchanged; transient errors never
/// escape.
pub async fn supervise(
    stage: &mut dyn Stage,
    ctx: CancellationToken,
    policy: &RetryPolicy,
) -> Result<(), StageError> {
    let mut attempt = 0usize;
    loop {
        match stage.serve(ctx.child_token()).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_permanent() => {
                tracing::error!(stage = stage.id(), error = %err, "stage failed permanently");
                return Err(err);
            }
            Err(err) => {
                attempt += 1;
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    stage = stage.id(),
                    error = %err,
                    attempt,
                    ?delay,
                    "restarting stage"
                );
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = ctx.cancelled() => return Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::stage::StageChans;

    /// Fails transiently `failures` times, then completes.
    struct Flaky {
        id: String,
        failures: usize,
        serves: usize,
    }

    #[async_trait]
    impl Stage for Flaky {
        fn id(&self) -> &str {
            &self.id
        }

        fn connect(&mut self, _chans: StageChans) {}

        async fn serve(&mut self, _ctx: CancellationToken) -> Result<(), StageError> {
            self.serves += 1;
            if self.serves <= self.failures {
                Err(StageError::transient("flaky"))
            } else {
                Ok(())
            }
        }
    }

    struct Fatal {
        id: String,
    }

    #[async_trait]
    impl Stage for Fatal {
        fn id(&self) -> &str {
            &self.id
        }

        fn connect(&mut self, _chans: StageChans) {}

        async fn serve(&mut self, _ctx: CancellationToken) -> Result<(), StageError> {
            Err(StageError::permanent("broken beyond repair"))
        }
    }

    #[test]
    fn delays_grow_exponentially_and_cap() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(400),
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        // Capped from here on.
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(400));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            multiplier: 1.0,
            jitter: 0.5,
        };
        for _ in 0..64 {
            let delay = policy.delay_for_attempt(1).as_secs_f64();
            assert!((0.05..=0.15).contains(&delay), "delay {delay} out of range");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_done() {
        let mut stage = Flaky {
            id: "flaky".into(),
            failures: 3,
            serves: 0,
        };
        let policy = RetryPolicy::fixed(Duration::from_millis(10));
        supervise(&mut stage, CancellationToken::new(), &policy)
            .await
            .unwrap();
        assert_eq!(stage.serves, 4);
    }

    #[tokio::test]
    async fn permanent_failure_stops_supervision() {
        let mut stage = Fatal { id: "fatal".into() };
        let err = supervise(
            &mut stage,
            CancellationToken::new(),
            &RetryPolicy::default(),
        )
        .await
        .unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let mut stage = Flaky {
            id: "flaky".into(),
            failures: usize::MAX,
            serves: 0,
        };
        let policy = RetryPolicy::fixed(Duration::from_secs(3600));
        let ctx = CancellationToken::new();
        let cancel = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            cancel.cancel();
        });
        supervise(&mut stage, ctx, &policy).await.unwrap();
        assert_eq!(stage.serves, 1);
    }
}
