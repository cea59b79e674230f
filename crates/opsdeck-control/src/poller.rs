use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Fixed-interval retry budget. Open-ended polling is unrepresentable: both
/// the interval and the attempt count are explicit and finite.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Hard wall-clock ceiling, `interval × max_attempts`. Enforced
    /// independently of how many attempts actually ran, so a slow fetch
    /// cannot stretch the total wait.
    pub fn ceiling(&self) -> Duration {
        self.interval.saturating_mul(self.max_attempts)
    }
}

#[derive(Debug, PartialEq)]
pub enum PollOutcome<T> {
    Reached(T),
    TimedOut,
    Cancelled,
}

// Allowance for a final-attempt fetch that starts exactly at the ceiling
// boundary; anything still in flight past this is cut off.
const FETCH_GRACE: Duration = Duration::from_millis(50);

/// Poll `fetch` at a fixed interval until `predicate` holds, the attempt
/// budget is spent, or `cancel` fires.
///
/// The first fetch happens one interval after entry. A transient fetch
/// error consumes one attempt without terminating the poll. Once `cancel`
/// is signalled no further fetch is issued and the in-flight one (if any)
/// is dropped; the poll resolves [`PollOutcome::Cancelled`] without error.
/// Every timer is dropped on resolution; nothing fires afterwards.
pub async fn wait_for<T, E, F, Fut, P>(
    mut fetch: F,
    mut predicate: P,
    policy: PollPolicy,
    cancel: &CancellationToken,
) -> PollOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&T) -> bool,
    E: Display,
{
    let started = Instant::now();
    let deadline = started + policy.ceiling();

    for attempt in 1..=policy.max_attempts {
        let tick = started + policy.interval.saturating_mul(attempt);
        tokio::select! {
            _ = cancel.cancelled() => return PollOutcome::Cancelled,
            _ = tokio::time::sleep_until(tick) => {}
        }

        let fetched = tokio::select! {
            _ = cancel.cancelled() => return PollOutcome::Cancelled,
            _ = tokio::time::sleep_until(deadline + FETCH_GRACE) => {
                debug!(target: "opsdeck::poll", attempt, "fetch cut off at poll ceiling");
                return PollOutcome::TimedOut;
            }
            result = fetch() => result,
        };

        match fetched {
            Ok(value) if predicate(&value) => return PollOutcome::Reached(value),
            Ok(_) => {}
            Err(err) => {
                debug!(
                    target: "opsdeck::poll",
                    attempt,
                    error = %err,
                    "poll fetch failed; attempt consumed"
                );
            }
        }
    }

    PollOutcome::TimedOut
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy_2s_x3() -> PollPolicy {
        PollPolicy::new(Duration::from_secs(2), 3)
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_reached_once_predicate_holds() {
        let calls = Arc::new(AtomicU32::new(0));
        let fetch_calls = Arc::clone(&calls);
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let outcome = wait_for(
            move || {
                let calls = Arc::clone(&fetch_calls);
                async move { Ok::<u32, String>(calls.fetch_add(1, Ordering::SeqCst) + 1) }
            },
            |seen| *seen >= 2,
            policy_2s_x3(),
            &cancel,
        )
        .await;

        assert_eq!(outcome, PollOutcome::Reached(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_resolve_timed_out_within_ceiling() {
        let calls = Arc::new(AtomicU32::new(0));
        let fetch_calls = Arc::clone(&calls);
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let outcome = wait_for(
            move || {
                let calls = Arc::clone(&fetch_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<bool, String>(false)
                }
            },
            |ready| *ready,
            policy_2s_x3(),
            &cancel,
        )
        .await;

        assert_eq!(outcome, PollOutcome::TimedOut);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(6), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_secs(6) + FETCH_GRACE, "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_consume_attempts_without_aborting() {
        let calls = Arc::new(AtomicU32::new(0));
        let fetch_calls = Arc::clone(&calls);
        let cancel = CancellationToken::new();

        let outcome = wait_for(
            move || {
                let calls = Arc::clone(&fetch_calls);
                async move {
                    match calls.fetch_add(1, Ordering::SeqCst) {
                        0 => Err("connection refused".to_string()),
                        n => Ok(n + 1),
                    }
                }
            },
            |seen| *seen >= 2,
            policy_2s_x3(),
            &cancel,
        )
        .await;

        assert_eq!(outcome, PollOutcome::Reached(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn all_errors_exhaust_the_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let fetch_calls = Arc::clone(&calls);
        let cancel = CancellationToken::new();

        let outcome = wait_for(
            move || {
                let calls = Arc::clone(&fetch_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<bool, String>("connection refused".to_string())
                }
            },
            |ready| *ready,
            policy_2s_x3(),
            &cancel,
        )
        .await;

        assert_eq!(outcome, PollOutcome::TimedOut);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_further_fetches() {
        let calls = Arc::new(AtomicU32::new(0));
        let fetch_calls = Arc::clone(&calls);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            trigger.cancel();
        });

        let outcome = wait_for(
            move || {
                let calls = Arc::clone(&fetch_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<bool, String>(false)
                }
            },
            |ready| *ready,
            policy_2s_x3(),
            &cancel,
        )
        .await;

        assert_eq!(outcome, PollOutcome::Cancelled);
        // One fetch at the 2s tick, none after the 3s cancellation.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetch_is_cut_at_the_ceiling() {
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let outcome = wait_for(
            || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<bool, String>(true)
            },
            |ready| *ready,
            policy_2s_x3(),
            &cancel,
        )
        .await;

        assert_eq!(outcome, PollOutcome::TimedOut);
        let elapsed = started.elapsed();
        assert!(elapsed <= Duration::from_secs(6) + FETCH_GRACE, "elapsed {elapsed:?}");
    }

    #[test]
    fn ceiling_is_interval_times_attempts() {
        assert_eq!(policy_2s_x3().ceiling(), Duration::from_secs(6));
        assert_eq!(
            PollPolicy::new(Duration::from_millis(500), 10).ceiling(),
            Duration::from_secs(5)
        );
    }
}
