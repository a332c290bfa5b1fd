//! Bounded convergence polling.
//!
//! `poll_immediate` evaluates a condition right away and then once per interval until
//! it reports `Done`, fails, or the deadline passes. Evaluations are strictly
//! sequential, so a condition may perform reads and writes without coordination.
//! Time comes from `tokio::time`, which makes the loop testable under a paused clock.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// Outcome of one successful evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress<T> {
    Pending,
    Done(T),
}

#[derive(Debug)]
pub enum PollError<E> {
    /// Deadline elapsed without the condition reporting `Done`.
    DeadlineExceeded(Duration),
    /// The condition returned a hard error; polling stopped at that evaluation.
    Failed(E),
}

pub async fn poll_immediate<T, E, F, Fut>(interval: Duration, timeout: Duration, mut condition: F) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Progress<T>, E>>,
{
    let started = Instant::now();
    let deadline = started + timeout;
    let mut evaluations: u64 = 0;
    loop {
        evaluations += 1;
        counter!("poll_evaluations_total", 1u64);
        match condition().await {
            Ok(Progress::Done(v)) => return Ok(v),
            Ok(Progress::Pending) => {}
            Err(e) => return Err(PollError::Failed(e)),
        }
        let now = Instant::now();
        let next = now + interval;
        if now >= deadline || next > deadline {
            sleep_until(deadline).await;
            counter!("poll_deadline_exceeded_total", 1u64);
            debug!(evaluations, waited_ms = %started.elapsed().as_millis(), "poll deadline exceeded");
            return Err(PollError::DeadlineExceeded(timeout));
        }
        sleep_until(next).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    const INTERVAL: Duration = Duration::from_secs(20);
    const TIMEOUT: Duration = Duration::from_secs(600);

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_nth_evaluation_and_stops() {
        let calls = Cell::new(0u32);
        let started = Instant::now();
        let out = poll_immediate(INTERVAL, TIMEOUT, || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move { Ok::<_, ()>(if n == 3 { Progress::Done(n) } else { Progress::Pending }) }
        })
        .await;
        assert_eq!(out.unwrap(), 3);
        assert_eq!(calls.get(), 3);
        // Immediate first evaluation, then two intervals.
        assert_eq!(started.elapsed(), INTERVAL * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn never_done_hits_deadline_within_eval_bound() {
        let calls = Cell::new(0u64);
        let started = Instant::now();
        let out = poll_immediate(INTERVAL, TIMEOUT, || {
            calls.set(calls.get() + 1);
            async { Ok::<Progress<()>, ()>(Progress::Pending) }
        })
        .await;
        assert!(matches!(out, Err(PollError::DeadlineExceeded(d)) if d == TIMEOUT));
        assert!(started.elapsed() >= TIMEOUT);
        assert!(calls.get() <= TIMEOUT.as_secs() / INTERVAL.as_secs() + 1, "calls={}", calls.get());
        assert_eq!(calls.get(), 31);
    }

    #[tokio::test(start_paused = true)]
    async fn uneven_interval_still_waits_full_deadline() {
        let calls = Cell::new(0u64);
        let started = Instant::now();
        let out = poll_immediate(Duration::from_secs(7), Duration::from_secs(30), || {
            calls.set(calls.get() + 1);
            async { Ok::<Progress<()>, ()>(Progress::Pending) }
        })
        .await;
        assert!(matches!(out, Err(PollError::DeadlineExceeded(_))));
        assert_eq!(started.elapsed(), Duration::from_secs(30));
        assert_eq!(calls.get(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn hard_error_aborts_at_that_call() {
        let calls = Cell::new(0u32);
        let out = poll_immediate(INTERVAL, TIMEOUT, || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move { if n == 4 { Err("boom") } else { Ok::<Progress<()>, _>(Progress::Pending) } }
        })
        .await;
        assert!(matches!(out, Err(PollError::Failed("boom"))));
        assert_eq!(calls.get(), 4);
    }
}
