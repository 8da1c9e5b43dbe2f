// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities for polling for a condition
//!
//! This is intended for the test suites and developer tools in situations
//! where some action has been taken against an external system and we want to
//! wait for its effects to be observable, _and_ there's no way to directly
//! wait for the observable event.  The predicate is re-evaluated on a fixed
//! interval until it reports `true` or the time budget runs out.
//!
//! A predicate error is never fatal here: it's treated exactly like `false`
//! for the purpose of deciding whether to keep going, and the most recent one
//! is kept in [`PollOutcome::last_error`] so that the caller can tell "the
//! condition was observed false" apart from "the query kept failing".  Whether
//! an unsatisfied outcome is a failure, a skip, or a warning is entirely up to
//! the caller.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Result of a call to [`wait_for()`] or [`wait_for_async()`]
#[derive(Debug)]
pub struct PollOutcome<E> {
    /// whether the predicate returned `true` before the deadline
    pub satisfied: bool,
    /// wall-clock time from the first attempt until we stopped
    pub elapsed: Duration,
    /// number of times the predicate was evaluated (always at least 1)
    pub attempts: u32,
    /// most recent error returned by the predicate, if any
    ///
    /// This is retained even when a later attempt succeeded.
    pub last_error: Option<E>,
}

/// Error returned when the poll parameters make no sense
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PollError {
    #[error(
        "poll interval must be nonzero when the timeout is nonzero \
        (timeout {timeout:?})"
    )]
    ZeroInterval { timeout: Duration },
}

fn validate(timeout: &Duration, interval: &Duration) -> Result<(), PollError> {
    if !timeout.is_zero() && interval.is_zero() {
        return Err(PollError::ZeroInterval { timeout: *timeout });
    }
    Ok(())
}

/// Bookkeeping shared by the blocking and async loops.
struct Attempts<E> {
    count: u32,
    last_error: Option<E>,
}

impl<E> Attempts<E> {
    fn new() -> Self {
        Attempts { count: 0, last_error: None }
    }

    /// Account for one evaluation and report whether it satisfied the
    /// condition.
    fn observe(&mut self, result: Result<bool, E>) -> bool {
        self.count += 1;
        match result {
            Ok(done) => done,
            Err(error) => {
                self.last_error = Some(error);
                false
            }
        }
    }

    fn finish(self, satisfied: bool, elapsed: Duration) -> PollOutcome<E> {
        PollOutcome {
            satisfied,
            elapsed,
            attempts: self.count,
            last_error: self.last_error,
        }
    }
}

/// Evaluate `predicate` until it returns `Ok(true)` or `timeout` has elapsed
/// since the first attempt, sleeping `interval` between attempts
///
/// The predicate is always evaluated at least once, so a zero `timeout` means
/// "check exactly once".  Expiry is checked after each unsuccessful attempt and
/// before sleeping, which means we can overrun `timeout` by up to one
/// `interval` plus the time one evaluation takes.
///
/// This blocks the calling thread.  Use [`wait_for_async()`] from async code.
pub fn wait_for<P, E>(
    mut predicate: P,
    timeout: &Duration,
    interval: &Duration,
) -> Result<PollOutcome<E>, PollError>
where
    P: FnMut() -> Result<bool, E>,
{
    validate(timeout, interval)?;

    let start = std::time::Instant::now();
    let mut attempts = Attempts::new();
    loop {
        let done = attempts.observe(predicate());
        let elapsed = start.elapsed();
        if done || elapsed >= *timeout {
            return Ok(attempts.finish(done, elapsed));
        }
        std::thread::sleep(*interval);
    }
}

/// Async version of [`wait_for()`]
///
/// The semantics are identical.  Time is measured with [`tokio::time`], so
/// this respects a paused test clock.
pub async fn wait_for_async<P, Fut, E>(
    mut predicate: P,
    timeout: &Duration,
    interval: &Duration,
) -> Result<PollOutcome<E>, PollError>
where
    P: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    validate(timeout, interval)?;

    let start = tokio::time::Instant::now();
    let mut attempts = Attempts::new();
    loop {
        let done = attempts.observe(predicate().await);
        let elapsed = start.elapsed();
        if done || elapsed >= *timeout {
            return Ok(attempts.finish(done, elapsed));
        }
        tokio::time::sleep(*interval).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::Cell;

    /// Returns a predicate that replays `script` in order, then keeps
    /// returning `Ok(false)`.
    fn scripted(
        script: Vec<Result<bool, &'static str>>,
    ) -> impl FnMut() -> Result<bool, &'static str> {
        let mut script = script.into_iter();
        move || script.next().unwrap_or(Ok(false))
    }

    #[test]
    fn test_immediate_success() {
        let outcome = wait_for(
            || Ok::<_, ()>(true),
            &Duration::from_secs(10),
            &Duration::from_secs(1),
        )
        .unwrap();
        assert!(outcome.satisfied);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.last_error.is_none());
        assert!(outcome.elapsed < Duration::from_millis(500));
    }

    #[test]
    fn test_zero_timeout_checks_exactly_once() {
        for result in [Ok(false), Ok(true), Err("boom")] {
            let calls = Cell::new(0);
            let outcome = wait_for(
                || {
                    calls.set(calls.get() + 1);
                    result
                },
                &Duration::ZERO,
                &Duration::ZERO,
            )
            .unwrap();
            assert_eq!(calls.get(), 1);
            assert_eq!(outcome.attempts, 1);
            assert_eq!(outcome.satisfied, result == Ok(true));
        }
    }

    #[test]
    fn test_error_on_last_attempt_is_kept() {
        let outcome = wait_for(
            || Err::<bool, _>("nope"),
            &Duration::ZERO,
            &Duration::ZERO,
        )
        .unwrap();
        assert!(!outcome.satisfied);
        assert_eq!(outcome.last_error, Some("nope"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let calls = Cell::new(0);
        let error = wait_for(
            || {
                calls.set(calls.get() + 1);
                Ok::<_, ()>(true)
            },
            &Duration::from_secs(1),
            &Duration::ZERO,
        )
        .unwrap_err();
        assert_eq!(
            error,
            PollError::ZeroInterval { timeout: Duration::from_secs(1) }
        );
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_timeout_bound() {
        let timeout = Duration::from_millis(50);
        let interval = Duration::from_millis(10);
        let outcome =
            wait_for(|| Ok::<_, ()>(false), &timeout, &interval).unwrap();
        assert!(!outcome.satisfied);
        assert!(outcome.attempts >= 2);
        assert!(outcome.elapsed >= timeout);
        // one interval of overrun, plus slack for a loaded test machine
        assert!(outcome.elapsed < timeout + interval + Duration::from_secs(1));
    }

    #[test]
    fn test_errors_tolerated_until_success() {
        let outcome = wait_for(
            scripted(vec![Err("first"), Err("second"), Ok(true)]),
            &Duration::from_secs(10),
            &Duration::from_millis(5),
        )
        .unwrap();
        assert!(outcome.satisfied);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.last_error, Some("second"));
    }

    #[test]
    fn test_attempts_count_every_call() {
        let calls = Cell::new(0u32);
        let outcome = wait_for(
            || {
                calls.set(calls.get() + 1);
                Ok::<_, ()>(calls.get() == 7)
            },
            &Duration::from_secs(10),
            &Duration::from_millis(1),
        )
        .unwrap();
        assert!(outcome.satisfied);
        assert_eq!(outcome.attempts, 7);
        assert_eq!(calls.get(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_node_ready_after_three_checks() {
        let mut predicate = scripted(vec![Ok(false), Ok(false), Ok(true)]);
        let outcome = wait_for_async(
            || std::future::ready(predicate()),
            &Duration::from_secs(10),
            &Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert!(outcome.satisfied);
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.last_error.is_none());
        assert!(outcome.elapsed >= Duration::from_secs(2));
        assert!(
            outcome.elapsed < Duration::from_secs(2) + Duration::from_millis(50)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_timeout_overrun_is_one_interval_at_most() {
        let timeout = Duration::from_millis(5500);
        let interval = Duration::from_secs(2);
        let outcome = wait_for_async(
            || async { Ok::<_, ()>(false) },
            &timeout,
            &interval,
        )
        .await
        .unwrap();
        assert!(!outcome.satisfied);
        // attempts at t = 0, 2, 4, 6
        assert_eq!(outcome.attempts, 4);
        assert!(outcome.elapsed >= timeout);
        assert!(outcome.elapsed <= timeout + interval);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_errors_tolerated() {
        let mut predicate =
            scripted(vec![Err("not found"), Err("connection reset"), Ok(true)]);
        let outcome = wait_for_async(
            || std::future::ready(predicate()),
            &Duration::from_secs(30),
            &Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert!(outcome.satisfied);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.last_error, Some("connection reset"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_past_deadline_still_checks() {
        let outcome = wait_for_async(
            || async { Err::<bool, _>("unreachable") },
            &Duration::ZERO,
            &Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert!(!outcome.satisfied);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.last_error, Some("unreachable"));
    }
}
