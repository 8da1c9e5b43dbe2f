// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod conditions;
pub mod ctx;
pub mod k8s;
pub mod proxmox;

use anyhow::{Context as _, Result};
use rand::Rng;
use rollout_test_utils::dev::poll::{wait_for_async, PollOutcome};
use slog::{debug, info, warn, Logger};
use std::future::Future;
use std::time::Duration;

/// Generate a unique name usable as a Kubernetes object name
pub fn generate_name(prefix: &str) -> String {
    format!("{}-{:x}", prefix, rand::rng().random_range(0..0xff_ffffu32))
}

/// How long to keep polling a condition, and how often
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timing {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Timing {
    pub const fn secs(timeout: u64, interval: u64) -> Timing {
        Timing {
            timeout: Duration::from_secs(timeout),
            interval: Duration::from_secs(interval),
        }
    }
}

/// Poll `predicate` with [`wait_for_async()`], logging each unsuccessful
/// attempt at debug level and the outcome at info (or warn) level
///
/// The returned outcome is not judged here; see [`crate::report::PollPolicy`].
pub async fn poll<P, Fut>(
    log: &Logger,
    what: &str,
    timing: Timing,
    mut predicate: P,
) -> Result<PollOutcome<anyhow::Error>>
where
    P: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let mut attempt = 0u32;
    let outcome = wait_for_async(
        || {
            attempt += 1;
            let attempt = attempt;
            let check = predicate();
            async move {
                let result = check.await;
                match &result {
                    Ok(true) => (),
                    Ok(false) => debug!(
                        log, "not yet";
                        "what" => what,
                        "attempt" => attempt,
                    ),
                    Err(error) => debug!(
                        log, "check failed";
                        "what" => what,
                        "attempt" => attempt,
                        "error" => format!("{error:#}"),
                    ),
                }
                result
            }
        },
        &timing.timeout,
        &timing.interval,
    )
    .await
    .with_context(|| format!("polling for {what}"))?;

    if outcome.satisfied {
        info!(
            log, "condition met";
            "what" => what,
            "attempts" => outcome.attempts,
            "elapsed" => ?outcome.elapsed,
        );
    } else {
        warn!(
            log, "gave up waiting";
            "what" => what,
            "attempts" => outcome.attempts,
            "elapsed" => ?outcome.elapsed,
            "last_error" =>
                outcome.last_error.as_ref().map(|e| format!("{e:#}")),
        );
    }
    Ok(outcome)
}

#[cfg(test)]
mod test {
    use super::*;
    use rollout_test_utils::dev::test_setup_log;

    #[test]
    fn test_generate_name() {
        let a = generate_name("e2e-app");
        let b = generate_name("e2e-app");
        assert!(a.starts_with("e2e-app-"));
        assert!(a.len() <= 63);
        assert!(a.chars().all(|c| c.is_ascii_lowercase()
            || c.is_ascii_digit()
            || c == '-'));
        // not a guarantee, but a collision here would be astonishing
        assert_ne!(a, b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_reports_outcome() {
        let log = test_setup_log("test_poll_reports_outcome");
        let mut remaining = 2;
        let outcome = poll(&log, "replicas", Timing::secs(60, 5), || {
            let result = if remaining == 0 {
                Ok(true)
            } else {
                remaining -= 1;
                Err(anyhow::anyhow!("{remaining} to go"))
            };
            std::future::ready(result)
        })
        .await
        .unwrap();
        assert!(outcome.satisfied);
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.elapsed >= Duration::from_secs(10));
        assert!(outcome.elapsed < Duration::from_secs(11));
        assert_eq!(outcome.last_error.unwrap().to_string(), "0 to go");
    }

    #[tokio::test]
    async fn test_poll_rejects_zero_interval() {
        let log = test_setup_log("test_poll_rejects_zero_interval");
        let timing = Timing {
            timeout: Duration::from_secs(1),
            interval: Duration::ZERO,
        };
        let error = poll(&log, "anything", timing, || async { Ok(true) })
            .await
            .unwrap_err();
        assert!(error.to_string().contains("anything"), "{error:#}");
    }
}
