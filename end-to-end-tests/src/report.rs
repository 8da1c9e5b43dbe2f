// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Check results and how they roll up into step results

use crate::steps::Step;
use anyhow::anyhow;
use colored::Colorize;
use rollout_test_utils::dev::poll::PollOutcome;
use slog::{error, info, warn, Logger};
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

/// What a check that didn't fail concluded
///
/// Failures are the `Err` side of a check's `anyhow::Result<Verdict>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    /// the check passed, but something deserves a look
    Warn(String),
    /// the check doesn't apply to this environment
    Skip(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckStatus {
    Passed,
    Warned(String),
    Skipped(String),
    Failed(String),
}

impl CheckStatus {
    fn from_result(result: anyhow::Result<Verdict>) -> CheckStatus {
        match result {
            Ok(Verdict::Pass) => CheckStatus::Passed,
            Ok(Verdict::Warn(why)) => CheckStatus::Warned(why),
            Ok(Verdict::Skip(why)) => CheckStatus::Skipped(why),
            Err(error) => CheckStatus::Failed(format!("{error:#}")),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, CheckStatus::Failed(_))
    }

    fn label(&self) -> colored::ColoredString {
        match self {
            CheckStatus::Passed => "PASS".green(),
            CheckStatus::Warned(_) => "WARN".yellow(),
            CheckStatus::Skipped(_) => "SKIP".cyan(),
            CheckStatus::Failed(_) => "FAIL".red().bold(),
        }
    }

    fn detail(&self) -> Option<&str> {
        match self {
            CheckStatus::Passed => None,
            CheckStatus::Warned(s)
            | CheckStatus::Skipped(s)
            | CheckStatus::Failed(s) => Some(s),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub elapsed: Duration,
}

impl fmt::Display for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  [{}] {} ({:.1}s)",
            self.status.label(),
            self.name,
            self.elapsed.as_secs_f64()
        )?;
        if let Some(detail) = self.status.detail() {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

/// Results of running (or declining to run) one step
#[derive(Clone, Debug)]
pub struct StepReport {
    pub step: Step,
    pub checks: Vec<CheckResult>,
    /// set when the step was not run because this dependency did not pass
    pub blocked_by: Option<Step>,
}

impl StepReport {
    pub fn new(step: Step) -> StepReport {
        StepReport { step, checks: Vec::new(), blocked_by: None }
    }

    pub fn blocked(step: Step, dependency: Step) -> StepReport {
        StepReport { step, checks: Vec::new(), blocked_by: Some(dependency) }
    }

    pub fn record(
        &mut self,
        name: &str,
        elapsed: Duration,
        result: anyhow::Result<Verdict>,
    ) -> &CheckResult {
        self.checks.push(CheckResult {
            name: name.to_string(),
            status: CheckStatus::from_result(result),
            elapsed,
        });
        &self.checks[self.checks.len() - 1]
    }

    /// Run one check, record its result, and print a line for it
    pub async fn check<F>(&mut self, log: &Logger, name: &str, check: F)
    where
        F: Future<Output = anyhow::Result<Verdict>>,
    {
        let start = Instant::now();
        let result = check.await;
        let step = self.step.slug();
        let recorded = self.record(name, start.elapsed(), result);
        match &recorded.status {
            CheckStatus::Passed | CheckStatus::Skipped(_) => {
                info!(log, "check finished"; "step" => step, "check" => name,
                    "status" => ?recorded.status);
            }
            CheckStatus::Warned(why) => {
                warn!(log, "check warned"; "step" => step, "check" => name,
                    "why" => why);
            }
            CheckStatus::Failed(why) => {
                error!(log, "check failed"; "step" => step, "check" => name,
                    "error" => why);
            }
        }
        println!("{recorded}");
    }

    pub fn passed(&self) -> bool {
        self.blocked_by.is_none()
            && !self.checks.iter().any(|c| c.status.is_failed())
    }

    fn count(&self, f: impl Fn(&CheckStatus) -> bool) -> usize {
        self.checks.iter().filter(|c| f(&c.status)).count()
    }

    pub fn num_passed(&self) -> usize {
        self.count(|s| matches!(s, CheckStatus::Passed))
    }

    pub fn num_warned(&self) -> usize {
        self.count(|s| matches!(s, CheckStatus::Warned(_)))
    }

    pub fn num_skipped(&self) -> usize {
        self.count(|s| matches!(s, CheckStatus::Skipped(_)))
    }

    pub fn num_failed(&self) -> usize {
        self.count(|s| s.is_failed())
    }

    pub fn elapsed(&self) -> Duration {
        self.checks.iter().map(|c| c.elapsed).sum()
    }

    /// One-line summary of the step, without color
    pub fn render(&self) -> String {
        let title = format!("step {} {}", self.step.number(), self.step.slug());
        if let Some(dependency) = self.blocked_by {
            return format!(
                "{title}: not run (dependency {} did not pass)",
                dependency.slug()
            );
        }
        format!(
            "{title}: {} passed, {} warned, {} skipped, {} failed ({:.1}s)",
            self.num_passed(),
            self.num_warned(),
            self.num_skipped(),
            self.num_failed(),
            self.elapsed().as_secs_f64(),
        )
    }
}

/// Turns an unsatisfied poll into a failure, a skip, or a warning
pub trait PollPolicy {
    /// Fail unless the condition was met
    fn require(self, what: &str) -> anyhow::Result<()>;
    /// Pass if the condition was met, otherwise skip
    fn or_skip(self, what: &str) -> Verdict;
    /// Pass if the condition was met, otherwise warn
    fn or_warn(self, what: &str) -> Verdict;
}

fn describe(outcome: &PollOutcome<anyhow::Error>, what: &str) -> String {
    let mut message = format!(
        "{what}: not satisfied after {} attempts in {}",
        outcome.attempts,
        humantime::format_duration(round_to_millis(outcome.elapsed)),
    );
    if let Some(error) = &outcome.last_error {
        message.push_str(&format!(" (last error: {error:#})"));
    }
    message
}

fn round_to_millis(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

impl PollPolicy for PollOutcome<anyhow::Error> {
    fn require(self, what: &str) -> anyhow::Result<()> {
        if self.satisfied {
            return Ok(());
        }
        Err(anyhow!(describe(&self, what)))
    }

    fn or_skip(self, what: &str) -> Verdict {
        if self.satisfied {
            Verdict::Pass
        } else {
            Verdict::Skip(describe(&self, what))
        }
    }

    fn or_warn(self, what: &str) -> Verdict {
        if self.satisfied {
            Verdict::Pass
        } else {
            Verdict::Warn(describe(&self, what))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn outcome(
        satisfied: bool,
        last_error: Option<&str>,
    ) -> PollOutcome<anyhow::Error> {
        PollOutcome {
            satisfied,
            elapsed: Duration::from_millis(30_250),
            attempts: 4,
            last_error: last_error.map(|e| anyhow!("{e}")),
        }
    }

    #[test]
    fn test_require() {
        outcome(true, Some("transient"))
            .require("ProxmoxCluster Ready")
            .unwrap();

        let error = outcome(false, Some("connection refused"))
            .require("ProxmoxCluster Ready")
            .unwrap_err();
        assert_eq!(
            error.to_string(),
            "ProxmoxCluster Ready: not satisfied after 4 attempts in 30s 250ms \
            (last error: connection refused)"
        );
    }

    #[test]
    fn test_or_skip_and_or_warn() {
        assert_eq!(outcome(true, None).or_skip("x"), Verdict::Pass);
        assert_eq!(outcome(true, None).or_warn("x"), Verdict::Pass);
        assert_eq!(
            outcome(false, None).or_skip("volume pod Running"),
            Verdict::Skip(String::from(
                "volume pod Running: not satisfied after 4 attempts in \
                30s 250ms"
            ))
        );
        assert!(matches!(
            outcome(false, None).or_warn("volume pod Running"),
            Verdict::Warn(_)
        ));
    }

    #[test]
    fn test_step_report() {
        let mut report = StepReport::new(Step::CsiStorage);
        report.record("a", Duration::from_secs(1), Ok(Verdict::Pass));
        report.record(
            "b",
            Duration::from_secs(2),
            Ok(Verdict::Warn(String::from("meh"))),
        );
        report.record(
            "c",
            Duration::ZERO,
            Ok(Verdict::Skip(String::from("n/a"))),
        );
        assert!(report.passed());
        assert_eq!(
            report.render(),
            "step 5 csi-storage: 1 passed, 1 warned, 1 skipped, 0 failed (3.0s)"
        );

        let failed = report.record(
            "d",
            Duration::ZERO,
            Err(anyhow!("inner").context("outer")),
        );
        assert_eq!(
            failed.status,
            CheckStatus::Failed(String::from("outer: inner"))
        );
        assert!(!report.passed());
        assert_eq!(report.num_failed(), 1);
    }

    #[test]
    fn test_blocked_step() {
        let report = StepReport::blocked(Step::E2e, Step::Monitoring);
        assert!(!report.passed());
        assert_eq!(
            report.render(),
            "step 8 e2e: not run (dependency monitoring did not pass)"
        );
    }
}
