// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The rollout steps and the gate that runs them in dependency order

mod api_connection;
mod csi_storage;
mod e2e;
mod monitoring;
mod network_policies;
mod network_storage;
mod vm_management;
mod worker_integration;

use crate::helpers::ctx::Context;
use crate::report::StepReport;
use slog::{info, o, warn, Logger};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Step {
    ApiConnection,
    NetworkStorage,
    VmManagement,
    WorkerIntegration,
    CsiStorage,
    NetworkPolicies,
    Monitoring,
    E2e,
}

impl Step {
    pub const ALL: [Step; 8] = [
        Step::ApiConnection,
        Step::NetworkStorage,
        Step::VmManagement,
        Step::WorkerIntegration,
        Step::CsiStorage,
        Step::NetworkPolicies,
        Step::Monitoring,
        Step::E2e,
    ];

    pub fn number(self) -> u8 {
        match self {
            Step::ApiConnection => 1,
            Step::NetworkStorage => 2,
            Step::VmManagement => 3,
            Step::WorkerIntegration => 4,
            Step::CsiStorage => 5,
            Step::NetworkPolicies => 6,
            Step::Monitoring => 7,
            Step::E2e => 8,
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            Step::ApiConnection => "api-connection",
            Step::NetworkStorage => "network-storage",
            Step::VmManagement => "vm-management",
            Step::WorkerIntegration => "worker-integration",
            Step::CsiStorage => "csi-storage",
            Step::NetworkPolicies => "network-policies",
            Step::Monitoring => "monitoring",
            Step::E2e => "e2e",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Step::ApiConnection => "Proxmox API connection and authentication",
            Step::NetworkStorage => "Proxmox network and storage configuration",
            Step::VmManagement => "VM management via Cluster API",
            Step::WorkerIntegration => "Proxmox worker integration",
            Step::CsiStorage => "CSI storage",
            Step::NetworkPolicies => "Network policies",
            Step::Monitoring => "Monitoring",
            Step::E2e => "End-to-end integration",
        }
    }

    /// Steps that must pass before this one can run
    pub fn dependencies(self) -> &'static [Step] {
        match self {
            Step::ApiConnection => &[],
            Step::NetworkStorage => &[Step::ApiConnection],
            Step::VmManagement => &[Step::ApiConnection, Step::NetworkStorage],
            Step::WorkerIntegration => &[Step::VmManagement],
            Step::CsiStorage | Step::NetworkPolicies | Step::Monitoring => {
                &[Step::WorkerIntegration]
            }
            Step::E2e => {
                &[Step::CsiStorage, Step::NetworkPolicies, Step::Monitoring]
            }
        }
    }

    async fn run(self, ctx: &Context, report: &mut StepReport) {
        match self {
            Step::ApiConnection => api_connection::run(ctx, report).await,
            Step::NetworkStorage => network_storage::run(ctx, report).await,
            Step::VmManagement => vm_management::run(ctx, report).await,
            Step::WorkerIntegration => {
                worker_integration::run(ctx, report).await
            }
            Step::CsiStorage => csi_storage::run(ctx, report).await,
            Step::NetworkPolicies => network_policies::run(ctx, report).await,
            Step::Monitoring => monitoring::run(ctx, report).await,
            Step::E2e => e2e::run(ctx, report).await,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error(
    "unknown step {0:?} (expected 1-8 or one of: {names})",
    names = step_names()
)]
pub struct UnknownStep(pub String);

fn step_names() -> String {
    Step::ALL.iter().map(|s| s.slug()).collect::<Vec<_>>().join(", ")
}

impl FromStr for Step {
    type Err = UnknownStep;

    fn from_str(s: &str) -> Result<Step, UnknownStep> {
        Step::ALL
            .into_iter()
            .find(|step| {
                step.slug() == s || s.parse::<u8>() == Ok(step.number())
            })
            .ok_or_else(|| UnknownStep(s.to_string()))
    }
}

/// The steps to run for `selected`: those steps plus everything they
/// transitively depend on, in an order where every step follows its
/// dependencies
///
/// An empty selection means every step.
pub fn plan(selected: &[Step]) -> Vec<Step> {
    if selected.is_empty() {
        return Step::ALL.to_vec();
    }
    let mut included = BTreeSet::new();
    let mut pending = selected.to_vec();
    while let Some(step) = pending.pop() {
        if included.insert(step) {
            pending.extend_from_slice(step.dependencies());
        }
    }
    // The enum's declaration order is a topological order.
    included.into_iter().collect()
}

/// Carries out the checks of one step, recording them in `report`
trait StepRunner {
    async fn run_step(&self, step: Step, report: &mut StepReport);
}

impl StepRunner for Context {
    async fn run_step(&self, step: Step, report: &mut StepReport) {
        step.run(self, report).await
    }
}

/// Runs a plan of steps against one environment
pub struct Gate<'a> {
    ctx: &'a Context,
}

impl<'a> Gate<'a> {
    pub fn new(ctx: &'a Context) -> Gate<'a> {
        Gate { ctx }
    }

    /// Run `plan` in order
    ///
    /// A step whose dependencies didn't all pass is recorded as blocked and
    /// not run.  Steps that don't depend on a failed step still run.
    pub async fn run(&self, plan: &[Step]) -> Vec<StepReport> {
        run_plan(&self.ctx.log, self.ctx, plan).await
    }
}

async fn run_plan<R: StepRunner>(
    log: &Logger,
    runner: &R,
    plan: &[Step],
) -> Vec<StepReport> {
    let mut reports: Vec<StepReport> = Vec::with_capacity(plan.len());
    for &step in plan {
        let log = log.new(o!("step" => step.slug()));
        if let Some(dependency) = blocking_dependency(step, &reports) {
            warn!(log, "skipping step";
                "failed_dependency" => dependency.slug());
            reports.push(StepReport::blocked(step, dependency));
            continue;
        }

        println!("==> step {}: {}", step.number(), step.title());
        info!(log, "starting step");
        let mut report = StepReport::new(step);
        runner.run_step(step, &mut report).await;
        info!(log, "finished step"; "passed" => report.passed());
        reports.push(report);
    }
    reports
}

/// The first dependency of `step` that was planned but didn't pass
///
/// Dependencies left out of the plan entirely don't block anything; `plan`
/// always includes them, so that only happens for a hand-built plan.
fn blocking_dependency(step: Step, reports: &[StepReport]) -> Option<Step> {
    step.dependencies().iter().copied().find(|dependency| {
        reports.iter().any(|r| r.step == *dependency && !r.passed())
    })
}

/// Process exit status for a finished run
pub fn exit_code(reports: &[StepReport]) -> i32 {
    if reports.iter().all(StepReport::passed) { 0 } else { 1 }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::report::{CheckStatus, PollPolicy, Verdict};
    use anyhow::anyhow;
    use rollout_test_utils::dev::poll::PollOutcome;
    use rollout_test_utils::dev::test_setup_log;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::time::Duration;

    #[test]
    fn test_from_str() {
        assert_eq!("csi-storage".parse::<Step>(), Ok(Step::CsiStorage));
        assert_eq!("1".parse::<Step>(), Ok(Step::ApiConnection));
        assert_eq!("8".parse::<Step>(), Ok(Step::E2e));
        assert_eq!(
            "9".parse::<Step>(),
            Err(UnknownStep(String::from("9")))
        );
        assert!("CSI".parse::<Step>().is_err());
        for step in Step::ALL {
            assert_eq!(step.slug().parse::<Step>(), Ok(step));
            assert_eq!(step.number().to_string().parse::<Step>(), Ok(step));
        }
    }

    #[test]
    fn test_dependencies_precede_dependents() {
        for step in Step::ALL {
            for dependency in step.dependencies() {
                assert!(
                    dependency < &step,
                    "{dependency} must precede {step}"
                );
            }
        }
    }

    #[test]
    fn test_plan() {
        assert_eq!(plan(&[]), Step::ALL.to_vec());
        assert_eq!(plan(&[Step::ApiConnection]), vec![Step::ApiConnection]);
        assert_eq!(
            plan(&[Step::WorkerIntegration]),
            vec![
                Step::ApiConnection,
                Step::NetworkStorage,
                Step::VmManagement,
                Step::WorkerIntegration,
            ]
        );
        // duplicates and ordering of the selection don't matter
        assert_eq!(
            plan(&[Step::Monitoring, Step::CsiStorage, Step::Monitoring]),
            vec![
                Step::ApiConnection,
                Step::NetworkStorage,
                Step::VmManagement,
                Step::WorkerIntegration,
                Step::CsiStorage,
                Step::Monitoring,
            ]
        );
        assert_eq!(plan(&[Step::E2e]), Step::ALL.to_vec());
    }

    fn finished(step: Step, pass: bool) -> StepReport {
        let mut report = StepReport::new(step);
        let result =
            if pass { Ok(Verdict::Pass) } else { Err(anyhow!("boom")) };
        report.record("only", Duration::ZERO, result);
        report
    }

    #[test]
    fn test_blocking_dependency() {
        let reports = vec![
            finished(Step::WorkerIntegration, true),
            finished(Step::CsiStorage, true),
            finished(Step::NetworkPolicies, false),
        ];
        assert_eq!(blocking_dependency(Step::Monitoring, &reports), None);
        assert_eq!(
            blocking_dependency(Step::E2e, &reports),
            Some(Step::NetworkPolicies)
        );

        // a blocked step blocks its own dependents in turn
        let reports = vec![
            finished(Step::ApiConnection, false),
            StepReport::blocked(Step::NetworkStorage, Step::ApiConnection),
        ];
        assert_eq!(
            blocking_dependency(Step::VmManagement, &reports),
            Some(Step::ApiConnection)
        );
    }

    #[test]
    fn test_exit_code() {
        assert_eq!(exit_code(&[]), 0);
        assert_eq!(exit_code(&[finished(Step::ApiConnection, true)]), 0);
        assert_eq!(
            exit_code(&[
                finished(Step::ApiConnection, true),
                finished(Step::NetworkStorage, false),
            ]),
            1
        );
    }

    /// How a step under [`Scripted`] turns out
    enum Script {
        Fails,
        /// a poll whose condition is optional times out
        OptionalTimeout,
        /// a poll whose condition is required times out
        RequiredTimeout,
    }

    fn timed_out() -> PollOutcome<anyhow::Error> {
        PollOutcome {
            satisfied: false,
            elapsed: Duration::from_secs(60),
            attempts: 7,
            last_error: None,
        }
    }

    /// Stands in for the real steps: every step passes unless scripted
    /// otherwise, and the steps actually run are remembered
    struct Scripted {
        script: BTreeMap<Step, Script>,
        ran: RefCell<Vec<Step>>,
    }

    impl Scripted {
        fn new(script: impl IntoIterator<Item = (Step, Script)>) -> Scripted {
            Scripted {
                script: script.into_iter().collect(),
                ran: RefCell::new(Vec::new()),
            }
        }
    }

    impl StepRunner for Scripted {
        async fn run_step(&self, step: Step, report: &mut StepReport) {
            self.ran.borrow_mut().push(step);
            let result = match self.script.get(&step) {
                None => Ok(Verdict::Pass),
                Some(Script::Fails) => Err(anyhow!("{step} broke")),
                Some(Script::OptionalTimeout) => {
                    Ok(timed_out().or_skip("optional component"))
                }
                Some(Script::RequiredTimeout) => timed_out()
                    .require("required component")
                    .map(|()| Verdict::Pass),
            };
            report.record("scripted", Duration::ZERO, result);
        }
    }

    fn blocked_by(reports: &[StepReport]) -> Vec<(Step, Option<Step>)> {
        reports.iter().map(|r| (r.step, r.blocked_by)).collect()
    }

    #[tokio::test]
    async fn test_failed_step_blocks_only_dependents() {
        let log = test_setup_log("test_failed_step_blocks_only_dependents");
        let runner = Scripted::new([(Step::NetworkPolicies, Script::Fails)]);
        let reports = run_plan(&log, &runner, &plan(&[])).await;

        assert_eq!(
            *runner.ran.borrow(),
            vec![
                Step::ApiConnection,
                Step::NetworkStorage,
                Step::VmManagement,
                Step::WorkerIntegration,
                Step::CsiStorage,
                Step::NetworkPolicies,
                Step::Monitoring,
            ]
        );
        assert_eq!(reports.len(), 8);
        assert_eq!(
            blocked_by(&reports)[5..],
            [
                (Step::NetworkPolicies, None),
                (Step::Monitoring, None),
                (Step::E2e, Some(Step::NetworkPolicies)),
            ]
        );
        assert!(!reports[5].passed());
        assert_eq!(reports[5].num_failed(), 1);
        assert!(reports[6].passed());
        assert!(reports[7].checks.is_empty());
        assert_eq!(exit_code(&reports), 1);
    }

    #[tokio::test]
    async fn test_failed_root_blocks_everything() {
        let log = test_setup_log("test_failed_root_blocks_everything");
        let runner = Scripted::new([(Step::ApiConnection, Script::Fails)]);
        let reports = run_plan(&log, &runner, &plan(&[])).await;

        assert_eq!(*runner.ran.borrow(), vec![Step::ApiConnection]);
        assert_eq!(
            blocked_by(&reports),
            vec![
                (Step::ApiConnection, None),
                (Step::NetworkStorage, Some(Step::ApiConnection)),
                (Step::VmManagement, Some(Step::ApiConnection)),
                (Step::WorkerIntegration, Some(Step::VmManagement)),
                (Step::CsiStorage, Some(Step::WorkerIntegration)),
                (Step::NetworkPolicies, Some(Step::WorkerIntegration)),
                (Step::Monitoring, Some(Step::WorkerIntegration)),
                (Step::E2e, Some(Step::CsiStorage)),
            ]
        );
        assert!(reports.iter().all(|r| !r.passed()));
    }

    #[tokio::test]
    async fn test_timeouts_skip_or_fail_by_policy() {
        let log = test_setup_log("test_timeouts_skip_or_fail_by_policy");
        let runner = Scripted::new([
            (Step::CsiStorage, Script::OptionalTimeout),
            (Step::Monitoring, Script::RequiredTimeout),
        ]);
        let reports = run_plan(&log, &runner, &[
            Step::WorkerIntegration,
            Step::CsiStorage,
            Step::Monitoring,
            Step::E2e,
        ])
        .await;

        let csi = &reports[1];
        assert!(csi.passed());
        assert_eq!(csi.num_skipped(), 1);
        assert_eq!(
            csi.checks[0].status,
            CheckStatus::Skipped(String::from(
                "optional component: not satisfied after 7 attempts in 1m"
            ))
        );

        let monitoring = &reports[2];
        assert!(!monitoring.passed());
        assert_eq!(
            monitoring.checks[0].status,
            CheckStatus::Failed(String::from(
                "required component: not satisfied after 7 attempts in 1m"
            ))
        );

        assert_eq!(reports[3].blocked_by, Some(Step::Monitoring));
        assert_eq!(
            *runner.ran.borrow(),
            vec![Step::WorkerIntegration, Step::CsiStorage, Step::Monitoring]
        );
    }
}
