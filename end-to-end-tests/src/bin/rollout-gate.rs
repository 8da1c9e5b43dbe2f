// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runs the rollout readiness gate against a Proxmox host and a cluster

use anyhow::Context as _;
use camino::Utf8PathBuf;
use clap::Parser;
use colored::Colorize;
use rollout_e2e_tests::config::HarnessConfig;
use rollout_e2e_tests::helpers::ctx::Context;
use rollout_e2e_tests::report::StepReport;
use rollout_e2e_tests::steps::{exit_code, plan, Gate, Step};
use rollout_test_utils::dev::stderr_logger;
use slog::{info, o};

fn parse_log_level(s: &str) -> Result<slog::Level, String> {
    s.parse().map_err(|_| format!("invalid log level {s:?}"))
}

#[derive(Clone, Debug, Parser)]
struct Args {
    /// Steps to run, by number or name (default: all).  The steps they
    /// depend on are always run first.
    steps: Vec<Step>,

    /// TOML configuration file (default: $ROLLOUT_CONFIG, if set)
    #[arg(long)]
    config: Option<Utf8PathBuf>,

    /// The log level.
    #[arg(
        long,
        default_value_t = slog::Level::Info,
        value_parser = parse_log_level
    )]
    log_level: slog::Level,

    /// Print the steps that would run and exit
    #[arg(long)]
    list: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let plan = plan(&args.steps);

    if args.list {
        for step in &plan {
            println!("{} {}: {}", step.number(), step.slug(), step.title());
        }
        return Ok(());
    }

    let config = HarnessConfig::load(args.config.as_deref())
        .context("loading configuration")?;
    let log = stderr_logger("rollout-gate", args.log_level);
    info!(log, "starting rollout gate";
        "steps" => plan.iter().map(|s| s.slug()).collect::<Vec<_>>().join(","));
    let ctx = Context::new(config, log.new(o!()));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("creating tokio runtime")?;
    let reports = runtime.block_on(Gate::new(&ctx).run(&plan));

    print_summary(&reports);
    let code = exit_code(&reports);
    info!(log, "rollout gate finished"; "exit_code" => code);
    drop(ctx);
    drop(log);
    std::process::exit(code);
}

fn print_summary(reports: &[StepReport]) {
    println!();
    println!("{}", "==> summary".bold());
    for report in reports {
        let line = report.render();
        if report.passed() {
            println!("  {}", line.green());
        } else if report.blocked_by.is_some() {
            println!("  {}", line.yellow());
        } else {
            println!("  {}", line.red());
        }
    }
    if reports.iter().all(StepReport::passed) {
        println!("{}", "rollout gate passed".green().bold());
    } else {
        println!("{}", "rollout gate FAILED".red().bold());
    }
}
