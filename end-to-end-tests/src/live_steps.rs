// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Run each step, with its dependencies, against a live environment.
//!
//! These are ignored by default.  Point `ROLLOUT_CONFIG` (or the individual
//! environment overrides) at a real Proxmox host and cluster and run them
//! with `--ignored`.

#![cfg(test)]

use crate::config::HarnessConfig;
use crate::helpers::ctx::Context;
use crate::steps::{plan, Gate, Step};
use rollout_test_utils::dev::test_setup_log;

async fn run_step(test_name: &'static str, step: Step) {
    let log = test_setup_log(test_name);
    let config = HarnessConfig::load(None).expect("loading harness config");
    let ctx = Context::new(config, log);
    let reports = Gate::new(&ctx).run(&plan(&[step])).await;
    let failed: Vec<String> = reports
        .iter()
        .filter(|r| !r.passed())
        .map(|r| r.render())
        .collect();
    assert!(failed.is_empty(), "steps did not pass:\n{}", failed.join("\n"));
}

#[tokio::test]
#[ignore = "requires a live Proxmox/Kubernetes environment"]
async fn api_connection() {
    run_step("api_connection", Step::ApiConnection).await;
}

#[tokio::test]
#[ignore = "requires a live Proxmox/Kubernetes environment"]
async fn network_storage() {
    run_step("network_storage", Step::NetworkStorage).await;
}

#[tokio::test]
#[ignore = "requires a live Proxmox/Kubernetes environment"]
async fn vm_management() {
    run_step("vm_management", Step::VmManagement).await;
}

#[tokio::test]
#[ignore = "requires a live Proxmox/Kubernetes environment"]
async fn worker_integration() {
    run_step("worker_integration", Step::WorkerIntegration).await;
}

#[tokio::test]
#[ignore = "requires a live Proxmox/Kubernetes environment"]
async fn csi_storage() {
    run_step("csi_storage", Step::CsiStorage).await;
}

#[tokio::test]
#[ignore = "requires a live Proxmox/Kubernetes environment"]
async fn network_policies() {
    run_step("network_policies", Step::NetworkPolicies).await;
}

#[tokio::test]
#[ignore = "requires a live Proxmox/Kubernetes environment"]
async fn monitoring() {
    run_step("monitoring", Step::Monitoring).await;
}

#[tokio::test]
#[ignore = "requires a live Proxmox/Kubernetes environment"]
async fn end_to_end() {
    run_step("end_to_end", Step::E2e).await;
}
