// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Readiness checks for a Proxmox-backed Kubernetes rollout
//!
//! The checks are grouped into [`steps::Step`]s that build on each other,
//! from reaching the Proxmox API up to running workloads end to end.  The
//! `rollout-gate` binary runs them against a live environment.

pub mod config;
pub mod helpers;
pub mod report;
pub mod steps;

mod live_steps;
