// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Step 1: the Proxmox API is reachable and accepts our credentials

use crate::config::ProxmoxConfig;
use crate::helpers::ctx::Context;
use crate::helpers::proxmox::{ProxmoxClient, ProxmoxError};
use crate::helpers::Timing;
use crate::report::{PollPolicy, StepReport, Verdict};
use anyhow::{anyhow, bail, ensure, Context as _, Result};
use rollout_test_utils::dev::poll::wait_for;
use slog::info;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REACHABLE: Timing = Timing::secs(30, 5);
const MAX_RESPONSE_TIME: Duration = Duration::from_secs(5);

pub(super) async fn run(ctx: &Context, report: &mut StepReport) {
    let log = &ctx.log;
    report.check(log, "host reachable", host_reachable(ctx)).await;
    report.check(log, "authentication", authentication(ctx)).await;
    report.check(log, "version info", version_info(ctx)).await;
    report.check(log, "node list", node_list(ctx)).await;
    report.check(log, "cluster status", cluster_status(ctx)).await;
    report.check(log, "permissions", permissions(ctx)).await;
    report.check(log, "response time", response_time(ctx)).await;
    report
        .check(log, "invalid credentials rejected", invalid_credentials(ctx))
        .await;
}

fn tcp_connect(host: &str, port: u16) -> Result<bool> {
    let addrs = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolving {host}"))?;
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, TCP_CONNECT_TIMEOUT) {
            Ok(_) => return Ok(true),
            Err(error) => last_error = Some((addr, error)),
        }
    }
    match last_error {
        Some((addr, error)) => {
            Err(anyhow!(error).context(format!("connecting to {addr}")))
        }
        None => bail!("{host} resolved to no addresses"),
    }
}

async fn host_reachable(ctx: &Context) -> Result<Verdict> {
    let ProxmoxConfig { host, port, .. } = ctx.config.proxmox.clone();
    let target = format!("{host}:{port}");
    let outcome = tokio::task::spawn_blocking(move || {
        wait_for(
            || tcp_connect(&host, port),
            &REACHABLE.timeout,
            &REACHABLE.interval,
        )
    })
    .await
    .context("TCP connection task panicked")??;
    let attempts = outcome.attempts;
    outcome.require(&format!("TCP connection to {target}"))?;
    info!(ctx.log, "Proxmox host reachable";
        "target" => &target, "attempts" => attempts);
    Ok(Verdict::Pass)
}

async fn authentication(ctx: &Context) -> Result<Verdict> {
    ctx.proxmox().await?;
    Ok(Verdict::Pass)
}

async fn version_info(ctx: &Context) -> Result<Verdict> {
    let version = ctx.proxmox().await?.version().await?;
    ensure!(!version.version.is_empty(), "version field is empty");
    ensure!(!version.release.is_empty(), "release field is empty");
    info!(ctx.log, "Proxmox version";
        "version" => &version.version, "release" => &version.release);
    Ok(Verdict::Pass)
}

async fn node_list(ctx: &Context) -> Result<Verdict> {
    let nodes = ctx.proxmox().await?.nodes().await?;
    ensure!(!nodes.is_empty(), "no nodes found in cluster");
    for node in &nodes {
        ensure!(!node.node.is_empty(), "node with empty name");
        ensure!(!node.status.is_empty(), "node {} has no status", node.node);
        let kind = node
            .kind
            .as_deref()
            .ok_or_else(|| anyhow!("node {} has no type", node.node))?;
        info!(ctx.log, "Proxmox node";
            "node" => &node.node, "status" => &node.status, "type" => kind);
    }
    Ok(Verdict::Pass)
}

async fn cluster_status(ctx: &Context) -> Result<Verdict> {
    let items = ctx.proxmox().await?.cluster_status().await?;
    for item in &items {
        info!(ctx.log, "cluster item";
            "name" => item.name.as_deref().unwrap_or("unknown"),
            "type" => &item.kind);
    }
    Ok(Verdict::Pass)
}

async fn permissions(ctx: &Context) -> Result<Verdict> {
    match ctx.proxmox().await?.nodes().await {
        Ok(_) => Ok(Verdict::Pass),
        Err(ProxmoxError::Forbidden { .. }) => {
            bail!(
                "user {} does not have permission to list nodes",
                ctx.config.proxmox.username
            )
        }
        Err(error) => Err(error.into()),
    }
}

async fn response_time(ctx: &Context) -> Result<Verdict> {
    let client = ctx.proxmox().await?;
    let start = Instant::now();
    client.version().await?;
    let elapsed = start.elapsed();
    ensure!(
        elapsed < MAX_RESPONSE_TIME,
        "API response time too slow: {:.2}s",
        elapsed.as_secs_f64()
    );
    info!(ctx.log, "API response time"; "elapsed" => ?elapsed);
    Ok(Verdict::Pass)
}

async fn invalid_credentials(ctx: &Context) -> Result<Verdict> {
    let bogus = ProxmoxConfig {
        username: String::from("invalid_user@pve"),
        password: String::from("invalid_password"),
        ..ctx.config.proxmox.clone()
    };
    match ProxmoxClient::login(&bogus).await {
        Ok(_) => bail!("login succeeded with invalid credentials"),
        Err(error) if error.is_auth_failure() => Ok(Verdict::Pass),
        Err(error) => Ok(Verdict::Warn(format!(
            "login failed, but not with an authentication error: {:#}",
            anyhow::Error::from(error)
        ))),
    }
}
