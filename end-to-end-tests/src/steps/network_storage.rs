// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Step 2: Proxmox networking and storage are set up for cluster VMs

use crate::helpers::ctx::Context;
use crate::helpers::proxmox::NetworkInterface;
use crate::report::{StepReport, Verdict};
use anyhow::{bail, ensure, Result};
use slog::{info, warn};

/// Staged (never applied) during the bridge round trip
const SCRATCH_BRIDGE: &str = "vmbr999";
const REQUIRED_CONTENT: [&str; 3] = ["images", "iso", "backup"];
const RECOMMENDED_STORAGE_TYPES: [&str; 3] = ["lvm", "zfs", "ceph"];
const USAGE_WARN_PERCENT: f64 = 90.0;

pub(super) async fn run(ctx: &Context, report: &mut StepReport) {
    let log = &ctx.log;
    report.check(log, "network interfaces", network_interfaces(ctx)).await;
    report.check(log, "bridges configured", bridges(ctx)).await;
    report
        .check(log, "configured bridge present", configured_bridge(ctx))
        .await;
    report.check(log, "SDN configuration", sdn(ctx)).await;
    report.check(log, "bridge create/delete", bridge_round_trip(ctx)).await;
    report.check(log, "storage pools configured", storage_pools(ctx)).await;
    report.check(log, "local storage", local_storage(ctx)).await;
    report.check(log, "node storage active", node_storage_active(ctx)).await;
    report.check(log, "storage types", storage_types(ctx)).await;
    report.check(log, "storage content types", content_types(ctx)).await;
    report.check(log, "storage space", storage_space(ctx)).await;
    report
        .check(log, "Kubernetes requirements", kubernetes_requirements(ctx))
        .await;
}

/// The configured node if the cluster has it, otherwise the first node
async fn test_node(ctx: &Context) -> Result<String> {
    let nodes = ctx.proxmox().await?.nodes().await?;
    let wanted = &ctx.config.proxmox.node;
    if let Some(node) = nodes.iter().find(|n| &n.node == wanted) {
        return Ok(node.node.clone());
    }
    match nodes.into_iter().next() {
        Some(node) => {
            warn!(ctx.log, "configured node not found, using first node";
                "configured" => wanted, "using" => &node.node);
            Ok(node.node)
        }
        None => bail!("no nodes available"),
    }
}

async fn interfaces(ctx: &Context) -> Result<Vec<NetworkInterface>> {
    let node = test_node(ctx).await?;
    Ok(ctx.proxmox().await?.node_network(&node).await?)
}

async fn network_interfaces(ctx: &Context) -> Result<Verdict> {
    let interfaces = interfaces(ctx).await?;
    ensure!(!interfaces.is_empty(), "no network interfaces found");
    ensure!(
        interfaces.iter().any(|i| i.kind == "loopback"),
        "no loopback interface found"
    );
    for iface in &interfaces {
        info!(ctx.log, "interface";
            "iface" => &iface.iface, "type" => &iface.kind);
    }
    Ok(Verdict::Pass)
}

/// Every bridge must follow the `vmbrN` naming used by VM templates
fn check_bridge_names(interfaces: &[NetworkInterface]) -> Result<()> {
    let bridges: Vec<&str> = interfaces
        .iter()
        .filter(|i| i.is_bridge())
        .map(|i| i.iface.as_str())
        .collect();
    ensure!(!bridges.is_empty(), "no bridge interfaces found");
    let unconventional: Vec<&str> =
        bridges.into_iter().filter(|name| !name.starts_with("vmbr")).collect();
    ensure!(
        unconventional.is_empty(),
        "bridges not following the vmbrN convention: {}",
        unconventional.join(", ")
    );
    Ok(())
}

async fn bridges(ctx: &Context) -> Result<Verdict> {
    check_bridge_names(&interfaces(ctx).await?)?;
    Ok(Verdict::Pass)
}

async fn configured_bridge(ctx: &Context) -> Result<Verdict> {
    let wanted = &ctx.config.proxmox.bridge;
    let interfaces = interfaces(ctx).await?;
    ensure!(
        interfaces.iter().any(|i| i.is_bridge() && &i.iface == wanted),
        "bridge {wanted} not found"
    );
    Ok(Verdict::Pass)
}

async fn sdn(ctx: &Context) -> Result<Verdict> {
    let client = ctx.proxmox().await?;
    // SDN is optional.
    let zones = client.sdn_zones().await;
    let vnets = client.sdn_vnets().await;
    let (zones, vnets) = match (zones, vnets) {
        (Ok(zones), Ok(vnets)) => (zones, vnets),
        (Err(error), _) | (_, Err(error)) => {
            return Ok(Verdict::Warn(format!(
                "SDN not configured or not accessible: {:#}",
                anyhow::Error::from(error)
            )));
        }
    };
    info!(ctx.log, "SDN"; "zones" => zones.len(), "vnets" => vnets.len());
    Ok(Verdict::Pass)
}

async fn bridge_round_trip(ctx: &Context) -> Result<Verdict> {
    let node = test_node(ctx).await?;
    let client = ctx.proxmox().await?;
    if let Err(error) = client.create_bridge(&node, SCRATCH_BRIDGE).await {
        return Ok(Verdict::Warn(format!(
            "could not create {SCRATCH_BRIDGE}: {:#}",
            anyhow::Error::from(error)
        )));
    }

    let listed = client
        .node_network(&node)
        .await
        .map(|ifaces| ifaces.iter().any(|i| i.iface == SCRATCH_BRIDGE));
    let cleanup = client.delete_bridge(&node, SCRATCH_BRIDGE).await;

    match (listed, cleanup) {
        (Ok(true), Ok(())) => Ok(Verdict::Pass),
        (Ok(false), _) => Ok(Verdict::Warn(format!(
            "{SCRATCH_BRIDGE} was accepted but is not listed on {node}"
        ))),
        (Err(error), _) => Ok(Verdict::Warn(format!(
            "listing interfaces after creating {SCRATCH_BRIDGE}: {:#}",
            anyhow::Error::from(error)
        ))),
        (Ok(true), Err(error)) => Ok(Verdict::Warn(format!(
            "failed to clean up {SCRATCH_BRIDGE}: {:#}",
            anyhow::Error::from(error)
        ))),
    }
}

async fn storage_pools(ctx: &Context) -> Result<Verdict> {
    let pools = ctx.proxmox().await?.storage().await?;
    ensure!(!pools.is_empty(), "no storage pools configured");
    for pool in &pools {
        info!(ctx.log, "storage pool";
            "storage" => &pool.storage, "type" => &pool.kind);
    }
    Ok(Verdict::Pass)
}

async fn local_storage(ctx: &Context) -> Result<Verdict> {
    let pools = ctx.proxmox().await?.storage().await?;
    let Some(local) = pools.iter().find(|p| p.storage == "local") else {
        bail!("no local storage found");
    };
    ensure!(
        local.kind == "dir",
        "local storage is {:?}, not dir",
        local.kind
    );
    ensure!(
        local.path.as_deref() == Some("/var/lib/vz"),
        "local storage path is {:?}, expected /var/lib/vz",
        local.path
    );
    Ok(Verdict::Pass)
}

async fn node_storage_active(ctx: &Context) -> Result<Verdict> {
    let node = test_node(ctx).await?;
    let storage = ctx.proxmox().await?.node_storage(&node).await?;
    ensure!(!storage.is_empty(), "no storage available on {node}");
    let inactive: Vec<&str> = storage
        .iter()
        .filter(|s| !s.is_active())
        .map(|s| s.storage.as_str())
        .collect();
    ensure!(
        inactive.is_empty(),
        "storage not active on {node}: {}",
        inactive.join(", ")
    );
    Ok(Verdict::Pass)
}

async fn storage_types(ctx: &Context) -> Result<Verdict> {
    let pools = ctx.proxmox().await?.storage().await?;
    ensure!(
        pools.iter().any(|p| p.kind == "dir"),
        "no dir storage configured"
    );
    let recommended: Vec<&str> = RECOMMENDED_STORAGE_TYPES
        .into_iter()
        .filter(|t| pools.iter().any(|p| p.kind == *t))
        .collect();
    info!(ctx.log, "storage types";
        "recommended_present" => recommended.join(","));
    Ok(Verdict::Pass)
}

async fn content_types(ctx: &Context) -> Result<Verdict> {
    let pools = ctx.proxmox().await?.storage().await?;
    let missing: Vec<&str> = REQUIRED_CONTENT
        .into_iter()
        .filter(|c| !pools.iter().any(|p| p.supports(c)))
        .collect();
    if missing.is_empty() {
        Ok(Verdict::Pass)
    } else {
        Ok(Verdict::Warn(format!(
            "no storage pool holds content type(s): {}",
            missing.join(", ")
        )))
    }
}

async fn storage_space(ctx: &Context) -> Result<Verdict> {
    let node = test_node(ctx).await?;
    let storage = ctx.proxmox().await?.node_storage(&node).await?;
    let mut nearly_full = Vec::new();
    for pool in &storage {
        ensure!(
            pool.avail > 0,
            "storage {} has no available space",
            pool.storage
        );
        if let Some(usage) = pool.usage_percent() {
            if usage > USAGE_WARN_PERCENT {
                nearly_full.push(format!("{} ({usage:.1}%)", pool.storage));
            }
        }
    }
    if nearly_full.is_empty() {
        Ok(Verdict::Pass)
    } else {
        Ok(Verdict::Warn(format!(
            "storage nearly full: {}",
            nearly_full.join(", ")
        )))
    }
}

async fn kubernetes_requirements(ctx: &Context) -> Result<Verdict> {
    let pools = ctx.proxmox().await?.storage().await?;
    let vm_storage = pools.iter().filter(|p| p.supports("images")).count();
    ensure!(vm_storage > 0, "no storage configured for VM images");
    let bridges =
        interfaces(ctx).await?.iter().filter(|i| i.is_bridge()).count();
    ensure!(bridges > 0, "no bridges configured for VM networking");
    info!(ctx.log, "VM prerequisites";
        "image_pools" => vm_storage, "bridges" => bridges);
    Ok(Verdict::Pass)
}
