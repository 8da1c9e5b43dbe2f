// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Step 4: a Proxmox-hosted worker has joined the cluster and takes pods

use crate::helpers::conditions::{node_ready, node_roles, pod_scheduled_on};
use crate::helpers::ctx::Context;
use crate::helpers::k8s::{
    apply_object, delete_namespace, delete_object, ensure_namespace, TypeRef,
};
use crate::helpers::{poll, Timing};
use crate::report::{PollPolicy, StepReport, Verdict};
use anyhow::{ensure, Context as _, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::api::ListParams;
use kube::Api;
use serde_json::json;
use slog::info;
use std::collections::BTreeMap;

const SECRET_NAME: &str = "proxmox-credentials";
const SCHEDULING_POD: &str = "test-proxmox-scheduling";
const INSTANCE_TYPE_LABEL: &str = "node.kubernetes.io/instance-type";

const NODE_READY: Timing = Timing::secs(600, 10);
const POD_SCHEDULED: Timing = Timing::secs(60, 5);

pub(super) async fn run(ctx: &Context, report: &mut StepReport) {
    let log = &ctx.log;
    report.check(log, "cluster accessible", cluster_accessible(ctx)).await;
    report.check(log, "permissions", permissions(ctx)).await;
    report.check(log, "namespace", namespace(ctx)).await;
    report.check(log, "credentials secret", credentials_secret(ctx)).await;
    report.check(log, "worker node ready", worker_ready(ctx)).await;
    report.check(log, "worker node labels", worker_labels(ctx)).await;
    report.check(log, "worker node resources", worker_resources(ctx)).await;
    report.check(log, "pod scheduling on worker", pod_scheduling(ctx)).await;
    report.check(log, "cleanup", cleanup(ctx)).await;
}

fn ns(ctx: &Context) -> &str {
    &ctx.config.worker.namespace
}

async fn list_nodes(ctx: &Context) -> Result<Vec<Node>> {
    let nodes: Api<Node> = Api::all(ctx.kube().await?.clone());
    Ok(nodes.list(&ListParams::default()).await.context("listing nodes")?.items)
}

/// Whether `name` looks like the Proxmox worker
fn is_worker_name(name: &str, expected: &str) -> bool {
    name.contains(expected) || name.to_lowercase().contains("proxmox")
}

async fn find_worker(ctx: &Context) -> Result<Option<Node>> {
    let expected = &ctx.config.worker.expected_node_name;
    Ok(list_nodes(ctx).await?.into_iter().find(|node| {
        let name = node.metadata.name.as_deref();
        name.is_some_and(|n| is_worker_name(n, expected))
    }))
}

fn worker_not_found(ctx: &Context) -> Verdict {
    Verdict::Skip(format!(
        "Proxmox worker node not found (expected a name containing {:?})",
        ctx.config.worker.expected_node_name
    ))
}

async fn cluster_accessible(ctx: &Context) -> Result<Verdict> {
    let nodes = list_nodes(ctx).await?;
    ensure!(!nodes.is_empty(), "no nodes found in cluster");
    let control_plane = nodes
        .iter()
        .filter(|n| {
            node_roles(n).iter().any(|r| r == "control-plane" || r == "master")
        })
        .count();
    ensure!(control_plane > 0, "no control plane nodes found");
    info!(ctx.log, "cluster accessible";
        "nodes" => nodes.len(), "control_plane" => control_plane);
    Ok(Verdict::Pass)
}

async fn permissions(ctx: &Context) -> Result<Verdict> {
    let client = ctx.kube().await?;
    let params = ListParams::default().limit(1);
    Api::<Node>::all(client.clone())
        .list(&params)
        .await
        .context("cannot list nodes")?;
    Api::<Namespace>::all(client.clone())
        .list(&params)
        .await
        .context("cannot list namespaces")?;
    Api::<Pod>::all(client.clone())
        .list(&params)
        .await
        .context("cannot list pods")?;
    Api::<Deployment>::all(client.clone())
        .list(&params)
        .await
        .context("cannot list deployments")?;
    Ok(Verdict::Pass)
}

async fn namespace(ctx: &Context) -> Result<Verdict> {
    let state =
        ensure_namespace(ctx.kube().await?, ns(ctx), &BTreeMap::new()).await?;
    info!(ctx.log, "namespace"; "name" => ns(ctx), "state" => ?state);
    Ok(Verdict::Pass)
}

async fn credentials_secret(ctx: &Context) -> Result<Verdict> {
    let proxmox = &ctx.config.proxmox;
    apply_object(
        ctx.kube().await?,
        &json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": SECRET_NAME, "namespace": ns(ctx)},
            "type": "Opaque",
            "stringData": {
                "username": proxmox.username,
                "password": proxmox.password,
                "server": proxmox.host,
                "port": proxmox.port.to_string(),
            },
        }),
    )
    .await?;
    Ok(Verdict::Pass)
}

async fn worker_ready(ctx: &Context) -> Result<Verdict> {
    let Some(worker) = find_worker(ctx).await? else {
        return Ok(worker_not_found(ctx));
    };
    let name = worker.metadata.name.unwrap_or_default();
    let client = ctx.kube().await?;
    poll(&ctx.log, "worker node Ready", NODE_READY, || {
        node_ready(client, &name)
    })
    .await?
    .require(&format!("node {name} Ready"))?;
    Ok(Verdict::Pass)
}

async fn worker_labels(ctx: &Context) -> Result<Verdict> {
    let Some(worker) = find_worker(ctx).await? else {
        return Ok(worker_not_found(ctx));
    };
    let roles = node_roles(&worker);
    let name = worker.metadata.name.as_deref().unwrap_or_default();
    ensure!(
        roles.iter().any(|r| r == "worker"),
        "node {name} does not have the worker role (roles: {})",
        roles.join(", ")
    );
    let instance_type = worker
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(INSTANCE_TYPE_LABEL));
    info!(ctx.log, "worker labels"; "node" => name,
        "instance_type" => instance_type.map(String::as_str));
    Ok(Verdict::Pass)
}

async fn worker_resources(ctx: &Context) -> Result<Verdict> {
    let Some(worker) = find_worker(ctx).await? else {
        return Ok(worker_not_found(ctx));
    };
    let name = worker.metadata.name.as_deref().unwrap_or_default();
    let allocatable =
        worker.status.as_ref().and_then(|s| s.allocatable.as_ref());
    let Some(allocatable) = allocatable else {
        return Ok(Verdict::Warn(format!(
            "node {name} reports no allocatable resources"
        )));
    };
    let get = |key: &str| allocatable.get(key).map(|q| q.0.clone());
    info!(ctx.log, "worker resources"; "node" => name,
        "cpu" => get("cpu"), "memory" => get("memory"),
        "ephemeral_storage" => get("ephemeral-storage"), "pods" => get("pods"));
    Ok(Verdict::Pass)
}

async fn pod_scheduling(ctx: &Context) -> Result<Verdict> {
    let Some(worker) = find_worker(ctx).await? else {
        return Ok(worker_not_found(ctx));
    };
    let node = worker.metadata.name.unwrap_or_default();
    let client = ctx.kube().await?;
    apply_object(
        client,
        &json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": SCHEDULING_POD, "namespace": ns(ctx)},
            "spec": {
                "nodeSelector": {"kubernetes.io/hostname": node},
                "restartPolicy": "Never",
                "containers": [{
                    "name": "test-container",
                    "image": "nginx:1.25",
                    "resources": {
                        "requests": {"cpu": "100m", "memory": "128Mi"},
                        "limits": {"cpu": "200m", "memory": "256Mi"},
                    },
                }],
            },
        }),
    )
    .await?;

    let what = "test pod scheduled on worker";
    let result = poll(&ctx.log, what, POD_SCHEDULED, || {
        pod_scheduled_on(client, ns(ctx), SCHEDULING_POD, &node)
    })
    .await
    .and_then(|outcome| outcome.require(&format!("pod scheduled on {node}")));
    delete_object(
        client,
        TypeRef::namespaced("v1", "Pod", ns(ctx)),
        SCHEDULING_POD,
    )
    .await?;
    result.map(|()| Verdict::Pass)
}

async fn cleanup(ctx: &Context) -> Result<Verdict> {
    let client = ctx.kube().await?;
    delete_object(
        client,
        TypeRef::namespaced("v1", "Pod", ns(ctx)),
        SCHEDULING_POD,
    )
    .await?;
    delete_namespace(client, ns(ctx)).await?;
    Ok(Verdict::Pass)
}

#[cfg(test)]
mod test {
    use super::is_worker_name;

    #[test]
    fn test_is_worker_name() {
        assert!(is_worker_name("proxmox-worker-0", "proxmox-worker"));
        assert!(is_worker_name("k8s-node-3", "node-3"));
        assert!(is_worker_name("PVE-Proxmox-7", "nomatch"));
        assert!(!is_worker_name("cp-0", "proxmox-worker"));
    }
}
