// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Step 3: the Cluster API Proxmox provider can provision VMs

use crate::helpers::conditions::{any_object_exists, cr_condition_met};
use crate::helpers::ctx::Context;
use crate::helpers::k8s::{
    apply_object, delete_object, ensure_namespace, get_object, list_objects,
    TypeRef,
};
use crate::helpers::{poll, Timing};
use crate::report::{PollPolicy, StepReport, Verdict};
use anyhow::{anyhow, bail, ensure, Context as _, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition,
};
use kube::api::ListParams;
use kube::Api;
use serde_json::json;
use slog::info;
use std::collections::{BTreeMap, BTreeSet};

const CAPI: &str = "cluster.x-k8s.io/v1beta1";
const INFRA: &str = "infrastructure.cluster.x-k8s.io/v1alpha1";

const SECRET_NAME: &str = "proxmox-credentials";
const PROXMOX_CLUSTER: &str = "test-proxmox-cluster";
const CLUSTER: &str = "test-cluster";
const MACHINE_TEMPLATE: &str = "test-machine-template";
const MACHINE_DEPLOYMENT: &str = "test-worker-deployment";

const REQUIRED_CRDS: [&str; 5] = [
    "clusters.cluster.x-k8s.io",
    "machines.cluster.x-k8s.io",
    "machinesets.cluster.x-k8s.io",
    "proxmoxclusters.infrastructure.cluster.x-k8s.io",
    "proxmoxmachines.infrastructure.cluster.x-k8s.io",
];

const CLUSTER_READY: Timing = Timing::secs(300, 10);
const MACHINE_CREATED: Timing = Timing::secs(600, 30);

pub(super) async fn run(ctx: &Context, report: &mut StepReport) {
    let log = &ctx.log;
    report
        .check(log, "Cluster API deployments ready", capi_deployments(ctx))
        .await;
    report
        .check(
            log,
            "Proxmox provider deployments ready",
            provider_deployments(ctx),
        )
        .await;
    report.check(log, "required CRDs", required_crds(ctx)).await;
    report.check(log, "namespace", namespace(ctx)).await;
    report.check(log, "credentials secret", credentials_secret(ctx)).await;
    report.check(log, "ProxmoxCluster ready", proxmox_cluster(ctx)).await;
    report.check(log, "Cluster created", capi_cluster(ctx)).await;
    report
        .check(log, "ProxmoxMachineTemplate created", machine_template(ctx))
        .await;
    report
        .check(log, "MachineDeployment created", machine_deployment(ctx))
        .await;
    report.check(log, "machine provisioned", machine_provisioned(ctx)).await;
    report
        .check(log, "ProxmoxMachine status", proxmox_machine_status(ctx))
        .await;
    report.check(log, "cleanup", cleanup(ctx)).await;
}

fn ns(ctx: &Context) -> &str {
    &ctx.config.capi.namespace
}

/// Every deployment whose name matches `filter` has at least one ready
/// replica, and there is at least one
async fn deployments_ready(
    ctx: &Context,
    what: &str,
    filter: impl Fn(&str) -> bool,
) -> Result<Verdict> {
    let client = ctx.kube().await?;
    let deployments: Api<Deployment> = Api::all(client.clone());
    let matching: Vec<Deployment> = deployments
        .list(&ListParams::default())
        .await
        .context("listing deployments")?
        .items
        .into_iter()
        .filter(|d| d.metadata.name.as_deref().is_some_and(&filter))
        .collect();
    ensure!(!matching.is_empty(), "no {what} deployments found");
    for deployment in &matching {
        let name = deployment.metadata.name.as_deref().unwrap_or_default();
        let ready = deployment
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        ensure!(ready > 0, "deployment {name} has no ready replicas");
        info!(ctx.log, "deployment ready"; "name" => name, "ready" => ready);
    }
    Ok(Verdict::Pass)
}

async fn capi_deployments(ctx: &Context) -> Result<Verdict> {
    deployments_ready(ctx, "Cluster API", |name| name.contains("cluster-api"))
        .await
}

async fn provider_deployments(ctx: &Context) -> Result<Verdict> {
    deployments_ready(ctx, "Proxmox provider", |name| {
        name.to_lowercase().contains("proxmox")
    })
    .await
}

async fn required_crds(ctx: &Context) -> Result<Verdict> {
    let client = ctx.kube().await?;
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let installed: BTreeSet<String> = crds
        .list(&ListParams::default())
        .await
        .context("listing CRDs")?
        .items
        .into_iter()
        .filter_map(|crd| crd.metadata.name)
        .collect();
    let missing: Vec<&str> = REQUIRED_CRDS
        .into_iter()
        .filter(|crd| !installed.contains(*crd))
        .collect();
    ensure!(missing.is_empty(), "missing CRDs: {}", missing.join(", "));
    Ok(Verdict::Pass)
}

async fn namespace(ctx: &Context) -> Result<Verdict> {
    let state =
        ensure_namespace(ctx.kube().await?, ns(ctx), &BTreeMap::new()).await?;
    info!(ctx.log, "namespace"; "name" => ns(ctx), "state" => ?state);
    Ok(Verdict::Pass)
}

/// Apply `manifest`, then read it back to confirm it exists
async fn apply_and_confirm(
    ctx: &Context,
    manifest: serde_json::Value,
    type_ref: TypeRef<'_>,
    name: &str,
) -> Result<Verdict> {
    let client = ctx.kube().await?;
    apply_object(client, &manifest).await?;
    get_object(client, type_ref, name)
        .await?
        .ok_or_else(|| {
            anyhow!("{} {name} not found after apply", type_ref.kind)
        })?;
    Ok(Verdict::Pass)
}

async fn credentials_secret(ctx: &Context) -> Result<Verdict> {
    let proxmox = &ctx.config.proxmox;
    let manifest = json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {"name": SECRET_NAME, "namespace": ns(ctx)},
        "type": "Opaque",
        "stringData": {
            "username": proxmox.username,
            "password": proxmox.password,
        },
    });
    apply_and_confirm(
        ctx,
        manifest,
        TypeRef::namespaced("v1", "Secret", ns(ctx)),
        SECRET_NAME,
    )
    .await
}

async fn proxmox_cluster(ctx: &Context) -> Result<Verdict> {
    let client = ctx.kube().await?;
    let proxmox = &ctx.config.proxmox;
    apply_object(
        client,
        &json!({
            "apiVersion": INFRA,
            "kind": "ProxmoxCluster",
            "metadata": {"name": PROXMOX_CLUSTER, "namespace": ns(ctx)},
            "spec": {
                "server": proxmox.host,
                "credentialsRef": {"name": SECRET_NAME},
                "node": proxmox.node,
                "allowedNodes": [proxmox.node],
            },
        }),
    )
    .await?;

    let type_ref = TypeRef::namespaced(INFRA, "ProxmoxCluster", ns(ctx));
    let outcome = poll(&ctx.log, "ProxmoxCluster Ready", CLUSTER_READY, || {
        cr_condition_met(client, type_ref, PROXMOX_CLUSTER, "Ready")
    })
    .await?;
    if let Err(error) = outcome.require("ProxmoxCluster Ready") {
        let status = get_object(client, type_ref, PROXMOX_CLUSTER)
            .await
            .ok()
            .flatten()
            .and_then(|o| o.data.get("status").cloned())
            .unwrap_or_default();
        bail!("{error:#}; last observed status: {status}");
    }
    Ok(Verdict::Pass)
}

async fn capi_cluster(ctx: &Context) -> Result<Verdict> {
    let manifest = json!({
        "apiVersion": CAPI,
        "kind": "Cluster",
        "metadata": {"name": CLUSTER, "namespace": ns(ctx)},
        "spec": {
            "clusterNetwork": {
                "pods": {"cidrBlocks": ["10.244.0.0/16"]},
                "services": {"cidrBlocks": ["10.96.0.0/12"]},
            },
            "infrastructureRef": {
                "apiVersion": INFRA,
                "kind": "ProxmoxCluster",
                "name": PROXMOX_CLUSTER,
            },
            "controlPlaneRef": {
                "apiVersion": "controlplane.cluster.x-k8s.io/v1beta1",
                "kind": "KubeadmControlPlane",
                "name": "test-control-plane",
            },
        },
    });
    apply_and_confirm(
        ctx,
        manifest,
        TypeRef::namespaced(CAPI, "Cluster", ns(ctx)),
        CLUSTER,
    )
    .await
}

async fn machine_template(ctx: &Context) -> Result<Verdict> {
    let proxmox = &ctx.config.proxmox;
    let manifest = json!({
        "apiVersion": INFRA,
        "kind": "ProxmoxMachineTemplate",
        "metadata": {"name": MACHINE_TEMPLATE, "namespace": ns(ctx)},
        "spec": {"template": {"spec": {
            "sourceNode": proxmox.node,
            "templateID": proxmox.template_id,
            "storage": proxmox.storage,
            "network": {"device": "virtio", "bridge": proxmox.bridge},
            "hardware": {"cpu": 2, "memory": 2048, "disk": 20},
        }}},
    });
    apply_and_confirm(
        ctx,
        manifest,
        TypeRef::namespaced(INFRA, "ProxmoxMachineTemplate", ns(ctx)),
        MACHINE_TEMPLATE,
    )
    .await
}

async fn machine_deployment(ctx: &Context) -> Result<Verdict> {
    let labels = json!({
        "cluster.x-k8s.io/cluster-name": CLUSTER,
        "cluster.x-k8s.io/deployment-name": MACHINE_DEPLOYMENT,
    });
    let manifest = json!({
        "apiVersion": CAPI,
        "kind": "MachineDeployment",
        "metadata": {"name": MACHINE_DEPLOYMENT, "namespace": ns(ctx)},
        "spec": {
            "clusterName": CLUSTER,
            "replicas": 1,
            "selector": {"matchLabels": labels},
            "template": {
                "metadata": {"labels": labels},
                "spec": {
                    "clusterName": CLUSTER,
                    "version": "v1.28.0",
                    "bootstrap": {"configRef": {
                        "apiVersion": "bootstrap.cluster.x-k8s.io/v1beta1",
                        "kind": "KubeadmConfigTemplate",
                        "name": "test-worker-bootstrap",
                    }},
                    "infrastructureRef": {
                        "apiVersion": INFRA,
                        "kind": "ProxmoxMachineTemplate",
                        "name": MACHINE_TEMPLATE,
                    },
                },
            },
        },
    });
    apply_and_confirm(
        ctx,
        manifest,
        TypeRef::namespaced(CAPI, "MachineDeployment", ns(ctx)),
        MACHINE_DEPLOYMENT,
    )
    .await
}

async fn machine_provisioned(ctx: &Context) -> Result<Verdict> {
    let client = ctx.kube().await?;
    let machines = TypeRef::namespaced(CAPI, "Machine", ns(ctx));
    poll(&ctx.log, "a Machine to be created", MACHINE_CREATED, || {
        any_object_exists(client, machines)
    })
    .await?
    .require("a Machine to be created")?;

    let machine = list_objects(client, machines)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Machine disappeared"))?;
    let name = machine.metadata.name.unwrap_or_default();
    ensure!(
        machine.data.pointer("/spec/infrastructureRef").is_some(),
        "Machine {name} has no infrastructure reference"
    );
    let phase = machine
        .data
        .pointer("/status/phase")
        .and_then(|p| p.as_str())
        .unwrap_or("Unknown");
    info!(ctx.log, "machine created"; "name" => &name, "phase" => phase);
    Ok(Verdict::Pass)
}

async fn proxmox_machine_status(ctx: &Context) -> Result<Verdict> {
    let client = ctx.kube().await?;
    let type_ref = TypeRef::namespaced(INFRA, "ProxmoxMachine", ns(ctx));
    let machines = list_objects(client, type_ref).await?;
    let Some(machine) = machines.first() else {
        return Ok(Verdict::Skip(String::from("no ProxmoxMachines found")));
    };
    let name = machine.metadata.name.as_deref().unwrap_or_default();
    let conditions = machine
        .data
        .pointer("/status/conditions")
        .and_then(|c| c.as_array())
        .map(Vec::as_slice)
        .unwrap_or_default();
    for condition in conditions {
        let field = |key: &str| {
            condition.get(key).and_then(|v| v.as_str()).unwrap_or("")
        };
        info!(ctx.log, "ProxmoxMachine condition"; "machine" => name,
            "type" => field("type"), "status" => field("status"),
            "message" => field("message"));
    }
    match machine.data.pointer("/status/vmID") {
        Some(vm_id) => {
            info!(ctx.log, "VM id assigned";
                "machine" => name, "vm_id" => %vm_id)
        }
        None => info!(ctx.log, "VM id not yet assigned"; "machine" => name),
    }
    Ok(Verdict::Pass)
}

async fn cleanup(ctx: &Context) -> Result<Verdict> {
    let client = ctx.kube().await?;
    let capi = |kind| TypeRef::namespaced(CAPI, kind, ns(ctx));
    let infra = |kind| TypeRef::namespaced(INFRA, kind, ns(ctx));
    // reverse order of creation
    let objects = [
        (capi("MachineDeployment"), MACHINE_DEPLOYMENT),
        (infra("ProxmoxMachineTemplate"), MACHINE_TEMPLATE),
        (capi("Cluster"), CLUSTER),
        (infra("ProxmoxCluster"), PROXMOX_CLUSTER),
        (TypeRef::namespaced("v1", "Secret", ns(ctx)), SECRET_NAME),
    ];
    let mut failures = Vec::new();
    for (type_ref, name) in objects {
        if let Err(error) = delete_object(client, type_ref, name).await {
            failures.push(format!("{error:#}"));
        }
    }
    if !failures.is_empty() {
        bail!("cleanup incomplete: {}", failures.join("; "));
    }
    Ok(Verdict::Pass)
}
