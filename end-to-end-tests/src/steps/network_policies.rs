// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Step 6: the CNI is up and enforces NetworkPolicy

use crate::helpers::conditions::{
    daemonset_counts, node_network_ready, pod_phase, pod_running,
};
use crate::helpers::ctx::Context;
use crate::helpers::k8s::{
    apply_object, delete_namespace, delete_object, ensure_namespace,
    exec_in_pod, TypeRef,
};
use crate::helpers::{poll, Timing};
use crate::report::{PollPolicy, StepReport, Verdict};
use anyhow::{anyhow, ensure, Context as _, Result};
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::api::ListParams;
use kube::{Api, Client};
use serde_json::json;
use slog::info;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

const CNI_KEYWORDS: [&str; 6] =
    ["cilium", "calico", "flannel", "weave", "kube-ovn", "antrea"];
const MESH_KEYWORDS: [&str; 4] = ["istio", "linkerd", "consul", "envoy"];

const DENY_ALL_POLICY: &str = "test-deny-all";
const SERVER_POLICY: &str = "test-server-policy";
const SERVER_POD: &str = "test-server";
const CLIENT_POD: &str = "test-client";
const SERVER_PORT: u16 = 80;
/// `nc` gives up on a connection after this many seconds
const CONNECT_WAIT_SECS: u32 = 3;

const POD_RUNNING: Timing = Timing::secs(120, 5);
const POLICY_POLL_INTERVAL_SECS: u64 = 5;

pub(super) async fn run(ctx: &Context, report: &mut StepReport) {
    let log = &ctx.log;
    report.check(log, "CNI pods running", cni_pods(ctx)).await;
    report.check(log, "CNI daemonsets ready", cni_daemonsets(ctx)).await;
    report.check(log, "node network status", node_network(ctx)).await;
    report.check(log, "NetworkPolicy API", policy_api(ctx)).await;
    report.check(log, "namespace", namespace(ctx)).await;
    report.check(log, "basic policy creation", basic_policy(ctx)).await;
    report.check(log, "test pods running", test_pods(ctx)).await;
    report.check(log, "pod-to-pod connectivity", connectivity(ctx)).await;
    report
        .check(log, "policy enforcement", policy_enforcement(ctx))
        .await;
    report.check(log, "Proxmox network policies", proxmox_policies(ctx)).await;
    report.check(log, "Proxmox node addresses", proxmox_nodes(ctx)).await;
    report.check(log, "service mesh", service_mesh(ctx)).await;
    report.check(log, "cleanup", cleanup(ctx)).await;
}

fn ns(ctx: &Context) -> &str {
    &ctx.config.network.namespace
}

/// The first of `keywords` that appears in `name`, ignoring case
fn keyword_in(name: &str, keywords: &[&'static str]) -> Option<&'static str> {
    let name = name.to_lowercase();
    keywords.iter().copied().find(|keyword| name.contains(keyword))
}

fn cni_type(name: &str) -> Option<&'static str> {
    keyword_in(name, &CNI_KEYWORDS)
}

fn name_of<T: kube::Resource>(item: &T) -> &str {
    item.meta().name.as_deref().unwrap_or_default()
}

async fn all_pods(client: &Client) -> Result<Vec<Pod>> {
    let pods: Api<Pod> = Api::all(client.clone());
    Ok(pods.list(&ListParams::default()).await.context("listing pods")?.items)
}

async fn cni_pods(ctx: &Context) -> Result<Verdict> {
    let pods = all_pods(ctx.kube().await?).await?;
    let mut types = BTreeSet::new();
    for pod in &pods {
        let Some(cni) = cni_type(name_of(pod)) else { continue };
        let phase = pod_phase(pod);
        ensure!(
            phase == "Running",
            "CNI pod {} not running: {phase}",
            name_of(pod)
        );
        types.insert(cni);
    }
    if types.is_empty() {
        return Ok(Verdict::Skip(String::from("no CNI pods found")));
    }
    let detected = types.iter().copied().collect::<Vec<_>>().join(", ");
    info!(ctx.log, "CNI detected"; "types" => &detected);

    let expected = ctx.config.network.cni_provider.as_str();
    if expected != "auto" {
        ensure!(
            types.contains(expected),
            "expected CNI {expected} not found (running: {detected})"
        );
    }
    Ok(Verdict::Pass)
}

async fn cni_daemonsets(ctx: &Context) -> Result<Verdict> {
    let daemonsets: Api<DaemonSet> = Api::all(ctx.kube().await?.clone());
    let daemonsets: Vec<DaemonSet> = daemonsets
        .list(&ListParams::default())
        .await
        .context("listing daemonsets")?
        .items
        .into_iter()
        .filter(|ds| cni_type(name_of(ds)).is_some())
        .collect();
    if daemonsets.is_empty() {
        return Ok(Verdict::Skip(String::from("no CNI daemonsets found")));
    }
    for ds in &daemonsets {
        let (ready, desired) = daemonset_counts(ds);
        ensure!(
            ready == desired,
            "CNI daemonset {} not fully ready ({ready}/{desired})",
            name_of(ds)
        );
    }
    Ok(Verdict::Pass)
}

async fn node_network(ctx: &Context) -> Result<Verdict> {
    let nodes: Api<Node> = Api::all(ctx.kube().await?.clone());
    let nodes =
        nodes.list(&ListParams::default()).await.context("listing nodes")?;
    let unclear: Vec<&str> = nodes
        .items
        .iter()
        .filter(|node| !node_network_ready(node))
        .map(name_of)
        .collect();
    if unclear.is_empty() {
        Ok(Verdict::Pass)
    } else {
        Ok(Verdict::Warn(format!(
            "network status unclear on: {}",
            unclear.join(", ")
        )))
    }
}

async fn list_policies(
    client: &Client,
    namespace: Option<&str>,
) -> Result<Vec<NetworkPolicy>> {
    let policies: Api<NetworkPolicy> = match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    Ok(policies
        .list(&ListParams::default())
        .await
        .context("listing network policies")?
        .items)
}

async fn policy_api(ctx: &Context) -> Result<Verdict> {
    match list_policies(ctx.kube().await?, None).await {
        Ok(policies) => {
            info!(ctx.log, "NetworkPolicy supported";
                "existing" => policies.len());
            Ok(Verdict::Pass)
        }
        Err(error) => Ok(Verdict::Skip(format!(
            "network policies not supported: {error:#}"
        ))),
    }
}

async fn namespace(ctx: &Context) -> Result<Verdict> {
    let state =
        ensure_namespace(ctx.kube().await?, ns(ctx), &BTreeMap::new()).await?;
    info!(ctx.log, "namespace"; "name" => ns(ctx), "state" => ?state);
    Ok(Verdict::Pass)
}

/// An ingress policy with no rules: selected pods accept no traffic
fn deny_ingress_manifest(
    name: &str,
    namespace: &str,
    match_labels: serde_json::Value,
) -> serde_json::Value {
    json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "NetworkPolicy",
        "metadata": {"name": name, "namespace": namespace},
        "spec": {
            "podSelector": {"matchLabels": match_labels},
            "policyTypes": ["Ingress"],
            "ingress": [],
        },
    })
}

fn policy_type(namespace: &str) -> TypeRef<'_> {
    TypeRef::namespaced("networking.k8s.io/v1", "NetworkPolicy", namespace)
}

fn pod_type(namespace: &str) -> TypeRef<'_> {
    TypeRef::namespaced("v1", "Pod", namespace)
}

async fn basic_policy(ctx: &Context) -> Result<Verdict> {
    let client = ctx.kube().await?;
    let manifest = deny_ingress_manifest(DENY_ALL_POLICY, ns(ctx), json!({}));
    apply_object(client, &manifest).await?;
    let listed = list_policies(client, Some(ns(ctx)))
        .await
        .map(|policies| policies.iter().any(|p| name_of(p) == DENY_ALL_POLICY));
    // The namespace-wide deny must be gone before the connectivity checks.
    delete_object(client, policy_type(ns(ctx)), DENY_ALL_POLICY).await?;
    ensure!(listed?, "policy {DENY_ALL_POLICY} not found after creating it");
    Ok(Verdict::Pass)
}

async fn test_pods(ctx: &Context) -> Result<Verdict> {
    let client = ctx.kube().await?;
    apply_object(
        client,
        &json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": SERVER_POD,
                "namespace": ns(ctx),
                "labels": {"role": "server"},
            },
            "spec": {
                "restartPolicy": "Never",
                "containers": [{
                    "name": "test-container",
                    "image": "nginx:1.25",
                    "ports": [{"containerPort": SERVER_PORT}],
                }],
            },
        }),
    )
    .await?;
    apply_object(
        client,
        &json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": CLIENT_POD,
                "namespace": ns(ctx),
                "labels": {"role": "client"},
            },
            "spec": {
                "restartPolicy": "Never",
                "containers": [{
                    "name": "test-container",
                    "image": "busybox:1.36",
                    "command": ["sleep", "3600"],
                }],
            },
        }),
    )
    .await?;

    for pod in [SERVER_POD, CLIENT_POD] {
        poll(&ctx.log, &format!("pod {pod} Running"), POD_RUNNING, || {
            pod_running(client, ns(ctx), pod)
        })
        .await?
        .require(&format!("pod {pod} running"))?;
    }
    Ok(Verdict::Pass)
}

async fn server_ip(client: &Client, namespace: &str) -> Result<String> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let pod = pods
        .get(SERVER_POD)
        .await
        .with_context(|| format!("fetching pod {namespace}/{SERVER_POD}"))?;
    pod.status
        .and_then(|s| s.pod_ip)
        .ok_or_else(|| anyhow!("pod {SERVER_POD} has no IP address"))
}

fn connect_command(ip: &str) -> String {
    format!("nc -z -w {CONNECT_WAIT_SECS} {ip} {SERVER_PORT}")
}

/// Whether the client pod can open a TCP connection to the server pod
async fn can_connect(
    client: &Client,
    namespace: &str,
    ip: &str,
) -> Result<bool> {
    let command = connect_command(ip);
    let output =
        exec_in_pod(client, namespace, CLIENT_POD, &["sh", "-c", &command])
            .await?;
    Ok(output.success)
}

async fn connection_refused(
    client: &Client,
    namespace: &str,
    ip: &str,
) -> Result<bool> {
    Ok(!can_connect(client, namespace, ip).await?)
}

async fn connectivity(ctx: &Context) -> Result<Verdict> {
    let client = ctx.kube().await?;
    let ip = server_ip(client, ns(ctx)).await?;
    ensure!(
        can_connect(client, ns(ctx), &ip).await?,
        "{CLIENT_POD} cannot reach {SERVER_POD} at {ip}:{SERVER_PORT}"
    );
    info!(ctx.log, "pod-to-pod connectivity"; "target" => &ip);
    Ok(Verdict::Pass)
}

async fn policy_enforcement(ctx: &Context) -> Result<Verdict> {
    let network = &ctx.config.network;
    let client = ctx.kube().await?;
    let ip = server_ip(client, ns(ctx)).await?;
    let server = json!({"role": "server"});
    apply_object(client, &deny_ingress_manifest(SERVER_POLICY, ns(ctx), server))
        .await?;

    let timing = Timing {
        timeout: network.test_timeout(),
        interval: Duration::from_secs(POLICY_POLL_INTERVAL_SECS),
    };
    let outcome = poll(&ctx.log, "server ingress denied", timing, || {
        connection_refused(client, ns(ctx), &ip)
    })
    .await;
    delete_object(client, policy_type(ns(ctx)), SERVER_POLICY).await?;

    let outcome = outcome?;
    let what =
        format!("connections to {SERVER_POD} refused under {SERVER_POLICY}");
    if network.policy_enabled {
        outcome.require(&what)?;
        Ok(Verdict::Pass)
    } else {
        Ok(outcome.or_warn(&what))
    }
}

async fn proxmox_policies(ctx: &Context) -> Result<Verdict> {
    let policies = list_policies(ctx.kube().await?, None).await?;
    let proxmox: Vec<&NetworkPolicy> = policies
        .iter()
        .filter(|p| name_of(*p).to_lowercase().contains("proxmox"))
        .collect();
    if proxmox.is_empty() {
        return Ok(Verdict::Skip(String::from(
            "no Proxmox-specific network policies found",
        )));
    }
    for policy in proxmox {
        let spec = policy.spec.as_ref();
        info!(ctx.log, "Proxmox network policy";
            "namespace" => policy.metadata.namespace.as_deref(),
            "name" => name_of(policy),
            "types" => spec
                .and_then(|s| s.policy_types.as_ref())
                .map(|t| t.join(",")),
            "ingress_rules" =>
                spec.and_then(|s| s.ingress.as_ref()).map_or(0, Vec::len),
            "egress_rules" =>
                spec.and_then(|s| s.egress.as_ref()).map_or(0, Vec::len));
    }
    Ok(Verdict::Pass)
}

/// Whether any label key or value mentions Proxmox
fn has_proxmox_label(labels: &BTreeMap<String, String>) -> bool {
    labels.iter().any(|(key, value)| {
        key.to_lowercase().contains("proxmox")
            || value.to_lowercase().contains("proxmox")
    })
}

async fn proxmox_nodes(ctx: &Context) -> Result<Verdict> {
    let nodes: Api<Node> = Api::all(ctx.kube().await?.clone());
    let nodes =
        nodes.list(&ListParams::default()).await.context("listing nodes")?;
    let mut found = 0;
    for node in &nodes.items {
        if !node.metadata.labels.as_ref().is_some_and(has_proxmox_label) {
            continue;
        }
        found += 1;
        let addresses = node
            .status
            .as_ref()
            .and_then(|s| s.addresses.as_ref())
            .map(|addrs| {
                addrs
                    .iter()
                    .map(|a| format!("{}={}", a.type_, a.address))
                    .collect::<Vec<_>>()
                    .join(",")
            });
        info!(ctx.log, "Proxmox node";
            "name" => name_of(node), "addresses" => addresses);
    }
    if found == 0 {
        return Ok(Verdict::Skip(String::from(
            "no Proxmox worker nodes detected",
        )));
    }
    Ok(Verdict::Pass)
}

async fn service_mesh(ctx: &Context) -> Result<Verdict> {
    let pods = all_pods(ctx.kube().await?).await?;
    let meshes: BTreeSet<&str> = pods
        .iter()
        .filter_map(|pod| keyword_in(name_of(pod), &MESH_KEYWORDS))
        .collect();
    if meshes.is_empty() {
        return Ok(Verdict::Skip(String::from(
            "no service mesh components detected",
        )));
    }
    info!(ctx.log, "service mesh detected";
        "types" => meshes.into_iter().collect::<Vec<_>>().join(","));
    Ok(Verdict::Pass)
}

async fn cleanup(ctx: &Context) -> Result<Verdict> {
    let client = ctx.kube().await?;
    for pod in [SERVER_POD, CLIENT_POD] {
        delete_object(client, pod_type(ns(ctx)), pod).await?;
    }
    for policy in &list_policies(client, Some(ns(ctx))).await? {
        delete_object(client, policy_type(ns(ctx)), name_of(policy)).await?;
    }
    delete_namespace(client, ns(ctx)).await?;
    Ok(Verdict::Pass)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cni_type() {
        assert_eq!(cni_type("cilium-operator-6d8f7c9b4-x2x7z"), Some("cilium"));
        assert_eq!(cni_type("Calico-Node-abcde"), Some("calico"));
        assert_eq!(cni_type("kube-ovn-cni-pqrst"), Some("kube-ovn"));
        assert_eq!(cni_type("coredns-5d78c9869d-7xk2p"), None);
        assert_eq!(
            keyword_in("istio-ingressgateway-0", &MESH_KEYWORDS),
            Some("istio")
        );
    }

    #[test]
    fn test_deny_ingress_manifest() {
        let selector = json!({"role": "server"});
        let manifest = deny_ingress_manifest("deny", "network-test", selector);
        let policy: NetworkPolicy = serde_json::from_value(manifest).unwrap();
        let spec = policy.spec.unwrap();
        assert_eq!(spec.policy_types, Some(vec![String::from("Ingress")]));
        assert_eq!(spec.ingress, Some(Vec::new()));
        assert_eq!(policy.metadata.namespace.as_deref(), Some("network-test"));
    }

    #[test]
    fn test_has_proxmox_label() {
        let mut labels = BTreeMap::new();
        labels.insert(String::from("kubernetes.io/os"), String::from("linux"));
        assert!(!has_proxmox_label(&labels));
        labels.insert(
            String::from("node.kubernetes.io/instance-type"),
            String::from("Proxmox-VM"),
        );
        assert!(has_proxmox_label(&labels));
    }

    #[test]
    fn test_connect_command() {
        assert_eq!(connect_command("10.0.0.7"), "nc -z -w 3 10.0.0.7 80");
    }
}
