// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Step 8: workloads using storage, networking and monitoring together

use crate::helpers::conditions::{
    daemonset_counts, deployment_ready, deployment_replicas, node_is_ready,
    node_roles, pod_node, pod_phase,
};
use crate::helpers::ctx::Context;
use crate::helpers::k8s::{
    apply_object, build_api_resource, delete_namespace, delete_object,
    ensure_namespace, TypeRef,
};
use crate::helpers::{generate_name, poll, Timing};
use crate::report::{PollPolicy, StepReport, Verdict};
use anyhow::{bail, Context as _, Result};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{
    Endpoints, Node, PersistentVolume, PersistentVolumeClaim, Pod,
};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{ApiResource, DynamicObject, ListParams};
use kube::{Api, Client};
use rollout_test_utils::dev::poll::PollOutcome;
use serde_json::json;
use slog::{info, warn, Logger};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

const CNI_KEYWORDS: [&str; 4] = ["cilium", "calico", "flannel", "kube-ovn"];
const MIN_RUNNING_PERCENT: f64 = 80.0;
const MULTI_WORKLOADS: usize = 3;
const SCALE_WORKLOAD: &str = "resource-test";
const SCALED_REPLICAS: i32 = 3;

const LIFECYCLE_POLL_INTERVAL_SECS: u64 = 10;
const WORKLOAD_READY: Timing = Timing::secs(180, 10);
const SCALING_READY: Timing = Timing::secs(120, 10);

pub(super) async fn run(ctx: &Context, report: &mut StepReport) {
    let log = &ctx.log;
    report.check(log, "integration health", integration_health(ctx)).await;
    report.check(log, "namespace", namespace(ctx)).await;
    report.check(log, "Proxmox components", proxmox_components(ctx)).await;
    report.check(log, "workload lifecycle", workload_lifecycle(ctx)).await;
    report.check(log, "multiple workloads", multiple_workloads(ctx)).await;
    report.check(log, "worker fault tolerance", fault_tolerance(ctx)).await;
    report.check(log, "resource limits and scaling", scaling(ctx)).await;
    report.check(log, "metrics API", metrics_api(ctx)).await;
    report.check(log, "cleanup", cleanup(ctx)).await;
    report.check(log, "final status", final_status(ctx)).await;
}

fn ns(ctx: &Context) -> &str {
    &ctx.config.e2e.namespace
}

fn name_of<T: kube::Resource>(item: &T) -> &str {
    item.meta().name.as_deref().unwrap_or_default()
}

fn mentions_proxmox(s: &str) -> bool {
    s.to_lowercase().contains("proxmox")
}

/// A snapshot of the whole integration
#[derive(Debug, Default, PartialEq)]
struct Health {
    nodes: usize,
    ready_nodes: usize,
    proxmox_workers: usize,
    pods: usize,
    running_pods: usize,
    proxmox_pods: usize,
    cni_pods: usize,
    prometheus_pods: usize,
    grafana_pods: usize,
    storage_classes: usize,
    proxmox_classes: usize,
    volumes: usize,
    network_policies: usize,
    metrics_available: bool,
}

impl Health {
    fn tally(nodes: &[Node], pods: &[Pod], classes: &[StorageClass]) -> Health {
        let mut health = Health {
            nodes: nodes.len(),
            pods: pods.len(),
            storage_classes: classes.len(),
            ..Health::default()
        };
        for node in nodes {
            if node_is_ready(node) {
                health.ready_nodes += 1;
            }
            let proxmox_label = node
                .metadata
                .labels
                .iter()
                .flatten()
                .any(|(k, v)| mentions_proxmox(k) || mentions_proxmox(v));
            if proxmox_label {
                health.proxmox_workers += 1;
            }
        }
        for pod in pods {
            let name = name_of(pod).to_lowercase();
            let running = pod_phase(pod) == "Running";
            if running {
                health.running_pods += 1;
            }
            if name.contains("proxmox") {
                health.proxmox_pods += 1;
            }
            if CNI_KEYWORDS.iter().any(|k| name.contains(k)) {
                health.cni_pods += 1;
            }
            if running && name.contains("prometheus") {
                health.prometheus_pods += 1;
            } else if running && name.contains("grafana") {
                health.grafana_pods += 1;
            }
        }
        health.proxmox_classes = classes
            .iter()
            .filter(|sc| {
                mentions_proxmox(name_of(*sc))
                    || mentions_proxmox(&sc.provisioner)
            })
            .count();
        health
    }

    fn running_percent(&self) -> f64 {
        if self.pods == 0 {
            0.0
        } else {
            self.running_pods as f64 * 100.0 / self.pods as f64
        }
    }

    /// Problems that make the integration unusable
    fn critical_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.ready_nodes == 0 {
            issues.push(String::from("no ready nodes"));
        }
        if self.running_percent() < MIN_RUNNING_PERCENT {
            issues.push(format!(
                "low pod health: {:.1}% running",
                self.running_percent()
            ));
        }
        if self.cni_pods == 0 {
            issues.push(String::from("no CNI pods running"));
        }
        issues
    }
}

fn metrics_nodes() -> ApiResource {
    ApiResource {
        plural: String::from("nodes"),
        ..build_api_resource("metrics.k8s.io/v1beta1", "NodeMetrics")
    }
}

async fn metrics_available(client: &Client) -> bool {
    let api: Api<DynamicObject> =
        Api::all_with(client.clone(), &metrics_nodes());
    api.list(&ListParams::default().limit(1)).await.is_ok()
}

async fn collect_health(client: &Client) -> Result<Health> {
    let params = ListParams::default();
    let nodes = Api::<Node>::all(client.clone())
        .list(&params)
        .await
        .context("listing nodes")?;
    let pods = Api::<Pod>::all(client.clone())
        .list(&params)
        .await
        .context("listing pods")?;
    let classes = Api::<StorageClass>::all(client.clone())
        .list(&params)
        .await
        .context("listing storage classes")?;
    let mut health = Health::tally(&nodes.items, &pods.items, &classes.items);
    health.volumes = Api::<PersistentVolume>::all(client.clone())
        .list(&params)
        .await
        .context("listing persistent volumes")?
        .items
        .len();
    // Clusters without NetworkPolicy support just report none.
    health.network_policies = Api::<NetworkPolicy>::all(client.clone())
        .list(&params)
        .await
        .map_or(0, |list| list.items.len());
    health.metrics_available = metrics_available(client).await;
    Ok(health)
}

fn log_health(ctx: &Context, health: &Health) {
    info!(ctx.log, "integration health";
        "ready_nodes" => health.ready_nodes,
        "nodes" => health.nodes,
        "proxmox_workers" => health.proxmox_workers,
        "running_pods" => health.running_pods,
        "pods" => health.pods,
        "proxmox_pods" => health.proxmox_pods,
        "storage_classes" => health.storage_classes,
        "proxmox_classes" => health.proxmox_classes,
        "volumes" => health.volumes,
        "network_policies" => health.network_policies,
        "cni_pods" => health.cni_pods,
        "prometheus_pods" => health.prometheus_pods,
        "grafana_pods" => health.grafana_pods,
        "metrics_available" => health.metrics_available,
    );
}

async fn integration_health(ctx: &Context) -> Result<Verdict> {
    let health = collect_health(ctx.kube().await?).await?;
    log_health(ctx, &health);
    let issues = health.critical_issues();
    if !issues.is_empty() {
        bail!("critical integration issues: {}", issues.join("; "));
    }
    Ok(Verdict::Pass)
}

async fn namespace(ctx: &Context) -> Result<Verdict> {
    let labels = BTreeMap::from([
        (String::from("test"), String::from("e2e")),
        (String::from("purpose"), String::from("proxmox-integration")),
    ]);
    let state = ensure_namespace(ctx.kube().await?, ns(ctx), &labels).await?;
    info!(ctx.log, "namespace"; "name" => ns(ctx), "state" => ?state);
    Ok(Verdict::Pass)
}

async fn proxmox_components(ctx: &Context) -> Result<Verdict> {
    let client = ctx.kube().await?;
    let deployments = Api::<Deployment>::all(client.clone())
        .list(&ListParams::default())
        .await
        .context("listing deployments")?;
    let daemonsets = Api::<DaemonSet>::all(client.clone())
        .list(&ListParams::default())
        .await
        .context("listing daemonsets")?;
    let mut found = 0;
    let proxmox_deployments =
        deployments.items.iter().filter(|d| mentions_proxmox(name_of(*d)));
    for deployment in proxmox_deployments {
        let (ready, desired) = deployment_replicas(deployment);
        info!(ctx.log, "Proxmox deployment"; "name" => name_of(deployment),
            "ready" => ready, "desired" => desired);
        found += 1;
    }
    let proxmox_daemonsets =
        daemonsets.items.iter().filter(|d| mentions_proxmox(name_of(*d)));
    for ds in proxmox_daemonsets {
        let (ready, desired) = daemonset_counts(ds);
        info!(ctx.log, "Proxmox daemonset"; "name" => name_of(ds),
            "ready" => ready, "desired" => desired);
        found += 1;
    }
    if found == 0 {
        return Ok(Verdict::Warn(String::from(
            "no Proxmox deployments or daemonsets found",
        )));
    }
    Ok(Verdict::Pass)
}

/// A Deployment fronted by a Service, optionally with a PVC mounted at
/// `/data` and a NetworkPolicy admitting only same-namespace traffic
#[derive(Debug)]
struct Workload<'a> {
    name: String,
    namespace: &'a str,
    replicas: i32,
    /// storage class of the PVC, if the workload has one
    storage_class: Option<String>,
    network_policy: bool,
}

impl<'a> Workload<'a> {
    fn deployment(&self) -> String {
        format!("{}-deployment", self.name)
    }

    fn service(&self) -> String {
        format!("{}-service", self.name)
    }

    fn pvc(&self) -> String {
        format!("{}-pvc", self.name)
    }

    fn policy(&self) -> String {
        format!("{}-netpol", self.name)
    }

    fn labels(&self) -> serde_json::Value {
        json!({"app": self.name, "test": "e2e"})
    }

    /// Manifests in the order they should be applied
    fn manifests(&self) -> Vec<serde_json::Value> {
        let mut manifests = Vec::new();
        let mut container = json!({
            "name": "test-app",
            "image": "nginx:1.25",
            "ports": [{"containerPort": 80}],
            "resources": {
                "requests": {"cpu": "100m", "memory": "128Mi"},
                "limits": {"cpu": "500m", "memory": "512Mi"},
            },
        });
        let mut pod_spec = json!({});

        if let Some(class) = &self.storage_class {
            manifests.push(json!({
                "apiVersion": "v1",
                "kind": "PersistentVolumeClaim",
                "metadata": {
                    "name": self.pvc(),
                    "namespace": self.namespace,
                    "labels": self.labels(),
                },
                "spec": {
                    "accessModes": ["ReadWriteOnce"],
                    "storageClassName": class,
                    "resources": {"requests": {"storage": "1Gi"}},
                },
            }));
            container["volumeMounts"] = json!([{
                "name": "test-storage",
                "mountPath": "/data",
            }]);
            pod_spec["volumes"] = json!([{
                "name": "test-storage",
                "persistentVolumeClaim": {"claimName": self.pvc()},
            }]);
        }
        pod_spec["containers"] = json!([container]);

        manifests.push(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": self.deployment(),
                "namespace": self.namespace,
                "labels": self.labels(),
            },
            "spec": {
                "replicas": self.replicas,
                "selector": {"matchLabels": {"app": self.name}},
                "template": {
                    "metadata": {"labels": self.labels()},
                    "spec": pod_spec,
                },
            },
        }));
        manifests.push(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": self.service(),
                "namespace": self.namespace,
                "labels": self.labels(),
            },
            "spec": {
                "type": "ClusterIP",
                "selector": {"app": self.name},
                "ports": [{"port": 80, "targetPort": 80, "protocol": "TCP"}],
            },
        }));
        if self.network_policy {
            let same_namespace = json!({
                "kubernetes.io/metadata.name": self.namespace,
            });
            manifests.push(json!({
                "apiVersion": "networking.k8s.io/v1",
                "kind": "NetworkPolicy",
                "metadata": {
                    "name": self.policy(),
                    "namespace": self.namespace,
                    "labels": self.labels(),
                },
                "spec": {
                    "podSelector": {"matchLabels": {"app": self.name}},
                    "policyTypes": ["Ingress"],
                    "ingress": [{
                        "from": [{
                            "namespaceSelector": {
                                "matchLabels": same_namespace,
                            },
                        }],
                        "ports": [{"port": 80, "protocol": "TCP"}],
                    }],
                },
            }));
        }
        manifests
    }

    async fn create(&self, client: &Client) -> Result<()> {
        for manifest in self.manifests() {
            apply_object(client, &manifest).await?;
        }
        Ok(())
    }

    /// Delete everything `create()` may have made, newest first
    async fn delete(&self, client: &Client) -> Result<()> {
        let ns = self.namespace;
        delete_object(
            client,
            TypeRef::namespaced("networking.k8s.io/v1", "NetworkPolicy", ns),
            &self.policy(),
        )
        .await?;
        delete_object(
            client,
            TypeRef::namespaced("v1", "Service", ns),
            &self.service(),
        )
        .await?;
        delete_object(
            client,
            TypeRef::namespaced("apps/v1", "Deployment", ns),
            &self.deployment(),
        )
        .await?;
        delete_object(
            client,
            TypeRef::namespaced("v1", "PersistentVolumeClaim", ns),
            &self.pvc(),
        )
        .await
    }
}

/// The storage class to back workload volumes: the configured CSI class if
/// present, else any class that looks like Proxmox
fn workload_class(
    classes: &[StorageClass],
    preferred: &str,
) -> Option<String> {
    classes
        .iter()
        .find(|sc| name_of(*sc) == preferred)
        .or_else(|| {
            classes.iter().find(|sc| {
                mentions_proxmox(name_of(*sc))
                    || mentions_proxmox(&sc.provisioner)
            })
        })
        .and_then(|sc| sc.metadata.name.clone())
}

async fn storage_class(ctx: &Context) -> Result<Option<String>> {
    if !ctx.config.e2e.enable_storage {
        return Ok(None);
    }
    let classes = Api::<StorageClass>::all(ctx.kube().await?.clone())
        .list(&ListParams::default())
        .await
        .context("listing storage classes")?;
    let class = workload_class(&classes.items, &ctx.config.csi.storage_class);
    if class.is_none() {
        warn!(ctx.log,
            "no Proxmox storage class; workloads run without volumes");
    }
    Ok(class)
}

/// Issues with a running workload that don't fail it
async fn workload_warnings(
    ctx: &Context,
    workload: &Workload<'_>,
) -> Result<Vec<String>> {
    let client = ctx.kube().await?;
    let mut warnings = Vec::new();

    if workload.storage_class.is_some() {
        let pvcs: Api<PersistentVolumeClaim> =
            Api::namespaced(client.clone(), workload.namespace);
        let pvc = pvcs
            .get(&workload.pvc())
            .await
            .context("fetching workload PVC")?;
        let phase = pvc.status.as_ref().and_then(|s| s.phase.clone());
        let volume = pvc.spec.and_then(|s| s.volume_name);
        match (phase.as_deref(), volume) {
            (Some("Bound"), Some(volume)) => {
                let pv = Api::<PersistentVolume>::all(client.clone())
                    .get(&volume)
                    .await
                    .with_context(|| format!("fetching PV {volume}"))?;
                let driver = pv.spec.and_then(|s| s.csi).map(|csi| csi.driver);
                if !driver.as_deref().is_some_and(mentions_proxmox) {
                    warnings.push(format!(
                        "volume {volume} not provisioned by Proxmox CSI"
                    ));
                }
            }
            (phase, _) => warnings.push(format!(
                "workload PVC is {}",
                phase.unwrap_or("in an unknown phase")
            )),
        }
    }

    if ctx.config.e2e.enable_network {
        let endpoints: Api<Endpoints> =
            Api::namespaced(client.clone(), workload.namespace);
        let ready: usize = endpoints
            .get_opt(&workload.service())
            .await
            .context("fetching workload endpoints")?
            .and_then(|e| e.subsets)
            .map_or(0, |subsets| {
                subsets
                    .iter()
                    .map(|s| s.addresses.as_ref().map_or(0, Vec::len))
                    .sum()
            });
        if ready == 0 {
            warnings.push(format!(
                "service {} has no endpoints",
                workload.service()
            ));
        }
    }

    let pods: Api<Pod> = Api::namespaced(client.clone(), workload.namespace);
    let selector = format!("app={}", workload.name);
    let params = ListParams::default().labels(&selector);
    for pod in pods.list(&params).await?.items {
        info!(ctx.log, "workload pod"; "pod" => name_of(&pod),
            "phase" => pod_phase(&pod), "node" => pod_node(&pod));
    }
    Ok(warnings)
}

async fn workload_lifecycle(ctx: &Context) -> Result<Verdict> {
    let e2e = &ctx.config.e2e;
    let client = ctx.kube().await?;
    let storage_class = storage_class(ctx).await?;
    let workload = Workload {
        name: generate_name("proxmox-e2e"),
        namespace: ns(ctx),
        // a ReadWriteOnce volume can only follow a single replica
        replicas: if storage_class.is_some() { 1 } else { 2 },
        storage_class,
        network_policy: e2e.enable_network,
    };
    create_or_clean_up(&ctx.log, workload.create(client), || {
        workload.delete(client)
    })
    .await?;

    let timing = Timing {
        timeout: e2e.test_timeout(),
        interval: Duration::from_secs(LIFECYCLE_POLL_INTERVAL_SECS),
    };
    let deployment = workload.deployment();
    let outcome = poll(&ctx.log, "workload deployment ready", timing, || {
        deployment_ready(client, ns(ctx), &deployment)
    })
    .await?;

    let settled = settle(outcome, &deployment, ns(ctx), e2e.cleanup_on_failure);
    let result = match settled {
        Settled::Ready => workload_warnings(ctx, &workload).await,
        Settled::Kept(verdict) => {
            warn!(ctx.log, "leaving workload in place";
                "workload" => &workload.name);
            return Ok(verdict);
        }
        Settled::Failed(error) => Err(error),
    };
    workload.delete(client).await?;

    let warnings = result?;
    if warnings.is_empty() {
        Ok(Verdict::Pass)
    } else {
        Ok(Verdict::Warn(warnings.join("; ")))
    }
}

/// Run `create`, and if it fails, run `cleanup` before handing back the
/// error, so that a partially created workload doesn't linger
async fn create_or_clean_up<C, D, F>(
    log: &Logger,
    create: C,
    cleanup: D,
) -> Result<()>
where
    C: Future<Output = Result<()>>,
    D: FnOnce() -> F,
    F: Future<Output = Result<()>>,
{
    let Err(error) = create.await else {
        return Ok(());
    };
    if let Err(cleanup_error) = cleanup().await {
        warn!(log, "cleanup after failed create also failed";
            "error" => format!("{cleanup_error:#}"));
    }
    Err(error)
}

/// What becomes of a workload once its readiness poll is over
#[derive(Debug)]
enum Settled {
    /// ready; inspect it, then delete it
    Ready,
    /// not ready, and left in place for debugging
    Kept(Verdict),
    /// not ready; delete it, then fail
    Failed(anyhow::Error),
}

fn settle(
    outcome: PollOutcome<anyhow::Error>,
    deployment: &str,
    namespace: &str,
    cleanup_on_failure: bool,
) -> Settled {
    match outcome.require(&format!("deployment {deployment} ready")) {
        Ok(()) => Settled::Ready,
        Err(error) if cleanup_on_failure => Settled::Failed(error),
        Err(error) => Settled::Kept(Verdict::Skip(format!(
            "{error:#} (resources left in {namespace})"
        ))),
    }
}

/// Whether enough of the workloads came up: at least 80%
fn enough_ready(ready: usize, total: usize) -> bool {
    ready * 5 >= total * 4
}

async fn multiple_workloads(ctx: &Context) -> Result<Verdict> {
    let client = ctx.kube().await?;
    let storage_class = storage_class(ctx).await?;
    let workloads: Vec<Workload> = (0..MULTI_WORKLOADS)
        .map(|_| Workload {
            name: generate_name("multi-test"),
            namespace: ns(ctx),
            replicas: if storage_class.is_some() { 1 } else { 2 },
            storage_class: storage_class.clone(),
            network_policy: false,
        })
        .collect();

    let mut ready = 0;
    let mut result = Ok(());
    for workload in &workloads {
        if let Err(error) = workload.create(client).await {
            result = Err(error);
            break;
        }
    }
    if result.is_ok() {
        for workload in &workloads {
            let deployment = workload.deployment();
            match poll(&ctx.log, "workload ready", WORKLOAD_READY, || {
                deployment_ready(client, ns(ctx), &deployment)
            })
            .await
            {
                Ok(outcome) if outcome.satisfied => ready += 1,
                Ok(_) => warn!(ctx.log, "workload not ready";
                    "workload" => &workload.name),
                Err(error) => {
                    result = Err(error);
                    break;
                }
            }
        }
    }
    for workload in &workloads {
        workload.delete(client).await?;
    }
    result?;

    info!(ctx.log, "multiple workloads";
        "ready" => ready, "total" => MULTI_WORKLOADS);
    if ready == 0 {
        bail!("none of {MULTI_WORKLOADS} workloads became ready");
    }
    if enough_ready(ready, MULTI_WORKLOADS) {
        Ok(Verdict::Pass)
    } else {
        Ok(Verdict::Warn(format!(
            "{ready}/{MULTI_WORKLOADS} workloads ready"
        )))
    }
}

async fn fault_tolerance(ctx: &Context) -> Result<Verdict> {
    let nodes = Api::<Node>::all(ctx.kube().await?.clone())
        .list(&ListParams::default())
        .await
        .context("listing nodes")?;
    let workers: Vec<&Node> = nodes
        .items
        .iter()
        .filter(|node| {
            !node_roles(node)
                .iter()
                .any(|r| r == "control-plane" || r == "master")
        })
        .collect();
    let ready = workers.iter().filter(|node| node_is_ready(node)).count();
    info!(ctx.log, "worker nodes"; "total" => workers.len(), "ready" => ready);
    if ready > 1 {
        Ok(Verdict::Pass)
    } else {
        Ok(Verdict::Warn(format!(
            "only {ready} ready worker node(s); fault tolerance is reduced"
        )))
    }
}

fn scaling_manifest(namespace: &str, replicas: i32) -> serde_json::Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": SCALE_WORKLOAD,
            "namespace": namespace,
            "labels": {"test": "resource-limits"},
        },
        "spec": {
            "replicas": replicas,
            "selector": {"matchLabels": {"app": SCALE_WORKLOAD}},
            "template": {
                "metadata": {"labels": {"app": SCALE_WORKLOAD}},
                "spec": {
                    "containers": [{
                        "name": "test-container",
                        "image": "nginx:1.25",
                        "resources": {
                            "requests": {"cpu": "50m", "memory": "64Mi"},
                            "limits": {"cpu": "100m", "memory": "128Mi"},
                        },
                    }],
                },
            },
        },
    })
}

async fn scale_to(ctx: &Context, replicas: i32) -> Result<()> {
    let client = ctx.kube().await?;
    apply_object(client, &scaling_manifest(ns(ctx), replicas)).await?;
    poll(
        &ctx.log,
        &format!("{SCALE_WORKLOAD} at {replicas} replicas"),
        SCALING_READY,
        || deployment_ready(client, ns(ctx), SCALE_WORKLOAD),
    )
    .await?
    .require(&format!(
        "deployment {SCALE_WORKLOAD} ready with {replicas} replicas"
    ))
}

async fn scaling(ctx: &Context) -> Result<Verdict> {
    let result: Result<()> = async {
        scale_to(ctx, 1).await?;
        scale_to(ctx, SCALED_REPLICAS).await
    }
    .await;
    delete_object(
        ctx.kube().await?,
        TypeRef::namespaced("apps/v1", "Deployment", ns(ctx)),
        SCALE_WORKLOAD,
    )
    .await?;
    result.map(|()| Verdict::Pass)
}

async fn metrics_api(ctx: &Context) -> Result<Verdict> {
    if !ctx.config.e2e.enable_monitoring {
        return Ok(Verdict::Skip(String::from(
            "monitoring checks disabled",
        )));
    }
    if metrics_available(ctx.kube().await?).await {
        Ok(Verdict::Pass)
    } else {
        Ok(Verdict::Warn(String::from("metrics API not available")))
    }
}

async fn cleanup(ctx: &Context) -> Result<Verdict> {
    let client = ctx.kube().await?;
    let pods = Api::<Pod>::namespaced(client.clone(), ns(ctx))
        .list(&ListParams::default())
        .await
        .context("listing leftover pods")?;
    let deployments = Api::<Deployment>::namespaced(client.clone(), ns(ctx))
        .list(&ListParams::default())
        .await
        .context("listing leftover deployments")?;
    info!(ctx.log, "deleting namespace"; "name" => ns(ctx),
        "pods" => pods.items.len(), "deployments" => deployments.items.len());
    delete_namespace(client, ns(ctx)).await?;
    Ok(Verdict::Pass)
}

async fn final_status(ctx: &Context) -> Result<Verdict> {
    let health = collect_health(ctx.kube().await?).await?;
    log_health(ctx, &health);
    Ok(Verdict::Pass)
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::anyhow;
    use rollout_test_utils::dev::test_setup_log;
    use std::cell::Cell;

    fn from_json<T: serde::de::DeserializeOwned>(
        value: serde_json::Value,
    ) -> T {
        serde_json::from_value(value).unwrap()
    }

    fn pod(name: &str, phase: &str) -> Pod {
        from_json(json!({
            "metadata": {"name": name},
            "status": {"phase": phase},
        }))
    }

    fn class(name: &str, provisioner: &str) -> StorageClass {
        from_json(json!({
            "metadata": {"name": name},
            "provisioner": provisioner,
        }))
    }

    #[test]
    fn test_health_tally() {
        let nodes: Vec<Node> = vec![
            from_json(json!({
                "metadata": {"name": "cp-0"},
                "status": {"conditions": [{"type": "Ready", "status": "True"}]},
            })),
            from_json(json!({
                "metadata": {
                    "name": "worker-0",
                    "labels": {
                        "node.kubernetes.io/instance-type": "proxmox-vm",
                    },
                },
                "status": {
                    "conditions": [{"type": "Ready", "status": "False"}],
                },
            })),
        ];
        let pods = vec![
            pod("cilium-abcde", "Running"),
            pod("prometheus-k8s-0", "Running"),
            pod("grafana-5c9f", "Pending"),
            pod("proxmox-csi-controller-0", "Running"),
            pod("coredns-1", "Running"),
        ];
        let classes = vec![
            class("local", "rancher.io/local-path"),
            class("fast", "csi.proxmox.sinextra.dev"),
        ];
        let health = Health::tally(&nodes, &pods, &classes);
        assert_eq!(health.nodes, 2);
        assert_eq!(health.ready_nodes, 1);
        assert_eq!(health.proxmox_workers, 1);
        assert_eq!(health.running_pods, 4);
        assert_eq!(health.cni_pods, 1);
        assert_eq!(health.prometheus_pods, 1);
        assert_eq!(health.grafana_pods, 0);
        assert_eq!(health.proxmox_pods, 1);
        assert_eq!(health.proxmox_classes, 1);
        assert_eq!(health.running_percent(), 80.0);
        assert!(health.critical_issues().is_empty());
    }

    #[test]
    fn test_critical_issues() {
        let health = Health { pods: 10, running_pods: 7, ..Health::default() };
        assert_eq!(
            health.critical_issues(),
            vec![
                String::from("no ready nodes"),
                String::from("low pod health: 70.0% running"),
                String::from("no CNI pods running"),
            ]
        );
        // no pods at all is not healthy either
        let health =
            Health { ready_nodes: 1, cni_pods: 1, ..Health::default() };
        assert_eq!(health.critical_issues().len(), 1);
    }

    #[test]
    fn test_workload_manifests() {
        let workload = Workload {
            name: String::from("web"),
            namespace: "e2e-test",
            replicas: 1,
            storage_class: Some(String::from("proxmox-csi")),
            network_policy: true,
        };
        let manifests = workload.manifests();
        let kinds: Vec<&str> =
            manifests.iter().filter_map(|m| m["kind"].as_str()).collect();
        assert_eq!(
            kinds,
            ["PersistentVolumeClaim", "Deployment", "Service", "NetworkPolicy"]
        );

        let deployment: Deployment = from_json(manifests[1].clone());
        let pod_spec = deployment.spec.unwrap().template.spec.unwrap();
        let volumes = pod_spec.volumes.unwrap();
        assert_eq!(
            volumes[0].persistent_volume_claim.as_ref().unwrap().claim_name,
            "web-pvc"
        );
        let mounts = pod_spec.containers[0].volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[0].mount_path, "/data");
        let policy: NetworkPolicy = from_json(manifests[3].clone());
        let ingress = policy.spec.unwrap().ingress.unwrap();
        let from = ingress[0].from.as_ref().unwrap();
        let selector = from[0].namespace_selector.as_ref().unwrap();
        assert_eq!(
            selector.match_labels.as_ref().unwrap()
                ["kubernetes.io/metadata.name"],
            "e2e-test"
        );

        let bare =
            Workload { storage_class: None, network_policy: false, ..workload };
        let manifests = bare.manifests();
        assert_eq!(manifests.len(), 2);
        let deployment: Deployment = from_json(manifests[0].clone());
        let pod_spec = deployment.spec.unwrap().template.spec.unwrap();
        assert!(pod_spec.volumes.is_none());
        assert!(pod_spec.containers[0].volume_mounts.is_none());
    }

    #[test]
    fn test_workload_class() {
        let classes = vec![
            class("standard", "csi.proxmox.sinextra.dev"),
            class("proxmox-csi", "csi.proxmox.sinextra.dev"),
            class("local", "rancher.io/local-path"),
        ];
        assert_eq!(
            workload_class(&classes, "proxmox-csi").as_deref(),
            Some("proxmox-csi")
        );
        assert_eq!(
            workload_class(&classes, "missing").as_deref(),
            Some("standard")
        );
        assert_eq!(workload_class(&classes[2..], "missing"), None);
    }

    #[test]
    fn test_enough_ready() {
        assert!(enough_ready(3, 3));
        assert!(!enough_ready(2, 3));
        assert!(enough_ready(4, 5));
        assert!(enough_ready(0, 0));
    }

    fn outcome(satisfied: bool) -> PollOutcome<anyhow::Error> {
        PollOutcome {
            satisfied,
            elapsed: Duration::from_secs(300),
            attempts: 31,
            last_error: Some(anyhow!("0/1 replicas ready")),
        }
    }

    #[test]
    fn test_settle_ready() {
        for cleanup_on_failure in [true, false] {
            assert!(matches!(
                settle(outcome(true), "web", "e2e-test", cleanup_on_failure),
                Settled::Ready
            ));
        }
    }

    #[test]
    fn test_settle_timeout_with_cleanup() {
        let Settled::Failed(error) =
            settle(outcome(false), "web-deployment", "e2e-test", true)
        else {
            panic!("a timed out workload must fail when cleaning up");
        };
        assert_eq!(
            format!("{error:#}"),
            "deployment web-deployment ready: not satisfied after 31 \
            attempts in 5m (last error: 0/1 replicas ready)"
        );
    }

    #[test]
    fn test_settle_timeout_keeping_resources() {
        let Settled::Kept(verdict) =
            settle(outcome(false), "web-deployment", "e2e-test", false)
        else {
            panic!("a timed out workload must be kept");
        };
        assert_eq!(
            verdict,
            Verdict::Skip(String::from(
                "deployment web-deployment ready: not satisfied after 31 \
                attempts in 5m (last error: 0/1 replicas ready) \
                (resources left in e2e-test)"
            ))
        );
    }

    #[tokio::test]
    async fn test_failed_create_is_cleaned_up() {
        let log = test_setup_log("test_failed_create_is_cleaned_up");
        let cleaned = Cell::new(false);
        let cleaned = &cleaned;
        let error = create_or_clean_up(
            &log,
            async { Err::<(), _>(anyhow!("applying Service web-service")) },
            move || async move {
                cleaned.set(true);
                Ok::<_, anyhow::Error>(())
            },
        )
        .await
        .unwrap_err();
        assert_eq!(error.to_string(), "applying Service web-service");
        assert!(cleaned.get());
    }

    #[tokio::test]
    async fn test_failed_cleanup_keeps_create_error() {
        let log = test_setup_log("test_failed_cleanup_keeps_create_error");
        let error = create_or_clean_up(
            &log,
            async { Err::<(), _>(anyhow!("applying Deployment")) },
            || async { Err::<(), _>(anyhow!("deleting web-pvc")) },
        )
        .await
        .unwrap_err();
        assert_eq!(error.to_string(), "applying Deployment");
    }

    #[tokio::test]
    async fn test_successful_create_is_kept() {
        let log = test_setup_log("test_successful_create_is_kept");
        let cleaned = Cell::new(false);
        let cleaned = &cleaned;
        let created = async { Ok::<_, anyhow::Error>(()) };
        create_or_clean_up(&log, created, move || async move {
            cleaned.set(true);
            Ok::<_, anyhow::Error>(())
        })
        .await
        .unwrap();
        assert!(!cleaned.get());
    }
}
