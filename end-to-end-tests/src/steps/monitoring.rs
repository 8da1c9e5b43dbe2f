// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Step 7: the monitoring stack is running and collecting metrics

use crate::helpers::conditions::{daemonset_counts, pod_is_ready, pod_phase};
use crate::helpers::ctx::Context;
use crate::helpers::k8s::build_api_resource;
use crate::helpers::{poll, Timing};
use crate::report::{PollPolicy, StepReport, Verdict};
use anyhow::{bail, ensure, Context as _, Result};
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Endpoints, Node, Pod, Service};
use kube::api::{ApiResource, DynamicObject, ListParams};
use kube::{Api, Client};
use serde::Deserialize;
use slog::info;
use std::collections::BTreeSet;
use std::time::Duration;

/// Most specific first: "prometheus-node-exporter" is a node exporter.
const MONITORING_KINDS: [&str; 8] = [
    "node-exporter",
    "kube-state-metrics",
    "metrics-server",
    "alertmanager",
    "grafana",
    "prometheus",
    "loki",
    "fluent",
];
const METRICS_API_VERSION: &str = "metrics.k8s.io/v1beta1";
const SAMPLE_QUERIES: [&str; 2] =
    ["node_cpu_seconds_total", "container_memory_usage_bytes"];

/// How many Proxmox pods to look up in the pod metrics API
const POD_METRICS_SAMPLE: usize = 3;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const EXTERNAL_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub(super) async fn run(ctx: &Context, report: &mut StepReport) {
    let log = &ctx.log;
    report.check(log, "monitoring pods", monitoring_pods(ctx)).await;
    report.check(log, "Prometheus pods", prometheus(ctx)).await;
    report.check(log, "Grafana pods", grafana(ctx)).await;
    report.check(log, "node exporter", node_exporter(ctx)).await;
    report.check(log, "monitoring services", services(ctx)).await;
    report
        .check(log, "Prometheus service endpoints", prometheus_endpoints(ctx))
        .await;
    report.check(log, "node metrics", node_metrics(ctx)).await;
    report.check(log, "pod metrics", pod_metrics(ctx)).await;
    report
        .check(log, "Proxmox node metrics", proxmox_node_metrics(ctx))
        .await;
    report
        .check(log, "Proxmox pod metrics", proxmox_pod_metrics(ctx))
        .await;
    report
        .check(log, "external Prometheus API", external_prometheus(ctx))
        .await;
    report
        .check(log, "external Grafana API", external_grafana(ctx))
        .await;
}

/// Which monitoring component a pod or service name belongs to
fn monitoring_kind(name: &str) -> Option<&'static str> {
    let name = name.to_lowercase();
    MONITORING_KINDS.into_iter().find(|kind| name.contains(kind))
}

fn name_of<T: kube::Resource>(item: &T) -> &str {
    item.meta().name.as_deref().unwrap_or_default()
}

fn qualified<T: kube::Resource>(item: &T) -> String {
    format!(
        "{}/{}",
        item.meta().namespace.as_deref().unwrap_or_default(),
        name_of(item)
    )
}

/// All pods belonging to the monitoring stack, with their component
async fn monitoring_pods_by_kind(
    client: &Client,
) -> Result<Vec<(&'static str, Pod)>> {
    let pods: Api<Pod> = Api::all(client.clone());
    let pods =
        pods.list(&ListParams::default()).await.context("listing pods")?;
    Ok(pods
        .items
        .into_iter()
        .filter_map(|pod| {
            monitoring_kind(name_of(&pod)).map(|kind| (kind, pod))
        })
        .collect())
}

fn is_healthy(pod: &Pod) -> bool {
    pod_phase(pod) == "Running" && pod_is_ready(pod)
}

async fn monitoring_pods(ctx: &Context) -> Result<Verdict> {
    let pods = monitoring_pods_by_kind(ctx.kube().await?).await?;
    if pods.is_empty() {
        return Ok(Verdict::Skip(String::from("no monitoring pods found")));
    }
    let kinds: BTreeSet<&str> = pods.iter().map(|(kind, _)| *kind).collect();
    info!(ctx.log, "monitoring stack";
        "pods" => pods.len(),
        "components" => kinds.into_iter().collect::<Vec<_>>().join(","));

    let unhealthy: Vec<String> = pods
        .iter()
        .filter(|(_, pod)| !is_healthy(pod))
        .map(|(_, pod)| format!("{} ({})", qualified(pod), pod_phase(pod)))
        .collect();
    if unhealthy.is_empty() {
        Ok(Verdict::Pass)
    } else {
        Ok(Verdict::Warn(format!(
            "monitoring pods not running and ready: {}",
            unhealthy.join(", ")
        )))
    }
}

async fn pods_of_kind(ctx: &Context, kind: &str) -> Result<Vec<Pod>> {
    Ok(monitoring_pods_by_kind(ctx.kube().await?)
        .await?
        .into_iter()
        .filter(|(k, _)| *k == kind)
        .map(|(_, pod)| pod)
        .collect())
}

async fn prometheus(ctx: &Context) -> Result<Verdict> {
    let pods = pods_of_kind(ctx, "prometheus").await?;
    if pods.is_empty() {
        return Ok(Verdict::Skip(String::from("no Prometheus pods found")));
    }
    for pod in &pods {
        ensure!(
            pod_phase(pod) == "Running",
            "Prometheus pod {} not running: {}",
            qualified(pod),
            pod_phase(pod)
        );
        ensure!(
            pod_is_ready(pod),
            "Prometheus pod {} not ready",
            qualified(pod)
        );
    }
    Ok(Verdict::Pass)
}

async fn grafana(ctx: &Context) -> Result<Verdict> {
    let pods = pods_of_kind(ctx, "grafana").await?;
    if pods.is_empty() {
        return Ok(Verdict::Warn(String::from("no Grafana pods found")));
    }
    let unhealthy: Vec<String> =
        pods.iter().filter(|p| !is_healthy(p)).map(qualified).collect();
    if unhealthy.is_empty() {
        Ok(Verdict::Pass)
    } else {
        Ok(Verdict::Warn(format!(
            "Grafana pods unhealthy: {}",
            unhealthy.join(", ")
        )))
    }
}

async fn node_exporter(ctx: &Context) -> Result<Verdict> {
    let daemonsets: Api<DaemonSet> = Api::all(ctx.kube().await?.clone());
    let daemonsets: Vec<DaemonSet> = daemonsets
        .list(&ListParams::default())
        .await
        .context("listing daemonsets")?
        .items
        .into_iter()
        .filter(|ds| name_of(ds).to_lowercase().contains("node-exporter"))
        .collect();
    if daemonsets.is_empty() {
        return Ok(Verdict::Warn(String::from(
            "no node exporter daemonset found",
        )));
    }
    for ds in &daemonsets {
        let (ready, desired) = daemonset_counts(ds);
        if desired == 0 || ready != desired {
            return Ok(Verdict::Warn(format!(
                "node exporter {} not fully ready ({ready}/{desired})",
                qualified(ds)
            )));
        }
    }
    Ok(Verdict::Pass)
}

async fn monitoring_services(
    client: &Client,
) -> Result<Vec<(&'static str, Service)>> {
    let services: Api<Service> = Api::all(client.clone());
    let services = services
        .list(&ListParams::default())
        .await
        .context("listing services")?;
    Ok(services
        .items
        .into_iter()
        .filter_map(|svc| {
            monitoring_kind(name_of(&svc)).map(|kind| (kind, svc))
        })
        .collect())
}

async fn services(ctx: &Context) -> Result<Verdict> {
    let services = monitoring_services(ctx.kube().await?).await?;
    if services.is_empty() {
        return Ok(Verdict::Skip(String::from(
            "no monitoring services found",
        )));
    }
    for (kind, svc) in &services {
        let spec = svc.spec.as_ref();
        let ports = spec
            .and_then(|s| s.ports.as_ref())
            .map(|ports| {
                ports
                    .iter()
                    .map(|p| p.port.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_default();
        info!(ctx.log, "monitoring service";
            "service" => qualified(svc),
            "component" => *kind,
            "type" => spec.and_then(|s| s.type_.as_deref()),
            "cluster_ip" => spec.and_then(|s| s.cluster_ip.as_deref()),
            "ports" => ports);
    }
    Ok(Verdict::Pass)
}

/// Number of ready addresses behind a service
fn ready_addresses(endpoints: &Endpoints) -> usize {
    endpoints
        .subsets
        .iter()
        .flatten()
        .map(|subset| subset.addresses.as_ref().map_or(0, Vec::len))
        .sum()
}

async fn prometheus_endpoints(ctx: &Context) -> Result<Verdict> {
    let client = ctx.kube().await?;
    let services: Vec<Service> = monitoring_services(client)
        .await?
        .into_iter()
        .filter(|(kind, _)| *kind == "prometheus")
        .map(|(_, svc)| svc)
        .collect();
    if services.is_empty() {
        return Ok(Verdict::Skip(String::from(
            "no Prometheus services found",
        )));
    }
    let mut empty = Vec::new();
    for svc in &services {
        let namespace =
            svc.metadata.namespace.as_deref().unwrap_or("default");
        let endpoints: Api<Endpoints> =
            Api::namespaced(client.clone(), namespace);
        let count = match endpoints.get_opt(name_of(svc)).await {
            Ok(found) => found.as_ref().map_or(0, ready_addresses),
            Err(error) => {
                return Ok(Verdict::Warn(format!(
                    "could not read endpoints of {}: {error}",
                    qualified(svc)
                )));
            }
        };
        info!(ctx.log, "Prometheus endpoints";
            "service" => qualified(svc), "ready" => count);
        if count == 0 {
            empty.push(qualified(svc));
        }
    }
    if empty.is_empty() {
        Ok(Verdict::Pass)
    } else {
        Ok(Verdict::Warn(format!(
            "Prometheus services without endpoints: {}",
            empty.join(", ")
        )))
    }
}

/// The resource metrics API, whose plurals don't follow the kind names
fn metrics_resource(kind: &str, plural: &str) -> ApiResource {
    ApiResource {
        plural: plural.to_string(),
        ..build_api_resource(METRICS_API_VERSION, kind)
    }
}

async fn list_metrics(
    client: &Client,
    kind: &str,
    plural: &str,
    namespace: Option<&str>,
) -> Result<Vec<DynamicObject>> {
    let resource = metrics_resource(kind, plural);
    let api: Api<DynamicObject> = match namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, &resource),
        None => Api::all_with(client.clone(), &resource),
    };
    Ok(api
        .list(&ListParams::default())
        .await
        .with_context(|| {
            format!("listing {plural} from {METRICS_API_VERSION}")
        })?
        .items)
}

fn usage<'a>(metrics: &'a DynamicObject, resource: &str) -> Option<&'a str> {
    metrics
        .data
        .pointer(&format!("/usage/{resource}"))
        .and_then(serde_json::Value::as_str)
}

async fn node_metrics(ctx: &Context) -> Result<Verdict> {
    let client = ctx.kube().await?;
    let metrics = match list_metrics(client, "NodeMetrics", "nodes", None).await
    {
        Ok(metrics) if !metrics.is_empty() => metrics,
        Ok(_) => {
            return Ok(Verdict::Warn(String::from(
                "metrics API returned no nodes",
            )));
        }
        Err(error) => {
            return Ok(Verdict::Warn(format!(
                "metrics API not available: {error:#}"
            )));
        }
    };
    for node in metrics.iter().take(3) {
        info!(ctx.log, "node usage"; "node" => name_of(node),
            "cpu" => usage(node, "cpu"), "memory" => usage(node, "memory"));
    }
    info!(ctx.log, "metrics API available"; "nodes" => metrics.len());
    Ok(Verdict::Pass)
}

async fn pod_metrics(ctx: &Context) -> Result<Verdict> {
    let namespace = ctx.config.monitoring.namespace.as_str();
    let client = ctx.kube().await?;
    match list_metrics(client, "PodMetrics", "pods", Some(namespace)).await {
        Ok(metrics) if !metrics.is_empty() => {
            info!(ctx.log, "pod metrics available";
                "namespace" => namespace, "pods" => metrics.len());
            Ok(Verdict::Pass)
        }
        Ok(_) => Ok(Verdict::Warn(format!("no pod metrics in {namespace}"))),
        Err(error) => Ok(Verdict::Warn(format!(
            "no pod metrics available: {error:#}"
        ))),
    }
}

async fn proxmox_node_metrics(ctx: &Context) -> Result<Verdict> {
    let client = ctx.kube().await?;
    let nodes: Api<Node> = Api::all(client.clone());
    let proxmox: BTreeSet<String> = nodes
        .list(&ListParams::default())
        .await
        .context("listing nodes")?
        .items
        .into_iter()
        .filter(|node| {
            node.metadata.labels.iter().flatten().any(|(k, v)| {
                k.to_lowercase().contains("proxmox")
                    || v.to_lowercase().contains("proxmox")
            })
        })
        .filter_map(|node| node.metadata.name)
        .collect();
    if proxmox.is_empty() {
        return Ok(Verdict::Skip(String::from(
            "no Proxmox worker nodes detected",
        )));
    }
    let Ok(metrics) = list_metrics(client, "NodeMetrics", "nodes", None).await
    else {
        return Ok(Verdict::Warn(String::from("metrics API not available")));
    };
    let covered: Vec<&DynamicObject> = metrics
        .iter()
        .filter(|m| proxmox.contains(name_of(*m)))
        .collect();
    for node in &covered {
        info!(ctx.log, "Proxmox node usage"; "node" => name_of(*node),
            "cpu" => usage(node, "cpu"), "memory" => usage(node, "memory"));
    }
    if covered.len() < proxmox.len() {
        return Ok(Verdict::Warn(format!(
            "metrics for {} of {} Proxmox nodes",
            covered.len(),
            proxmox.len()
        )));
    }
    Ok(Verdict::Pass)
}

/// Pods whose names mention Proxmox, as (namespace, name)
fn proxmox_pods(pods: &[Pod]) -> Vec<(String, String)> {
    pods.iter()
        .filter(|pod| name_of(*pod).to_lowercase().contains("proxmox"))
        .map(|pod| {
            let namespace = pod.metadata.namespace.as_deref();
            (namespace.unwrap_or("default").to_string(), name_of(pod).into())
        })
        .collect()
}

/// Number of containers a PodMetrics object has usage samples for
fn sampled_containers(metrics: &DynamicObject) -> usize {
    metrics
        .data
        .get("containers")
        .and_then(serde_json::Value::as_array)
        .map_or(0, Vec::len)
}

async fn proxmox_pod_metrics(ctx: &Context) -> Result<Verdict> {
    let client = ctx.kube().await?;
    let pods: Api<Pod> = Api::all(client.clone());
    let pods =
        pods.list(&ListParams::default()).await.context("listing pods")?;
    let proxmox = proxmox_pods(&pods.items);
    if proxmox.is_empty() {
        return Ok(Verdict::Skip(String::from(
            "no Proxmox-related pods found",
        )));
    }
    info!(ctx.log, "Proxmox-related pods"; "pods" => proxmox.len());

    let mut missing = Vec::new();
    for (namespace, name) in proxmox.iter().take(POD_METRICS_SAMPLE) {
        let metrics =
            match list_metrics(client, "PodMetrics", "pods", Some(namespace))
                .await
            {
                Ok(metrics) => metrics,
                Err(error) => {
                    missing.push(format!("{namespace}/{name} ({error:#})"));
                    continue;
                }
            };
        match metrics.iter().find(|m| name_of(*m) == name) {
            Some(found) => {
                info!(ctx.log, "Proxmox pod metrics";
                    "pod" => format!("{namespace}/{name}"),
                    "containers" => sampled_containers(found));
            }
            None => missing.push(format!("{namespace}/{name}")),
        }
    }
    if missing.is_empty() {
        Ok(Verdict::Pass)
    } else {
        Ok(Verdict::Warn(format!(
            "no metrics for Proxmox pods: {}",
            missing.join(", ")
        )))
    }
}

/// Response body of the Prometheus query API
#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<serde_json::Value>,
}

impl QueryResponse {
    fn samples(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.result.len())
    }
}

fn endpoint_url(base: &str, path: &str) -> String {
    format!("{}{path}", base.trim_end_matches('/'))
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("building HTTP client")
}

async fn query_prometheus(
    http: &reqwest::Client,
    base: &str,
    query: &str,
) -> Result<QueryResponse> {
    let url = endpoint_url(base, "/api/v1/query");
    let response = http
        .get(&url)
        .query(&[("query", query)])
        .send()
        .await
        .with_context(|| format!("GET {url}"))?
        .error_for_status()
        .with_context(|| format!("GET {url}"))?;
    response
        .json()
        .await
        .with_context(|| format!("decoding response from {url}"))
}

async fn prometheus_up(http: &reqwest::Client, base: &str) -> Result<bool> {
    Ok(query_prometheus(http, base, "up").await?.status == "success")
}

async fn grafana_healthy(http: &reqwest::Client, base: &str) -> Result<bool> {
    let url = endpoint_url(base, "/api/health");
    let status = http
        .get(&url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?
        .status();
    if !status.is_success() {
        bail!("GET {url}: {status}");
    }
    Ok(true)
}

/// The endpoint to test, or why the check is skipped
fn external_endpoint<'a>(
    enabled: bool,
    endpoint: Option<&'a str>,
    what: &str,
) -> Result<&'a str, Verdict> {
    match endpoint {
        Some(endpoint) if enabled => Ok(endpoint),
        _ => Err(Verdict::Skip(format!(
            "external {what} testing disabled or endpoint not configured"
        ))),
    }
}

fn external_timing(ctx: &Context) -> Timing {
    Timing {
        timeout: ctx.config.monitoring.test_timeout(),
        interval: EXTERNAL_POLL_INTERVAL,
    }
}

async fn external_prometheus(ctx: &Context) -> Result<Verdict> {
    let monitoring = &ctx.config.monitoring;
    let base = match external_endpoint(
        monitoring.enable_external_tests,
        monitoring.prometheus_endpoint.as_deref(),
        "Prometheus",
    ) {
        Ok(base) => base,
        Err(skip) => return Ok(skip),
    };
    let http = http_client()?;
    poll(&ctx.log, "Prometheus up query", external_timing(ctx), || {
        prometheus_up(&http, base)
    })
    .await?
    .require(&format!("Prometheus API at {base}"))?;

    let mut failed = Vec::new();
    for query in SAMPLE_QUERIES {
        match query_prometheus(&http, base, query).await {
            Ok(response) if response.status == "success" => {
                info!(ctx.log, "Prometheus query";
                    "query" => query, "samples" => response.samples());
            }
            _ => failed.push(query),
        }
    }
    if failed.is_empty() {
        Ok(Verdict::Pass)
    } else {
        Ok(Verdict::Warn(format!(
            "Prometheus queries failed: {}",
            failed.join(", ")
        )))
    }
}

async fn external_grafana(ctx: &Context) -> Result<Verdict> {
    let monitoring = &ctx.config.monitoring;
    let base = match external_endpoint(
        monitoring.enable_external_tests,
        monitoring.grafana_endpoint.as_deref(),
        "Grafana",
    ) {
        Ok(base) => base,
        Err(skip) => return Ok(skip),
    };
    let http = http_client()?;
    Ok(poll(&ctx.log, "Grafana health", external_timing(ctx), || {
        grafana_healthy(&http, base)
    })
    .await?
    .or_warn(&format!("Grafana API at {base}")))
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_monitoring_kind() {
        assert_eq!(monitoring_kind("prometheus-k8s-0"), Some("prometheus"));
        assert_eq!(
            monitoring_kind("stack-prometheus-node-exporter-x7k2p"),
            Some("node-exporter")
        );
        assert_eq!(
            monitoring_kind("alertmanager-kube-prometheus-stack-0"),
            Some("alertmanager")
        );
        assert_eq!(monitoring_kind("Grafana-7d9f"), Some("grafana"));
        assert_eq!(monitoring_kind("fluent-bit-abcde"), Some("fluent"));
        assert_eq!(monitoring_kind("coredns-5d78c9869d-7xk2p"), None);
    }

    #[test]
    fn test_ready_addresses() {
        let endpoints: Endpoints = serde_json::from_value(json!({
            "metadata": {"name": "prometheus"},
            "subsets": [
                {"addresses": [{"ip": "10.0.0.1"}, {"ip": "10.0.0.2"}]},
                {"notReadyAddresses": [{"ip": "10.0.0.3"}]},
            ],
        }))
        .unwrap();
        assert_eq!(ready_addresses(&endpoints), 2);
        let empty: Endpoints =
            serde_json::from_value(json!({"metadata": {"name": "p"}})).unwrap();
        assert_eq!(ready_addresses(&empty), 0);
    }

    #[test]
    fn test_metrics_resource() {
        let resource = metrics_resource("NodeMetrics", "nodes");
        assert_eq!(resource.group, "metrics.k8s.io");
        assert_eq!(resource.version, "v1beta1");
        assert_eq!(resource.plural, "nodes");
        assert_eq!(resource.kind, "NodeMetrics");
    }

    #[test]
    fn test_query_response() {
        let response: QueryResponse = serde_json::from_value(json!({
            "status": "success",
            "data": {"resultType": "vector", "result": [{"value": [1, "1"]}]},
        }))
        .unwrap();
        assert_eq!(response.samples(), 1);
        let error: QueryResponse = serde_json::from_value(json!({
            "status": "error",
            "errorType": "bad_data",
        }))
        .unwrap();
        assert_eq!(error.status, "error");
        assert_eq!(error.samples(), 0);
    }

    #[test]
    fn test_endpoint_url() {
        assert_eq!(
            endpoint_url("http://prom:9090/", "/api/v1/query"),
            "http://prom:9090/api/v1/query"
        );
        assert_eq!(
            endpoint_url("http://grafana", "/api/health"),
            "http://grafana/api/health"
        );
    }

    #[test]
    fn test_external_endpoint() {
        assert_eq!(
            external_endpoint(true, Some("http://p"), "Prometheus"),
            Ok("http://p")
        );
        assert!(matches!(
            external_endpoint(false, Some("http://p"), "Prometheus"),
            Err(Verdict::Skip(_))
        ));
        assert!(matches!(
            external_endpoint(true, None, "Grafana"),
            Err(Verdict::Skip(_))
        ));
    }

    fn pod(namespace: Option<&str>, name: &str) -> Pod {
        serde_json::from_value(json!({
            "metadata": {"name": name, "namespace": namespace},
        }))
        .unwrap()
    }

    #[test]
    fn test_proxmox_pods() {
        let pods = vec![
            pod(Some("capmox-system"), "capmox-controller-manager-5f9"),
            pod(Some("csi-proxmox"), "Proxmox-CSI-plugin-node-abcde"),
            pod(Some("kube-system"), "coredns-5d78c9869d-7xk2p"),
            pod(None, "proxmox-ccm-0"),
        ];
        assert_eq!(
            proxmox_pods(&pods),
            vec![
                (
                    String::from("csi-proxmox"),
                    String::from("Proxmox-CSI-plugin-node-abcde")
                ),
                (String::from("default"), String::from("proxmox-ccm-0")),
            ]
        );
        assert!(proxmox_pods(&pods[2..3]).is_empty());
    }

    #[test]
    fn test_sampled_containers() {
        let metrics: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "metrics.k8s.io/v1beta1",
            "kind": "PodMetrics",
            "metadata": {"name": "proxmox-ccm-0", "namespace": "kube-system"},
            "containers": [
                {"name": "ccm", "usage": {"cpu": "3m", "memory": "20Mi"}},
            ],
        }))
        .unwrap();
        assert_eq!(sampled_containers(&metrics), 1);
        let empty: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "metrics.k8s.io/v1beta1",
            "kind": "PodMetrics",
            "metadata": {"name": "p"},
        }))
        .unwrap();
        assert_eq!(sampled_containers(&empty), 0);
    }
}
