// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Readiness evaluators and poll predicates
//!
//! The evaluators are pure functions over API objects.  The predicates each
//! perform exactly one read and report whether the condition holds right now;
//! they're meant to be handed to [`crate::helpers::poll()`].

use super::k8s::{get_object, list_objects, TypeRef};
use anyhow::{bail, Context as _, Result};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, DeploymentCondition};
use k8s_openapi::api::core::v1::{
    Node, NodeCondition, PersistentVolumeClaim, Pod, PodCondition,
};
use kube::{Api, Client};

const STATUS_TRUE: &str = "True";
const ROLE_LABEL_PREFIX: &str = "node-role.kubernetes.io/";

/// Types that look like a Kubernetes status condition
pub trait HasConditionFields {
    fn type_field(&self) -> &str;
    fn status_field(&self) -> &str;
}

impl HasConditionFields for NodeCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

impl HasConditionFields for PodCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

impl HasConditionFields for DeploymentCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

/// Status of the condition named `condition_type`, if one is present
pub fn condition_status<'a, T>(
    conditions: Option<&'a [T]>,
    condition_type: &str,
) -> Option<&'a str>
where
    T: HasConditionFields,
{
    conditions?
        .iter()
        .find(|c| c.type_field() == condition_type)
        .map(|c| c.status_field())
}

fn condition_is_true<T: HasConditionFields>(
    conditions: Option<&[T]>,
    condition_type: &str,
) -> bool {
    condition_status(conditions, condition_type) == Some(STATUS_TRUE)
}

/// Whether the untyped object `object` has a `status.conditions` entry of
/// type `condition_type` whose status is `status`
///
/// `object` is the object body (for a `DynamicObject`, its `data`).
pub fn has_condition(
    object: &serde_json::Value,
    condition_type: &str,
    status: &str,
) -> bool {
    object
        .pointer("/status/conditions")
        .and_then(serde_json::Value::as_array)
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(|t| t.as_str()) == Some(condition_type)
                    && c.get("status").and_then(|s| s.as_str()) == Some(status)
            })
        })
}

pub fn node_is_ready(node: &Node) -> bool {
    let conditions = node.status.as_ref().and_then(|s| s.conditions.as_deref());
    condition_is_true(conditions, "Ready")
}

/// Roles from the node's `node-role.kubernetes.io/<role>` labels
///
/// A node without any role labels is a plain worker.
pub fn node_roles(node: &Node) -> Vec<String> {
    let roles: Vec<String> = node
        .metadata
        .labels
        .iter()
        .flatten()
        .filter_map(|(key, _)| key.strip_prefix(ROLE_LABEL_PREFIX))
        .filter(|role| !role.is_empty())
        .map(String::from)
        .collect();
    if roles.is_empty() { vec![String::from("worker")] } else { roles }
}

/// Whether the node's network is up
///
/// Most CNIs clear `NetworkUnavailable` once they've configured the node;
/// those that never set it are judged by `Ready` instead.
pub fn node_network_ready(node: &Node) -> bool {
    let conditions = node.status.as_ref().and_then(|s| s.conditions.as_deref());
    condition_status(conditions, "NetworkUnavailable") == Some("False")
        || condition_is_true(conditions, "Ready")
}

pub fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown")
}

pub fn pod_is_ready(pod: &Pod) -> bool {
    let conditions = pod.status.as_ref().and_then(|s| s.conditions.as_deref());
    condition_is_true(conditions, "Ready")
}

/// Whether every container in the pod reports ready (and there is at least
/// one)
pub fn pod_containers_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_deref())
        .is_some_and(|cs| !cs.is_empty() && cs.iter().all(|c| c.ready))
}

/// Name of the node the pod has been scheduled on, if any
pub fn pod_node(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref().and_then(|s| s.node_name.as_deref())
}

pub fn pvc_is_bound(pvc: &PersistentVolumeClaim) -> bool {
    pvc.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Bound")
}

/// (ready, desired) replica counts
pub fn deployment_replicas(deployment: &Deployment) -> (i32, i32) {
    let desired =
        deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    (ready, desired)
}

pub fn deployment_is_ready(deployment: &Deployment) -> bool {
    let (ready, desired) = deployment_replicas(deployment);
    desired > 0 && ready == desired
}

/// (ready, desired) pod counts
pub fn daemonset_counts(daemonset: &DaemonSet) -> (i32, i32) {
    daemonset
        .status
        .as_ref()
        .map(|s| (s.number_ready, s.desired_number_scheduled))
        .unwrap_or((0, 0))
}

pub fn daemonset_is_ready(daemonset: &DaemonSet) -> bool {
    let (ready, desired) = daemonset_counts(daemonset);
    ready == desired
}

// Predicates

/// Whether the named custom resource has condition `condition_type` set to
/// "True".  A resource that doesn't exist yet just isn't ready.
pub async fn cr_condition_met(
    client: &Client,
    type_ref: TypeRef<'_>,
    name: &str,
    condition_type: &str,
) -> Result<bool> {
    Ok(get_object(client, type_ref, name)
        .await?
        .is_some_and(|o| has_condition(&o.data, condition_type, STATUS_TRUE)))
}

pub async fn node_ready(client: &Client, name: &str) -> Result<bool> {
    let nodes: Api<Node> = Api::all(client.clone());
    let node = nodes
        .get(name)
        .await
        .with_context(|| format!("fetching node {name:?}"))?;
    Ok(node_is_ready(&node))
}

pub async fn pvc_bound(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<bool> {
    let pvcs: Api<PersistentVolumeClaim> =
        Api::namespaced(client.clone(), namespace);
    let pvc = pvcs
        .get(name)
        .await
        .with_context(|| format!("fetching PVC {namespace}/{name}"))?;
    Ok(pvc_is_bound(&pvc))
}

/// Whether the pod has reached the `Running` phase
///
/// A pod that has `Failed` is surfaced as an error so that the poll outcome
/// carries the reason.
pub async fn pod_running(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<bool> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let pod = pods
        .get(name)
        .await
        .with_context(|| format!("fetching pod {namespace}/{name}"))?;
    match pod_phase(&pod) {
        "Running" => Ok(true),
        "Failed" => bail!("pod {namespace}/{name} failed"),
        _ => Ok(false),
    }
}

pub async fn deployment_ready(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<bool> {
    let deployments: Api<Deployment> =
        Api::namespaced(client.clone(), namespace);
    let deployment = deployments
        .get(name)
        .await
        .with_context(|| format!("fetching deployment {namespace}/{name}"))?;
    Ok(deployment_is_ready(&deployment))
}

pub async fn pod_scheduled_on(
    client: &Client,
    namespace: &str,
    name: &str,
    node: &str,
) -> Result<bool> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let pod = pods
        .get(name)
        .await
        .with_context(|| format!("fetching pod {namespace}/{name}"))?;
    Ok(pod_node(&pod) == Some(node))
}

/// Whether at least one object of the given type exists
pub async fn any_object_exists(
    client: &Client,
    type_ref: TypeRef<'_>,
) -> Result<bool> {
    Ok(!list_objects(client, type_ref).await?.is_empty())
}
