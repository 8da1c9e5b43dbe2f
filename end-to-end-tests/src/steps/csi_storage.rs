// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Step 5: the Proxmox CSI driver provisions and mounts volumes

use crate::helpers::conditions::{
    daemonset_counts, pod_containers_ready, pod_phase, pod_running, pvc_bound,
};
use crate::helpers::ctx::Context;
use crate::helpers::k8s::{
    apply_object, delete_namespace, delete_object, ensure_namespace, TypeRef,
};
use crate::helpers::{poll, Timing};
use crate::report::{PollPolicy, StepReport, Verdict};
use anyhow::{anyhow, bail, ensure, Context as _, Result};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{
    PersistentVolume, PersistentVolumeClaim, Pod,
};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::ListParams;
use kube::{Api, Client};
use rollout_test_utils::dev::poll::PollOutcome;
use serde_json::json;
use slog::{info, warn};
use std::collections::BTreeMap;

const PROVISIONING_PVC: &str = "test-proxmox-pvc";
const MOUNT_PVC: &str = "test-mount-pvc";
const MOUNT_POD: &str = "test-mount-pod";
const MOUNT_VOLUME_SIZE: &str = "1Gi";
const ACCESS_MODES: [&str; 3] =
    ["ReadWriteOnce", "ReadOnlyMany", "ReadWriteMany"];

const PVC_BOUND: Timing = Timing::secs(300, 10);
const ACCESS_MODE_BOUND: Timing = Timing::secs(60, 10);
const MOUNT_POD_RUNNING: Timing = Timing::secs(180, 10);

pub(super) async fn run(ctx: &Context, report: &mut StepReport) {
    let log = &ctx.log;
    report.check(log, "CSI deployments ready", csi_deployments(ctx)).await;
    report.check(log, "CSI daemonsets ready", csi_daemonsets(ctx)).await;
    report.check(log, "CSI pods running", csi_pods(ctx)).await;
    report.check(log, "storage class", storage_class(ctx)).await;
    report
        .check(log, "storage class parameters", storage_class_parameters(ctx))
        .await;
    report.check(log, "namespace", namespace(ctx)).await;
    report
        .check(log, "dynamic provisioning", dynamic_provisioning(ctx))
        .await;
    report.check(log, "volume mount in pod", volume_mount(ctx)).await;
    report.check(log, "volume expansion", volume_expansion(ctx)).await;
    report.check(log, "access modes", access_modes(ctx)).await;
    report.check(log, "cleanup", cleanup(ctx)).await;
}

fn ns(ctx: &Context) -> &str {
    &ctx.config.csi.namespace
}

/// Whether a workload name belongs to the Proxmox CSI driver
fn is_csi_name(name: &str) -> bool {
    let name = name.to_lowercase();
    name.contains("proxmox") && name.contains("csi")
}

fn named_csi<T: kube::Resource>(items: Vec<T>) -> Vec<T> {
    items
        .into_iter()
        .filter(|item| item.meta().name.as_deref().is_some_and(is_csi_name))
        .collect()
}

fn name_of<T: kube::Resource>(item: &T) -> &str {
    item.meta().name.as_deref().unwrap_or_default()
}

async fn csi_deployments(ctx: &Context) -> Result<Verdict> {
    let deployments: Api<Deployment> = Api::all(ctx.kube().await?.clone());
    let deployments = named_csi(
        deployments
            .list(&ListParams::default())
            .await
            .context("listing deployments")?
            .items,
    );
    if deployments.is_empty() {
        return Ok(Verdict::Skip(String::from(
            "Proxmox CSI driver not deployed",
        )));
    }
    for deployment in &deployments {
        let ready = deployment
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        ensure!(ready > 0, "CSI deployment {} not ready", name_of(deployment));
        info!(ctx.log, "CSI deployment ready";
            "name" => name_of(deployment), "ready_replicas" => ready);
    }
    Ok(Verdict::Pass)
}

async fn csi_daemonsets(ctx: &Context) -> Result<Verdict> {
    let daemonsets: Api<DaemonSet> = Api::all(ctx.kube().await?.clone());
    let daemonsets = named_csi(
        daemonsets
            .list(&ListParams::default())
            .await
            .context("listing daemonsets")?
            .items,
    );
    if daemonsets.is_empty() {
        return Ok(Verdict::Warn(String::from(
            "no Proxmox CSI daemonsets found",
        )));
    }
    for daemonset in &daemonsets {
        let (ready, desired) = daemonset_counts(daemonset);
        ensure!(
            ready == desired,
            "CSI daemonset {} not fully ready ({ready}/{desired})",
            name_of(daemonset)
        );
    }
    Ok(Verdict::Pass)
}

async fn csi_pods(ctx: &Context) -> Result<Verdict> {
    let pods: Api<Pod> = Api::all(ctx.kube().await?.clone());
    let pods = named_csi(
        pods.list(&ListParams::default()).await.context("listing pods")?.items,
    );
    if pods.is_empty() {
        return Ok(Verdict::Skip(String::from("no Proxmox CSI pods found")));
    }
    for pod in &pods {
        let phase = pod_phase(pod);
        ensure!(
            phase == "Running",
            "CSI pod {} not running: {phase}",
            name_of(pod)
        );
        ensure!(
            pod_containers_ready(pod),
            "CSI pod {} has containers that are not ready",
            name_of(pod)
        );
    }
    Ok(Verdict::Pass)
}

async fn storage_classes(client: &Client) -> Result<Vec<StorageClass>> {
    let classes: Api<StorageClass> = Api::all(client.clone());
    Ok(classes
        .list(&ListParams::default())
        .await
        .context("listing storage classes")?
        .items)
}

/// Storage classes served by `provisioner`
fn provisioned_by<'a>(
    classes: &'a [StorageClass],
    provisioner: &'a str,
) -> impl Iterator<Item = &'a StorageClass> + 'a {
    classes.iter().filter(move |sc| sc.provisioner == provisioner)
}

/// The storage class to provision test volumes from: the configured one if
/// the driver serves it, otherwise the first class the driver serves
fn test_class<'a>(
    classes: &'a [StorageClass],
    provisioner: &'a str,
    preferred: &str,
) -> Option<&'a str> {
    let mut candidates = provisioned_by(classes, provisioner)
        .filter_map(|sc| sc.metadata.name.as_deref())
        .peekable();
    let first = *candidates.peek()?;
    Some(candidates.find(|name| *name == preferred).unwrap_or(first))
}

fn no_class(ctx: &Context) -> Verdict {
    Verdict::Skip(format!(
        "no storage classes with provisioner {}",
        ctx.config.csi.provisioner
    ))
}

async fn storage_class(ctx: &Context) -> Result<Verdict> {
    let provisioner = &ctx.config.csi.provisioner;
    let classes = storage_classes(ctx.kube().await?).await?;
    let proxmox: Vec<&StorageClass> = classes
        .iter()
        .filter(|sc| {
            name_of(*sc).to_lowercase().contains("proxmox")
                || &sc.provisioner == provisioner
        })
        .collect();
    if proxmox.is_empty() {
        return Ok(Verdict::Skip(String::from(
            "no Proxmox storage classes found",
        )));
    }
    for sc in proxmox {
        ensure!(
            &sc.provisioner == provisioner,
            "storage class {} has unexpected provisioner {}",
            name_of(sc),
            sc.provisioner
        );
        info!(ctx.log, "storage class";
            "name" => name_of(sc),
            "binding_mode" => sc.volume_binding_mode.as_deref(),
            "reclaim_policy" => sc.reclaim_policy.as_deref());
    }
    Ok(Verdict::Pass)
}

async fn storage_class_parameters(ctx: &Context) -> Result<Verdict> {
    let classes = storage_classes(ctx.kube().await?).await?;
    let proxmox: Vec<_> =
        provisioned_by(&classes, &ctx.config.csi.provisioner).collect();
    if proxmox.is_empty() {
        return Ok(no_class(ctx));
    }
    let empty = BTreeMap::new();
    let mut without_storage = Vec::new();
    for sc in proxmox {
        let params = sc.parameters.as_ref().unwrap_or(&empty);
        let param = |key: &str| params.get(key).map(String::as_str);
        if param("storage").is_none() {
            without_storage.push(name_of(sc));
        }
        info!(ctx.log, "storage class parameters";
            "name" => name_of(sc),
            "storage" => param("storage"),
            "format" => param("format"),
            "node" => param("node"),
            "cache" => param("cache"));
    }
    if without_storage.is_empty() {
        Ok(Verdict::Pass)
    } else {
        Ok(Verdict::Warn(format!(
            "storage classes without a storage parameter: {}",
            without_storage.join(", ")
        )))
    }
}

async fn namespace(ctx: &Context) -> Result<Verdict> {
    let state =
        ensure_namespace(ctx.kube().await?, ns(ctx), &BTreeMap::new()).await?;
    info!(ctx.log, "namespace"; "name" => ns(ctx), "state" => ?state);
    Ok(Verdict::Pass)
}

fn pvc_manifest(
    name: &str,
    namespace: &str,
    storage_class: &str,
    size: &str,
    access_mode: &str,
) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {"name": name, "namespace": namespace},
        "spec": {
            "accessModes": [access_mode],
            "storageClassName": storage_class,
            "resources": {"requests": {"storage": size}},
        },
    })
}

fn pvc_type(namespace: &str) -> TypeRef<'_> {
    TypeRef::namespaced("v1", "PersistentVolumeClaim", namespace)
}

/// Create a PVC from `storage_class` and poll it until it's bound
///
/// The PVC is left in place either way.
async fn provision(
    ctx: &Context,
    name: &str,
    storage_class: &str,
    size: &str,
    access_mode: &str,
    timing: Timing,
) -> Result<PollOutcome<anyhow::Error>> {
    let client = ctx.kube().await?;
    apply_object(
        client,
        &pvc_manifest(name, ns(ctx), storage_class, size, access_mode),
    )
    .await?;
    poll(&ctx.log, &format!("PVC {name} bound"), timing, || {
        pvc_bound(client, ns(ctx), name)
    })
    .await
}

/// The CSI driver behind the volume bound to a PVC
async fn bound_driver(
    client: &Client,
    namespace: &str,
    pvc: &str,
) -> Result<String> {
    let pvcs: Api<PersistentVolumeClaim> =
        Api::namespaced(client.clone(), namespace);
    let claim = pvcs
        .get(pvc)
        .await
        .with_context(|| format!("fetching PVC {pvc}"))?;
    let volume = claim
        .spec
        .and_then(|s| s.volume_name)
        .ok_or_else(|| anyhow!("PVC {pvc} is bound but names no volume"))?;
    let pvs: Api<PersistentVolume> = Api::all(client.clone());
    let pv = pvs
        .get(&volume)
        .await
        .with_context(|| format!("fetching PV {volume}"))?;
    pv.spec
        .and_then(|s| s.csi)
        .map(|csi| csi.driver)
        .ok_or_else(|| anyhow!("PV {volume} is not a CSI volume"))
}

async fn dynamic_provisioning(ctx: &Context) -> Result<Verdict> {
    let csi = &ctx.config.csi;
    let client = ctx.kube().await?;
    let classes = storage_classes(client).await?;
    let Some(class) = test_class(&classes, &csi.provisioner, &csi.storage_class)
    else {
        return Ok(no_class(ctx));
    };

    let result: Result<Verdict> = async {
        provision(
            ctx,
            PROVISIONING_PVC,
            class,
            &csi.test_volume_size,
            ACCESS_MODES[0],
            PVC_BOUND,
        )
        .await?
        .require(&format!("PVC {PROVISIONING_PVC} bound"))?;
        let driver = bound_driver(client, ns(ctx), PROVISIONING_PVC).await?;
        ensure!(
            driver == csi.provisioner,
            "volume provisioned by {driver}, expected {}",
            csi.provisioner
        );
        Ok(Verdict::Pass)
    }
    .await;
    delete_object(client, pvc_type(ns(ctx)), PROVISIONING_PVC).await?;
    result
}

async fn volume_mount(ctx: &Context) -> Result<Verdict> {
    let csi = &ctx.config.csi;
    let client = ctx.kube().await?;
    let classes = storage_classes(client).await?;
    let Some(class) = test_class(&classes, &csi.provisioner, &csi.storage_class)
    else {
        return Ok(no_class(ctx));
    };

    let result: Result<Verdict> = async {
        let bound = provision(
            ctx,
            MOUNT_PVC,
            class,
            MOUNT_VOLUME_SIZE,
            ACCESS_MODES[0],
            PVC_BOUND,
        )
        .await?;
        if !bound.satisfied {
            return Ok(bound.or_skip(&format!("PVC {MOUNT_PVC} bound")));
        }
        apply_object(
            client,
            &json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": MOUNT_POD, "namespace": ns(ctx)},
                "spec": {
                    "restartPolicy": "Never",
                    "containers": [{
                        "name": "test-container",
                        "image": "busybox:1.35",
                        "command": ["sleep", "300"],
                        "volumeMounts": [{
                            "name": "test-volume",
                            "mountPath": "/data",
                        }],
                    }],
                    "volumes": [{
                        "name": "test-volume",
                        "persistentVolumeClaim": {"claimName": MOUNT_PVC},
                    }],
                },
            }),
        )
        .await?;
        Ok(poll(&ctx.log, "mount pod Running", MOUNT_POD_RUNNING, || {
            pod_running(client, ns(ctx), MOUNT_POD)
        })
        .await?
        .or_warn(&format!("pod {MOUNT_POD} running with the volume mounted")))
    }
    .await;

    delete_object(client, TypeRef::namespaced("v1", "Pod", ns(ctx)), MOUNT_POD)
        .await?;
    delete_object(client, pvc_type(ns(ctx)), MOUNT_PVC).await?;
    result
}

async fn volume_expansion(ctx: &Context) -> Result<Verdict> {
    let classes = storage_classes(ctx.kube().await?).await?;
    let provisioner = &ctx.config.csi.provisioner;
    let expandable: Vec<&str> = provisioned_by(&classes, provisioner)
        .filter(|sc| sc.allow_volume_expansion == Some(true))
        .map(name_of)
        .collect();
    if expandable.is_empty() {
        return Ok(Verdict::Skip(String::from(
            "no expandable Proxmox storage classes found",
        )));
    }
    info!(ctx.log, "expandable storage classes";
        "names" => expandable.join(","));
    Ok(Verdict::Pass)
}

/// Which access modes the driver can bind
///
/// Block storage drivers usually only support ReadWriteOnce, so modes that
/// don't bind are reported rather than failed.
async fn access_modes(ctx: &Context) -> Result<Verdict> {
    let csi = &ctx.config.csi;
    let client = ctx.kube().await?;
    let classes = storage_classes(client).await?;
    let Some(class) = test_class(&classes, &csi.provisioner, &csi.storage_class)
    else {
        return Ok(no_class(ctx));
    };

    let mut unsupported = Vec::new();
    for (i, mode) in ACCESS_MODES.into_iter().enumerate() {
        let name = format!("test-access-mode-{i}");
        let bound = provision(
            ctx,
            &name,
            class,
            MOUNT_VOLUME_SIZE,
            mode,
            ACCESS_MODE_BOUND,
        )
        .await
        .map(|outcome| outcome.satisfied);
        match bound {
            Ok(true) => info!(ctx.log, "access mode supported"; "mode" => mode),
            Ok(false) => unsupported.push(mode),
            Err(error) => {
                warn!(ctx.log, "access mode test failed";
                    "mode" => mode, "error" => format!("{error:#}"));
                unsupported.push(mode);
            }
        }
        delete_object(client, pvc_type(ns(ctx)), &name).await?;
    }
    if unsupported.len() == ACCESS_MODES.len() {
        bail!("no access mode could be bound from storage class {class}");
    }
    if unsupported.is_empty() {
        Ok(Verdict::Pass)
    } else {
        Ok(Verdict::Warn(format!(
            "access modes not bound: {}",
            unsupported.join(", ")
        )))
    }
}

async fn cleanup(ctx: &Context) -> Result<Verdict> {
    let client = ctx.kube().await?;
    let pvcs: Api<PersistentVolumeClaim> =
        Api::namespaced(client.clone(), ns(ctx));
    let leftover = pvcs
        .list(&ListParams::default())
        .await
        .context("listing leftover PVCs")?;
    for pvc in &leftover.items {
        info!(ctx.log, "deleting leftover PVC"; "name" => name_of(pvc));
        delete_object(client, pvc_type(ns(ctx)), name_of(pvc)).await?;
    }
    delete_namespace(client, ns(ctx)).await?;
    Ok(Verdict::Pass)
}

#[cfg(test)]
mod test {
    use super::*;

    fn class(name: &str, provisioner: &str) -> StorageClass {
        serde_json::from_value(json!({
            "metadata": {"name": name},
            "provisioner": provisioner,
        }))
        .unwrap()
    }

    #[test]
    fn test_is_csi_name() {
        assert!(is_csi_name("proxmox-csi-plugin-controller"));
        assert!(is_csi_name("CSI-Proxmox-node"));
        assert!(!is_csi_name("proxmox-cloud-controller"));
        assert!(!is_csi_name("csi-snapshotter"));
    }

    #[test]
    fn test_test_class() {
        let driver = "csi.proxmox.sinextra.dev";
        let classes = vec![
            class("local-path", "rancher.io/local-path"),
            class("proxmox-data", driver),
            class("proxmox-csi", driver),
        ];
        assert_eq!(
            test_class(&classes, driver, "proxmox-csi"),
            Some("proxmox-csi")
        );
        assert_eq!(
            test_class(&classes, driver, "missing"),
            Some("proxmox-data")
        );
        assert_eq!(test_class(&classes[..1], driver, "proxmox-csi"), None);
    }

    #[test]
    fn test_pvc_manifest() {
        let manifest = pvc_manifest(
            "claim",
            "csi-test",
            "proxmox-csi",
            "2Gi",
            "ReadWriteOnce",
        );
        let pvc: PersistentVolumeClaim =
            serde_json::from_value(manifest).unwrap();
        let spec = pvc.spec.unwrap();
        assert_eq!(spec.storage_class_name.as_deref(), Some("proxmox-csi"));
        assert_eq!(
            spec.access_modes,
            Some(vec![String::from("ReadWriteOnce")])
        );
        let requests = spec.resources.unwrap().requests.unwrap();
        assert_eq!(requests["storage"].0, "2Gi");
        assert_eq!(pvc.metadata.namespace.as_deref(), Some("csi-test"));
    }
}
