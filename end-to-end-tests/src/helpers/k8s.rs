// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kubernetes plumbing shared by the steps
//!
//! Objects the steps create are treated as opaque JSON documents and applied
//! with server-side apply, so rerunning a step converges rather than failing
//! on "already exists".

use anyhow::{anyhow, Context as _, Result};
use futures::try_join;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{
    Api, AttachParams, DeleteParams, DynamicObject, ListParams, Patch,
    PatchParams, PostParams,
};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// Field manager recorded on everything we apply
pub const FIELD_MANAGER: &str = "rollout-gate";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Build a client from the in-cluster environment or the local kubeconfig
pub async fn build_kube_client() -> Result<Client> {
    let mut config =
        Config::infer().await.context("inferring Kubernetes client config")?;
    config.connect_timeout = Some(CONNECT_TIMEOUT);
    config.read_timeout = Some(READ_TIMEOUT);
    Client::try_from(config).context("creating Kubernetes client")
}

/// Returns true if `error` is an API error with the given HTTP status
pub fn is_status(error: &kube::Error, code: u16) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == code)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NamespaceState {
    Created,
    AlreadyExists,
}

pub async fn ensure_namespace(
    client: &Client,
    name: &str,
    labels: &BTreeMap<String, String>,
) -> Result<NamespaceState> {
    let api: Api<Namespace> = Api::all(client.clone());
    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: (!labels.is_empty()).then(|| labels.clone()),
            ..Default::default()
        },
        ..Default::default()
    };
    match api.create(&PostParams::default(), &namespace).await {
        Ok(_) => Ok(NamespaceState::Created),
        Err(error) if is_status(&error, 409) => {
            Ok(NamespaceState::AlreadyExists)
        }
        Err(error) => Err(anyhow::Error::new(error)
            .context(format!("creating namespace {name:?}"))),
    }
}

/// Delete a namespace, treating "not found" as success
pub async fn delete_namespace(client: &Client, name: &str) -> Result<()> {
    let api: Api<Namespace> = Api::all(client.clone());
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => Ok(()),
        Err(error) if is_status(&error, 404) => Ok(()),
        Err(error) => Err(anyhow::Error::new(error)
            .context(format!("deleting namespace {name:?}"))),
    }
}

/// Split an apiVersion into its (group, version) parts; core types have an
/// empty group
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Lowercase plural resource name for `kind`
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh")
    {
        format!("{lower}es")
    } else if lower.ends_with('y')
        && !lower.ends_with("ay")
        && !lower.ends_with("ey")
    {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{lower}s")
    }
}

pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Identifies one kind of (possibly custom) resource, optionally scoped to a
/// namespace
#[derive(Clone, Copy, Debug)]
pub struct TypeRef<'a> {
    pub api_version: &'a str,
    pub kind: &'a str,
    pub namespace: Option<&'a str>,
}

impl<'a> TypeRef<'a> {
    pub fn namespaced(
        api_version: &'a str,
        kind: &'a str,
        namespace: &'a str,
    ) -> Self {
        TypeRef { api_version, kind, namespace: Some(namespace) }
    }

    fn api(&self, client: &Client) -> Api<DynamicObject> {
        let resource = build_api_resource(self.api_version, self.kind);
        match self.namespace {
            Some(ns) => Api::namespaced_with(client.clone(), ns, &resource),
            None => Api::all_with(client.clone(), &resource),
        }
    }
}

fn str_field<'a>(
    object: &'a serde_json::Value,
    pointer: &str,
) -> Option<&'a str> {
    object.pointer(pointer).and_then(serde_json::Value::as_str)
}

/// Server-side apply an object described by a JSON manifest
///
/// The manifest must carry `apiVersion`, `kind`, and `metadata.name`.  A
/// `metadata.namespace` scopes the request; otherwise the object is treated
/// as cluster-scoped.
pub async fn apply_object(
    client: &Client,
    manifest: &serde_json::Value,
) -> Result<DynamicObject> {
    let api_version = str_field(manifest, "/apiVersion")
        .ok_or_else(|| anyhow!("manifest has no apiVersion"))?;
    let kind = str_field(manifest, "/kind")
        .ok_or_else(|| anyhow!("manifest has no kind"))?;
    let name = str_field(manifest, "/metadata/name")
        .ok_or_else(|| anyhow!("{kind} manifest has no metadata.name"))?;
    let namespace = str_field(manifest, "/metadata/namespace");

    let type_ref = TypeRef { api_version, kind, namespace };
    type_ref
        .api(client)
        .patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(manifest),
        )
        .await
        .with_context(|| format!("applying {kind} {name:?}"))
}

/// Fetch one object, mapping "not found" to `None`
pub async fn get_object(
    client: &Client,
    type_ref: TypeRef<'_>,
    name: &str,
) -> Result<Option<DynamicObject>> {
    type_ref
        .api(client)
        .get_opt(name)
        .await
        .with_context(|| format!("fetching {} {name:?}", type_ref.kind))
}

pub async fn list_objects(
    client: &Client,
    type_ref: TypeRef<'_>,
) -> Result<Vec<DynamicObject>> {
    let list = type_ref
        .api(client)
        .list(&ListParams::default())
        .await
        .with_context(|| format!("listing {}", pluralize_kind(type_ref.kind)))?;
    Ok(list.items)
}

/// Delete one object, treating "not found" as success
pub async fn delete_object(
    client: &Client,
    type_ref: TypeRef<'_>,
    name: &str,
) -> Result<()> {
    match type_ref.api(client).delete(name, &DeleteParams::background()).await
    {
        Ok(_) => Ok(()),
        Err(error) if is_status(&error, 404) => Ok(()),
        Err(error) => Err(anyhow::Error::new(error)
            .context(format!("deleting {} {name:?}", type_ref.kind))),
    }
}

/// What a command run with [`exec_in_pod()`] produced
#[derive(Debug)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// whether the API server reported the command as exiting successfully
    pub success: bool,
}

/// Run `command` in the first container of `pod` and collect its output
pub async fn exec_in_pod(
    client: &Client,
    namespace: &str,
    pod: &str,
    command: &[&str],
) -> Result<ExecOutput> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let params = AttachParams::default().stdin(false).stdout(true).stderr(true);
    let mut attached = pods
        .exec(pod, command.iter().copied(), &params)
        .await
        .with_context(|| format!("exec in pod {namespace}/{pod}"))?;

    let stdout_reader = attached.stdout();
    let stderr_reader = attached.stderr();
    let status = attached.take_status();

    let (stdout, stderr) = try_join!(
        async {
            let mut out = String::new();
            if let Some(mut reader) = stdout_reader {
                reader.read_to_string(&mut out).await?;
            }
            Ok::<_, std::io::Error>(out)
        },
        async {
            let mut out = String::new();
            if let Some(mut reader) = stderr_reader {
                reader.read_to_string(&mut out).await?;
            }
            Ok::<_, std::io::Error>(out)
        },
    )
    .context("reading exec output")?;

    let status = match status {
        Some(status) => status.await,
        None => None,
    };
    attached.join().await.context("waiting for exec to finish")?;

    let success = status
        .and_then(|s| s.status)
        .is_some_and(|s| s == "Success");
    Ok(ExecOutput { stdout, stderr, success })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_api_version() {
        assert_eq!(
            parse_api_version("cluster.x-k8s.io/v1beta1"),
            (String::from("cluster.x-k8s.io"), String::from("v1beta1"))
        );
        assert_eq!(
            parse_api_version("v1"),
            (String::new(), String::from("v1"))
        );
    }

    #[test]
    fn test_pluralize_kind() {
        assert_eq!(pluralize_kind("ProxmoxCluster"), "proxmoxclusters");
        assert_eq!(
            pluralize_kind("ProxmoxMachineTemplate"),
            "proxmoxmachinetemplates"
        );
        assert_eq!(pluralize_kind("NetworkPolicy"), "networkpolicies");
        assert_eq!(pluralize_kind("StorageClass"), "storageclasses");
        assert_eq!(pluralize_kind("Gateway"), "gateways");
    }

    #[test]
    fn test_build_api_resource() {
        let resource = build_api_resource(
            "infrastructure.cluster.x-k8s.io/v1alpha1",
            "ProxmoxMachine",
        );
        assert_eq!(resource.group, "infrastructure.cluster.x-k8s.io");
        assert_eq!(resource.version, "v1alpha1");
        assert_eq!(resource.plural, "proxmoxmachines");
        assert_eq!(
            resource.api_version,
            "infrastructure.cluster.x-k8s.io/v1alpha1"
        );
    }
}
