// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Minimal client for the Proxmox VE JSON API
//!
//! Only the handful of endpoints the rollout steps look at are modeled.  Every
//! response is wrapped in a `{"data": ...}` envelope, which the accessors here
//! strip off.

use crate::config::ProxmoxConfig;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ProxmoxError {
    #[error("request to {path} failed")]
    Transport {
        path: String,
        #[source]
        err: reqwest::Error,
    },
    #[error("{path}: permission denied (HTTP 403)")]
    Forbidden { path: String },
    #[error("{path}: unexpected status {status}: {body}")]
    Status { path: String, status: StatusCode, body: String },
    #[error("login response did not include a ticket and CSRF token")]
    MissingTicket,
    #[error("session credential is not a valid header value")]
    BadCredential(#[from] reqwest::header::InvalidHeaderValue),
    #[error("decoding response from {path}")]
    Decode {
        path: String,
        #[source]
        err: serde_json::Error,
    },
}

impl ProxmoxError {
    /// Returns true if the server rejected the request with 401 or 403
    pub fn is_auth_failure(&self) -> bool {
        match self {
            ProxmoxError::Forbidden { .. } | ProxmoxError::MissingTicket => {
                true
            }
            ProxmoxError::Status { status, .. } => {
                *status == StatusCode::UNAUTHORIZED
            }
            _ => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct TicketData {
    ticket: Option<String>,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub release: String,
    #[serde(default)]
    pub repoid: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NodeSummary {
    pub node: String,
    pub status: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub maxcpu: Option<u64>,
    #[serde(default)]
    pub maxmem: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ClusterStatusItem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub online: Option<u8>,
    #[serde(default)]
    pub quorate: Option<u8>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NetworkInterface {
    pub iface: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub active: Option<u8>,
    #[serde(default)]
    pub bridge_ports: Option<String>,
}

impl NetworkInterface {
    pub fn is_bridge(&self) -> bool {
        self.kind == "bridge"
    }
}

/// A storage pool as configured cluster-wide (`/storage`)
#[derive(Clone, Debug, Deserialize)]
pub struct StoragePool {
    pub storage: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub path: Option<String>,
    /// comma-separated content types, e.g. "images,rootdir"
    #[serde(default)]
    pub content: String,
}

impl StoragePool {
    pub fn content_types(&self) -> impl Iterator<Item = &str> {
        self.content.split(',').map(str::trim).filter(|c| !c.is_empty())
    }

    pub fn supports(&self, content_type: &str) -> bool {
        self.content_types().any(|c| c == content_type)
    }
}

/// A storage pool as seen by one node (`/nodes/{node}/storage`)
#[derive(Clone, Debug, Deserialize)]
pub struct NodeStorage {
    pub storage: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub active: u8,
    #[serde(default)]
    pub enabled: Option<u8>,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub used: u64,
    #[serde(default)]
    pub avail: u64,
}

impl NodeStorage {
    pub fn is_active(&self) -> bool {
        self.active == 1
    }

    /// Percentage of the pool in use, or `None` if it reports no capacity
    pub fn usage_percent(&self) -> Option<f64> {
        (self.total > 0).then(|| self.used as f64 / self.total as f64 * 100.0)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SdnZone {
    pub zone: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SdnVnet {
    pub vnet: String,
    #[serde(default)]
    pub zone: Option<String>,
}

/// An authenticated session against one Proxmox VE endpoint
#[derive(Clone, Debug)]
pub struct ProxmoxClient {
    base_url: String,
    client: reqwest::Client,
}

fn builder(config: &ProxmoxConfig) -> reqwest::ClientBuilder {
    reqwest::ClientBuilder::new()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .danger_accept_invalid_certs(!config.verify_ssl)
}

impl ProxmoxClient {
    /// Acquire a ticket with the configured credentials and return a client
    /// that presents it on every request
    pub async fn login(
        config: &ProxmoxConfig,
    ) -> Result<ProxmoxClient, ProxmoxError> {
        let base_url = config.base_url();
        let path = "/access/ticket";
        let login_client = builder(config).build().map_err(|err| {
            ProxmoxError::Transport { path: path.to_string(), err }
        })?;

        let response = login_client
            .post(format!("{base_url}{path}"))
            .form(&[
                ("username", config.username.as_str()),
                ("password", config.password.as_str()),
            ])
            .send()
            .await
            .map_err(|err| ProxmoxError::Transport {
                path: path.to_string(),
                err,
            })?;
        let body = read_body(path, response).await?;
        let (ticket, csrf_token) = parse_ticket(&body)?;

        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::COOKIE,
            HeaderValue::from_str(&format!("PVEAuthCookie={ticket}"))?,
        );
        headers.insert(
            "CSRFPreventionToken",
            HeaderValue::from_str(&csrf_token)?,
        );

        let client =
            builder(config).default_headers(headers).build().map_err(
                |err| ProxmoxError::Transport { path: path.to_string(), err },
            )?;
        Ok(ProxmoxClient { base_url, client })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, ProxmoxError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .map_err(|err| ProxmoxError::Transport {
                path: path.to_string(),
                err,
            })?;
        let body = read_body(path, response).await?;
        decode_data(path, &body)
    }

    pub async fn version(&self) -> Result<VersionInfo, ProxmoxError> {
        self.get("/version").await
    }

    pub async fn nodes(&self) -> Result<Vec<NodeSummary>, ProxmoxError> {
        self.get("/nodes").await
    }

    pub async fn cluster_status(
        &self,
    ) -> Result<Vec<ClusterStatusItem>, ProxmoxError> {
        self.get("/cluster/status").await
    }

    pub async fn node_network(
        &self,
        node: &str,
    ) -> Result<Vec<NetworkInterface>, ProxmoxError> {
        self.get(&format!("/nodes/{node}/network")).await
    }

    pub async fn storage(&self) -> Result<Vec<StoragePool>, ProxmoxError> {
        self.get("/storage").await
    }

    pub async fn node_storage(
        &self,
        node: &str,
    ) -> Result<Vec<NodeStorage>, ProxmoxError> {
        self.get(&format!("/nodes/{node}/storage")).await
    }

    pub async fn sdn_zones(&self) -> Result<Vec<SdnZone>, ProxmoxError> {
        self.get("/cluster/sdn/zones").await
    }

    pub async fn sdn_vnets(&self) -> Result<Vec<SdnVnet>, ProxmoxError> {
        self.get("/cluster/sdn/vnets").await
    }

    /// Stage a new, portless bridge on `node`
    ///
    /// Proxmox only writes the pending network configuration; nothing is
    /// applied to the host until someone reloads networking.
    pub async fn create_bridge(
        &self,
        node: &str,
        iface: &str,
    ) -> Result<(), ProxmoxError> {
        let path = format!("/nodes/{node}/network");
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .form(&[
                ("iface", iface),
                ("type", "bridge"),
                ("autostart", "1"),
                ("bridge_ports", ""),
                ("bridge_stp", "0"),
                ("bridge_fd", "0"),
            ])
            .send()
            .await
            .map_err(|err| ProxmoxError::Transport {
                path: path.clone(),
                err,
            })?;
        read_body(&path, response).await.map(|_| ())
    }

    pub async fn delete_bridge(
        &self,
        node: &str,
        iface: &str,
    ) -> Result<(), ProxmoxError> {
        let path = format!("/nodes/{node}/network/{iface}");
        let response = self
            .client
            .delete(format!("{}{}", self.base_url, path))
            .send()
            .await
            .map_err(|err| ProxmoxError::Transport {
                path: path.clone(),
                err,
            })?;
        read_body(&path, response).await.map(|_| ())
    }
}

async fn read_body(
    path: &str,
    response: reqwest::Response,
) -> Result<String, ProxmoxError> {
    let status = response.status();
    let body = response.text().await.map_err(|err| {
        ProxmoxError::Transport { path: path.to_string(), err }
    })?;
    check_status(path, status, body)
}

fn check_status(
    path: &str,
    status: StatusCode,
    body: String,
) -> Result<String, ProxmoxError> {
    if status == StatusCode::FORBIDDEN {
        return Err(ProxmoxError::Forbidden { path: path.to_string() });
    }
    if !status.is_success() {
        return Err(ProxmoxError::Status {
            path: path.to_string(),
            status,
            body,
        });
    }
    Ok(body)
}

fn decode_data<T: DeserializeOwned>(
    path: &str,
    body: &str,
) -> Result<T, ProxmoxError> {
    serde_json::from_str::<ApiResponse<T>>(body)
        .map(|envelope| envelope.data)
        .map_err(|err| ProxmoxError::Decode { path: path.to_string(), err })
}

fn parse_ticket(body: &str) -> Result<(String, String), ProxmoxError> {
    // A failed login can come back as `{"data": null}` with a 200.
    let data: Option<TicketData> = decode_data("/access/ticket", body)?;
    match data {
        Some(TicketData { ticket: Some(ticket), csrf_token: Some(csrf) }) => {
            Ok((ticket, csrf))
        }
        _ => Err(ProxmoxError::MissingTicket),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_ticket() {
        let body = r#"{"data":{"username":"root@pam",
            "ticket":"PVE:root@pam:65A1B2C3::sig",
            "CSRFPreventionToken":"65A1B2C3:tok","cap":{}}}"#;
        let (ticket, csrf) = parse_ticket(body).unwrap();
        assert_eq!(ticket, "PVE:root@pam:65A1B2C3::sig");
        assert_eq!(csrf, "65A1B2C3:tok");
    }

    #[test]
    fn test_parse_ticket_null_data() {
        assert!(matches!(
            parse_ticket(r#"{"data":null}"#),
            Err(ProxmoxError::MissingTicket)
        ));
        assert!(matches!(
            parse_ticket(r#"{"data":{"ticket":"t"}}"#),
            Err(ProxmoxError::MissingTicket)
        ));
    }

    #[test]
    fn test_status_mapping() {
        let error = check_status("/nodes", StatusCode::FORBIDDEN, String::new())
            .unwrap_err();
        assert!(matches!(error, ProxmoxError::Forbidden { .. }));
        assert!(error.is_auth_failure());

        let error = check_status(
            "/access/ticket",
            StatusCode::UNAUTHORIZED,
            String::from("authentication failure"),
        )
        .unwrap_err();
        assert!(error.is_auth_failure());

        let error = check_status(
            "/version",
            StatusCode::INTERNAL_SERVER_ERROR,
            String::new(),
        )
        .unwrap_err();
        assert!(!error.is_auth_failure());

        assert_eq!(
            check_status("/version", StatusCode::OK, String::from("{}"))
                .unwrap(),
            "{}"
        );
    }

    #[test]
    fn test_decode_nodes() {
        let body = r#"{"data":[
            {"node":"pve1","status":"online","type":"node","maxcpu":16,
             "maxmem":67108864000,"uptime":1234},
            {"node":"pve2","status":"offline"}
        ]}"#;
        let nodes: Vec<NodeSummary> = decode_data("/nodes", body).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].kind.as_deref(), Some("node"));
        assert_eq!(nodes[0].maxcpu, Some(16));
        assert_eq!(nodes[1].status, "offline");
        assert!(nodes[1].kind.is_none());
    }

    #[test]
    fn test_decode_error_names_path() {
        let error = decode_data::<VersionInfo>("/version", r#"{"data":{}}"#)
            .unwrap_err();
        assert!(error.to_string().contains("/version"), "{error}");
    }

    #[test]
    fn test_storage_helpers() {
        let body = r#"{"data":[
            {"storage":"local","type":"dir","path":"/var/lib/vz",
             "content":"iso,vztmpl,backup"},
            {"storage":"local-lvm","type":"lvmthin","content":"rootdir,images"}
        ]}"#;
        let pools: Vec<StoragePool> = decode_data("/storage", body).unwrap();
        assert!(pools[0].supports("backup"));
        assert!(!pools[0].supports("images"));
        assert!(pools[1].supports("images"));
        assert_eq!(pools[1].path, None);

        let body = r#"{"data":[
            {"storage":"local","type":"dir","active":1,"enabled":1,
             "total":1000,"used":950,"avail":50},
            {"storage":"nfs","type":"nfs","active":0,"total":0}
        ]}"#;
        let storage: Vec<NodeStorage> =
            decode_data("/nodes/pve1/storage", body).unwrap();
        assert!(storage[0].is_active());
        assert_eq!(storage[0].usage_percent(), Some(95.0));
        assert!(!storage[1].is_active());
        assert_eq!(storage[1].usage_percent(), None);
    }

    #[test]
    fn test_network_interfaces() {
        let body = r#"{"data":[
            {"iface":"lo","type":"loopback","active":1},
            {"iface":"vmbr0","type":"bridge","active":1,"bridge_ports":"eno1"},
            {"iface":"eno1","type":"eth"}
        ]}"#;
        let ifaces: Vec<NetworkInterface> =
            decode_data("/nodes/pve1/network", body).unwrap();
        let bridges: Vec<_> =
            ifaces.iter().filter(|i| i.is_bridge()).collect();
        assert_eq!(bridges.len(), 1);
        assert_eq!(bridges[0].iface, "vmbr0");
    }
}
