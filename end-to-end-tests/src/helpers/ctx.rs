// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::config::HarnessConfig;
use crate::helpers::k8s::build_kube_client;
use crate::helpers::proxmox::ProxmoxClient;
use anyhow::{Context as _, Result};
use slog::{info, Logger};
use tokio::sync::OnceCell;

/// State shared by every step of one gate run
///
/// The API sessions are established on first use, so that steps that only
/// need Proxmox can run on a machine without a kubeconfig (and vice versa).
pub struct Context {
    pub config: HarnessConfig,
    pub log: Logger,
    kube: OnceCell<kube::Client>,
    proxmox: OnceCell<ProxmoxClient>,
}

impl Context {
    pub fn new(config: HarnessConfig, log: Logger) -> Context {
        Context {
            config,
            log,
            kube: OnceCell::new(),
            proxmox: OnceCell::new(),
        }
    }

    pub async fn kube(&self) -> Result<&kube::Client> {
        self.kube
            .get_or_try_init(|| async {
                let client = build_kube_client().await?;
                info!(self.log, "connected to Kubernetes";
                    "default_namespace" => client.default_namespace());
                Ok(client)
            })
            .await
    }

    /// An authenticated Proxmox session using the configured credentials
    pub async fn proxmox(&self) -> Result<&ProxmoxClient> {
        let config = &self.config.proxmox;
        self.proxmox
            .get_or_try_init(|| async {
                let client = ProxmoxClient::login(config)
                    .await
                    .with_context(|| {
                        format!(
                            "logging in to {} as {}",
                            config.base_url(),
                            config.username
                        )
                    })?;
                info!(self.log, "logged in to Proxmox";
                    "url" => config.base_url(), "user" => &config.username);
                Ok(client)
            })
            .await
    }
}
