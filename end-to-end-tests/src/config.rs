// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Harness configuration
//!
//! Values come from three layers, each overriding the one before: built-in
//! defaults, an optional TOML file, and environment variables.  The variable
//! names match the ones operators already export for the rollout pipeline
//! (`PROXMOX_HOST`, `CSI_STORAGE_CLASS`, ...).

use camino::Utf8Path;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming a TOML config file
pub const CONFIG_PATH_ENV: &str = "ROLLOUT_CONFIG";

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    pub proxmox: ProxmoxConfig,
    pub capi: CapiConfig,
    pub worker: WorkerConfig,
    pub csi: CsiConfig,
    pub network: NetworkConfig,
    pub monitoring: MonitoringConfig,
    pub e2e: E2eConfig,
}

/// How to reach and authenticate against the Proxmox VE API, and which of
/// its resources the cluster is expected to use
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxmoxConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub verify_ssl: bool,
    pub node: String,
    pub storage: String,
    pub bridge: String,
    pub template_id: u32,
}

impl Default for ProxmoxConfig {
    fn default() -> Self {
        ProxmoxConfig {
            host: String::from("proxmox.example.com"),
            port: 8006,
            username: String::from("root@pam"),
            password: String::new(),
            verify_ssl: false,
            node: String::from("proxmox-node1"),
            storage: String::from("local"),
            bridge: String::from("vmbr0"),
            template_id: 1000,
        }
    }
}

impl ProxmoxConfig {
    pub fn base_url(&self) -> String {
        format!("https://{}:{}/api2/json", self.host, self.port)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CapiConfig {
    pub namespace: String,
}

impl Default for CapiConfig {
    fn default() -> Self {
        CapiConfig { namespace: String::from("capi-test") }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub namespace: String,
    /// Substring of the Kubernetes node name the Proxmox worker registers as
    pub expected_node_name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            namespace: String::from("proxmox-worker"),
            expected_node_name: String::from("proxmox-worker"),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CsiConfig {
    pub namespace: String,
    pub storage_class: String,
    /// Provisioner expected on storage classes and as the driver on PVs
    pub provisioner: String,
    pub test_volume_size: String,
}

impl Default for CsiConfig {
    fn default() -> Self {
        CsiConfig {
            namespace: String::from("csi-test"),
            storage_class: String::from("proxmox-csi"),
            provisioner: String::from("csi.proxmox.sinextra.dev"),
            test_volume_size: String::from("1Gi"),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    pub namespace: String,
    /// Expected CNI, or "auto" to accept whatever is running
    pub cni_provider: String,
    pub policy_enabled: bool,
    pub test_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            namespace: String::from("network-test"),
            cni_provider: String::from("cilium"),
            policy_enabled: true,
            test_timeout_secs: 60,
        }
    }
}

impl NetworkConfig {
    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitoringConfig {
    pub namespace: String,
    pub prometheus_endpoint: Option<String>,
    pub grafana_endpoint: Option<String>,
    pub test_timeout_secs: u64,
    pub enable_external_tests: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            namespace: String::from("monitoring"),
            prometheus_endpoint: None,
            grafana_endpoint: None,
            test_timeout_secs: 60,
            enable_external_tests: false,
        }
    }
}

impl MonitoringConfig {
    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct E2eConfig {
    pub namespace: String,
    pub test_timeout_secs: u64,
    pub enable_storage: bool,
    pub enable_network: bool,
    pub enable_monitoring: bool,
    /// Delete workload resources even when the lifecycle check fails
    pub cleanup_on_failure: bool,
}

impl Default for E2eConfig {
    fn default() -> Self {
        E2eConfig {
            namespace: String::from("e2e-test"),
            test_timeout_secs: 600,
            enable_storage: true,
            enable_network: true,
            enable_monitoring: true,
            cleanup_on_failure: true,
        }
    }
}

impl E2eConfig {
    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("error reading \"{path}\": {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing \"{path}\": {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("environment variable {var}={value:?} is not a valid {expected}")]
    BadEnv { var: &'static str, value: String, expected: &'static str },
}

impl HarnessConfig {
    /// Load a `HarnessConfig` from the given TOML file
    ///
    /// Sections and keys missing from the file take their defaults.
    pub fn from_file(path: &Utf8Path) -> Result<HarnessConfig, LoadError> {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.into(), err })?;
        let config_parsed: HarnessConfig = toml::from_str(&file_contents)
            .map_err(|err| LoadError::Parse { path: path.into(), err })?;
        Ok(config_parsed)
    }

    /// Load the configuration the way the gate does: `path` (or
    /// `$ROLLOUT_CONFIG`) if given, then environment overrides
    pub fn load(path: Option<&Utf8Path>) -> Result<HarnessConfig, LoadError> {
        let env_path =
            std::env::var(CONFIG_PATH_ENV).ok().map(Utf8PathBuf::from);
        let mut config = match path.or(env_path.as_deref()) {
            Some(path) => HarnessConfig::from_file(path)?,
            None => HarnessConfig::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Override values with whatever `lookup` returns for the well-known
    /// environment variables
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), LoadError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let p = &mut self.proxmox;
        env.string("PROXMOX_HOST", &mut p.host);
        env.parse("PROXMOX_PORT", "port number", &mut p.port)?;
        env.string("PROXMOX_USERNAME", &mut p.username);
        env.string("PROXMOX_PASSWORD", &mut p.password);
        env.flag("PROXMOX_VERIFY_SSL", &mut p.verify_ssl);
        env.string("PROXMOX_NODE", &mut p.node);
        env.string("PROXMOX_STORAGE", &mut p.storage);
        env.string("PROXMOX_BRIDGE", &mut p.bridge);
        env.parse("PROXMOX_TEMPLATE_ID", "VM id", &mut p.template_id)?;

        env.string("TEST_NAMESPACE", &mut self.capi.namespace);

        let w = &mut self.worker;
        env.string("WORKER_TEST_NAMESPACE", &mut w.namespace);
        env.string("EXPECTED_NODE_NAME", &mut w.expected_node_name);

        let c = &mut self.csi;
        env.string("CSI_TEST_NAMESPACE", &mut c.namespace);
        env.string("CSI_STORAGE_CLASS", &mut c.storage_class);
        env.string("CSI_PROVISIONER", &mut c.provisioner);
        env.string("CSI_TEST_SIZE", &mut c.test_volume_size);

        let n = &mut self.network;
        env.string("NETWORK_TEST_NAMESPACE", &mut n.namespace);
        env.string("CNI_PROVIDER", &mut n.cni_provider);
        env.flag("NETWORK_POLICY_ENABLED", &mut n.policy_enabled);
        env.parse(
            "NETWORK_TEST_TIMEOUT",
            "number of seconds",
            &mut n.test_timeout_secs,
        )?;

        let m = &mut self.monitoring;
        env.string("MONITORING_NAMESPACE", &mut m.namespace);
        env.optional("PROMETHEUS_ENDPOINT", &mut m.prometheus_endpoint);
        env.optional("GRAFANA_ENDPOINT", &mut m.grafana_endpoint);
        env.parse(
            "MONITORING_TEST_TIMEOUT",
            "number of seconds",
            &mut m.test_timeout_secs,
        )?;
        env.flag(
            "ENABLE_EXTERNAL_MONITORING_TESTS",
            &mut m.enable_external_tests,
        );

        let e = &mut self.e2e;
        env.string("E2E_TEST_NAMESPACE", &mut e.namespace);
        env.parse(
            "E2E_TEST_TIMEOUT",
            "number of seconds",
            &mut e.test_timeout_secs,
        )?;
        env.flag("E2E_ENABLE_STORAGE", &mut e.enable_storage);
        env.flag("E2E_ENABLE_NETWORK", &mut e.enable_network);
        env.flag("E2E_ENABLE_MONITORING", &mut e.enable_monitoring);
        env.flag("E2E_CLEANUP_ON_FAILURE", &mut e.cleanup_on_failure);

        Ok(())
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, var: &str, slot: &mut String) {
        if let Some(value) = (self.lookup)(var) {
            *slot = value;
        }
    }

    /// An empty value clears the setting.
    fn optional(&self, var: &str, slot: &mut Option<String>) {
        if let Some(value) = (self.lookup)(var) {
            *slot = if value.is_empty() { None } else { Some(value) };
        }
    }

    /// Only "true" (in any case) turns a flag on; any other value turns it
    /// off.
    fn flag(&self, var: &str, slot: &mut bool) {
        if let Some(value) = (self.lookup)(var) {
            *slot = value.eq_ignore_ascii_case("true");
        }
    }

    fn parse<T: std::str::FromStr>(
        &self,
        var: &'static str,
        expected: &'static str,
        slot: &mut T,
    ) -> Result<(), LoadError> {
        if let Some(value) = (self.lookup)(var) {
            *slot = value
                .trim()
                .parse()
                .map_err(|_| LoadError::BadEnv { var, value, expected })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use camino_tempfile::NamedUtf8TempFile;
    use std::collections::BTreeMap;
    use std::io::Write;

    fn env_from(
        pairs: &[(&str, &str)],
    ) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.proxmox.port, 8006);
        assert_eq!(
            config.proxmox.base_url(),
            "https://proxmox.example.com:8006/api2/json"
        );
        assert_eq!(config.csi.provisioner, "csi.proxmox.sinextra.dev");
        assert_eq!(config.e2e.test_timeout(), Duration::from_secs(600));
        assert!(config.monitoring.prometheus_endpoint.is_none());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedUtf8TempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [proxmox]
            host = "pve01.lab"
            verify_ssl = true

            [network]
            cni_provider = "auto"
            "#
        )
        .unwrap();

        let config = HarnessConfig::from_file(file.path()).unwrap();
        assert_eq!(config.proxmox.host, "pve01.lab");
        assert!(config.proxmox.verify_ssl);
        assert_eq!(config.proxmox.port, 8006);
        assert_eq!(config.network.cni_provider, "auto");
        assert_eq!(config.csi, CsiConfig::default());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut file = NamedUtf8TempFile::new().unwrap();
        writeln!(file, "[proxmox]\nhostname = \"typo\"").unwrap();
        let error = HarnessConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(error, LoadError::Parse { .. }), "{error}");
    }

    #[test]
    fn test_missing_file() {
        let error =
            HarnessConfig::from_file(Utf8Path::new("/nonexistent/rollout.toml"))
                .unwrap_err();
        assert!(matches!(error, LoadError::Io { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = HarnessConfig::default();
        config
            .apply_env(env_from(&[
                ("PROXMOX_HOST", "10.0.0.5"),
                ("PROXMOX_PORT", "8443"),
                ("PROXMOX_VERIFY_SSL", "TRUE"),
                ("NETWORK_POLICY_ENABLED", "no"),
                ("PROMETHEUS_ENDPOINT", "http://prom:9090"),
                ("E2E_TEST_TIMEOUT", "120"),
            ]))
            .unwrap();
        assert_eq!(config.proxmox.host, "10.0.0.5");
        assert_eq!(config.proxmox.port, 8443);
        assert!(config.proxmox.verify_ssl);
        assert!(!config.network.policy_enabled);
        assert_eq!(
            config.monitoring.prometheus_endpoint.as_deref(),
            Some("http://prom:9090")
        );
        assert_eq!(config.e2e.test_timeout(), Duration::from_secs(120));
        // untouched
        assert_eq!(config.proxmox.username, "root@pam");
    }

    #[test]
    fn test_empty_endpoint_clears() {
        let mut config = HarnessConfig::default();
        config.monitoring.grafana_endpoint = Some(String::from("http://g"));
        config.apply_env(env_from(&[("GRAFANA_ENDPOINT", "")])).unwrap();
        assert!(config.monitoring.grafana_endpoint.is_none());
    }

    #[test]
    fn test_bad_numeric_env() {
        let mut config = HarnessConfig::default();
        let error = config
            .apply_env(env_from(&[("PROXMOX_PORT", "eighty")]))
            .unwrap_err();
        match error {
            LoadError::BadEnv { var, value, .. } => {
                assert_eq!(var, "PROXMOX_PORT");
                assert_eq!(value, "eighty");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
