use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use egressgateway_core::Mark;

/// Agent configuration mounted from the configmap.
///
/// Every field has a default so a missing or partial file yields a working
/// single-stack agent.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileConfig {
    #[serde(rename = "enableIPv4")]
    pub enable_ipv4: bool,
    #[serde(rename = "enableIPv6")]
    pub enable_ipv6: bool,

    /// Base fwmark, hex. The high byte identifies this agent's marks.
    pub mark: String,

    pub iptables: IptablesConfig,

    #[serde(rename = "egressIgnoreCIDR")]
    pub egress_ignore_cidr: IgnoreCidrConfig,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            enable_ipv4: true,
            enable_ipv6: false,
            mark: "0x26000000".to_string(),
            iptables: IptablesConfig::default(),
            egress_ignore_cidr: IgnoreCidrConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IptablesConfig {
    pub backend_mode: String,
    pub refresh_interval_second: u64,
    pub lock_timeout_second: u64,
    pub lock_probe_interval_millis: u64,
    pub initial_post_write_interval_second: u64,
    pub restore_supports_lock: bool,
    pub lock_file_path: PathBuf,
}

impl Default for IptablesConfig {
    fn default() -> Self {
        Self {
            backend_mode: "auto".to_string(),
            refresh_interval_second: 90,
            lock_timeout_second: 0,
            lock_probe_interval_millis: 50,
            initial_post_write_interval_second: 1,
            restore_supports_lock: false,
            lock_file_path: PathBuf::from("/run/xtables.lock"),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IgnoreCidrConfig {
    pub auto_detect: AutoDetect,
    pub custom: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AutoDetect {
    #[serde(rename = "podCIDR")]
    pub pod_cidr: bool,
    #[serde(rename = "clusterIP")]
    pub cluster_ip: bool,
    #[serde(rename = "nodeIP")]
    pub node_ip: bool,
}

impl Default for AutoDetect {
    fn default() -> Self {
        Self {
            pod_cidr: true,
            cluster_ip: true,
            node_ip: true,
        }
    }
}

impl FileConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn base_mark(&self) -> Result<Mark> {
        self.mark
            .parse()
            .with_context(|| format!("invalid mark {:?} in config", self.mark))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.iptables.refresh_interval_second)
    }
}
