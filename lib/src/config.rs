//! # Agent configuration
//!
//! This module handles the JSON configuration file for the agent
//! (default `/etc/conveyd/conveyd.conf`).

use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

/// One resolved server in the failover ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    /// Base URL without a trailing slash
    pub url: String,
    /// Tenant token presented to this server
    pub tenant_token: Option<String>,
}

/// The default configuration file path.
pub const DEFAULT_CONF_PATH: &str = "/etc/conveyd/conveyd.conf";
/// The default persistent store directory.
pub const DEFAULT_DATA_DIR: &str = "/data/mender";
/// The default device private key location.
const DEFAULT_KEY_PATH: &str = "/var/lib/conveyd/device.pem";
/// The default device type file location.
const DEFAULT_DEVICE_TYPE_FILE: &str = "/var/lib/conveyd/device_type";

const DEFAULT_UPDATE_POLL_INTERVAL: u64 = 1800;
const DEFAULT_INVENTORY_POLL_INTERVAL: u64 = 28800;
const DEFAULT_RETRY_POLL_INTERVAL: u64 = 300;

fn default_update_poll() -> u64 {
    DEFAULT_UPDATE_POLL_INTERVAL
}

fn default_inventory_poll() -> u64 {
    DEFAULT_INVENTORY_POLL_INTERVAL
}

fn default_retry_poll() -> u64 {
    DEFAULT_RETRY_POLL_INTERVAL
}

/// Client-side TLS material for mutual TLS; both halves are required
/// if either is set.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct HttpsClientConfig {
    /// Path to the client certificate (PEM)
    pub certificate: Option<Utf8PathBuf>,
    /// Path to the client private key (PEM)
    pub key: Option<Utf8PathBuf>,
}

/// One deployment server entry in the failover ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerConfig {
    /// Base URL, e.g. `https://updates.example.com`
    #[serde(rename = "ServerURL")]
    pub server_url: String,
    /// Per-server tenant token override
    pub tenant_token: Option<String>,
}

/// The serialized agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct AgentConfig {
    /// Convenience single-server form; prepended to `Servers` if set
    #[serde(rename = "ServerURL", skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    /// The ordered failover ring
    #[serde(skip_serializing_if = "Option::is_none")]
    pub servers: Option<Vec<ServerConfig>>,
    /// Default tenant token for servers without an override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_token: Option<String>,

    /// Seconds between update checks
    #[serde(default = "default_update_poll")]
    pub update_poll_interval_seconds: u64,
    /// Seconds between inventory submissions
    #[serde(default = "default_inventory_poll")]
    pub inventory_poll_interval_seconds: u64,
    /// Cap on the exponential retry interval, in seconds
    #[serde(default = "default_retry_poll")]
    pub retry_poll_interval_seconds: u64,

    /// The "A" root filesystem partition device
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rootfs_part_a: Option<Utf8PathBuf>,
    /// The "B" root filesystem partition device
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rootfs_part_b: Option<Utf8PathBuf>,

    /// Override for the bootloader environment read tool
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fw_printenv_path: Option<Utf8PathBuf>,
    /// Override for the bootloader environment write tool
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fw_setenv_path: Option<Utf8PathBuf>,

    /// File holding `device_type=<name>`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_type_file: Option<Utf8PathBuf>,
    /// Device private key (PEM); generated here when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_key: Option<Utf8PathBuf>,
    /// JSON file of identity attributes; falls back to the machine id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<Utf8PathBuf>,

    /// Pinned server certificate (PEM), added to the system trust store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_certificate: Option<Utf8PathBuf>,
    /// Client TLS material for mutual TLS
    #[serde(skip_serializing_if = "Option::is_none")]
    pub https_client: Option<HttpsClientConfig>,
    /// Public key (PEM) artifact manifests must be signed with
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_verify_key: Option<Utf8PathBuf>,

    /// Persistent store directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_store: Option<Utf8PathBuf>,

    /// Proxy for plain HTTP origins
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<String>,
    /// Proxy (via CONNECT) for HTTPS origins
    #[serde(skip_serializing_if = "Option::is_none")]
    pub https_proxy: Option<String>,
    /// Comma-separated origins to never proxy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_proxy: Option<String>,
}

impl AgentConfig {
    /// Load and validate a configuration file.
    #[context("Loading configuration")]
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let buf = std::fs::read_to_string(path).with_context(|| format!("Reading {path}"))?;
        let mut unused = std::collections::HashSet::new();
        let de = &mut serde_json::Deserializer::from_str(&buf);
        let config: Self = serde_ignored::deserialize(de, |path| {
            unused.insert(path.to_string());
        })
        .with_context(|| format!("Parsing {path}"))?;
        for key in unused {
            tracing::warn!("{path}: unknown configuration key {key}");
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work before any network traffic.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.servers().is_empty() {
            anyhow::bail!("no deployment server configured (set ServerURL or Servers)");
        }
        if let Some(tls) = self.https_client.as_ref() {
            if tls.certificate.is_some() != tls.key.is_some() {
                anyhow::bail!(
                    "HttpsClient requires both Certificate and Key; only one is configured"
                );
            }
        }
        if self.rootfs_part_a.is_some() != self.rootfs_part_b.is_some() {
            anyhow::bail!("RootfsPartA and RootfsPartB must be configured together");
        }
        Ok(())
    }

    /// The ordered failover ring.
    pub fn servers(&self) -> Vec<ServerEndpoint> {
        let single = self.server_url.iter().map(|url| ServerEndpoint {
            url: url.trim_end_matches('/').to_string(),
            tenant_token: self.tenant_token.clone(),
        });
        let listed = self.servers.iter().flatten().map(|s| ServerEndpoint {
            url: s.server_url.trim_end_matches('/').to_string(),
            tenant_token: s.tenant_token.clone().or_else(|| self.tenant_token.clone()),
        });
        single.chain(listed).collect()
    }

    /// Read the configured device type file (`device_type=<name>`).
    #[context("Reading device type")]
    pub fn device_type(&self) -> Result<String> {
        let path = self.device_type_file();
        let buf =
            std::fs::read_to_string(&path).with_context(|| format!("Reading {path}"))?;
        parse_device_type(&buf)
            .ok_or_else(|| anyhow::anyhow!("no device_type entry found in {path}"))
    }

    pub(crate) fn device_type_file(&self) -> Utf8PathBuf {
        self.device_type_file
            .clone()
            .unwrap_or_else(|| DEFAULT_DEVICE_TYPE_FILE.into())
    }

    pub(crate) fn device_key_path(&self) -> Utf8PathBuf {
        self.device_key
            .clone()
            .unwrap_or_else(|| DEFAULT_KEY_PATH.into())
    }

    pub(crate) fn data_store(&self) -> Utf8PathBuf {
        self.data_store
            .clone()
            .unwrap_or_else(|| DEFAULT_DATA_DIR.into())
    }

    pub(crate) fn update_poll_interval(&self) -> Duration {
        Duration::from_secs(self.update_poll_interval_seconds)
    }

    pub(crate) fn inventory_poll_interval(&self) -> Duration {
        Duration::from_secs(self.inventory_poll_interval_seconds)
    }

    /// The cap applied to every exponential retry schedule.
    pub(crate) fn retry_max_interval(&self) -> Duration {
        Duration::from_secs(self.retry_poll_interval_seconds)
    }
}

fn parse_device_type(buf: &str) -> Option<String> {
    buf.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        (k.trim() == "device_type" && !v.trim().is_empty()).then(|| v.trim().to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> AgentConfig {
        serde_json::from_str(s).unwrap()
    }

    #[test]
    fn test_parse_config() {
        let c = parse(indoc::indoc! {r#"
            {
                "ServerURL": "https://updates.example.com/",
                "TenantToken": "tok",
                "UpdatePollIntervalSeconds": 60,
                "RootfsPartA": "/dev/mmcblk0p2",
                "RootfsPartB": "/dev/mmcblk0p3"
            }"#});
        c.validate().unwrap();
        let servers = c.servers();
        assert_eq!(servers.len(), 1);
        // Trailing slash is normalized away
        assert_eq!(servers[0].url, "https://updates.example.com");
        assert_eq!(servers[0].tenant_token.as_deref(), Some("tok"));
        assert_eq!(c.update_poll_interval(), Duration::from_secs(60));
        assert_eq!(
            c.inventory_poll_interval(),
            Duration::from_secs(DEFAULT_INVENTORY_POLL_INTERVAL)
        );
    }

    #[test]
    fn test_server_ring_order_and_token_fallback() {
        let c = parse(
            r#"{
                "Servers": [
                    {"ServerURL": "https://one.example.com"},
                    {"ServerURL": "https://two.example.com", "TenantToken": "t2"}
                ],
                "TenantToken": "shared"
            }"#,
        );
        let servers = c.servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].url, "https://one.example.com");
        assert_eq!(servers[0].tenant_token.as_deref(), Some("shared"));
        assert_eq!(servers[1].tenant_token.as_deref(), Some("t2"));
    }

    #[test]
    fn test_no_servers_is_fatal() {
        let c = parse(r#"{"TenantToken": "tok"}"#);
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_half_configured_mtls_is_fatal() {
        let c = parse(
            r#"{"ServerURL": "https://u.example.com",
                "HttpsClient": {"Certificate": "/etc/conveyd/client.crt"}}"#,
        );
        assert!(c.validate().is_err());
        let c = parse(
            r#"{"ServerURL": "https://u.example.com",
                "HttpsClient": {"Certificate": "/etc/conveyd/client.crt",
                                "Key": "/etc/conveyd/client.key"}}"#,
        );
        c.validate().unwrap();
    }

    #[test]
    fn test_half_configured_partitions_is_fatal() {
        let c = parse(
            r#"{"ServerURL": "https://u.example.com", "RootfsPartA": "/dev/sda2"}"#,
        );
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_parse_device_type() {
        assert_eq!(
            parse_device_type("device_type=qemux86-64\n").as_deref(),
            Some("qemux86-64")
        );
        assert_eq!(
            parse_device_type("# comment\ndevice_type = raspberrypi4\n").as_deref(),
            Some("raspberrypi4")
        );
        assert_eq!(parse_device_type("device_type=\n"), None);
        assert_eq!(parse_device_type("other=1\n"), None);
    }
}
