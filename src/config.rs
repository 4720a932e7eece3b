//! Configuration loading and validation.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::blocklist::BlockGroup;
use crate::blocklist::hosts::default_hosts_path;
use crate::error::{ConfigError, Result, ValidationError};

/// Main configuration for the nullroute DNS interceptor.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address the local resolver listens on and injects into adapters.
    #[serde(default = "default_listen_ip")]
    pub listen_ip: Ipv4Addr,

    #[serde(default = "default_dns_port")]
    pub listen_port: u16,

    /// Port used when contacting upstream servers.
    #[serde(default = "default_dns_port")]
    pub upstream_port: u16,

    /// Per-upstream reply timeout in milliseconds.
    #[serde(default = "default_forward_timeout_ms")]
    pub forward_timeout_ms: u64,

    /// How long a stop waits for in-flight queries, in milliseconds.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Extra upstream servers tried after the ones found on the adapters.
    #[serde(default)]
    pub upstreams: Vec<IpAddr>,

    #[serde(default)]
    pub system_dns: SystemDnsSettings,

    /// Hosts file used for kernel-level groups.
    #[serde(default = "default_hosts_path")]
    pub hosts_file: PathBuf,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Block groups by name.
    #[serde(default)]
    pub groups: BTreeMap<String, BlockGroup>,
}

/// How the system resolver configuration is redirected.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemDnsSettings {
    /// Point the system DNS at the local listener while running.
    #[serde(default = "default_true")]
    pub redirect: bool,

    #[serde(default)]
    pub backend: AdapterBackendKind,

    /// File edited by the resolv-conf backend.
    #[serde(default = "default_resolv_conf")]
    pub resolv_conf: PathBuf,

    /// Where the pre-redirection DNS settings are kept.
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
}

impl Default for SystemDnsSettings {
    fn default() -> Self {
        Self {
            redirect: true,
            backend: AdapterBackendKind::default(),
            resolv_conf: default_resolv_conf(),
            snapshot_path: default_snapshot_path(),
        }
    }
}

/// Platform facility used to change adapter DNS servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterBackendKind {
    ResolvConf,
    #[serde(alias = "powershell")]
    PowerShell,
}

impl Default for AdapterBackendKind {
    fn default() -> Self {
        if cfg!(windows) {
            Self::PowerShell
        } else {
            Self::ResolvConf
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

const fn default_listen_ip() -> Ipv4Addr {
    Ipv4Addr::new(127, 0, 1, 10)
}

const fn default_dns_port() -> u16 {
    53
}

const fn default_forward_timeout_ms() -> u64 {
    2000
}

const fn default_drain_timeout_ms() -> u64 {
    5000
}

const fn default_true() -> bool {
    true
}

fn default_resolv_conf() -> PathBuf {
    PathBuf::from(crate::adapter::resolv_conf::DEFAULT_RESOLV_CONF)
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("dns_backup.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9184))
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.forward_timeout_ms == 0 {
            return Err(ValidationError::ZeroForwardTimeout);
        }

        if self.drain_timeout_ms == 0 {
            return Err(ValidationError::ZeroDrainTimeout);
        }

        if self.system_dns.snapshot_path.as_os_str().is_empty() {
            return Err(ValidationError::EmptySnapshotPath);
        }

        for (name, group) in &self.groups {
            if name.trim().is_empty() {
                return Err(ValidationError::EmptyGroupName);
            }
            if group.domains.iter().any(|domain| domain.trim().is_empty()) {
                return Err(ValidationError::EmptyGroupDomain {
                    group: name.clone(),
                });
            }
        }

        Ok(())
    }

    /// Groups with their names filled in from the table keys.
    pub fn block_groups(&self) -> Vec<BlockGroup> {
        self.groups
            .iter()
            .map(|(name, group)| BlockGroup {
                name: name.clone(),
                ..group.clone()
            })
            .collect()
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((self.listen_ip, self.listen_port))
    }

    pub const fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }

    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::parse("").unwrap();

        assert_eq!(config.listen_addr().to_string(), "127.0.1.10:53");
        assert_eq!(config.upstream_port, 53);
        assert_eq!(config.forward_timeout(), Duration::from_secs(2));
        assert!(config.system_dns.redirect);
        assert_eq!(
            config.system_dns.snapshot_path,
            PathBuf::from("dns_backup.json")
        );
        assert!(config.upstreams.is_empty());
        assert!(config.groups.is_empty());
        assert!(!config.metrics.enabled);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_groups() {
        let toml = r#"
            [groups.ads]
            description = "Advertising"
            enabled = true
            domains = ["ads.net", "example.com"]

            [groups.social]
            on = false
            kernel = true
            hosts = ["social.net"]
        "#;

        let config = Config::parse(toml).unwrap();
        let groups = config.block_groups();

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].name, "ads");
        assert!(groups[0].enabled);
        assert_eq!(groups[0].domains.len(), 2);
        assert_eq!(groups[1].name, "social");
        assert!(groups[1].managed_at_kernel_level);
        assert!(!groups[1].enabled);
    }

    #[test]
    fn test_parse_system_dns_settings() {
        let toml = r#"
            listen_ip = "127.0.0.53"
            listen_port = 5353
            upstreams = ["9.9.9.9"]

            [system_dns]
            redirect = false
            backend = "powershell"
            snapshot_path = "/var/lib/nullroute/backup.json"
        "#;

        let config = Config::parse(toml).unwrap();
        assert_eq!(config.listen_addr().to_string(), "127.0.0.53:5353");
        assert_eq!(config.upstreams, vec!["9.9.9.9".parse::<IpAddr>().unwrap()]);
        assert!(!config.system_dns.redirect);
        assert_eq!(config.system_dns.backend, AdapterBackendKind::PowerShell);
    }

    #[test]
    fn test_parse_resolv_conf_backend() {
        let toml = r#"
            [system_dns]
            backend = "resolv-conf"
            resolv_conf = "/tmp/resolv.conf"
        "#;

        let config = Config::parse(toml).unwrap();
        assert_eq!(config.system_dns.backend, AdapterBackendKind::ResolvConf);
        assert_eq!(config.system_dns.resolv_conf, PathBuf::from("/tmp/resolv.conf"));
    }

    #[test]
    fn test_ipv6_listen_rejected() {
        assert!(Config::parse(r#"listen_ip = "::1""#).is_err());
    }

    #[test]
    fn test_zero_forward_timeout_rejected() {
        assert!(Config::parse("forward_timeout_ms = 0").is_err());
    }

    #[test]
    fn test_zero_drain_timeout_rejected() {
        assert!(Config::parse("drain_timeout_ms = 0").is_err());
    }

    #[test]
    fn test_empty_group_domain_rejected() {
        let toml = r#"
            [groups.ads]
            domains = ["ads.net", " "]
        "#;

        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(Config::parse(r#"unknown_field = "value""#).is_err());
    }

    #[test]
    fn test_unknown_group_field_rejected() {
        let toml = r#"
            [groups.ads]
            colour = "red"
        "#;

        assert!(Config::parse(toml).is_err());
    }
}
