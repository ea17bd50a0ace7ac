//! Configuration management for apctl

use crate::allocator::{self, Ipv4Subnet, SubnetAllocation};
use crate::error::{ApctlError, ApctlResult};
use crate::validation;
use chrono::{TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "APCTL_CONFIG";

pub const DEFAULT_CONFIG_PATH: &str = "/etc/apctl/apctl.toml";

/// Main apctl configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApctlConfig {
    /// Base /24; slot i gets third octet + i
    pub base_network: Ipv4Subnet,
    /// DNS server handed to clients
    #[serde(default = "default_dns_server")]
    pub dns_server: Ipv4Addr,
    /// Upstream for NAT: "auto" (default route) or an interface name
    #[serde(default)]
    pub upstream_interface: UpstreamSelector,
    #[serde(default = "default_true")]
    pub internet_enabled_by_default: bool,
    /// Regulatory domain written into hostapd.conf
    #[serde(default = "default_country_code")]
    pub country_code: String,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub paths: ConfigPaths,
    #[serde(default)]
    pub daemons: DaemonSettings,
    /// Managed networks, in allocation order
    pub networks: Vec<NetworkEntry>,
}

/// One configured slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEntry {
    pub net_id: String,
    pub interface: String,
}

/// Network lifetime bounds, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_timeout")]
    pub default: u64,
    #[serde(default = "default_min_timeout")]
    pub min: u64,
    #[serde(default = "default_max_timeout")]
    pub max: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPaths {
    /// hostapd/dnsmasq configs and lease files
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    #[serde(default = "default_hostapd_bin")]
    pub hostapd: PathBuf,
    #[serde(default = "default_dnsmasq_bin")]
    pub dnsmasq: PathBuf,
    /// AP readiness polls before giving up
    #[serde(default = "default_ready_attempts")]
    pub ready_attempts: u32,
    #[serde(default = "default_ready_interval_ms")]
    pub ready_interval_ms: u64,
    /// Wait after SIGTERM before SIGKILL
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// dnsmasq lease time, e.g. "12h"
    #[serde(default = "default_lease_time")]
    pub lease_time: String,
    #[serde(default = "default_expiry_interval_secs")]
    pub expiry_interval_secs: u64,
    /// Delay before re-reading TX power after a change
    #[serde(default = "default_tx_power_settle_ms")]
    pub tx_power_settle_ms: u64,
}

/// Where NAT traffic leaves the host
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum UpstreamSelector {
    #[default]
    Auto,
    Named(String),
}

impl From<String> for UpstreamSelector {
    fn from(value: String) -> Self {
        if value == "auto" {
            UpstreamSelector::Auto
        } else {
            UpstreamSelector::Named(value)
        }
    }
}

impl From<UpstreamSelector> for String {
    fn from(value: UpstreamSelector) -> Self {
        match value {
            UpstreamSelector::Auto => "auto".to_string(),
            UpstreamSelector::Named(name) => name,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_dns_server() -> Ipv4Addr {
    Ipv4Addr::new(1, 1, 1, 1)
}

fn default_country_code() -> String {
    "US".to_string()
}

fn default_timeout() -> u64 {
    3600
}

fn default_min_timeout() -> u64 {
    60
}

fn default_max_timeout() -> u64 {
    86400
}

fn default_runtime_dir() -> PathBuf {
    PathBuf::from("/run/apctl")
}

fn default_hostapd_bin() -> PathBuf {
    PathBuf::from("/usr/sbin/hostapd")
}

fn default_dnsmasq_bin() -> PathBuf {
    PathBuf::from("/usr/sbin/dnsmasq")
}

fn default_ready_attempts() -> u32 {
    10
}

fn default_ready_interval_ms() -> u64 {
    500
}

fn default_stop_grace_ms() -> u64 {
    3000
}

fn default_lease_time() -> String {
    "12h".to_string()
}

fn default_expiry_interval_secs() -> u64 {
    5
}

fn default_tx_power_settle_ms() -> u64 {
    3000
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            default: default_timeout(),
            min: default_min_timeout(),
            max: default_max_timeout(),
        }
    }
}

impl TimeoutSettings {
    /// Effective lifetime for a Start request
    pub fn effective(&self, requested: Option<u64>) -> Duration {
        let secs = requested.unwrap_or(self.default).clamp(self.min, self.max);
        Duration::from_secs(secs)
    }

    /// Effective lifetime as a signed span for deadline arithmetic
    pub fn lifetime(&self, requested: Option<u64>) -> ApctlResult<TimeDelta> {
        let secs = self.effective(requested).as_secs();
        i64::try_from(secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .ok_or_else(|| ApctlError::ValidationFailed(format!("Timeout of {}s is out of range", secs)))
    }
}

/// Whether a deadline `secs` from now fits in a `DateTime<Utc>`
fn deadline_representable(secs: u64) -> bool {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|span| Utc::now().checked_add_signed(span))
        .is_some()
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self { runtime_dir: default_runtime_dir() }
    }
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            hostapd: default_hostapd_bin(),
            dnsmasq: default_dnsmasq_bin(),
            ready_attempts: default_ready_attempts(),
            ready_interval_ms: default_ready_interval_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            lease_time: default_lease_time(),
            expiry_interval_secs: default_expiry_interval_secs(),
            tx_power_settle_ms: default_tx_power_settle_ms(),
        }
    }
}

impl DaemonSettings {
    pub fn ready_interval(&self) -> Duration {
        Duration::from_millis(self.ready_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn expiry_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_interval_secs)
    }

    pub fn tx_power_settle(&self) -> Duration {
        Duration::from_millis(self.tx_power_settle_ms)
    }
}

impl ApctlConfig {
    /// Load and validate configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> ApctlResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ApctlError::ConfigError(format!("Failed to read config {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Resolve the path from an explicit argument, `APCTL_CONFIG`, or the default
    pub fn resolve_path(explicit: Option<PathBuf>) -> PathBuf {
        explicit
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    pub fn from_toml_str(content: &str) -> ApctlResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ApctlError::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check everything once, so requests never re-validate configuration
    pub fn validate(&self) -> ApctlResult<()> {
        if self.networks.is_empty() {
            return Err(ApctlError::ConfigError("At least one network must be configured".to_string()));
        }

        let mut interfaces = HashSet::new();
        for entry in &self.networks {
            validation::validate_interface_name(&entry.interface)
                .map_err(|e| ApctlError::ConfigError(format!("{}: {}", entry.net_id, e)))?;
            if !interfaces.insert(entry.interface.as_str()) {
                return Err(ApctlError::ConfigError(format!(
                    "Interface {} is bound to more than one network",
                    entry.interface
                )));
            }
        }

        if let UpstreamSelector::Named(name) = &self.upstream_interface {
            validation::validate_interface_name(name)
                .map_err(|e| ApctlError::ConfigError(format!("upstream_interface: {}", e)))?;
        }

        validation::validate_country_code(&self.country_code)
            .map_err(|e| ApctlError::ConfigError(e.to_string()))?;

        let t = &self.timeouts;
        if t.min == 0 || t.min > t.max || t.default < t.min || t.default > t.max {
            return Err(ApctlError::ConfigError(format!(
                "Timeouts must satisfy 0 < min <= default <= max (min={}, default={}, max={})",
                t.min, t.default, t.max
            )));
        }

        if !deadline_representable(t.max) {
            return Err(ApctlError::ConfigError(format!(
                "timeouts.max of {}s is beyond the representable date range",
                t.max
            )));
        }

        if self.daemons.ready_attempts == 0 {
            return Err(ApctlError::ConfigError("daemons.ready_attempts must be at least 1".to_string()));
        }

        validation::sanitize_config_value(&self.daemons.lease_time)
            .map_err(|e| ApctlError::ConfigError(format!("daemons.lease_time: {}", e)))?;

        self.allocations().map(|_| ())
    }

    /// Subnet facts for every network, in configuration order
    pub fn allocations(&self) -> ApctlResult<Vec<SubnetAllocation>> {
        let ids: Vec<&str> = self.networks.iter().map(|n| n.net_id.as_str()).collect();
        allocator::allocate(self.base_network, &ids)
    }

    /// Ensure the runtime directory exists
    pub fn ensure_directories(&self) -> ApctlResult<()> {
        std::fs::create_dir_all(&self.paths.runtime_dir).map_err(|e| {
            ApctlError::ConfigError(format!(
                "Failed to create directory {:?}: {}",
                self.paths.runtime_dir, e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
base_network = "192.168.120.0/24"
dns_server = "192.168.10.21"

[timeouts]
min = 60

[[networks]]
net_id = "ap-01"
interface = "wlan0"

[[networks]]
net_id = "ap-02"
interface = "wlan1"
"#;

    #[test]
    fn test_load_sample() {
        let config = ApctlConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.networks.len(), 2);
        assert_eq!(config.upstream_interface, UpstreamSelector::Auto);
        assert!(config.internet_enabled_by_default);
        assert_eq!(config.timeouts.default, 3600);
        assert_eq!(config.daemons.ready_attempts, 10);

        let allocs = config.allocations().unwrap();
        assert_eq!(allocs[1].subnet.to_string(), "192.168.121.0/24");
    }

    #[test]
    fn test_effective_timeout_clamps() {
        let t = TimeoutSettings { default: 3600, min: 60, max: 7200 };
        assert_eq!(t.effective(None), Duration::from_secs(3600));
        assert_eq!(t.effective(Some(30)), Duration::from_secs(60));
        assert_eq!(t.effective(Some(10_000)), Duration::from_secs(7200));
        assert_eq!(t.effective(Some(120)), Duration::from_secs(120));
    }

    #[test]
    fn test_named_upstream() {
        let content = SAMPLE.replace(
            "dns_server = \"192.168.10.21\"",
            "dns_server = \"192.168.10.21\"\nupstream_interface = \"eth0\"",
        );
        let config = ApctlConfig::from_toml_str(&content).unwrap();
        assert_eq!(config.upstream_interface, UpstreamSelector::Named("eth0".to_string()));
    }

    #[test]
    fn test_rejects_shared_interface() {
        let content = SAMPLE.replace("wlan1", "wlan0");
        let err = ApctlConfig::from_toml_str(&content).unwrap_err();
        assert!(err.to_string().contains("more than one network"));
    }

    #[test]
    fn test_rejects_bad_timeouts() {
        let content = SAMPLE.replace("min = 60", "min = 60\nmax = 30");
        assert!(ApctlConfig::from_toml_str(&content).is_err());
    }

    #[test]
    fn test_max_timeout_must_fit_a_deadline() {
        let content = SAMPLE.replace("min = 60", "min = 60\nmax = 1000000000000000");
        let err = ApctlConfig::from_toml_str(&content).unwrap_err();
        assert_eq!(err.condition(), "ConfigError");
        assert!(err.to_string().contains("timeouts.max"));

        // ten years is fine
        let content = SAMPLE.replace("min = 60", "min = 60\nmax = 315360000");
        let config = ApctlConfig::from_toml_str(&content).unwrap();
        let span = config.timeouts.lifetime(Some(u64::MAX)).unwrap();
        assert_eq!(span.num_seconds(), 315_360_000);
    }

    #[test]
    fn test_rejects_bad_base_network() {
        let content = SAMPLE.replace("192.168.120.0/24", "192.168.0.0/16");
        assert!(ApctlConfig::from_toml_str(&content).is_err());

        let content = SAMPLE.replace("192.168.120.0/24", "192.168.255.0/24");
        let err = ApctlConfig::from_toml_str(&content).unwrap_err();
        assert_eq!(err.condition(), "ConfigError");
    }

    #[test]
    fn test_rejects_bad_net_id() {
        let content = SAMPLE.replace("ap-02", "AP_02");
        assert!(ApctlConfig::from_toml_str(&content).is_err());
    }
}
