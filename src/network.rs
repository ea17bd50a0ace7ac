//! Network parameters, slot states and status snapshots

use crate::allocator::SubnetAllocation;
use crate::dhcp::DhcpLease;
use crate::error::{ApctlError, ApctlResult};
use crate::validation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use uuid::Uuid;

const CHANNELS_2_4GHZ: &[u8] = &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14];

const CHANNELS_5GHZ: &[u8] = &[
    36, 40, 44, 48, 52, 56, 60, 64,
    100, 104, 108, 112, 116, 120, 124, 128, 132, 136, 140, 144,
    149, 153, 157, 161, 165,
];

/// WiFi band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Band {
    #[serde(rename = "2.4ghz")]
    Ghz2_4,
    #[serde(rename = "5ghz")]
    Ghz5,
}

impl Band {
    pub fn allowed_channels(&self) -> &'static [u8] {
        match self {
            Band::Ghz2_4 => CHANNELS_2_4GHZ,
            Band::Ghz5 => CHANNELS_5GHZ,
        }
    }

    pub(crate) fn channel_hint(&self) -> &'static str {
        match self {
            Band::Ghz2_4 => "must be 1-14",
            Band::Ghz5 => "36-64, 100-144, 149-165 in steps of 4",
        }
    }

    /// hostapd `hw_mode`
    pub fn hw_mode(&self) -> &'static str {
        match self {
            Band::Ghz2_4 => "g",
            Band::Ghz5 => "a",
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Band::Ghz2_4 => write!(f, "2.4ghz"),
            Band::Ghz5 => write!(f, "5ghz"),
        }
    }
}

/// Encryption kind offered by the access point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Encryption {
    Open,
    Wpa,
    Wpa2,
    Wpa3,
    Wpa2Wpa3,
}

impl Encryption {
    pub fn requires_password(&self) -> bool {
        !matches!(self, Encryption::Open)
    }
}

impl fmt::Display for Encryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Encryption::Open => "open",
            Encryption::Wpa => "wpa",
            Encryption::Wpa2 => "wpa2",
            Encryption::Wpa3 => "wpa3",
            Encryption::Wpa2Wpa3 => "wpa2-wpa3",
        };
        write!(f, "{}", name)
    }
}

fn default_tx_power_level() -> u8 {
    4
}

/// Parameters of a Start request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkParams {
    pub ssid: String,
    pub channel: u8,
    pub band: Band,
    pub encryption: Encryption,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub hidden: bool,
    /// Seconds; clamped to the configured bounds
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Falls back to the configured default when absent
    #[serde(default)]
    pub internet_enabled: Option<bool>,
    #[serde(default = "default_tx_power_level")]
    pub tx_power_level: u8,
}

impl NetworkParams {
    /// Check every field without touching the host
    pub fn validate(&self) -> ApctlResult<()> {
        validation::validate_ssid(&self.ssid)?;
        validation::validate_wifi_channel(self.channel, self.band)?;
        validation::validate_tx_power_level(self.tx_power_level)?;

        match (self.encryption.requires_password(), &self.password) {
            (true, Some(password)) => validation::validate_wifi_password(password)?,
            (true, None) => {
                return Err(ApctlError::ValidationFailed(format!(
                    "Password required for {} encryption",
                    self.encryption
                )))
            }
            (false, Some(_)) => {
                return Err(ApctlError::ValidationFailed(
                    "Password must not be set for open encryption".to_string(),
                ))
            }
            (false, None) => {}
        }

        if self.timeout == Some(0) {
            return Err(ApctlError::ValidationFailed(
                "Timeout must be a positive number of seconds".to_string(),
            ));
        }

        Ok(())
    }
}

/// Per-slot lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    Inactive,
    Starting,
    Active,
    Stopping,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlotState::Inactive => "inactive",
            SlotState::Starting => "starting",
            SlotState::Active => "active",
            SlotState::Stopping => "stopping",
        };
        write!(f, "{}", name)
    }
}

/// Snapshot of a running instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance_id: Uuid,
    pub ssid: String,
    pub channel: u8,
    pub band: Band,
    pub encryption: Encryption,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub hidden: bool,
    pub tx_power_level: u8,
    pub internet_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ap_pid: Option<u32>,
    pub dhcp_pid: Option<u32>,
    /// Set when the radio did not honour the last power change
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_power_warning: Option<String>,
}

impl InstanceInfo {
    pub fn expires_in(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}

/// One connected station: associated with the AP and holding a lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub mac: String,
    pub ip: Ipv4Addr,
}

/// Result of GetStatus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub net_id: String,
    pub interface: String,
    pub state: SlotState,
    pub addressing: SubnetAllocation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<InstanceInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    /// Stations still waiting for a lease are left out
    pub clients: Vec<ClientInfo>,
    pub leases: Vec<DhcpLease>,
}

/// Entry of ListSlots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotSummary {
    pub net_id: String,
    pub interface: String,
    pub addressing: SubnetAllocation,
    pub state: SlotState,
}

/// Overall service condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every active network has its daemons, rules and upstream
    Ok,
    Degraded,
    /// Nothing is active
    Standby,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthStatus::Ok => "ok",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Standby => "standby",
        };
        write!(f, "{}", name)
    }
}

/// Daemons of one kind across all active networks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonHealth {
    pub running: usize,
    pub expected: usize,
}

impl DaemonHealth {
    pub fn healthy(&self) -> bool {
        self.running == self.expected
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatHealth {
    /// Every network with internet enabled has its MASQUERADE rule
    pub configured: bool,
    pub rules: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamHealth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub up: bool,
    pub has_ip: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UpstreamHealth {
    pub fn reachable(&self) -> bool {
        self.up && self.has_ip
    }
}

/// Per-slot daemon liveness
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotHealth {
    pub net_id: String,
    pub state: SlotState,
    pub ap_running: bool,
    pub dhcp_running: bool,
    pub internet_enabled: bool,
}

/// Result of Health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub active_networks: usize,
    pub configured_networks: usize,
    pub hostapd: DaemonHealth,
    pub dnsmasq: DaemonHealth,
    pub nat: NatHealth,
    pub upstream: UpstreamHealth,
    pub networks: Vec<SlotHealth>,
}

/// Result of Stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopOutcome {
    /// Slot was already inactive
    AlreadyInactive,
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> NetworkParams {
        NetworkParams {
            ssid: "LabNet".to_string(),
            channel: 6,
            band: Band::Ghz2_4,
            encryption: Encryption::Wpa2,
            password: Some("testpass123".to_string()),
            hidden: false,
            timeout: None,
            internet_enabled: None,
            tx_power_level: 4,
        }
    }

    #[test]
    fn test_valid_params() {
        assert!(params().validate().is_ok());
    }

    #[test]
    fn test_channel_band_mismatch() {
        let p = NetworkParams { channel: 1, band: Band::Ghz5, ..params() };
        let err = p.validate().unwrap_err();
        assert_eq!(err.condition(), "ValidationFailed");
    }

    #[test]
    fn test_password_rules() {
        let missing = NetworkParams { password: None, ..params() };
        assert!(missing.validate().is_err());

        let short = NetworkParams { password: Some("1234567".into()), ..params() };
        assert!(short.validate().is_err());

        let open_with_pw = NetworkParams { encryption: Encryption::Open, ..params() };
        assert!(open_with_pw.validate().is_err());

        let open = NetworkParams { encryption: Encryption::Open, password: None, ..params() };
        assert!(open.validate().is_ok());
    }

    #[test]
    fn test_tx_power_and_timeout() {
        assert!(NetworkParams { tx_power_level: 0, ..params() }.validate().is_err());
        assert!(NetworkParams { timeout: Some(0), ..params() }.validate().is_err());
        assert!(NetworkParams { timeout: Some(30), ..params() }.validate().is_ok());
    }

    #[test]
    fn test_params_deserialize() {
        let p: NetworkParams = serde_json::from_str(
            r#"{"ssid":"Lab","channel":36,"band":"5ghz","encryption":"wpa2-wpa3","password":"testpass123"}"#,
        )
        .unwrap();
        assert_eq!(p.band, Band::Ghz5);
        assert_eq!(p.encryption, Encryption::Wpa2Wpa3);
        assert_eq!(p.tx_power_level, 4);
        assert!(!p.hidden);
    }
}
