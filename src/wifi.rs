//! WiFi device control
//!
//! Low-level radio management using the iw command

use crate::command::CommandRunner;
use crate::error::{ApctlError, ApctlResult};
use crate::validation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

/// Reported and requested power may differ by this much before we warn
const TX_POWER_TOLERANCE_DBM: f64 = 0.5;

pub const TX_POWER_WARNING: &str =
    "Interface does not support dynamic power change; recreate the network with the desired power level";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WifiDeviceInfo {
    pub interface: String,
    pub wiphy: Option<u32>,
    pub type_: Option<String>,
    pub channel: Option<u32>,
    pub txpower_dbm: Option<f64>,
    pub ssid: Option<String>,
}

impl WifiDeviceInfo {
    pub fn phy(&self) -> Option<String> {
        self.wiphy.map(|n| format!("phy{}", n))
    }

    pub fn is_ap(&self) -> bool {
        self.type_.as_deref() == Some("AP")
    }
}

/// One channel entry from `iw phy ... info`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelCapability {
    pub channel: u8,
    pub frequency_mhz: u32,
    pub max_dbm: f64,
}

/// Outcome of a TX power change or query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxPowerReport {
    pub interface: String,
    pub channel: u8,
    pub frequency_mhz: u32,
    pub max_dbm: f64,
    pub levels_dbm: BTreeMap<u8, f64>,
    pub current_level: u8,
    pub current_dbm: f64,
    /// What the driver reports after the change
    pub reported_dbm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// WiFi controller
pub struct WifiController {
    runner: Arc<dyn CommandRunner>,
}

impl WifiController {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Get WiFi device information
    pub async fn get_dev_info(&self, interface: &str) -> ApctlResult<WifiDeviceInfo> {
        validation::validate_interface_name(interface)?;
        let output = self.run_iw(&["dev", interface, "info"]).await?;
        Ok(parse_dev_info(interface, &output))
    }

    /// Physical device name (`phyN`)
    pub async fn get_phy(&self, interface: &str) -> ApctlResult<String> {
        let info = self.get_dev_info(interface).await?;
        info.phy().ok_or_else(|| ApctlError::CommandFailed {
            cmd: format!("iw dev {} info", interface),
            code: None,
            stderr: "cannot determine wiphy".to_string(),
        })
    }

    /// Switch the interface type (`managed`, `__ap`, ...)
    pub async fn set_type(&self, interface: &str, type_: &str) -> ApctlResult<()> {
        validation::validate_interface_name(interface)?;
        self.run_iw(&["dev", interface, "set", "type", type_]).await.map(|_| ())
    }

    /// Whether the radio lists AP among its supported interface modes
    pub async fn supports_ap_mode(&self, interface: &str) -> ApctlResult<bool> {
        let phy = self.get_phy(interface).await?;
        let output = self.run_iw(&["phy", &phy, "info"]).await?;
        Ok(parse_supports_ap(&output))
    }

    /// MAC addresses of associated stations
    pub async fn station_macs(&self, interface: &str) -> ApctlResult<Vec<String>> {
        validation::validate_interface_name(interface)?;
        let output = self.run_iw(&["dev", interface, "station", "dump"]).await?;
        Ok(parse_station_macs(&output))
    }

    /// Regulatory limits for one channel
    pub async fn channel_capability(&self, interface: &str, channel: u8) -> ApctlResult<ChannelCapability> {
        let phy = self.get_phy(interface).await?;
        let output = self.run_iw(&["phy", &phy, "info"]).await?;
        parse_channels(&output)
            .into_iter()
            .find(|c| c.channel == channel)
            .ok_or_else(|| {
                ApctlError::ValidationFailed(format!(
                    "Channel {} not supported on interface {}",
                    channel, interface
                ))
            })
    }

    /// Set a fixed transmit power in mBm
    pub async fn set_txpower_mbm(&self, interface: &str, mbm: i64) -> ApctlResult<()> {
        validation::validate_interface_name(interface)?;
        let value = mbm.to_string();
        self.run_iw(&["dev", interface, "set", "txpower", "fixed", &value]).await.map(|_| ())
    }

    /// Transmit power the driver currently reports
    pub async fn current_txpower(&self, interface: &str) -> Option<f64> {
        match self.get_dev_info(interface).await {
            Ok(info) => info.txpower_dbm,
            Err(e) => {
                warn!("Failed to read current txpower for {}: {}", interface, e);
                None
            }
        }
    }

    /// Apply a power level (1-4) and, if `settle` is given, verify it took
    pub async fn apply_tx_power(
        &self,
        interface: &str,
        channel: u8,
        level: u8,
        settle: Option<Duration>,
    ) -> ApctlResult<TxPowerReport> {
        validation::validate_tx_power_level(level)?;
        let caps = self.channel_capability(interface, channel).await?;
        let levels_dbm = level_table(caps.max_dbm);
        let desired_dbm = levels_dbm[&level];

        self.set_txpower_mbm(interface, (desired_dbm * 100.0).round() as i64).await?;
        info!("TX power on {} set to level {} ({} dBm)", interface, level, desired_dbm);

        let reported_dbm = match settle {
            Some(delay) => {
                sleep(delay).await;
                self.current_txpower(interface).await
            }
            None => None,
        };

        let mut report = TxPowerReport {
            interface: interface.to_string(),
            channel,
            frequency_mhz: caps.frequency_mhz,
            max_dbm: caps.max_dbm,
            levels_dbm,
            current_level: level,
            current_dbm: desired_dbm,
            reported_dbm,
            warning: None,
        };
        report.warning = mismatch_warning(&report);
        if let Some(ref w) = report.warning {
            warn!("{}: {} (requested {} dBm, reported {:?})", interface, w, desired_dbm, reported_dbm);
        }
        Ok(report)
    }

    /// Compare the configured level with what the radio reports
    pub async fn tx_power_info(&self, interface: &str, channel: u8, level: u8) -> ApctlResult<TxPowerReport> {
        let caps = self.channel_capability(interface, channel).await?;
        let levels_dbm = level_table(caps.max_dbm);
        let current_dbm = levels_dbm[&level];
        let mut report = TxPowerReport {
            interface: interface.to_string(),
            channel,
            frequency_mhz: caps.frequency_mhz,
            max_dbm: caps.max_dbm,
            levels_dbm,
            current_level: level,
            current_dbm,
            reported_dbm: self.current_txpower(interface).await,
            warning: None,
        };
        report.warning = mismatch_warning(&report);
        Ok(report)
    }

    async fn run_iw(&self, args: &[&str]) -> ApctlResult<String> {
        self.runner.output("iw", args).await
    }
}

fn mismatch_warning(report: &TxPowerReport) -> Option<String> {
    report
        .reported_dbm
        .filter(|reported| (reported - report.current_dbm).abs() > TX_POWER_TOLERANCE_DBM)
        .map(|_| TX_POWER_WARNING.to_string())
}

/// Split the channel maximum into four monotonic steps, each at least 1 dBm
pub fn level_table(max_dbm: f64) -> BTreeMap<u8, f64> {
    let round1 = |v: f64| (v * 10.0).round() / 10.0;
    let mut table = BTreeMap::new();
    let mut floor = 1.0_f64;
    for (level, share) in [(1u8, 0.25), (2, 0.50), (3, 0.75), (4, 1.0)] {
        let dbm = round1(max_dbm * share).max(floor);
        table.insert(level, dbm);
        floor = dbm;
    }
    table
}

fn parse_dev_info(interface: &str, output: &str) -> WifiDeviceInfo {
    let mut info = WifiDeviceInfo {
        interface: interface.to_string(),
        ..Default::default()
    };

    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("wiphy ") {
            info.wiphy = rest.trim().parse().ok();
        } else if let Some(rest) = line.strip_prefix("type ") {
            info.type_ = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("channel ") {
            // "channel 6 (2437 MHz), width: 20 MHz"
            info.channel = rest.split_whitespace().next().and_then(|s| s.parse().ok());
        } else if let Some(rest) = line.strip_prefix("txpower ") {
            // "txpower 20.00 dBm"
            info.txpower_dbm = rest.split_whitespace().next().and_then(|s| s.parse().ok());
        } else if let Some(rest) = line.strip_prefix("ssid ") {
            info.ssid = Some(rest.to_string());
        }
    }

    info
}

/// `Station aa:bb:cc:dd:ee:ff (on wlan0)`
fn parse_station_macs(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("Station "))
        .filter_map(|rest| rest.split_whitespace().next())
        .map(str::to_lowercase)
        .collect()
}

/// `* 2437 MHz [6] (20.0 dBm)`; disabled channels carry no dBm figure
fn parse_channels(output: &str) -> Vec<ChannelCapability> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("* ")?;
            let (freq, rest) = rest.split_once(" MHz")?;
            let frequency_mhz = freq.trim().parse::<f64>().ok()? as u32;
            let channel = rest.split_once('[')?.1.split_once(']')?.0.parse().ok()?;
            let max_dbm = rest.split_once('(')?.1.split_once(" dBm)")?.0.trim().parse().ok()?;
            Some(ChannelCapability { channel, frequency_mhz, max_dbm })
        })
        .collect()
}

fn parse_supports_ap(output: &str) -> bool {
    let mut in_modes = false;
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("Supported interface modes") {
            in_modes = true;
            continue;
        }
        if in_modes {
            match trimmed.strip_prefix("* ") {
                Some("AP") => return true,
                Some(_) => {}
                None => in_modes = false,
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV_INFO: &str = "Interface wlan0\n\
        \tifindex 3\n\
        \twdev 0x1\n\
        \taddr 00:c0:ca:12:34:56\n\
        \tssid LabNet\n\
        \ttype AP\n\
        \twiphy 1\n\
        \tchannel 6 (2437 MHz), width: 20 MHz, center1: 2437 MHz\n\
        \ttxpower 15.00 dBm\n";

    const PHY_INFO: &str = "Wiphy phy1\n\
        \tSupported interface modes:\n\
        \t\t * IBSS\n\
        \t\t * managed\n\
        \t\t * AP\n\
        \t\t * monitor\n\
        \tBand 1:\n\
        \t\tFrequencies:\n\
        \t\t\t* 2412 MHz [1] (20.0 dBm)\n\
        \t\t\t* 2437 MHz [6] (20.0 dBm)\n\
        \t\t\t* 2484 MHz [14] (disabled)\n\
        \tBand 2:\n\
        \t\tFrequencies:\n\
        \t\t\t* 5180.0 MHz [36] (23.0 dBm)\n";

    #[test]
    fn test_parse_dev_info() {
        let info = parse_dev_info("wlan0", DEV_INFO);
        assert_eq!(info.phy(), Some("phy1".to_string()));
        assert!(info.is_ap());
        assert_eq!(info.channel, Some(6));
        assert_eq!(info.txpower_dbm, Some(15.0));
        assert_eq!(info.ssid.as_deref(), Some("LabNet"));
    }

    #[test]
    fn test_parse_channels() {
        let channels = parse_channels(PHY_INFO);
        assert_eq!(channels.len(), 3);
        assert_eq!(channels[1], ChannelCapability { channel: 6, frequency_mhz: 2437, max_dbm: 20.0 });
        assert_eq!(channels[2].frequency_mhz, 5180);
        assert!(channels.iter().all(|c| c.channel != 14));
    }

    #[test]
    fn test_parse_supports_ap() {
        assert!(parse_supports_ap(PHY_INFO));
        assert!(!parse_supports_ap("Wiphy phy0\n\tSupported interface modes:\n\t\t * managed\n\tBand 1:\n"));
    }

    #[test]
    fn test_parse_station_macs() {
        let dump = "Station AA:BB:CC:00:11:22 (on wlan0)\n\tinactive time:\t10 ms\nStation 02:00:00:00:00:01 (on wlan0)\n";
        assert_eq!(parse_station_macs(dump), vec!["aa:bb:cc:00:11:22", "02:00:00:00:00:01"]);
    }

    #[test]
    fn test_level_table() {
        let t = level_table(20.0);
        assert_eq!(t[&1], 5.0);
        assert_eq!(t[&2], 10.0);
        assert_eq!(t[&3], 15.0);
        assert_eq!(t[&4], 20.0);

        let low = level_table(2.0);
        assert_eq!(low[&1], 1.0);
        assert_eq!(low[&2], 1.0);
        assert!(low[&3] >= low[&2] && low[&4] >= low[&3]);
    }
}
