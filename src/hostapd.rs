//! hostapd management for WiFi Access Point
//!
//! Configuration generation and supervision of one hostapd per radio

use crate::command::{CommandRunner, DaemonHandle, ReadinessPolicy};
use crate::dhcp::DhcpLease;
use crate::error::{ApctlError, ApctlResult};
use crate::interface::InterfaceController;
use crate::network::{Band, ClientInfo, Encryption, NetworkParams};
use crate::validation;
use crate::wifi::WifiController;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub const DAEMON_NAME: &str = "hostapd";

/// Radio parameters handed to hostapd
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApRadioConfig {
    pub net_id: String,
    pub interface: String,
    pub ssid: String,
    /// None for open networks
    pub password: Option<String>,
    pub channel: u8,
    pub band: Band,
    pub encryption: Encryption,
    pub hidden: bool,
    /// Regulatory domain
    pub country_code: String,
}

impl ApRadioConfig {
    pub fn from_params(net_id: &str, interface: &str, params: &NetworkParams, country_code: &str) -> Self {
        Self {
            net_id: net_id.to_string(),
            interface: interface.to_string(),
            ssid: params.ssid.clone(),
            password: params.password.clone(),
            channel: params.channel,
            band: params.band,
            encryption: params.encryption,
            hidden: params.hidden,
            country_code: country_code.to_string(),
        }
    }
}

/// Generate hostapd configuration file
pub fn generate_config(config: &ApRadioConfig) -> ApctlResult<String> {
    validation::validate_interface_name(&config.interface)?;
    validation::validate_ssid(&config.ssid)?;
    validation::validate_wifi_channel(config.channel, config.band)?;
    validation::validate_country_code(&config.country_code)?;

    let ssid = validation::sanitize_config_value(&config.ssid)?;

    let mut conf = String::new();
    conf.push_str(&format!("# apctl hostapd config for {}\n", config.net_id));
    conf.push_str(&format!("interface={}\n", config.interface));
    conf.push_str("driver=nl80211\n");
    conf.push_str(&format!("ssid={}\n", ssid));
    conf.push_str(&format!("hw_mode={}\n", config.band.hw_mode()));
    conf.push_str(&format!("channel={}\n", config.channel));
    conf.push_str(&format!("country_code={}\n", config.country_code));
    conf.push_str("ieee80211n=1\n");
    conf.push_str("wmm_enabled=1\n");

    if config.hidden {
        conf.push_str("ignore_broadcast_ssid=1\n");
    }

    // (wpa, wpa_key_mgmt, ieee80211w)
    let security = match config.encryption {
        Encryption::Open => None,
        Encryption::Wpa => Some((1, "WPA-PSK", None)),
        Encryption::Wpa2 => Some((2, "WPA-PSK", None)),
        Encryption::Wpa3 => Some((2, "SAE", Some(2))),
        Encryption::Wpa2Wpa3 => Some((2, "WPA-PSK SAE", Some(1))),
    };

    if let Some((wpa, key_mgmt, mfp)) = security {
        let password = config.password.as_deref().ok_or_else(|| {
            ApctlError::ValidationFailed(format!("Password required for {} encryption", config.encryption))
        })?;
        validation::validate_wifi_password(password)?;
        let password = validation::sanitize_config_value(password)?;

        conf.push_str(&format!("wpa={}\n", wpa));
        conf.push_str(&format!("wpa_passphrase={}\n", password));
        conf.push_str(&format!("wpa_key_mgmt={}\n", key_mgmt));
        if wpa == 1 {
            conf.push_str("wpa_pairwise=TKIP CCMP\n");
        } else {
            conf.push_str("rsn_pairwise=CCMP\n");
        }
        if let Some(level) = mfp {
            conf.push_str(&format!("ieee80211w={}\n", level));
        }
    } else if config.password.is_some() {
        return Err(ApctlError::ValidationFailed(
            "Password must not be set for open encryption".to_string(),
        ));
    }

    conf.push_str("auth_algs=1\nmacaddr_acl=0\n");

    Ok(conf)
}

/// hostapd controller
pub struct HostapdController {
    runner: Arc<dyn CommandRunner>,
    config_dir: PathBuf,
    hostapd_bin: PathBuf,
    policy: ReadinessPolicy,
    wifi: WifiController,
    links: InterfaceController,
}

impl HostapdController {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        config_dir: PathBuf,
        hostapd_bin: PathBuf,
        policy: ReadinessPolicy,
    ) -> Self {
        Self {
            wifi: WifiController::new(Arc::clone(&runner)),
            links: InterfaceController::new(Arc::clone(&runner)),
            runner,
            config_dir,
            hostapd_bin,
            policy,
        }
    }

    pub fn config_path(&self, net_id: &str) -> PathBuf {
        self.config_dir.join(format!("hostapd-{}.conf", net_id))
    }

    pub async fn write_config(&self, config: &ApRadioConfig) -> ApctlResult<PathBuf> {
        let conf_content = generate_config(config)?;
        let conf_path = self.config_path(&config.net_id);
        fs::create_dir_all(&self.config_dir).await?;
        fs::write(&conf_path, conf_content).await?;
        Ok(conf_path)
    }

    /// Put the radio into a clean managed state before hostapd takes it
    pub async fn prepare_interface(&self, interface: &str) {
        if let Err(e) = self.links.down(interface).await {
            debug!("prepare {}: link down failed: {}", interface, e);
        }
        if let Err(e) = self.wifi.set_type(interface, "managed").await {
            debug!("prepare {}: set type managed failed: {}", interface, e);
        }
        if let Err(e) = self.links.flush_addrs(interface).await {
            debug!("prepare {}: address flush failed: {}", interface, e);
        }
    }

    /// Launch hostapd and wait until the interface is in AP mode
    pub async fn start(&self, config: &ApRadioConfig) -> ApctlResult<DaemonHandle> {
        self.prepare_interface(&config.interface).await;
        let conf_path = self.write_config(config).await?;

        let bin = self.hostapd_bin.to_string_lossy().to_string();
        let conf_arg = conf_path.to_string_lossy().to_string();
        let process = match self.runner.spawn(&bin, &[&conf_arg]).await {
            Ok(process) => process,
            Err(e) => {
                self.cleanup(&config.interface, &conf_path).await;
                return Err(e);
            }
        };
        let mut handle = DaemonHandle::new(DAEMON_NAME, &config.interface, process);

        match self.wait_ready(&mut handle, &config.interface).await {
            Ok(()) => {
                info!(
                    "hostapd up on {} for {} (pid {:?})",
                    config.interface,
                    config.net_id,
                    handle.pid()
                );
                Ok(handle)
            }
            Err(detail) => {
                let tail = validation::sanitize_error_message(&handle.stderr_tail());
                if let Err(e) = handle.shutdown(self.policy.stop_grace).await {
                    warn!("Failed to stop unready hostapd on {}: {}", config.interface, e);
                }
                self.cleanup(&config.interface, &conf_path).await;
                let detail = if tail.is_empty() { detail } else { format!("{}: {}", detail, tail) };
                Err(ApctlError::DaemonStartFailed {
                    daemon: DAEMON_NAME.to_string(),
                    detail,
                })
            }
        }
    }

    async fn wait_ready(&self, handle: &mut DaemonHandle, interface: &str) -> Result<(), String> {
        for attempt in 1..=self.policy.attempts {
            sleep(self.policy.interval).await;

            if !handle.is_running() {
                return Err("process exited during startup".to_string());
            }

            match self.wifi.get_dev_info(interface).await {
                Ok(info) if info.is_ap() => return Ok(()),
                Ok(info) => debug!(
                    "{} not in AP mode yet (type {:?}, attempt {}/{})",
                    interface, info.type_, attempt, self.policy.attempts
                ),
                Err(e) => debug!("readiness probe on {} failed: {}", interface, e),
            }
        }

        Err(format!(
            "{} did not reach AP mode after {} attempts",
            interface, self.policy.attempts
        ))
    }

    /// Terminate hostapd and give the radio back in managed mode
    pub async fn stop(&self, net_id: &str, handle: DaemonHandle, interface: &str) -> ApctlResult<()> {
        let result = handle.shutdown(self.policy.stop_grace).await;
        self.cleanup(interface, &self.config_path(net_id)).await;
        result
    }

    async fn cleanup(&self, interface: &str, conf_path: &Path) {
        if let Err(e) = self.restore_interface(interface).await {
            warn!("Failed to restore {} to managed mode: {}", interface, e);
        }
        if let Err(e) = fs::remove_file(conf_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", conf_path.display(), e);
            }
        }
    }

    /// down, type managed, flush, up
    pub async fn restore_interface(&self, interface: &str) -> ApctlResult<()> {
        let _ = self.links.down(interface).await;
        self.wifi.set_type(interface, "managed").await?;
        let _ = self.links.flush_addrs(interface).await;
        self.links.up(interface).await
    }

    /// Associated stations that hold a live DHCP lease
    pub async fn clients(&self, interface: &str, leases: &[DhcpLease]) -> ApctlResult<Vec<ClientInfo>> {
        let macs = self.wifi.station_macs(interface).await?;
        Ok(join_clients(macs, leases))
    }
}

/// A station counts as connected once it is both associated and leased
fn join_clients(macs: Vec<String>, leases: &[DhcpLease]) -> Vec<ClientInfo> {
    macs.into_iter()
        .filter_map(|mac| {
            let ip = leases.iter().find(|l| l.mac == mac)?.ip;
            Some(ClientInfo { mac, ip })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn radio(encryption: Encryption, password: Option<&str>) -> ApRadioConfig {
        ApRadioConfig {
            net_id: "ap-01".to_string(),
            interface: "wlan0".to_string(),
            ssid: "LabNet".to_string(),
            password: password.map(str::to_string),
            channel: 6,
            band: Band::Ghz2_4,
            encryption,
            hidden: false,
            country_code: "US".to_string(),
        }
    }

    #[test]
    fn test_open_has_no_security_stanza() {
        let conf = generate_config(&radio(Encryption::Open, None)).unwrap();
        assert!(conf.contains("interface=wlan0\n"));
        assert!(conf.contains("hw_mode=g\n"));
        assert!(conf.contains("channel=6\n"));
        assert!(!conf.contains("wpa"));
        assert!(!conf.contains("ignore_broadcast_ssid"));
    }

    #[test]
    fn test_wpa2_stanza() {
        let conf = generate_config(&radio(Encryption::Wpa2, Some("testpass123"))).unwrap();
        assert!(conf.contains("wpa=2\n"));
        assert!(conf.contains("wpa_passphrase=testpass123\n"));
        assert!(conf.contains("wpa_key_mgmt=WPA-PSK\n"));
        assert!(!conf.contains("ieee80211w"));
    }

    #[test]
    fn test_wpa3_and_mixed_stanzas() {
        let wpa3 = generate_config(&radio(Encryption::Wpa3, Some("testpass123"))).unwrap();
        assert!(wpa3.contains("wpa_key_mgmt=SAE\n"));
        assert!(wpa3.contains("ieee80211w=2\n"));

        let mixed = generate_config(&radio(Encryption::Wpa2Wpa3, Some("testpass123"))).unwrap();
        assert!(mixed.contains("wpa_key_mgmt=WPA-PSK SAE\n"));
        assert!(mixed.contains("ieee80211w=1\n"));

        let wpa = generate_config(&radio(Encryption::Wpa, Some("testpass123"))).unwrap();
        assert!(wpa.contains("wpa=1\n"));
    }

    #[test]
    fn test_hidden_and_5ghz() {
        let mut config = radio(Encryption::Open, None);
        config.hidden = true;
        config.band = Band::Ghz5;
        config.channel = 36;
        let conf = generate_config(&config).unwrap();
        assert!(conf.contains("ignore_broadcast_ssid=1\n"));
        assert!(conf.contains("hw_mode=a\n"));
    }

    #[test]
    fn test_rejects_injection_and_bad_passwords() {
        let mut config = radio(Encryption::Open, None);
        config.ssid = "Lab\nwpa=0".to_string();
        assert!(generate_config(&config).is_err());

        assert!(generate_config(&radio(Encryption::Wpa2, None)).is_err());
        assert!(generate_config(&radio(Encryption::Open, Some("testpass123"))).is_err());
    }

    #[test]
    fn test_clients_need_a_lease() {
        let leases = vec![DhcpLease {
            mac: "aa:bb:cc:dd:ee:01".to_string(),
            ip: "192.168.120.10".parse().unwrap(),
            expires_at: None,
            hostname: Some("phone".to_string()),
        }];
        let macs = vec!["aa:bb:cc:dd:ee:01".to_string(), "aa:bb:cc:dd:ee:02".to_string()];

        let clients = join_clients(macs, &leases);
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].mac, "aa:bb:cc:dd:ee:01");
        assert_eq!(clients[0].ip, std::net::Ipv4Addr::new(192, 168, 120, 10));
    }
}
