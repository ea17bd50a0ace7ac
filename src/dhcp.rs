//! DHCP server management via dnsmasq
//!
//! One dnsmasq per subnet, DHCP only, bound to the AP interface

use crate::allocator::SubnetAllocation;
use crate::command::{CommandRunner, DaemonHandle, ReadinessPolicy};
use crate::error::{ApctlError, ApctlResult};
use crate::interface::InterfaceController;
use crate::validation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub const DAEMON_NAME: &str = "dnsmasq";

/// One DHCP scope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpConfig {
    pub net_id: String,
    pub interface: String,
    pub addressing: SubnetAllocation,
    pub dns_server: Ipv4Addr,
    /// dnsmasq lease time, e.g. "12h"
    pub lease_time: String,
    pub lease_file: PathBuf,
}

/// One row of the dnsmasq lease table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpLease {
    pub mac: String,
    pub ip: Ipv4Addr,
    /// None for infinite leases
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

pub fn generate_config(config: &DhcpConfig) -> ApctlResult<String> {
    validation::validate_interface_name(&config.interface)?;
    let lease_time = validation::sanitize_config_value(&config.lease_time)?;
    let lease_file = validation::sanitize_config_value(&config.lease_file.to_string_lossy())?;

    let a = &config.addressing;
    let mut conf = String::new();
    conf.push_str(&format!("# apctl dnsmasq config for {}\n", config.net_id));
    conf.push_str(&format!("interface={}\n", config.interface));
    conf.push_str("bind-interfaces\n");
    conf.push_str(&format!("listen-address={}\n", a.gateway));
    conf.push_str("port=0\n");
    conf.push_str(&format!(
        "dhcp-range={},{},{},{}\n",
        a.range_start,
        a.range_end,
        a.netmask(),
        lease_time
    ));
    conf.push_str(&format!("dhcp-option=option:router,{}\n", a.gateway));
    conf.push_str(&format!("dhcp-option=option:dns-server,{}\n", config.dns_server));
    conf.push_str(&format!("dhcp-leasefile={}\n", lease_file));
    conf.push_str("no-resolv\nno-poll\nlog-dhcp\n");

    Ok(conf)
}

/// Parse a dnsmasq lease file, dropping leases that expired before `now`
///
/// `<expiry> <mac> <ip> <hostname> <client-id>`, expiry 0 meaning infinite
pub fn parse_leases(content: &str, now: DateTime<Utc>) -> Vec<DhcpLease> {
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                return None;
            }
            let expiry: i64 = fields[0].parse().ok()?;
            let expires_at = if expiry == 0 {
                None
            } else {
                Some(DateTime::from_timestamp(expiry, 0)?)
            };
            if matches!(expires_at, Some(t) if t <= now) {
                return None;
            }
            let hostname = fields.get(3).filter(|h| **h != "*").map(|h| h.to_string());
            Some(DhcpLease {
                mac: fields[1].to_lowercase(),
                ip: fields[2].parse().ok()?,
                expires_at,
                hostname,
            })
        })
        .collect()
}

pub struct DhcpController {
    runner: Arc<dyn CommandRunner>,
    config_dir: PathBuf,
    dnsmasq_bin: PathBuf,
    policy: ReadinessPolicy,
    links: InterfaceController,
}

impl DhcpController {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        config_dir: PathBuf,
        dnsmasq_bin: PathBuf,
        policy: ReadinessPolicy,
    ) -> Self {
        Self {
            links: InterfaceController::new(Arc::clone(&runner)),
            runner,
            config_dir,
            dnsmasq_bin,
            policy,
        }
    }

    pub fn config_path(&self, net_id: &str) -> PathBuf {
        self.config_dir.join(format!("dnsmasq-{}.conf", net_id))
    }

    pub fn lease_path(&self, net_id: &str) -> PathBuf {
        self.config_dir.join(format!("leases-{}.db", net_id))
    }

    /// Build the scope for one slot
    pub fn scope(
        &self,
        net_id: &str,
        interface: &str,
        addressing: &SubnetAllocation,
        dns_server: Ipv4Addr,
        lease_time: &str,
    ) -> DhcpConfig {
        DhcpConfig {
            net_id: net_id.to_string(),
            interface: interface.to_string(),
            addressing: *addressing,
            dns_server,
            lease_time: lease_time.to_string(),
            lease_file: self.lease_path(net_id),
        }
    }

    pub async fn write_config(&self, config: &DhcpConfig) -> ApctlResult<PathBuf> {
        let conf = generate_config(config)?;
        let path = self.config_path(&config.net_id);
        fs::create_dir_all(&self.config_dir).await?;
        fs::write(&path, conf).await?;
        Ok(path)
    }

    /// Assign the gateway address, launch dnsmasq and check it stays up
    pub async fn start(&self, config: &DhcpConfig) -> ApctlResult<DaemonHandle> {
        let a = &config.addressing;
        if self.links.ensure_address(&config.interface, a.gateway, a.subnet.prefix_len()).await? {
            debug!("assigned {}/{} to {}", a.gateway, a.subnet.prefix_len(), config.interface);
        }
        self.links.up(&config.interface).await?;

        let conf_path = self.write_config(config).await?;
        let bin = self.dnsmasq_bin.to_string_lossy().to_string();
        let conf_arg = format!("--conf-file={}", conf_path.display());

        let test = self.runner.run(&bin, &["--test", &conf_arg]).await?;
        if !test.success() {
            self.remove_files(&config.net_id).await;
            return Err(ApctlError::DaemonStartFailed {
                daemon: DAEMON_NAME.to_string(),
                detail: format!(
                    "config test failed: {}",
                    validation::sanitize_error_message(&test.stderr)
                ),
            });
        }

        let process = match self.runner.spawn(&bin, &["--keep-in-foreground", &conf_arg]).await {
            Ok(process) => process,
            Err(e) => {
                self.remove_files(&config.net_id).await;
                return Err(e);
            }
        };
        let mut handle = DaemonHandle::new(DAEMON_NAME, &config.interface, process);

        sleep(self.policy.interval).await;
        if !handle.is_running() {
            let tail = validation::sanitize_error_message(&handle.stderr_tail());
            if let Err(e) = handle.shutdown(self.policy.stop_grace).await {
                warn!("Failed to reap dnsmasq on {}: {}", config.interface, e);
            }
            self.remove_files(&config.net_id).await;
            return Err(ApctlError::DaemonStartFailed {
                daemon: DAEMON_NAME.to_string(),
                detail: format!("process exited during startup: {}", tail),
            });
        }

        info!(
            "dnsmasq serving {} on {} for {} (pid {:?})",
            a.subnet,
            config.interface,
            config.net_id,
            handle.pid()
        );
        Ok(handle)
    }

    pub async fn stop(&self, net_id: &str, handle: DaemonHandle) -> ApctlResult<()> {
        let result = handle.shutdown(self.policy.stop_grace).await;
        self.remove_files(net_id).await;
        result
    }

    async fn remove_files(&self, net_id: &str) {
        for path in [self.config_path(net_id), self.lease_path(net_id)] {
            if let Err(e) = fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove {}: {}", path.display(), e);
                }
            }
        }
    }

    /// Current leases; an absent lease file means no leases yet
    pub async fn read_leases(&self, net_id: &str) -> ApctlResult<Vec<DhcpLease>> {
        match fs::read_to_string(self.lease_path(net_id)).await {
            Ok(content) => Ok(parse_leases(&content, Utc::now())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{allocate, Ipv4Subnet};

    fn config() -> DhcpConfig {
        let base: Ipv4Subnet = "192.168.120.0/24".parse().unwrap();
        let addressing = allocate(base, &["ap-01", "ap-02"]).unwrap().remove(1);
        DhcpConfig {
            net_id: "ap-02".to_string(),
            interface: "wlan1".to_string(),
            addressing,
            dns_server: Ipv4Addr::new(1, 1, 1, 1),
            lease_time: "12h".to_string(),
            lease_file: PathBuf::from("/run/apctl/leases-ap-02.db"),
        }
    }

    #[test]
    fn test_generate_config() {
        let conf = generate_config(&config()).unwrap();
        assert!(conf.contains("interface=wlan1\n"));
        assert!(conf.contains("listen-address=192.168.121.1\n"));
        assert!(conf.contains("port=0\n"));
        assert!(conf.contains("dhcp-range=192.168.121.10,192.168.121.250,255.255.255.0,12h\n"));
        assert!(conf.contains("dhcp-option=option:router,192.168.121.1\n"));
        assert!(conf.contains("dhcp-option=option:dns-server,1.1.1.1\n"));
        assert!(conf.contains("dhcp-leasefile=/run/apctl/leases-ap-02.db\n"));
    }

    #[test]
    fn test_rejects_injected_lease_time() {
        let mut c = config();
        c.lease_time = "12h\nserver=8.8.8.8".to_string();
        assert!(generate_config(&c).is_err());
    }

    #[test]
    fn test_parse_leases_drops_expired() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let content = "1700003600 AA:BB:CC:DD:EE:01 192.168.120.10 phone 01:aa:bb:cc:dd:ee:01\n\
                       1699999000 aa:bb:cc:dd:ee:02 192.168.120.11 * *\n\
                       0 aa:bb:cc:dd:ee:03 192.168.120.12 * *\n\
                       garbage\n";
        let leases = parse_leases(content, now);
        assert_eq!(leases.len(), 2);
        assert_eq!(leases[0].mac, "aa:bb:cc:dd:ee:01");
        assert_eq!(leases[0].hostname.as_deref(), Some("phone"));
        assert_eq!(leases[1].ip, Ipv4Addr::new(192, 168, 120, 12));
        assert_eq!(leases[1].expires_at, None);
        assert_eq!(leases[1].hostname, None);
    }
}
