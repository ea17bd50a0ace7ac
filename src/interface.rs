//! Network interface control
//!
//! Link and address management using the ip command

use crate::command::CommandRunner;
use crate::error::ApctlResult;
use crate::validation;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Interface controller
pub struct InterfaceController {
    runner: Arc<dyn CommandRunner>,
}

impl InterfaceController {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Whether the kernel knows the interface
    pub async fn exists(&self, interface: &str) -> ApctlResult<bool> {
        validation::validate_interface_name(interface)?;
        let out = self.runner.run("ip", &["link", "show", "dev", interface]).await?;
        Ok(out.success())
    }

    /// Whether the link is administratively and operationally up
    pub async fn is_up(&self, interface: &str) -> ApctlResult<bool> {
        validation::validate_interface_name(interface)?;
        let out = self.runner.output("ip", &["link", "show", "dev", interface]).await?;
        Ok(link_is_up(&out))
    }

    /// Bring interface up
    pub async fn up(&self, interface: &str) -> ApctlResult<()> {
        validation::validate_interface_name(interface)?;
        self.run_ip(&["link", "set", "dev", interface, "up"]).await
    }

    /// Bring interface down
    pub async fn down(&self, interface: &str) -> ApctlResult<()> {
        validation::validate_interface_name(interface)?;
        self.run_ip(&["link", "set", "dev", interface, "down"]).await
    }

    /// Remove every address from the interface
    pub async fn flush_addrs(&self, interface: &str) -> ApctlResult<()> {
        validation::validate_interface_name(interface)?;
        self.run_ip(&["addr", "flush", "dev", interface]).await
    }

    /// IPv4 addresses currently assigned
    pub async fn addresses(&self, interface: &str) -> ApctlResult<Vec<Ipv4Addr>> {
        validation::validate_interface_name(interface)?;
        let output = self.runner.output("ip", &["-4", "-o", "addr", "show", "dev", interface]).await?;
        Ok(parse_inet_addrs(&output))
    }

    /// Add `address/prefix_len` unless it is already present
    pub async fn ensure_address(&self, interface: &str, address: Ipv4Addr, prefix_len: u8) -> ApctlResult<bool> {
        if self.addresses(interface).await?.contains(&address) {
            return Ok(false);
        }
        let cidr = format!("{}/{}", address, prefix_len);
        self.run_ip(&["addr", "add", &cidr, "dev", interface]).await?;
        Ok(true)
    }

    async fn run_ip(&self, args: &[&str]) -> ApctlResult<()> {
        self.runner.output("ip", args).await.map(|_| ())
    }
}

/// `3: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 ... state UP ...`
///
/// Tunnels report `state UNKNOWN`; for those the UP flag decides.
fn link_is_up(output: &str) -> bool {
    let words: Vec<&str> = output.split_whitespace().collect();
    let state = words
        .windows(2)
        .find(|w| w[0] == "state")
        .map(|w| w[1]);
    let flag_up = output
        .split_once('<')
        .and_then(|(_, rest)| rest.split_once('>'))
        .is_some_and(|(flags, _)| flags.split(',').any(|f| f == "UP"));

    match state {
        Some("UP") => true,
        Some("UNKNOWN") => flag_up,
        _ => false,
    }
}

/// Parse `ip -4 -o addr show` output
///
/// `3: wlan0    inet 192.168.120.1/24 scope global wlan0\       valid_lft forever ...`
fn parse_inet_addrs(output: &str) -> Vec<Ipv4Addr> {
    output
        .lines()
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            words.find(|w| *w == "inet")?;
            let cidr = words.next()?;
            cidr.split('/').next()?.parse().ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inet_addrs() {
        let output = "3: wlan0    inet 192.168.120.1/24 scope global wlan0\\       valid_lft forever preferred_lft forever\n\
                      3: wlan0    inet 10.0.0.5/8 scope global secondary wlan0\n";
        assert_eq!(
            parse_inet_addrs(output),
            vec![Ipv4Addr::new(192, 168, 120, 1), Ipv4Addr::new(10, 0, 0, 5)]
        );
        assert!(parse_inet_addrs("").is_empty());
    }

    #[test]
    fn test_link_is_up() {
        assert!(link_is_up("2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq state UP mode DEFAULT"));
        assert!(!link_is_up("2: eth0: <NO-CARRIER,BROADCAST,MULTICAST,UP> mtu 1500 qdisc fq state DOWN mode DEFAULT"));
        assert!(link_is_up("5: tun0: <POINTOPOINT,MULTICAST,NOARP,UP,LOWER_UP> mtu 1500 state UNKNOWN"));
        assert!(!link_is_up("5: tun0: <POINTOPOINT,NOARP> mtu 1500 state UNKNOWN"));
    }
}
