//! Routing table queries

use crate::command::CommandRunner;
use crate::error::{ApctlError, ApctlResult};
use std::sync::Arc;

pub struct RoutingController {
    runner: Arc<dyn CommandRunner>,
}

impl RoutingController {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Interface carrying the IPv4 default route
    pub async fn default_route_interface(&self) -> ApctlResult<String> {
        let output = self.runner.output("ip", &["-4", "route", "show", "default"]).await?;
        parse_default_dev(&output).ok_or_else(|| ApctlError::CommandFailed {
            cmd: "ip -4 route show default".to_string(),
            code: None,
            stderr: "no default route found".to_string(),
        })
    }
}

/// `default via 192.168.1.1 dev eth0 proto dhcp metric 100`
fn parse_default_dev(output: &str) -> Option<String> {
    output
        .lines()
        .filter(|line| line.trim_start().starts_with("default"))
        .find_map(|line| {
            let mut words = line.split_whitespace();
            words.find(|w| *w == "dev")?;
            words.next().map(str::to_string)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_dev() {
        assert_eq!(
            parse_default_dev("default via 192.168.1.1 dev eth0 proto dhcp metric 100\n"),
            Some("eth0".to_string())
        );
        assert_eq!(
            parse_default_dev("default dev ppp0 scope link\ndefault via 10.0.0.1 dev eth1 metric 600\n"),
            Some("ppp0".to_string())
        );
        assert_eq!(parse_default_dev(""), None);
    }
}
