//! Subnet allocation for configured networks
//!
//! Each configured net_id gets its own /24 carved out of a base /24 by
//! adding its ordinal position to the third octet. The result depends only
//! on configuration order, so a restart with the same configuration yields
//! the same subnets.

use crate::error::{ApctlError, ApctlResult};
use crate::validation;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

const PREFIX_LEN: u8 = 24;
const GATEWAY_HOST: u8 = 1;
const RANGE_START_HOST: u8 = 10;
const RANGE_END_HOST: u8 = 250;

/// A /24 IPv4 network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Subnet {
    network: Ipv4Addr,
}

impl Ipv4Subnet {
    /// Build from any address inside the /24
    pub fn containing(addr: Ipv4Addr) -> Self {
        let [a, b, c, _] = addr.octets();
        Self { network: Ipv4Addr::new(a, b, c, 0) }
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        PREFIX_LEN
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::new(255, 255, 255, 0)
    }

    pub fn host(&self, last: u8) -> Ipv4Addr {
        let [a, b, c, _] = self.network.octets();
        Ipv4Addr::new(a, b, c, last)
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        Self::containing(addr) == *self
    }

    /// The /24 `offset` positions above this one, if the third octet allows it
    pub fn offset(&self, offset: usize) -> Option<Self> {
        let [a, b, c, _] = self.network.octets();
        let third = c as usize + offset;
        if third > u8::MAX as usize {
            return None;
        }
        Some(Self { network: Ipv4Addr::new(a, b, third as u8, 0) })
    }
}

impl fmt::Display for Ipv4Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, PREFIX_LEN)
    }
}

impl FromStr for Ipv4Subnet {
    type Err = ApctlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(|| {
            ApctlError::ConfigError(format!("Invalid network '{}': expected CIDR notation", s))
        })?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| ApctlError::ConfigError(format!("Invalid network address in '{}'", s)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| ApctlError::ConfigError(format!("Invalid prefix length in '{}'", s)))?;
        if prefix != PREFIX_LEN {
            return Err(ApctlError::ConfigError(format!(
                "Base network must be a /{} network, got /{}",
                PREFIX_LEN, prefix
            )));
        }
        Ok(Self::containing(addr))
    }
}

impl TryFrom<String> for Ipv4Subnet {
    type Error = ApctlError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Ipv4Subnet> for String {
    fn from(value: Ipv4Subnet) -> Self {
        value.to_string()
    }
}

/// Address facts for one slot, computed once at configuration load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetAllocation {
    pub subnet: Ipv4Subnet,
    pub gateway: Ipv4Addr,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
}

impl SubnetAllocation {
    fn for_subnet(subnet: Ipv4Subnet) -> Self {
        Self {
            subnet,
            gateway: subnet.host(GATEWAY_HOST),
            range_start: subnet.host(RANGE_START_HOST),
            range_end: subnet.host(RANGE_END_HOST),
        }
    }

    pub fn netmask(&self) -> Ipv4Addr {
        self.subnet.netmask()
    }
}

/// Allocate one subnet per net_id, in the given order
///
/// Fails when a net_id is malformed or repeated, or when the base network
/// has no room for all of them.
pub fn allocate(base: Ipv4Subnet, net_ids: &[&str]) -> ApctlResult<Vec<SubnetAllocation>> {
    let mut seen = HashSet::new();
    for net_id in net_ids {
        validation::validate_net_id(net_id).map_err(|e| ApctlError::ConfigError(e.to_string()))?;
        if !seen.insert(*net_id) {
            return Err(ApctlError::ConfigError(format!("Duplicate net_id '{}'", net_id)));
        }
    }

    net_ids
        .iter()
        .enumerate()
        .map(|(index, net_id)| {
            base.offset(index).map(SubnetAllocation::for_subnet).ok_or_else(|| {
                ApctlError::ConfigError(format!(
                    "Too many networks ({}) for base network {}: no room for '{}'",
                    net_ids.len(),
                    base,
                    net_id
                ))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Ipv4Subnet {
        "192.168.120.0/24".parse().unwrap()
    }

    #[test]
    fn test_two_networks_scenario() {
        let allocs = allocate(base(), &["ap-01", "ap-02"]).unwrap();
        assert_eq!(allocs[0].subnet.to_string(), "192.168.120.0/24");
        assert_eq!(allocs[0].gateway, Ipv4Addr::new(192, 168, 120, 1));
        assert_eq!(allocs[1].subnet.to_string(), "192.168.121.0/24");
        assert_eq!(allocs[1].gateway, Ipv4Addr::new(192, 168, 121, 1));
        assert_eq!(allocs[1].range_start, Ipv4Addr::new(192, 168, 121, 10));
        assert_eq!(allocs[1].range_end, Ipv4Addr::new(192, 168, 121, 250));
    }

    #[test]
    fn test_allocations_disjoint_and_deterministic() {
        let ids: Vec<String> = (0..20).map(|i| format!("net-{}", i)).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let first = allocate(base(), &refs).unwrap();
        let second = allocate(base(), &refs).unwrap();
        assert_eq!(first, second);

        let unique: HashSet<_> = first.iter().map(|a| a.subnet).collect();
        assert_eq!(unique.len(), first.len());
        for a in &first {
            for b in &first {
                if a.subnet != b.subnet {
                    assert!(!a.subnet.contains(b.gateway));
                }
            }
        }
    }

    #[test]
    fn test_overflow_rejected() {
        let base: Ipv4Subnet = "10.0.254.0/24".parse().unwrap();
        assert!(allocate(base, &["a", "b"]).is_ok());
        let err = allocate(base, &["a", "b", "c"]).unwrap_err();
        assert!(err.to_string().contains("Too many networks"));
    }

    #[test]
    fn test_bad_ids_rejected() {
        assert!(allocate(base(), &["ap-01", "ap-01"]).is_err());
        assert!(allocate(base(), &["AP01"]).is_err());
        assert!(allocate(base(), &["this-id-is-far-too-long"]).is_err());
    }

    #[test]
    fn test_base_must_be_slash_24() {
        assert!("192.168.0.0/16".parse::<Ipv4Subnet>().is_err());
        assert!("192.168.1.77/24".parse::<Ipv4Subnet>().unwrap().network() == Ipv4Addr::new(192, 168, 1, 0));
        assert!("not-a-network".parse::<Ipv4Subnet>().is_err());
    }
}
