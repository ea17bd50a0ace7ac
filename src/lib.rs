//! apctl - WiFi Access-Point Lifecycle Library
//!
//! Async library that turns configured radios into short-lived access points:
//! - Command execution and daemon supervision
//! - Subnet allocation per network
//! - Access Point (hostapd)
//! - DHCP server (dnsmasq)
//! - NAT and isolation rules (iptables)
//! - Lifecycle manager with automatic expiry
//!
//! Includes an in-memory simulated host for dry runs and tests.

pub mod error;
pub mod validation;
pub mod command;
pub mod config;
pub mod allocator;
pub mod network;
pub mod interface;
pub mod wifi;
pub mod hostapd;
pub mod dhcp;
pub mod routing;
pub mod firewall;
pub mod manager;
pub mod simulate;

// Re-export commonly used types
pub use error::{ApctlError, ApctlResult, TeardownStep};
pub use command::{CommandOutput, CommandRunner, DaemonHandle, ManagedProcess, ReadinessPolicy, SystemRunner};
pub use config::{ApctlConfig, NetworkEntry, UpstreamSelector};
pub use allocator::{Ipv4Subnet, SubnetAllocation};
pub use network::{
    Band, ClientInfo, DaemonHealth, Encryption, HealthReport, HealthStatus, InstanceInfo,
    NatHealth, NetworkParams, NetworkStatus, SlotHealth, SlotState, SlotSummary, StopOutcome,
    UpstreamHealth,
};
pub use interface::InterfaceController;
pub use wifi::{TxPowerReport, WifiController, WifiDeviceInfo};
pub use hostapd::{ApRadioConfig, HostapdController};
pub use dhcp::{DhcpConfig, DhcpController, DhcpLease};
pub use routing::RoutingController;
pub use firewall::FirewallController;
pub use manager::NetworkManager;
pub use simulate::SimulatedHost;
