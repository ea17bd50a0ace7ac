//! apcli - Access-Point Control CLI Tool
//!
//! Offline operator tool: validates configuration and renders the daemon
//! configuration a Start would write, without touching the host.

use clap::{Parser, Subcommand, ValueEnum};
use libapctl::config::ApctlConfig;
use libapctl::dhcp::{self, DhcpConfig};
use libapctl::error::{ApctlError, ApctlResult};
use libapctl::hostapd::{self, ApRadioConfig};
use libapctl::network::{Band, Encryption, NetworkParams};
use libapctl::wifi;
use serde_json::json;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "apcli")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Access-Point Control CLI - inspect apctl configuration offline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: $APCTL_CONFIG or /etc/apctl/apctl.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum BandArg {
    #[value(name = "2.4ghz")]
    Ghz2_4,
    #[value(name = "5ghz")]
    Ghz5,
}

impl From<BandArg> for Band {
    fn from(value: BandArg) -> Self {
        match value {
            BandArg::Ghz2_4 => Band::Ghz2_4,
            BandArg::Ghz5 => Band::Ghz5,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum EncryptionArg {
    Open,
    Wpa,
    Wpa2,
    Wpa3,
    #[value(name = "wpa2-wpa3")]
    Wpa2Wpa3,
}

impl From<EncryptionArg> for Encryption {
    fn from(value: EncryptionArg) -> Self {
        match value {
            EncryptionArg::Open => Encryption::Open,
            EncryptionArg::Wpa => Encryption::Wpa,
            EncryptionArg::Wpa2 => Encryption::Wpa2,
            EncryptionArg::Wpa3 => Encryption::Wpa3,
            EncryptionArg::Wpa2Wpa3 => Encryption::Wpa2Wpa3,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and show the subnet of every network
    Check,

    /// Print the hostapd.conf a Start would write
    RenderAp {
        /// Network identifier
        net_id: String,
        #[arg(long)]
        ssid: String,
        #[arg(long)]
        channel: u8,
        #[arg(long, value_enum, default_value = "2.4ghz")]
        band: BandArg,
        #[arg(long, value_enum, default_value = "wpa2")]
        encryption: EncryptionArg,
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        hidden: bool,
    },

    /// Print the dnsmasq configuration a Start would write
    RenderDhcp {
        /// Network identifier
        net_id: String,
    },

    /// Show the dBm of each TX power level for a channel maximum
    TxLevels {
        /// Regulatory maximum of the channel, in dBm
        #[arg(long)]
        max_dbm: f64,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Check => handle_check(&cli),
        Commands::RenderAp { net_id, ssid, channel, band, encryption, password, hidden } => {
            let params = NetworkParams {
                ssid: ssid.clone(),
                channel: *channel,
                band: (*band).into(),
                encryption: (*encryption).into(),
                password: password.clone(),
                hidden: *hidden,
                timeout: None,
                internet_enabled: None,
                tx_power_level: 4,
            };
            handle_render_ap(&cli, net_id, &params)
        }
        Commands::RenderDhcp { net_id } => handle_render_dhcp(&cli, net_id),
        Commands::TxLevels { max_dbm } => handle_tx_levels(&cli, *max_dbm),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn load_config(cli: &Cli) -> ApctlResult<ApctlConfig> {
    ApctlConfig::load(ApctlConfig::resolve_path(cli.config.clone()))
}

fn entry<'a>(config: &'a ApctlConfig, net_id: &str) -> ApctlResult<(usize, &'a str)> {
    config
        .networks
        .iter()
        .enumerate()
        .find(|(_, n)| n.net_id == net_id)
        .map(|(i, n)| (i, n.interface.as_str()))
        .ok_or_else(|| ApctlError::UnknownNetwork(net_id.to_string()))
}

fn handle_check(cli: &Cli) -> ApctlResult<()> {
    let config = load_config(cli)?;
    let allocations = config.allocations()?;

    if cli.json {
        let networks: Vec<_> = config
            .networks
            .iter()
            .zip(&allocations)
            .map(|(n, a)| json!({ "net_id": n.net_id, "interface": n.interface, "addressing": a }))
            .collect();
        let out = json!({
            "valid": true,
            "upstream_interface": String::from(config.upstream_interface.clone()),
            "timeouts": config.timeouts,
            "networks": networks,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Configuration OK ({} networks)", config.networks.len());
    println!("{:<16} {:<10} {:<20} {:<16} DHCP RANGE", "NET_ID", "INTERFACE", "SUBNET", "GATEWAY");
    for (n, a) in config.networks.iter().zip(&allocations) {
        println!(
            "{:<16} {:<10} {:<20} {:<16} {}-{}",
            n.net_id,
            n.interface,
            a.subnet.to_string(),
            a.gateway.to_string(),
            a.range_start,
            a.range_end
        );
    }
    println!(
        "Timeouts: default {}s, min {}s, max {}s",
        config.timeouts.default, config.timeouts.min, config.timeouts.max
    );
    Ok(())
}

fn handle_render_ap(cli: &Cli, net_id: &str, params: &NetworkParams) -> ApctlResult<()> {
    let config = load_config(cli)?;
    let (_, interface) = entry(&config, net_id)?;
    params.validate()?;

    let radio = ApRadioConfig::from_params(net_id, interface, params, &config.country_code);
    let rendered = hostapd::generate_config(&radio)?;

    if cli.json {
        let path = config.paths.runtime_dir.join(format!("hostapd-{}.conf", net_id));
        println!("{}", serde_json::to_string_pretty(&json!({ "path": path, "config": rendered }))?);
    } else {
        print!("{}", rendered);
    }
    Ok(())
}

fn handle_render_dhcp(cli: &Cli, net_id: &str) -> ApctlResult<()> {
    let config = load_config(cli)?;
    let (index, interface) = entry(&config, net_id)?;
    let allocations = config.allocations()?;
    let runtime_dir = &config.paths.runtime_dir;

    let scope = DhcpConfig {
        net_id: net_id.to_string(),
        interface: interface.to_string(),
        addressing: allocations[index],
        dns_server: config.dns_server,
        lease_time: config.daemons.lease_time.clone(),
        lease_file: runtime_dir.join(format!("leases-{}.db", net_id)),
    };
    let rendered = dhcp::generate_config(&scope)?;

    if cli.json {
        let path = runtime_dir.join(format!("dnsmasq-{}.conf", net_id));
        println!("{}", serde_json::to_string_pretty(&json!({ "path": path, "config": rendered }))?);
    } else {
        print!("{}", rendered);
    }
    Ok(())
}

fn handle_tx_levels(cli: &Cli, max_dbm: f64) -> ApctlResult<()> {
    if !(max_dbm.is_finite() && max_dbm > 0.0) {
        return Err(ApctlError::ValidationFailed("max-dbm must be a positive number".to_string()));
    }
    let table = wifi::level_table(max_dbm);

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&table)?);
    } else {
        for (level, dbm) in &table {
            println!("level {}: {:.1} dBm ({} mBm)", level, dbm, (dbm * 100.0).round() as i64);
        }
    }
    Ok(())
}
