//! Access-Point Control Daemon (apctld)
//!
//! Owns the configured radios for the lifetime of the process: validates
//! them at startup, expires networks whose lifetime ran out, and tears every
//! network down on SIGTERM/SIGINT. SIGHUP logs a health report.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (requires root/sudo)
//! sudo apctld --config /etc/apctl/apctl.toml
//!
//! # Bring networks up at boot
//! sudo apctld --autostart /etc/apctl/autostart.json
//!
//! # Dry run against an in-memory host
//! apctld --simulate --verbose
//! ```

use clap::Parser;
use libapctl::config::ApctlConfig;
use libapctl::error::{ApctlError, ApctlResult};
use libapctl::{CommandRunner, HealthStatus, NetworkManager, NetworkParams, SimulatedHost, SystemRunner};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Access-Point Control Daemon
#[derive(Parser, Debug)]
#[command(name = "apctld")]
#[command(author = "apctl contributors")]
#[command(version)]
#[command(about = "Access-Point Control Daemon - manages short-lived WiFi access points", long_about = None)]
struct Args {
    /// Configuration file (default: $APCTL_CONFIG or /etc/apctl/apctl.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run against a simulated host instead of the real system
    #[arg(long)]
    simulate: bool,

    /// JSON object of net_id -> network parameters to start at boot
    #[arg(long)]
    autostart: Option<PathBuf>,
}

/// Shared state for signal handling
struct DaemonState {
    /// Whether the daemon should continue running
    running: Arc<RwLock<bool>>,
}

impl DaemonState {
    fn new() -> Self {
        Self {
            running: Arc::new(RwLock::new(true)),
        }
    }

    async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        info!("Daemon stop requested");
    }
}

#[tokio::main]
async fn main() -> ApctlResult<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Access-Point Control Daemon (apctld)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config_path = ApctlConfig::resolve_path(args.config.clone());
    let config = match ApctlConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("✗ {}", e);
            return Err(e);
        }
    };
    info!("Loaded configuration from {}", config_path.display());

    let runner: Arc<dyn CommandRunner> = if args.simulate {
        warn!("Simulation mode: no command reaches the host");
        Arc::new(SimulatedHost::for_config(&config))
    } else {
        #[cfg(target_os = "linux")]
        {
            // SAFETY: getuid(2) has no preconditions
            let uid = unsafe { libc::getuid() };
            if uid != 0 {
                warn!("⚠️  Not running as root - hostapd, iptables and sysctl will fail");
            }
        }
        Arc::new(SystemRunner::new())
    };

    config.ensure_directories()?;
    let expiry_interval = config.daemons.expiry_interval();
    let manager = Arc::new(NetworkManager::new(config, runner)?);

    if let Err(e) = manager.check_radios().await {
        error!("✗ Radio check failed: {}", e);
        return Err(e);
    }
    info!("✓ All configured radios support AP mode");

    match manager.leftover_rules().await {
        Ok(rules) if !rules.is_empty() => {
            warn!("⚠️  {} apctl rules left over from a previous run:", rules.len());
            for rule in &rules {
                warn!("   {}", rule);
            }
        }
        Ok(_) => {}
        Err(e) => warn!("Could not list firewall rules: {}", e),
    }

    let state = Arc::new(DaemonState::new());
    let state_clone = state.clone();
    let manager_clone = manager.clone();
    tokio::spawn(async move {
        if let Err(e) = handle_signals(state_clone, manager_clone).await {
            error!("Signal handler error: {}", e);
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let expiry = manager.spawn_expiry_loop(expiry_interval, shutdown_rx);

    if let Some(path) = &args.autostart {
        autostart(&manager, path).await;
    }

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  Access-Point Control Daemon is ready");
    info!("  Networks:");
    for slot in manager.list_slots().await {
        info!("    • {:<16} {:<10} {}  ({})", slot.net_id, slot.interface, slot.addressing.subnet, slot.state);
    }
    info!("  Expiry scan every {}s", expiry_interval.as_secs());
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    // Main daemon loop
    while state.is_running().await {
        tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
    }

    info!("Shutting down Access-Point Control Daemon...");
    let _ = shutdown_tx.send(true);
    if let Err(e) = expiry.await {
        warn!("Expiry loop ended abnormally: {}", e);
    }

    for (net_id, result) in manager.shutdown_all().await {
        match result {
            Ok(outcome) => info!("  {} {:?}", net_id, outcome),
            Err(e) => error!("  {}: {}", net_id, e),
        }
    }

    info!("Access-Point Control Daemon stopped");
    Ok(())
}

/// Start the networks listed in an autostart file; failures are logged
async fn autostart(manager: &NetworkManager, path: &Path) {
    let parsed = std::fs::read_to_string(path)
        .map_err(ApctlError::from)
        .and_then(|content| {
            serde_json::from_str::<BTreeMap<String, NetworkParams>>(&content).map_err(ApctlError::from)
        });

    let entries = match parsed {
        Ok(entries) => entries,
        Err(e) => {
            error!("✗ Autostart file {}: {}", path.display(), e);
            return;
        }
    };

    for (net_id, params) in entries {
        match manager.start(&net_id, params).await {
            Ok(info) => info!("✓ Autostarted {} (ssid {}, expires {})", net_id, info.ssid, info.expires_at),
            Err(e) => error!("✗ Autostart of {} failed [{}]: {}", net_id, e.condition(), e),
        }
    }
}

/// Initialize logging based on command-line arguments
fn init_logging(args: &Args) {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            EnvFilter::new(format!("apctld={},libapctl={}", log_level, log_level))
        });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(atty::is(atty::Stream::Stdout))
        .init();
}

/// Handle Unix signals (SIGTERM, SIGINT stop; SIGHUP logs a health report)
async fn handle_signals(state: Arc<DaemonState>, manager: Arc<NetworkManager>) -> ApctlResult<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
                state.stop().await;
                return Ok(());
            }
            _ = sigint.recv() => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                state.stop().await;
                return Ok(());
            }
            _ = sighup.recv() => {
                let health = manager.health().await;
                info!(
                    "Received SIGHUP, health {} ({}/{} networks active)",
                    health.status, health.active_networks, health.configured_networks
                );
                for slot in &health.networks {
                    info!(
                        "  {}: {} (hostapd {}, dnsmasq {}, internet {})",
                        slot.net_id, slot.state, slot.ap_running, slot.dhcp_running, slot.internet_enabled
                    );
                }
                let upstream = &health.upstream;
                info!(
                    "  upstream {}: up {}, address {}, NAT rules {}",
                    upstream.name.as_deref().unwrap_or("?"),
                    upstream.up,
                    upstream.has_ip,
                    health.nat.rules
                );
                if health.status == HealthStatus::Degraded {
                    warn!("⚠️  Service degraded");
                }
            }
        }
    }
}
