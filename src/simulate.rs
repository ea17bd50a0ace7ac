//! In-memory host for dry runs and tests
//!
//! [`SimulatedHost`] answers the same commands the controllers issue (ip,
//! iw, iptables, sysctl, hostapd, dnsmasq) against an in-memory model of
//! the machine. `apctld --simulate` runs on it, and the integration tests
//! use its inspection helpers and failure switches.

use crate::command::{format_command, CommandOutput, CommandRunner, ManagedProcess};
use crate::config::{ApctlConfig, UpstreamSelector};
use crate::error::{ApctlError, ApctlResult};
use crate::network::Band;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Duration;
use tracing::debug;

const FILTER_CHAINS: &[&str] = &["INPUT", "FORWARD", "OUTPUT"];
const NAT_CHAINS: &[&str] = &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"];

#[derive(Debug, Clone)]
struct SimInterface {
    wiphy: u32,
    wireless: bool,
    up: bool,
    type_: String,
    addrs: Vec<(Ipv4Addr, u8)>,
    txpower_dbm: f64,
    stations: Vec<String>,
}

#[derive(Debug, Clone)]
struct SimRule {
    table: String,
    chain: String,
    spec: Vec<String>,
}

#[derive(Debug)]
struct SimProcessRecord {
    program: String,
    args: Vec<String>,
    interface: Option<String>,
    alive: Arc<AtomicBool>,
}

#[derive(Debug)]
struct HostState {
    interfaces: BTreeMap<String, SimInterface>,
    rules: Vec<SimRule>,
    policies: HashMap<(String, String), String>,
    sysctl: HashMap<String, String>,
    default_route: Option<String>,
    channel_max_dbm: f64,
    ignore_txpower: bool,
    ap_never_ready: bool,
    exit_on_start: Vec<String>,
    failing: Vec<String>,
    processes: Vec<SimProcessRecord>,
    commands: Vec<String>,
    next_pid: u32,
}

impl Default for HostState {
    fn default() -> Self {
        let mut policies = HashMap::new();
        for chain in FILTER_CHAINS {
            policies.insert(("filter".to_string(), chain.to_string()), "ACCEPT".to_string());
        }
        for chain in NAT_CHAINS {
            policies.insert(("nat".to_string(), chain.to_string()), "ACCEPT".to_string());
        }
        let mut sysctl = HashMap::new();
        sysctl.insert("net.ipv4.ip_forward".to_string(), "0".to_string());

        Self {
            interfaces: BTreeMap::new(),
            rules: Vec::new(),
            policies,
            sysctl,
            default_route: None,
            channel_max_dbm: 20.0,
            ignore_txpower: false,
            ap_never_ready: false,
            exit_on_start: Vec::new(),
            failing: Vec::new(),
            processes: Vec::new(),
            commands: Vec::new(),
            next_pid: 4000,
        }
    }
}

/// Simulated machine implementing [`CommandRunner`]
#[derive(Debug, Clone, Default)]
pub struct SimulatedHost {
    state: Arc<Mutex<HostState>>,
}

impl SimulatedHost {
    /// A host with the given radios and a wired `eth0` carrying the default route
    pub fn new(radios: &[&str]) -> Self {
        let host = Self::default();
        {
            let mut s = host.lock();
            for (n, radio) in radios.iter().enumerate() {
                s.interfaces.insert(radio.to_string(), SimInterface::radio(n as u32));
            }
            s.interfaces.insert("eth0".to_string(), SimInterface::wired());
            s.default_route = Some("eth0".to_string());
        }
        host
    }

    /// A host with every radio the configuration names
    pub fn for_config(config: &ApctlConfig) -> Self {
        let radios: Vec<&str> = config.networks.iter().map(|n| n.interface.as_str()).collect();
        let host = Self::new(&radios);
        if let UpstreamSelector::Named(name) = &config.upstream_interface {
            host.lock().interfaces.entry(name.clone()).or_insert_with(SimInterface::wired);
        }
        host
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// hostapd starts but the radio never reports AP mode
    pub fn set_ap_never_ready(&self, never: bool) {
        self.lock().ap_never_ready = never;
    }

    /// Spawned programs whose name ends with `program` exit immediately
    pub fn exit_on_start(&self, program: &str) {
        self.lock().exit_on_start.push(program.to_string());
    }

    /// Commands starting with `prefix` fail with exit code 1
    pub fn fail_command(&self, prefix: &str) {
        self.lock().failing.push(prefix.to_string());
    }

    pub fn clear_failures(&self) {
        let mut s = self.lock();
        s.failing.clear();
        s.exit_on_start.clear();
        s.ap_never_ready = false;
    }

    /// The driver accepts txpower commands but keeps its old value
    pub fn set_ignore_txpower(&self, ignore: bool) {
        self.lock().ignore_txpower = ignore;
    }

    pub fn set_channel_max_dbm(&self, dbm: f64) {
        self.lock().channel_max_dbm = dbm;
    }

    pub fn set_default_route(&self, interface: Option<&str>) {
        self.lock().default_route = interface.map(str::to_string);
    }

    pub fn set_policy(&self, table: &str, chain: &str, policy: &str) {
        self.lock()
            .policies
            .insert((table.to_string(), chain.to_string()), policy.to_string());
    }

    pub fn add_station(&self, interface: &str, mac: &str) {
        if let Some(iface) = self.lock().interfaces.get_mut(interface) {
            iface.stations.push(mac.to_string());
        }
    }

    pub fn sysctl(&self, key: &str) -> Option<String> {
        self.lock().sysctl.get(key).cloned()
    }

    pub fn set_sysctl(&self, key: &str, value: &str) {
        self.lock().sysctl.insert(key.to_string(), value.to_string());
    }

    pub fn txpower_dbm(&self, interface: &str) -> Option<f64> {
        self.lock().interfaces.get(interface).map(|i| i.txpower_dbm)
    }

    pub fn interface_type(&self, interface: &str) -> Option<String> {
        self.lock().interfaces.get(interface).map(|i| i.type_.clone())
    }

    pub fn addresses(&self, interface: &str) -> Vec<Ipv4Addr> {
        self.lock()
            .interfaces
            .get(interface)
            .map(|i| i.addrs.iter().map(|(a, _)| *a).collect())
            .unwrap_or_default()
    }

    /// Rules in `table`, formatted like `iptables -S`
    pub fn rules(&self, table: &str) -> Vec<String> {
        let s = self.lock();
        s.rules
            .iter()
            .filter(|r| r.table == table)
            .map(|r| format!("-A {} {}", r.chain, quote_spec(&r.spec)))
            .collect()
    }

    /// Rules in any table whose comment starts with `apctl:<net_id>:`
    pub fn tagged_rule_count(&self, net_id: &str) -> usize {
        let prefix = format!("apctl:{}:", net_id);
        self.lock()
            .rules
            .iter()
            .filter(|r| comment(&r.spec).is_some_and(|c| c.starts_with(&prefix)))
            .count()
    }

    pub fn rule_count(&self) -> usize {
        self.lock().rules.len()
    }

    /// How many times a program was spawned
    pub fn spawn_count(&self, program: &str) -> usize {
        self.lock()
            .processes
            .iter()
            .filter(|p| p.program.ends_with(program))
            .count()
    }

    /// Live processes of `program`
    pub fn running(&self, program: &str) -> usize {
        self.lock()
            .processes
            .iter()
            .filter(|p| p.program.ends_with(program) && p.alive.load(Ordering::SeqCst))
            .count()
    }

    /// Arguments of the most recent spawn of `program`
    pub fn last_spawn_args(&self, program: &str) -> Option<Vec<String>> {
        self.lock()
            .processes
            .iter()
            .rev()
            .find(|p| p.program.ends_with(program))
            .map(|p| p.args.clone())
    }

    /// Every command run so far, formatted
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    fn execute(&self, program: &str, args: &[&str]) -> CommandOutput {
        let mut s = self.lock();
        let line = format_command(program, args);
        s.commands.push(line.clone());

        if s.failing.iter().any(|prefix| line.starts_with(prefix.as_str())) {
            return failure("simulated failure");
        }

        let name = program_name(program);
        match name.as_str() {
            "ip" => s.ip(args),
            "iw" => s.iw(args),
            "iptables" => s.iptables(args),
            "sysctl" => s.sysctl(args),
            "dnsmasq" | "hostapd" => ok(""),
            _ => failure(&format!("{}: command not found", program)),
        }
    }
}

#[async_trait]
impl CommandRunner for SimulatedHost {
    async fn run(&self, program: &str, args: &[&str]) -> ApctlResult<CommandOutput> {
        debug!("sim exec: {}", format_command(program, args));
        Ok(self.execute(program, args))
    }

    async fn spawn(&self, program: &str, args: &[&str]) -> ApctlResult<Box<dyn ManagedProcess>> {
        debug!("sim spawn: {}", format_command(program, args));
        let mut s = self.lock();
        let line = format_command(program, args);
        s.commands.push(line.clone());

        if s.failing.iter().any(|prefix| line.starts_with(prefix.as_str())) {
            return Err(ApctlError::DaemonStartFailed {
                daemon: program_name(program),
                detail: "simulated spawn failure".to_string(),
            });
        }

        let interface = args.iter().find_map(|arg| {
            let path = arg.strip_prefix("--conf-file=").unwrap_or(arg);
            interface_from_conf(Path::new(path))
        });
        let exits = s.exit_on_start.iter().any(|p| program.ends_with(p.as_str()));
        let alive = Arc::new(AtomicBool::new(!exits));
        let pid = s.next_pid;
        s.next_pid += 1;

        s.processes.push(SimProcessRecord {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            interface,
            alive: Arc::clone(&alive),
        });

        let stderr = if exits {
            format!("{}: simulated startup failure\n", program_name(program))
        } else {
            String::new()
        };
        Ok(Box::new(SimProcess { pid, alive, stderr }))
    }
}

struct SimProcess {
    pid: u32,
    alive: Arc<AtomicBool>,
    stderr: String,
}

#[async_trait]
impl ManagedProcess for SimProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn is_running(&mut self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn terminate(&mut self, _grace: Duration) -> ApctlResult<()> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stderr_tail(&self) -> String {
        self.stderr.clone()
    }
}

impl SimInterface {
    fn radio(wiphy: u32) -> Self {
        Self {
            wiphy,
            wireless: true,
            up: false,
            type_: "managed".to_string(),
            addrs: Vec::new(),
            txpower_dbm: 20.0,
            stations: Vec::new(),
        }
    }

    fn wired() -> Self {
        Self {
            wiphy: 0,
            wireless: false,
            up: true,
            type_: String::new(),
            addrs: vec![(Ipv4Addr::new(192, 168, 1, 50), 24)],
            txpower_dbm: 0.0,
            stations: Vec::new(),
        }
    }
}

impl HostState {
    fn iface(&mut self, name: &str) -> Result<&mut SimInterface, CommandOutput> {
        self.interfaces
            .get_mut(name)
            .ok_or_else(|| failure(&format!("Device \"{}\" does not exist.", name)))
    }

    fn ap_active(&self, interface: &str) -> bool {
        !self.ap_never_ready
            && self.processes.iter().any(|p| {
                p.program.ends_with("hostapd")
                    && p.interface.as_deref() == Some(interface)
                    && p.alive.load(Ordering::SeqCst)
            })
    }

    fn ip(&mut self, args: &[&str]) -> CommandOutput {
        match args {
            ["link", "show", "dev", name] => match self.iface(name) {
                Ok(i) => ok(&format!("3: {}: <BROADCAST> state {}\n", name, if i.up { "UP" } else { "DOWN" })),
                Err(e) => e,
            },
            ["link", "set", "dev", name, state] => match self.iface(name) {
                Ok(i) => {
                    i.up = *state == "up";
                    ok("")
                }
                Err(e) => e,
            },
            ["addr", "flush", "dev", name] => match self.iface(name) {
                Ok(i) => {
                    i.addrs.clear();
                    ok("")
                }
                Err(e) => e,
            },
            ["addr", "add", cidr, "dev", name] => {
                let parsed = cidr
                    .split_once('/')
                    .and_then(|(a, p)| Some((a.parse::<Ipv4Addr>().ok()?, p.parse::<u8>().ok()?)));
                match (parsed, self.iface(name)) {
                    (Some(entry), Ok(i)) => {
                        if i.addrs.iter().any(|(a, _)| *a == entry.0) {
                            return failure("RTNETLINK answers: File exists");
                        }
                        i.addrs.push(entry);
                        ok("")
                    }
                    (None, _) => failure(&format!("Error: invalid address \"{}\"", cidr)),
                    (_, Err(e)) => e,
                }
            }
            ["-4", "-o", "addr", "show", "dev", name] => match self.iface(name) {
                Ok(i) => ok(&i
                    .addrs
                    .iter()
                    .map(|(a, p)| format!("3: {}    inet {}/{} scope global {}\n", name, a, p, name))
                    .collect::<String>()),
                Err(e) => e,
            },
            ["-4", "route", "show", "default"] => match &self.default_route {
                Some(dev) => ok(&format!("default via 192.168.1.1 dev {} proto dhcp metric 100\n", dev)),
                None => ok(""),
            },
            _ => failure("ip: unsupported arguments"),
        }
    }

    fn iw(&mut self, args: &[&str]) -> CommandOutput {
        match args {
            ["dev", name, "info"] => {
                let ap = self.ap_active(name);
                match self.iface(name) {
                    Ok(i) if i.wireless => {
                        let type_ = if ap { "AP".to_string() } else { i.type_.clone() };
                        ok(&format!(
                            "Interface {}\n\tifindex 3\n\ttype {}\n\twiphy {}\n\ttxpower {:.2} dBm\n",
                            name, type_, i.wiphy, i.txpower_dbm
                        ))
                    }
                    Ok(_) => failure("command failed: No such device (-19)"),
                    Err(e) => e,
                }
            }
            ["dev", name, "set", "type", type_] => match self.iface(name) {
                Ok(i) if i.wireless => {
                    i.type_ = type_.trim_start_matches("__").to_string();
                    ok("")
                }
                Ok(_) => failure("command failed: Operation not supported (-95)"),
                Err(e) => e,
            },
            ["dev", name, "station", "dump"] => match self.iface(name) {
                Ok(i) => ok(&i
                    .stations
                    .iter()
                    .map(|mac| format!("Station {} (on {})\n\tinactive time:\t10 ms\n", mac, name))
                    .collect::<String>()),
                Err(e) => e,
            },
            ["dev", name, "set", "txpower", "fixed", mbm] => {
                let ignore = self.ignore_txpower;
                let Ok(mbm) = mbm.parse::<f64>() else {
                    return failure("invalid txpower");
                };
                match self.iface(name) {
                    Ok(i) => {
                        if !ignore {
                            i.txpower_dbm = mbm / 100.0;
                        }
                        ok("")
                    }
                    Err(e) => e,
                }
            }
            ["phy", phy, "info"] => {
                let known = self
                    .interfaces
                    .values()
                    .any(|i| i.wireless && format!("phy{}", i.wiphy) == *phy);
                if known {
                    ok(&phy_info(phy, self.channel_max_dbm))
                } else {
                    failure("command failed: No such file or directory (-2)")
                }
            }
            _ => failure("iw: unsupported arguments"),
        }
    }

    fn sysctl(&mut self, args: &[&str]) -> CommandOutput {
        match args {
            ["-n", key] => match self.sysctl.get(*key) {
                Some(v) => ok(&format!("{}\n", v)),
                None => failure(&format!("sysctl: cannot stat /proc/sys/{}", key.replace('.', "/"))),
            },
            ["-w", assignment] => match assignment.split_once('=') {
                Some((k, v)) => {
                    self.sysctl.insert(k.to_string(), v.to_string());
                    ok(&format!("{} = {}\n", k, v))
                }
                None => failure("sysctl: malformed setting"),
            },
            _ => failure("sysctl: unsupported arguments"),
        }
    }

    fn iptables(&mut self, args: &[&str]) -> CommandOutput {
        let (table, rest) = match args {
            ["-t", table, rest @ ..] => (table.to_string(), rest),
            rest => ("filter".to_string(), rest),
        };
        let chains = match table.as_str() {
            "filter" => FILTER_CHAINS,
            "nat" => NAT_CHAINS,
            _ => return failure(&format!("iptables: can't initialize table `{}'", table)),
        };

        let Some((op, rest)) = rest.split_first() else {
            return failure("iptables: no command specified");
        };

        if *op == "-S" {
            let wanted: Vec<&str> = match rest.first() {
                Some(chain) => vec![*chain],
                None => chains.to_vec(),
            };
            let mut out = String::new();
            for chain in &wanted {
                let policy = self
                    .policies
                    .get(&(table.clone(), chain.to_string()))
                    .cloned()
                    .unwrap_or_else(|| "ACCEPT".to_string());
                out.push_str(&format!("-P {} {}\n", chain, policy));
            }
            for chain in &wanted {
                for rule in self.rules.iter().filter(|r| r.table == table && r.chain == *chain) {
                    out.push_str(&format!("-A {} {}\n", rule.chain, quote_spec(&rule.spec)));
                }
            }
            return ok(&out);
        }

        let Some((chain, mut spec)) = rest.split_first() else {
            return failure("iptables: chain required");
        };
        if !chains.contains(chain) {
            return failure(&format!("iptables: No chain/target/match by that name ({})", chain));
        }

        let mut position = None;
        if *op == "-I" {
            if let Some(n) = spec.first().and_then(|s| s.parse::<usize>().ok()) {
                position = Some(n);
                spec = &spec[1..];
            }
        }

        let spec: Vec<String> = spec.iter().map(|s| s.to_string()).collect();
        let found = self
            .rules
            .iter()
            .position(|r| r.table == table && r.chain == *chain && r.spec == spec);

        match *op {
            "-C" => match found {
                Some(_) => ok(""),
                None => failure("iptables: Bad rule (does a matching rule exist in that chain?)."),
            },
            "-D" => match found {
                Some(index) => {
                    self.rules.remove(index);
                    ok("")
                }
                None => failure("iptables: Bad rule (does a matching rule exist in that chain?)."),
            },
            "-A" => {
                self.rules.push(SimRule { table, chain: chain.to_string(), spec });
                ok("")
            }
            "-I" => {
                let at = position.unwrap_or(1).saturating_sub(1);
                let index = self
                    .rules
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| r.table == table && r.chain == *chain)
                    .nth(at)
                    .map(|(i, _)| i)
                    .unwrap_or(self.rules.len());
                self.rules.insert(index, SimRule { table, chain: chain.to_string(), spec });
                ok("")
            }
            _ => failure(&format!("iptables: unsupported option {}", op)),
        }
    }
}

fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        code: Some(0),
    }
}

fn failure(stderr: &str) -> CommandOutput {
    CommandOutput {
        stdout: String::new(),
        stderr: format!("{}\n", stderr),
        code: Some(1),
    }
}

fn program_name(program: &str) -> String {
    Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| program.to_string())
}

fn interface_from_conf(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    content
        .lines()
        .find_map(|line| line.strip_prefix("interface="))
        .map(|s| s.trim().to_string())
}

fn comment(spec: &[String]) -> Option<&str> {
    spec.iter()
        .position(|t| t == "--comment")
        .and_then(|i| spec.get(i + 1))
        .map(String::as_str)
}

/// Render a rule spec the way `iptables -S` does, comments quoted
fn quote_spec(spec: &[String]) -> String {
    let mut out = Vec::with_capacity(spec.len());
    let mut quote_next = false;
    for token in spec {
        if quote_next {
            out.push(format!("\"{}\"", token));
        } else {
            out.push(token.clone());
        }
        quote_next = token == "--comment";
    }
    out.join(" ")
}

fn phy_info(phy: &str, max_dbm: f64) -> String {
    let mut out = format!(
        "Wiphy {}\n\tSupported interface modes:\n\t\t * managed\n\t\t * AP\n\t\t * monitor\n",
        phy
    );
    out.push_str("\tBand 1:\n\t\tFrequencies:\n");
    for ch in Band::Ghz2_4.allowed_channels() {
        let freq = if *ch == 14 { 2484 } else { 2407 + 5 * *ch as u32 };
        out.push_str(&format!("\t\t\t* {} MHz [{}] ({:.1} dBm)\n", freq, ch, max_dbm));
    }
    out.push_str("\tBand 2:\n\t\tFrequencies:\n");
    for ch in Band::Ghz5.allowed_channels() {
        out.push_str(&format!("\t\t\t* {} MHz [{}] ({:.1} dBm)\n", 5000 + 5 * *ch as u32, ch, max_dbm));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_iptables_check_append_delete() {
        let host = SimulatedHost::new(&["wlan0"]);
        let rule = ["-t", "nat", "-C", "POSTROUTING", "-s", "10.0.0.0/24", "-j", "MASQUERADE"];
        assert!(!host.run("iptables", &rule).await.unwrap().success());

        let mut append = rule;
        append[2] = "-A";
        assert!(host.run("iptables", &append).await.unwrap().success());
        assert!(host.run("iptables", &rule).await.unwrap().success());
        assert_eq!(host.rules("nat").len(), 1);

        let mut delete = rule;
        delete[2] = "-D";
        assert!(host.run("iptables", &delete).await.unwrap().success());
        assert_eq!(host.rule_count(), 0);
    }

    #[tokio::test]
    async fn test_listing_quotes_comments() {
        let host = SimulatedHost::new(&["wlan0"]);
        host.output(
            "iptables",
            &["-I", "FORWARD", "1", "-s", "10.0.0.0/24", "-m", "comment", "--comment", "apctl:ap-01:nat", "-j", "ACCEPT"],
        )
        .await
        .unwrap();
        let listing = host.output("iptables", &["-t", "filter", "-S"]).await.unwrap();
        assert!(listing.contains("-P FORWARD ACCEPT"));
        assert!(listing.contains("--comment \"apctl:ap-01:nat\""));
        assert_eq!(host.tagged_rule_count("ap-01"), 1);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let host = SimulatedHost::new(&["wlan0"]);
        host.fail_command("sysctl -w");
        assert!(host.output("sysctl", &["-w", "net.ipv4.ip_forward=1"]).await.is_err());
        assert_eq!(host.sysctl("net.ipv4.ip_forward").as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn test_spawned_process_lifecycle() {
        let host = SimulatedHost::new(&["wlan0"]);
        let mut process = host.spawn("/usr/sbin/dnsmasq", &["--keep-in-foreground"]).await.unwrap();
        assert!(process.is_running());
        assert_eq!(host.running("dnsmasq"), 1);
        process.terminate(Duration::from_millis(10)).await.unwrap();
        assert_eq!(host.running("dnsmasq"), 0);
        assert_eq!(host.spawn_count("dnsmasq"), 1);
    }
}
