//! Forwarding and isolation rules
//!
//! All rule state lives in iptables. Every rule we add carries a comment
//! `apctl:<net_id>:<kind>[:<peer>]`, so removal lists the chains and deletes
//! exactly the rules tagged for one slot. Mutations are serialized by one
//! lock that also guards the IP forwarding reference count.

use crate::allocator::Ipv4Subnet;
use crate::command::CommandRunner;
use crate::config::UpstreamSelector;
use crate::error::{ApctlError, ApctlResult};
use crate::routing::RoutingController;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

pub const TAG_PREFIX: &str = "apctl:";
const PROTECT_TAG: &str = "apctl:protect";
const FORWARDING_KEY: &str = "net.ipv4.ip_forward";
const TABLES: [&str; 2] = ["filter", "nat"];

/// Rule kinds used in tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Nat,
    Isolate,
}

impl RuleKind {
    fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Nat => "nat",
            RuleKind::Isolate => "isolate",
        }
    }
}

pub fn rule_tag(net_id: &str, kind: RuleKind) -> String {
    format!("{}{}:{}", TAG_PREFIX, net_id, kind.as_str())
}

fn peer_tag(net_id: &str, peer: &str) -> String {
    format!("{}:{}", rule_tag(net_id, RuleKind::Isolate), peer)
}

/// Whether `comment` belongs to `net_id`'s rules of `kind`
fn tag_matches(comment: &str, net_id: &str, kind: RuleKind) -> bool {
    let tag = rule_tag(net_id, kind);
    comment == tag || comment.strip_prefix(tag.as_str()).is_some_and(|rest| rest.starts_with(':'))
}

/// One rule: table, chain and match/target arguments
#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    table: &'static str,
    chain: &'static str,
    spec: Vec<String>,
}

impl Rule {
    fn new(table: &'static str, chain: &'static str, spec: &[&str], tag: &str) -> Self {
        let mut spec: Vec<String> = spec.iter().map(|s| s.to_string()).collect();
        spec.extend(["-m", "comment", "--comment", tag].iter().map(|s| s.to_string()));
        Self { table, chain, spec }
    }

    fn args<'a>(&'a self, op: &'a str, position: Option<&'a str>) -> Vec<&'a str> {
        let mut args = vec!["-t", self.table, op, self.chain];
        args.extend(position);
        args.extend(self.spec.iter().map(String::as_str));
        args
    }
}

/// Peer subnet for isolation
#[derive(Debug, Clone)]
pub struct PeerSubnet {
    pub net_id: String,
    pub subnet: Ipv4Subnet,
}

#[derive(Debug, Default)]
struct FirewallState {
    /// Slots with NAT applied
    nat_slots: HashSet<String>,
    /// `net.ipv4.ip_forward` before the first NAT slot
    prior_forwarding: Option<String>,
    protect_installed: bool,
}

pub struct FirewallController {
    runner: Arc<dyn CommandRunner>,
    routing: RoutingController,
    upstream: UpstreamSelector,
    detected_upstream: OnceCell<String>,
    state: Mutex<FirewallState>,
}

impl FirewallController {
    pub fn new(runner: Arc<dyn CommandRunner>, upstream: UpstreamSelector) -> Self {
        Self {
            routing: RoutingController::new(Arc::clone(&runner)),
            runner,
            upstream,
            detected_upstream: OnceCell::new(),
            state: Mutex::new(FirewallState::default()),
        }
    }

    /// Configured upstream, or the default route interface (cached)
    pub async fn upstream_interface(&self) -> ApctlResult<String> {
        match &self.upstream {
            UpstreamSelector::Named(name) => Ok(name.clone()),
            UpstreamSelector::Auto => self
                .detected_upstream
                .get_or_try_init(|| async {
                    let dev = self.routing.default_route_interface().await?;
                    info!("Detected upstream interface {}", dev);
                    Ok::<_, ApctlError>(dev)
                })
                .await
                .cloned(),
        }
    }

    /// Masquerade `subnet` out of the upstream and allow forwarding both ways
    pub async fn apply_nat(&self, net_id: &str, subnet: Ipv4Subnet) -> ApctlResult<()> {
        let mut state = self.state.lock().await;
        let upstream = self.upstream_interface().await.map_err(rule_error)?;

        let first = state.nat_slots.is_empty();
        if first {
            if let Err(e) = self.enable_forwarding(&mut state).await {
                self.restore_forwarding(&mut state).await;
                return Err(rule_error(e));
            }
        }

        let result = self.add_nat_rules(net_id, subnet, &upstream).await;
        if let Err(e) = result {
            warn!("NAT for {} failed, removing partial rules: {}", net_id, e);
            if let Err(e) = self.delete_tagged(net_id, RuleKind::Nat).await {
                warn!("Cleanup of NAT rules for {} failed: {}", net_id, e);
            }
            if first {
                self.restore_forwarding(&mut state).await;
            }
            return Err(rule_error(e));
        }

        state.nat_slots.insert(net_id.to_string());
        info!("NAT enabled for {} ({} via {})", net_id, subnet, upstream);
        Ok(())
    }

    async fn add_nat_rules(&self, net_id: &str, subnet: Ipv4Subnet, upstream: &str) -> ApctlResult<()> {
        let tag = rule_tag(net_id, RuleKind::Nat);
        let src = subnet.to_string();
        let rules = [
            Rule::new("nat", "POSTROUTING", &["-s", &src, "-o", upstream, "-j", "MASQUERADE"], &tag),
            Rule::new("filter", "FORWARD", &["-s", &src, "-o", upstream, "-j", "ACCEPT"], &tag),
            Rule::new(
                "filter",
                "FORWARD",
                &[
                    "-d", &src, "-i", upstream,
                    "-m", "conntrack", "--ctstate", "RELATED,ESTABLISHED",
                    "-j", "ACCEPT",
                ],
                &tag,
            ),
        ];
        for rule in &rules {
            self.ensure_rule(rule, "-A", None).await?;
        }
        Ok(())
    }

    /// Delete this slot's NAT rules; disable forwarding with the last NAT slot
    pub async fn remove_nat(&self, net_id: &str) -> ApctlResult<()> {
        let mut state = self.state.lock().await;
        let result = self.delete_tagged(net_id, RuleKind::Nat).await;

        if state.nat_slots.remove(net_id) && state.nat_slots.is_empty() {
            self.restore_forwarding(&mut state).await;
        }

        let removed = result.map_err(rule_error)?;
        debug!("Removed {} NAT rules for {}", removed, net_id);
        Ok(())
    }

    /// Deny traffic between `subnet` and every peer, both directions
    pub async fn apply_isolation(&self, net_id: &str, subnet: Ipv4Subnet, peers: &[PeerSubnet]) -> ApctlResult<()> {
        let _state = self.state.lock().await;
        let own = subnet.to_string();

        for peer in peers {
            let tag = peer_tag(net_id, &peer.net_id);
            let other = peer.subnet.to_string();
            let rules = [
                Rule::new("filter", "FORWARD", &["-s", &own, "-d", &other, "-j", "DROP"], &tag),
                Rule::new("filter", "FORWARD", &["-s", &other, "-d", &own, "-j", "DROP"], &tag),
            ];
            for rule in &rules {
                if let Err(e) = self.ensure_rule(rule, "-I", Some("1")).await {
                    warn!("Isolation for {} failed, removing partial rules: {}", net_id, e);
                    if let Err(e) = self.delete_tagged(net_id, RuleKind::Isolate).await {
                        warn!("Cleanup of isolation rules for {} failed: {}", net_id, e);
                    }
                    return Err(rule_error(e));
                }
            }
        }

        debug!("Isolated {} from {} peer subnets", net_id, peers.len());
        Ok(())
    }

    pub async fn remove_isolation(&self, net_id: &str) -> ApctlResult<()> {
        let _state = self.state.lock().await;
        let removed = self.delete_tagged(net_id, RuleKind::Isolate).await.map_err(rule_error)?;
        debug!("Removed {} isolation rules for {}", removed, net_id);
        Ok(())
    }

    /// Every rule carrying an apctl tag, as printed by `iptables -S`
    pub async fn tagged_rules(&self) -> ApctlResult<Vec<String>> {
        let mut found = Vec::new();
        for table in TABLES {
            for line in self.list_rules(table).await? {
                let tokens = split_rule(&line);
                if comment_of(&tokens).is_some_and(|c| c.starts_with(TAG_PREFIX)) {
                    found.push(format!("-t {} {}", table, line));
                }
            }
        }
        Ok(found)
    }

    /// Rules tagged for one slot
    pub async fn rules_for(&self, net_id: &str) -> ApctlResult<Vec<String>> {
        let prefix = format!("{}{}:", TAG_PREFIX, net_id);
        Ok(self
            .tagged_rules()
            .await?
            .into_iter()
            .filter(|rule| {
                comment_of(&split_rule(rule)).is_some_and(|c| c.starts_with(&prefix))
            })
            .collect())
    }

    async fn ensure_rule(&self, rule: &Rule, op: &str, position: Option<&str>) -> ApctlResult<()> {
        let check = self.runner.run("iptables", &rule.args("-C", None)).await?;
        if check.success() {
            return Ok(());
        }
        self.runner.output("iptables", &rule.args(op, position)).await.map(|_| ())
    }

    async fn list_rules(&self, table: &str) -> ApctlResult<Vec<String>> {
        let out = self.runner.output("iptables", &["-t", table, "-S"]).await?;
        Ok(out.lines().map(str::to_string).collect())
    }

    /// Delete every rule of `kind` tagged with `net_id`; returns how many went
    async fn delete_tagged(&self, net_id: &str, kind: RuleKind) -> ApctlResult<usize> {
        let mut removed = 0;
        let mut first_error = None;

        for table in TABLES {
            for line in self.list_rules(table).await? {
                let tokens = split_rule(&line);
                if tokens.first().map(String::as_str) != Some("-A") {
                    continue;
                }
                if !comment_of(&tokens).is_some_and(|c| tag_matches(c, net_id, kind)) {
                    continue;
                }

                let mut args = vec!["-t", table, "-D"];
                args.extend(tokens[1..].iter().map(String::as_str));
                match self.runner.output("iptables", &args).await {
                    Ok(_) => removed += 1,
                    Err(e) => {
                        warn!("Failed to delete rule '{}': {}", line, e);
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    async fn enable_forwarding(&self, state: &mut FirewallState) -> ApctlResult<()> {
        let prior = self.runner.output("sysctl", &["-n", FORWARDING_KEY]).await?.trim().to_string();
        if prior != "1" {
            self.runner.output("sysctl", &["-w", &format!("{}=1", FORWARDING_KEY)]).await?;
            info!("IP forwarding enabled (was {})", prior);
        }
        state.prior_forwarding = Some(prior);

        if !state.protect_installed && self.forward_policy_is_drop().await {
            let protect = Rule::new(
                "filter",
                "FORWARD",
                &["-m", "conntrack", "--ctstate", "ESTABLISHED,RELATED", "-j", "ACCEPT"],
                PROTECT_TAG,
            );
            warn!("FORWARD policy is DROP, accepting established sessions first");
            self.ensure_rule(&protect, "-I", Some("1")).await?;
            state.protect_installed = true;
        }
        Ok(())
    }

    async fn restore_forwarding(&self, state: &mut FirewallState) {
        if let Some(prior) = state.prior_forwarding.take() {
            if prior != "1" {
                match self.runner.output("sysctl", &["-w", &format!("{}={}", FORWARDING_KEY, prior)]).await {
                    Ok(_) => info!("IP forwarding restored to {}", prior),
                    Err(e) => warn!("Failed to restore IP forwarding: {}", e),
                }
            }
        }

        if state.protect_installed {
            let protect = Rule::new(
                "filter",
                "FORWARD",
                &["-m", "conntrack", "--ctstate", "ESTABLISHED,RELATED", "-j", "ACCEPT"],
                PROTECT_TAG,
            );
            match self.runner.output("iptables", &protect.args("-D", None)).await {
                Ok(_) => state.protect_installed = false,
                Err(e) => warn!("Failed to remove established-session rule: {}", e),
            }
        }
    }

    async fn forward_policy_is_drop(&self) -> bool {
        match self.runner.output("iptables", &["-S", "FORWARD"]).await {
            Ok(out) => out.lines().any(|l| l.trim() == "-P FORWARD DROP"),
            Err(e) => {
                warn!("Could not read FORWARD policy: {}", e);
                false
            }
        }
    }
}

fn rule_error(e: ApctlError) -> ApctlError {
    match e {
        ApctlError::RuleApplyFailed(_) => e,
        other => ApctlError::RuleApplyFailed(other.to_string()),
    }
}

/// Split an `iptables -S` line, honouring double quotes
fn split_rule(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut in_token = false;

    for c in line.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

fn comment_of(tokens: &[String]) -> Option<&str> {
    tokens
        .iter()
        .position(|t| t == "--comment")
        .and_then(|i| tokens.get(i + 1))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulate::SimulatedHost;

    #[test]
    fn test_split_rule_handles_quotes() {
        let tokens = split_rule(r#"-A FORWARD -s 192.168.120.0/24 -m comment --comment "apctl:ap-01:nat" -j ACCEPT"#);
        assert_eq!(tokens[0], "-A");
        assert_eq!(comment_of(&tokens), Some("apctl:ap-01:nat"));
        assert_eq!(tokens.last().map(String::as_str), Some("ACCEPT"));

        let spaced = split_rule(r#"-A FORWARD -m comment --comment "two words" -j DROP"#);
        assert_eq!(comment_of(&spaced), Some("two words"));
    }

    #[test]
    fn test_tag_matching_is_exact_per_slot() {
        assert!(tag_matches("apctl:ap-01:nat", "ap-01", RuleKind::Nat));
        assert!(tag_matches("apctl:ap-01:isolate:ap-02", "ap-01", RuleKind::Isolate));
        assert!(!tag_matches("apctl:ap-01:nat", "ap-01", RuleKind::Isolate));
        assert!(!tag_matches("apctl:ap-010:nat", "ap-01", RuleKind::Nat));
        assert!(!tag_matches("apctl:ap-02:isolate:ap-01", "ap-01", RuleKind::Isolate));
        assert!(!tag_matches("apctl:ap-01:natx", "ap-01", RuleKind::Nat));
    }

    #[test]
    fn test_rule_args() {
        let rule = Rule::new("nat", "POSTROUTING", &["-s", "10.0.0.0/24", "-j", "MASQUERADE"], "apctl:x:nat");
        assert_eq!(
            rule.args("-C", None).join(" "),
            "-t nat -C POSTROUTING -s 10.0.0.0/24 -j MASQUERADE -m comment --comment apctl:x:nat"
        );
        assert_eq!(rule.args("-I", Some("1"))[4], "1");
    }

    fn controller(host: &SimulatedHost) -> FirewallController {
        FirewallController::new(Arc::new(host.clone()), UpstreamSelector::Auto)
    }

    fn subnet(s: &str) -> Ipv4Subnet {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_forwarding_restored_when_protect_insert_fails() {
        let host = SimulatedHost::new(&["wlan0"]);
        host.set_policy("filter", "FORWARD", "DROP");
        host.fail_command("iptables -t filter -I FORWARD 1 -m conntrack");
        let firewall = controller(&host);

        let err = firewall.apply_nat("ap-01", subnet("192.168.120.0/24")).await.unwrap_err();
        assert_eq!(err.condition(), "RuleApplyFailed");
        assert_eq!(host.sysctl("net.ipv4.ip_forward").as_deref(), Some("0"));
        assert_eq!(host.rule_count(), 0);

        // the saved value must still be the original one on the next attempt
        host.clear_failures();
        firewall.apply_nat("ap-01", subnet("192.168.120.0/24")).await.unwrap();
        assert_eq!(host.sysctl("net.ipv4.ip_forward").as_deref(), Some("1"));
        firewall.remove_nat("ap-01").await.unwrap();
        assert_eq!(host.sysctl("net.ipv4.ip_forward").as_deref(), Some("0"));
        assert_eq!(host.rule_count(), 0);
    }

    #[tokio::test]
    async fn test_rules_for_one_slot() {
        let host = SimulatedHost::new(&["wlan0", "wlan1"]);
        let firewall = controller(&host);
        let peer = PeerSubnet { net_id: "ap-01".to_string(), subnet: subnet("192.168.120.0/24") };

        firewall.apply_nat("ap-01", subnet("192.168.120.0/24")).await.unwrap();
        firewall.apply_isolation("ap-02", subnet("192.168.121.0/24"), &[peer]).await.unwrap();

        let own = firewall.rules_for("ap-01").await.unwrap();
        assert_eq!(own.len(), 3);
        assert!(own.iter().all(|r| r.contains("apctl:ap-01:nat")));
        assert!(own.iter().any(|r| r.starts_with("-t nat ") && r.contains("MASQUERADE")));

        let peer_rules = firewall.rules_for("ap-02").await.unwrap();
        assert_eq!(peer_rules.len(), 2);
        assert!(peer_rules.iter().all(|r| r.contains("apctl:ap-02:isolate:ap-01")));
        assert_eq!(firewall.tagged_rules().await.unwrap().len(), 5);
    }
}
