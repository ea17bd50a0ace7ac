//! Network lifecycle manager
//!
//! One state machine per configured net_id. Every state-changing operation
//! takes the slot's mutex with `try_lock`, so a second request against a
//! slot that is mid-operation fails `Busy` instead of queueing. Status reads
//! go through a published view and never touch the mutex.

use crate::allocator::SubnetAllocation;
use crate::command::{CommandRunner, DaemonHandle, ReadinessPolicy};
use crate::config::ApctlConfig;
use crate::dhcp::DhcpController;
use crate::error::{ApctlError, ApctlResult, TeardownStep};
use crate::firewall::{rule_tag, FirewallController, PeerSubnet, RuleKind};
use crate::hostapd::{ApRadioConfig, HostapdController};
use crate::interface::InterfaceController;
use crate::network::{
    DaemonHealth, HealthReport, HealthStatus, InstanceInfo, NatHealth, NetworkParams, NetworkStatus,
    SlotHealth, SlotState, SlotSummary, StopOutcome, UpstreamHealth,
};
use crate::validation;
use crate::wifi::{TxPowerReport, WifiController};
use chrono::{DateTime, TimeDelta, Utc};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What a Start has brought up so far; teardown undoes exactly this
#[derive(Debug, Default)]
struct Resources {
    ap: Option<DaemonHandle>,
    dhcp: Option<DaemonHandle>,
}

#[derive(Debug)]
struct NetworkInstance {
    info: InstanceInfo,
    resources: Resources,
}

#[derive(Debug, Clone)]
struct SlotView {
    state: SlotState,
    info: Option<InstanceInfo>,
}

struct Slot {
    net_id: String,
    interface: String,
    addressing: SubnetAllocation,
    instance: Mutex<Option<NetworkInstance>>,
    view: RwLock<SlotView>,
}

impl Slot {
    async fn publish(&self, state: SlotState, info: Option<InstanceInfo>) {
        *self.view.write().await = SlotView { state, info };
    }

    async fn snapshot(&self) -> SlotView {
        self.view.read().await.clone()
    }

    fn try_acquire(&self) -> ApctlResult<MutexGuard<'_, Option<NetworkInstance>>> {
        self.instance
            .try_lock()
            .map_err(|_| ApctlError::Busy(self.net_id.clone()))
    }
}

/// Creation time and expiry deadline for a lifetime starting now
fn deadline(lifetime: TimeDelta) -> ApctlResult<(DateTime<Utc>, DateTime<Utc>)> {
    let created_at = Utc::now();
    created_at
        .checked_add_signed(lifetime)
        .map(|expires_at| (created_at, expires_at))
        .ok_or_else(|| {
            ApctlError::ValidationFailed(format!(
                "Timeout of {}s puts the deadline out of range",
                lifetime.num_seconds()
            ))
        })
}

/// Owns every slot and the controllers that act on them
pub struct NetworkManager {
    config: ApctlConfig,
    slots: Vec<Arc<Slot>>,
    hostapd: HostapdController,
    dhcp: DhcpController,
    firewall: FirewallController,
    wifi: WifiController,
    links: InterfaceController,
}

impl NetworkManager {
    pub fn new(config: ApctlConfig, runner: Arc<dyn CommandRunner>) -> ApctlResult<Self> {
        config.validate()?;
        let allocations = config.allocations()?;

        let slots = config
            .networks
            .iter()
            .zip(allocations)
            .map(|(entry, addressing)| {
                Arc::new(Slot {
                    net_id: entry.net_id.clone(),
                    interface: entry.interface.clone(),
                    addressing,
                    instance: Mutex::new(None),
                    view: RwLock::new(SlotView { state: SlotState::Inactive, info: None }),
                })
            })
            .collect();

        let d = &config.daemons;
        let policy = ReadinessPolicy {
            attempts: d.ready_attempts,
            interval: d.ready_interval(),
            stop_grace: d.stop_grace(),
        };
        let runtime_dir = config.paths.runtime_dir.clone();

        Ok(Self {
            hostapd: HostapdController::new(Arc::clone(&runner), runtime_dir.clone(), d.hostapd.clone(), policy),
            dhcp: DhcpController::new(Arc::clone(&runner), runtime_dir, d.dnsmasq.clone(), policy),
            firewall: FirewallController::new(Arc::clone(&runner), config.upstream_interface.clone()),
            wifi: WifiController::new(Arc::clone(&runner)),
            links: InterfaceController::new(runner),
            slots,
            config,
        })
    }

    pub fn config(&self) -> &ApctlConfig {
        &self.config
    }

    fn slot(&self, net_id: &str) -> ApctlResult<&Arc<Slot>> {
        self.slots
            .iter()
            .find(|s| s.net_id == net_id)
            .ok_or_else(|| ApctlError::UnknownNetwork(net_id.to_string()))
    }

    /// Check that every configured radio exists and can run an AP
    pub async fn check_radios(&self) -> ApctlResult<()> {
        for slot in &self.slots {
            if !self.links.exists(&slot.interface).await? {
                return Err(ApctlError::ConfigError(format!(
                    "Interface {} for {} does not exist",
                    slot.interface, slot.net_id
                )));
            }
            if !self.wifi.supports_ap_mode(&slot.interface).await? {
                return Err(ApctlError::ConfigError(format!(
                    "Interface {} for {} does not support AP mode",
                    slot.interface, slot.net_id
                )));
            }
        }
        Ok(())
    }

    /// Rules tagged by apctl that are present right now
    pub async fn leftover_rules(&self) -> ApctlResult<Vec<String>> {
        self.firewall.tagged_rules().await
    }

    /// Bring a network up on an inactive slot
    pub async fn start(&self, net_id: &str, params: NetworkParams) -> ApctlResult<InstanceInfo> {
        let slot = self.slot(net_id)?;
        let mut guard = slot.try_acquire()?;
        if guard.is_some() {
            return Err(ApctlError::AlreadyActive(net_id.to_string()));
        }
        params.validate()?;

        let instance_id = Uuid::new_v4();
        let internet_enabled = params.internet_enabled.unwrap_or(self.config.internet_enabled_by_default);
        let lifetime = self.config.timeouts.lifetime(params.timeout)?;
        deadline(lifetime)?;
        info!(
            "Starting {} on {} (instance {}, ssid {}, channel {}, {})",
            net_id, slot.interface, instance_id, params.ssid, params.channel, params.band
        );
        slot.publish(SlotState::Starting, None).await;

        let mut resources = Resources::default();
        let brought_up = self
            .bring_up(slot, &params, internet_enabled, &mut resources)
            .await
            .and_then(|()| deadline(lifetime));
        let (created_at, expires_at) = match brought_up {
            Ok(times) => times,
            Err(e) => {
                error!("Start of {} failed: {}", net_id, e);
                let steps = self.teardown(slot, resources).await;
                for step in steps.iter().filter(|s| !s.succeeded()) {
                    warn!("Rollback step {} for {} failed: {:?}", step.step, net_id, step.error);
                }
                slot.publish(SlotState::Inactive, None).await;
                return Err(e);
            }
        };

        let mut info = InstanceInfo {
            instance_id,
            ssid: params.ssid.clone(),
            channel: params.channel,
            band: params.band,
            encryption: params.encryption,
            password: params.password.clone(),
            hidden: params.hidden,
            tx_power_level: params.tx_power_level,
            internet_enabled,
            created_at,
            expires_at,
            ap_pid: resources.ap.as_ref().and_then(DaemonHandle::pid),
            dhcp_pid: resources.dhcp.as_ref().and_then(DaemonHandle::pid),
            tx_power_warning: None,
        };

        info.tx_power_warning = match self
            .wifi
            .apply_tx_power(&slot.interface, params.channel, params.tx_power_level, Some(self.config.daemons.tx_power_settle()))
            .await
        {
            Ok(report) => report.warning,
            Err(e) => {
                warn!("TX power level {} not applied on {}: {}", params.tx_power_level, slot.interface, e);
                Some(format!("TX power level {} not applied: {}", params.tx_power_level, e))
            }
        };

        *guard = Some(NetworkInstance { info: info.clone(), resources });
        slot.publish(SlotState::Active, Some(info.clone())).await;
        info!("{} active until {} (instance {})", net_id, info.expires_at, instance_id);
        Ok(info)
    }

    async fn bring_up(
        &self,
        slot: &Slot,
        params: &NetworkParams,
        internet_enabled: bool,
        resources: &mut Resources,
    ) -> ApctlResult<()> {
        let radio = ApRadioConfig::from_params(&slot.net_id, &slot.interface, params, &self.config.country_code);
        resources.ap = Some(self.hostapd.start(&radio).await?);

        let scope = self.dhcp.scope(
            &slot.net_id,
            &slot.interface,
            &slot.addressing,
            self.config.dns_server,
            &self.config.daemons.lease_time,
        );
        resources.dhcp = Some(self.dhcp.start(&scope).await?);

        let peers: Vec<PeerSubnet> = self
            .slots
            .iter()
            .filter(|s| s.net_id != slot.net_id)
            .map(|s| PeerSubnet { net_id: s.net_id.clone(), subnet: s.addressing.subnet })
            .collect();
        self.firewall.apply_isolation(&slot.net_id, slot.addressing.subnet, &peers).await?;

        if internet_enabled {
            self.firewall.apply_nat(&slot.net_id, slot.addressing.subnet).await?;
        }
        Ok(())
    }

    /// Rules, then DHCP, then AP; every step runs even if an earlier one failed
    async fn teardown(&self, slot: &Slot, resources: Resources) -> Vec<TeardownStep> {
        let mut steps = Vec::with_capacity(4);
        let net_id = slot.net_id.as_str();

        steps.push(match self.firewall.remove_nat(net_id).await {
            Ok(()) => TeardownStep::ok("remove-nat"),
            Err(e) => TeardownStep::failed("remove-nat", e),
        });
        steps.push(match self.firewall.remove_isolation(net_id).await {
            Ok(()) => TeardownStep::ok("remove-isolation"),
            Err(e) => TeardownStep::failed("remove-isolation", e),
        });
        if let Some(handle) = resources.dhcp {
            steps.push(match self.dhcp.stop(net_id, handle).await {
                Ok(()) => TeardownStep::ok("stop-dhcp"),
                Err(e) => TeardownStep::failed("stop-dhcp", e),
            });
        }
        if let Some(handle) = resources.ap {
            steps.push(match self.hostapd.stop(net_id, handle, &slot.interface).await {
                Ok(()) => TeardownStep::ok("stop-ap"),
                Err(e) => TeardownStep::failed("stop-ap", e),
            });
        }

        steps
    }

    /// Tear a network down; stopping an inactive slot succeeds
    pub async fn stop(&self, net_id: &str) -> ApctlResult<StopOutcome> {
        let slot = self.slot(net_id)?;
        let guard = slot.try_acquire()?;
        self.stop_locked(slot, guard).await
    }

    async fn stop_locked(
        &self,
        slot: &Slot,
        mut guard: MutexGuard<'_, Option<NetworkInstance>>,
    ) -> ApctlResult<StopOutcome> {
        let Some(instance) = guard.take() else {
            return Ok(StopOutcome::AlreadyInactive);
        };

        let instance_id = instance.info.instance_id;
        info!("Stopping {} (instance {})", slot.net_id, instance_id);
        slot.publish(SlotState::Stopping, Some(instance.info)).await;

        let steps = self.teardown(slot, instance.resources).await;
        slot.publish(SlotState::Inactive, None).await;

        if steps.iter().any(|s| !s.succeeded()) {
            for step in steps.iter().filter(|s| !s.succeeded()) {
                warn!("Teardown step {} for {} failed: {:?}", step.step, slot.net_id, step.error);
            }
            return Err(ApctlError::PartialTeardown { net_id: slot.net_id.clone(), steps });
        }

        info!("{} stopped (instance {})", slot.net_id, instance_id);
        Ok(StopOutcome::Stopped)
    }

    /// Read-only snapshot with live clients and leases
    pub async fn status(&self, net_id: &str) -> ApctlResult<NetworkStatus> {
        let slot = self.slot(net_id)?;
        let view = slot.snapshot().await;
        let mut status = NetworkStatus {
            net_id: slot.net_id.clone(),
            interface: slot.interface.clone(),
            state: view.state,
            addressing: slot.addressing,
            instance: None,
            expires_in: None,
            clients: Vec::new(),
            leases: Vec::new(),
        };

        if let (SlotState::Active, Some(info)) = (view.state, view.info) {
            status.leases = self.dhcp.read_leases(net_id).await.unwrap_or_else(|e| {
                warn!("Could not read leases for {}: {}", net_id, e);
                Vec::new()
            });
            status.clients = self
                .hostapd
                .clients(&slot.interface, &status.leases)
                .await
                .unwrap_or_else(|e| {
                    warn!("Could not list stations on {}: {}", slot.interface, e);
                    Vec::new()
                });
            status.expires_in = Some(info.expires_in(Utc::now()));
            status.instance = Some(info);
        }

        Ok(status)
    }

    /// Toggle NAT for an active network
    pub async fn set_internet_enabled(&self, net_id: &str, enabled: bool) -> ApctlResult<InstanceInfo> {
        let slot = self.slot(net_id)?;
        let mut guard = slot.try_acquire()?;
        let instance = guard.as_mut().ok_or_else(|| ApctlError::NotActive(net_id.to_string()))?;

        if instance.info.internet_enabled == enabled {
            debug!("Internet for {} already {}", net_id, if enabled { "enabled" } else { "disabled" });
            return Ok(instance.info.clone());
        }

        if enabled {
            self.firewall.apply_nat(net_id, slot.addressing.subnet).await?;
        } else {
            self.firewall.remove_nat(net_id).await?;
        }

        instance.info.internet_enabled = enabled;
        slot.publish(SlotState::Active, Some(instance.info.clone())).await;
        info!("Internet for {} {}", net_id, if enabled { "enabled" } else { "disabled" });
        Ok(instance.info.clone())
    }

    /// Change the power level of an active network
    pub async fn set_tx_power(&self, net_id: &str, level: u8) -> ApctlResult<TxPowerReport> {
        let slot = self.slot(net_id)?;
        validation::validate_tx_power_level(level)?;
        let mut guard = slot.try_acquire()?;
        let instance = guard.as_mut().ok_or_else(|| ApctlError::NotActive(net_id.to_string()))?;

        let report = self
            .wifi
            .apply_tx_power(&slot.interface, instance.info.channel, level, Some(self.config.daemons.tx_power_settle()))
            .await?;

        instance.info.tx_power_level = level;
        instance.info.tx_power_warning = report.warning.clone();
        slot.publish(SlotState::Active, Some(instance.info.clone())).await;
        Ok(report)
    }

    /// Level table and reported power for an active network
    pub async fn tx_power_info(&self, net_id: &str) -> ApctlResult<TxPowerReport> {
        let slot = self.slot(net_id)?;
        match slot.snapshot().await {
            SlotView { state: SlotState::Active, info: Some(info) } => {
                self.wifi.tx_power_info(&slot.interface, info.channel, info.tx_power_level).await
            }
            _ => Err(ApctlError::NotActive(net_id.to_string())),
        }
    }

    /// Every configured slot, in configuration order
    pub async fn list_slots(&self) -> Vec<SlotSummary> {
        let mut out = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            out.push(SlotSummary {
                net_id: slot.net_id.clone(),
                interface: slot.interface.clone(),
                addressing: slot.addressing,
                state: slot.snapshot().await.state,
            });
        }
        out
    }

    /// Daemon liveness, NAT rules and upstream reachability
    ///
    /// A slot that is mid-operation is listed with its published state and
    /// left out of the daemon counts.
    pub async fn health(&self) -> HealthReport {
        let mut networks = Vec::with_capacity(self.slots.len());
        let mut hostapd = DaemonHealth::default();
        let mut dnsmasq = DaemonHealth::default();
        let mut nat_ids = Vec::new();

        for slot in &self.slots {
            let entry = match slot.instance.try_lock() {
                Ok(mut guard) => match guard.as_mut() {
                    Some(instance) => {
                        let ap_running = instance.resources.ap.as_mut().is_some_and(DaemonHandle::is_running);
                        let dhcp_running = instance.resources.dhcp.as_mut().is_some_and(DaemonHandle::is_running);
                        hostapd.expected += 1;
                        dnsmasq.expected += 1;
                        hostapd.running += usize::from(ap_running);
                        dnsmasq.running += usize::from(dhcp_running);
                        if instance.info.internet_enabled {
                            nat_ids.push(slot.net_id.clone());
                        }
                        SlotHealth {
                            net_id: slot.net_id.clone(),
                            state: SlotState::Active,
                            ap_running,
                            dhcp_running,
                            internet_enabled: instance.info.internet_enabled,
                        }
                    }
                    None => SlotHealth {
                        net_id: slot.net_id.clone(),
                        state: SlotState::Inactive,
                        ap_running: false,
                        dhcp_running: false,
                        internet_enabled: false,
                    },
                },
                Err(_) => {
                    let view = slot.snapshot().await;
                    SlotHealth {
                        net_id: slot.net_id.clone(),
                        state: view.state,
                        ap_running: false,
                        dhcp_running: false,
                        internet_enabled: view.info.is_some_and(|i| i.internet_enabled),
                    }
                }
            };
            networks.push(entry);
        }

        let nat = self.nat_health(&nat_ids).await;
        let upstream = self.upstream_health().await;
        let active_networks = hostapd.expected;

        let status = if active_networks == 0 {
            HealthStatus::Standby
        } else if hostapd.healthy() && dnsmasq.healthy() && nat.configured && upstream.reachable() {
            HealthStatus::Ok
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            status,
            active_networks,
            configured_networks: self.slots.len(),
            hostapd,
            dnsmasq,
            nat,
            upstream,
            networks,
        }
    }

    async fn nat_health(&self, net_ids: &[String]) -> NatHealth {
        let mut health = NatHealth { configured: true, rules: 0, error: None };
        for net_id in net_ids {
            let tag = rule_tag(net_id, RuleKind::Nat);
            match self.firewall.rules_for(net_id).await {
                Ok(found) => {
                    let nat: Vec<&String> = found.iter().filter(|r| r.contains(&tag)).collect();
                    health.rules += nat.len();
                    if !nat.iter().any(|r| r.contains("MASQUERADE")) {
                        warn!("{} has internet enabled but no MASQUERADE rule", net_id);
                        health.configured = false;
                    }
                }
                Err(e) => {
                    health.configured = false;
                    health.error = Some(e.to_string());
                    break;
                }
            }
        }
        health
    }

    async fn upstream_health(&self) -> UpstreamHealth {
        let name = match self.firewall.upstream_interface().await {
            Ok(name) => name,
            Err(e) => {
                return UpstreamHealth { name: None, up: false, has_ip: false, error: Some(e.to_string()) };
            }
        };

        match (self.links.is_up(&name).await, self.links.addresses(&name).await) {
            (Ok(up), Ok(addrs)) => UpstreamHealth { name: Some(name), up, has_ip: !addrs.is_empty(), error: None },
            (Err(e), _) | (_, Err(e)) => UpstreamHealth {
                name: Some(name),
                up: false,
                has_ip: false,
                error: Some(e.to_string()),
            },
        }
    }

    /// Stop every slot, waiting for in-flight operations to finish first
    pub async fn shutdown_all(&self) -> Vec<(String, ApctlResult<StopOutcome>)> {
        let stops = self.slots.iter().map(|slot| async move {
            let guard = slot.instance.lock().await;
            (slot.net_id.clone(), self.stop_locked(slot, guard).await)
        });
        join_all(stops).await
    }

    /// One expiry scan: stop every active slot whose deadline is at or before `now`
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut due = Vec::new();
        for slot in &self.slots {
            if let SlotView { state: SlotState::Active, info: Some(info) } = slot.snapshot().await {
                if info.expires_at <= now {
                    due.push(slot.net_id.clone());
                }
            }
        }

        let results = join_all(due.iter().map(|net_id| async move {
            info!("{} expired", net_id);
            (net_id.clone(), self.stop(net_id).await)
        }))
        .await;

        results
            .into_iter()
            .filter_map(|(net_id, result)| match result {
                Ok(StopOutcome::Stopped) => Some(net_id),
                Ok(StopOutcome::AlreadyInactive) => None,
                Err(ApctlError::Busy(_)) => {
                    debug!("{} busy, retrying expiry on next tick", net_id);
                    None
                }
                Err(e) => {
                    warn!("Expiry of {} finished with errors: {}", net_id, e);
                    Some(net_id)
                }
            })
            .collect()
    }

    /// Run `expire_due` every `interval` until `shutdown` flips to true
    pub fn spawn_expiry_loop(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired = manager.expire_due(Utc::now()).await;
                        if !expired.is_empty() {
                            info!("Expired networks: {}", expired.join(", "));
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Expiry loop stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}
