//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Keeps the controller's network flag and address block in step with the host."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use heatlink_common::config::NetworkConfig;
use heatlink_common::JobKind;
use heatlink_rt::RateLimiter;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::job::{Job, JobQueue};

/// Network flag as reported by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetState {
    #[default]
    Unknown,
    On,
    Off,
}

impl NetState {
    pub fn from_register(value: u16) -> Self {
        match value {
            1 => NetState::On,
            2 => NetState::Off,
            _ => NetState::Unknown,
        }
    }

    /// Anything other than a confirmed `On` counts as off.
    pub fn is_on(self) -> bool {
        self == NetState::On
    }
}

/// Local address, gateway and resolver as pushed to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetTriple {
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns: Ipv4Addr,
}

impl NetTriple {
    /// Twelve octets in register order: ip, gateway, dns.
    pub fn octets(&self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[..4].copy_from_slice(&self.ip.octets());
        out[4..8].copy_from_slice(&self.gateway.octets());
        out[8..].copy_from_slice(&self.dns.octets());
        out
    }
}

impl Default for NetTriple {
    fn default() -> Self {
        Self {
            ip: Ipv4Addr::UNSPECIFIED,
            gateway: Ipv4Addr::UNSPECIFIED,
            dns: Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// Produces the host's current addressing.
pub trait AddressSource: Send + Sync {
    fn current(&self) -> NetTriple;
}

/// Fixed addressing, used when the host cannot be inspected.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticAddresses(pub NetTriple);

impl AddressSource for StaticAddresses {
    fn current(&self) -> NetTriple {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetAction {
    SetNetOn,
    SetNetOff,
    SetIp(NetTriple),
}

impl NetAction {
    pub fn into_job(self, priority: u8) -> Job {
        match self {
            NetAction::SetNetOn => Job::new(priority, JobKind::SetNetOn),
            NetAction::SetNetOff => Job::new(priority, JobKind::SetNetOff),
            NetAction::SetIp(triple) => Job::set_ip(priority, triple),
        }
    }
}

/// Decides which network writes one reconciliation tick needs.
#[derive(Debug, Default)]
pub struct NetReconciler {
    last_triple: Option<NetTriple>,
}

impl NetReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// On an edge between reported state and reachability, flip the flag and
    /// push the triple. Otherwise push the triple only when it changed.
    pub fn step(&mut self, reported: NetState, reachable: bool, triple: NetTriple) -> Vec<NetAction> {
        let mut actions = Vec::new();
        match (reported.is_on(), reachable) {
            (false, true) => actions.push(NetAction::SetNetOn),
            (true, false) => actions.push(NetAction::SetNetOff),
            _ => {}
        }
        if !actions.is_empty() || self.last_triple != Some(triple) {
            actions.push(NetAction::SetIp(triple));
            self.last_triple = Some(triple);
        }
        actions
    }
}

/// How reachability of the backend is judged each tick.
#[derive(Debug, Clone)]
pub enum Reachability {
    /// Result of the most recent posting attempt.
    Posting(watch::Receiver<bool>),
    /// Bounded TCP connect to the backend.
    Tcp {
        host: String,
        port: u16,
        timeout: Duration,
    },
}

impl Reachability {
    pub async fn probe(&self) -> bool {
        match self {
            Reachability::Posting(connected) => *connected.borrow(),
            Reachability::Tcp {
                host,
                port,
                timeout: limit,
            } => matches!(
                timeout(*limit, TcpStream::connect((host.as_str(), *port))).await,
                Ok(Ok(_))
            ),
        }
    }
}

/// Periodic reconciliation loop driving the network jobs.
pub struct NetworkTask {
    config: NetworkConfig,
    priority: u8,
    queue: JobQueue,
    status: watch::Receiver<NetState>,
    probe: Reachability,
    addresses: Arc<dyn AddressSource>,
    reconciler: NetReconciler,
}

impl NetworkTask {
    pub fn new(
        config: NetworkConfig,
        priority: u8,
        queue: JobQueue,
        status: watch::Receiver<NetState>,
        probe: Reachability,
        addresses: Arc<dyn AddressSource>,
    ) -> Self {
        Self {
            config,
            priority,
            queue,
            status,
            probe,
            addresses,
            reconciler: NetReconciler::new(),
        }
    }

    /// Wait up to the settle time for the requested status read. Without an
    /// answer the last report stands.
    async fn reported_state(&mut self) -> NetState {
        match timeout(self.config.settle, self.status.changed()).await {
            Ok(Ok(())) => *self.status.borrow_and_update(),
            Ok(Err(_)) | Err(_) => {
                debug!("no fresh network status; keeping the last report");
                *self.status.borrow()
            }
        }
    }

    async fn tick(&mut self) {
        self.status.borrow_and_update();
        Job::new(self.priority, JobKind::GetNetStatus).submit(&self.queue);
        let reachable = self.probe.probe().await;
        let triple = self.addresses.current();
        let reported = self.reported_state().await;

        let actions = self.reconciler.step(reported, reachable, triple);
        debug!(?reported, reachable, actions = actions.len(), "network reconciled");
        for action in actions {
            if !matches!(action, NetAction::SetIp(_)) {
                info!(?action, "network flag change");
            }
            action.into_job(self.priority).submit(&self.queue);
        }
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut limiter = RateLimiter::new(self.config.interval);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("network task shutdown");
                    break;
                }
                _ = limiter.tick() => {
                    tokio::select! {
                        _ = shutdown.recv() => {
                            debug!("network task shutdown");
                            break;
                        }
                        _ = self.tick() => {}
                    }
                }
            }
        }
        Ok(())
    }
}
