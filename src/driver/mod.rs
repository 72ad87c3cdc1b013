//! Pod attachment and detachment.
//!
//! [`LinuxNetwork`] sequences the tunnel, veth, bridge and policy-routing
//! managers. Attach is fail-fast and unwinds what it already did; detach is
//! best-effort and only fails when source rules for a pod-specific table
//! could not be removed.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use ipnetwork::Ipv4Network;
use tracing::{debug, error, info, warn};

use crate::error::{is_not_found, NetlinkError};
use crate::lock::NodeLock;
use crate::netlink::{IpRoute2, NetLink, Route, RouteScope, Rule, MAIN_TABLE};
use crate::netns::{HostNetns, Namespace, ThreadNetns};

pub mod bridge;
pub mod geneve;
pub mod rules;
pub mod veth;

pub use bridge::{BridgeManager, BRIDGE_MTU};
pub use geneve::{
    GeneveTunnelManager, IpLinkTunnelCreator, Sleeper, ThreadSleeper, TunnelCreator, TunnelSpec,
    TUNNEL_LOOKUP_ATTEMPTS,
};
pub use rules::{
    PolicyRoutingManager, PolicyRule, RuleDirection, FROM_POD_RULE_PRIORITY, TO_POD_RULE_PRIORITY,
};
pub use veth::{VethPairFactory, POD_GATEWAY, POD_GATEWAY_MAC, VETH_MTU};

/// Everything needed to attach one pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRequest {
    pub host_veth_name: String,
    pub container_veth_name: String,
    pub tunnel_name: String,
    pub bridge_name: String,
    pub netns_path: PathBuf,
    pub addr: Ipv4Network,
    /// Pod-specific routing table; 0 means the primary ENI, which has none.
    pub table: u32,
    pub vpc_cidrs: Vec<Ipv4Network>,
    pub use_external_snat: bool,
    pub gateway_ip: Ipv4Addr,
    pub vni: u32,
    pub tunnel_port: u16,
}

impl AttachmentRequest {
    pub fn tunnel_spec(&self) -> TunnelSpec {
        TunnelSpec {
            name: self.tunnel_name.clone(),
            remote: self.gateway_ip,
            vni: self.vni,
            port: self.tunnel_port,
        }
    }

    /// The detach request that undoes this attachment.
    pub fn detachment(&self) -> DetachmentRequest {
        DetachmentRequest {
            addr: Some(self.addr),
            table: self.table,
            host_veth_name: self.host_veth_name.clone(),
            tunnel_name: self.tunnel_name.clone(),
            bridge_name: self.bridge_name.clone(),
        }
    }
}

/// Everything needed to detach one pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachmentRequest {
    /// Pod address; without it only links are cleaned up.
    pub addr: Option<Ipv4Network>,
    pub table: u32,
    pub host_veth_name: String,
    pub tunnel_name: String,
    pub bridge_name: String,
}

/// Attach/detach operations consumed by the CNI entry point.
pub trait NetworkApis: Send + Sync {
    fn setup_ns(&self, req: &AttachmentRequest) -> Result<()>;
    fn teardown_ns(&self, req: &DetachmentRequest) -> Result<()>;
}

/// Compensating action for a completed setup step.
#[derive(Debug)]
enum Undo {
    DeleteLink(String),
    DeleteRoute(Route),
    DeleteRule(Rule),
    RemoveRulesFrom(Ipv4Network),
}

/// Builder for [`LinuxNetwork`].
pub struct LinuxNetworkBuilder {
    netlink: Arc<dyn NetLink>,
    ns: Arc<dyn Namespace>,
    creator: Arc<dyn TunnelCreator>,
    sleeper: Arc<dyn Sleeper>,
    bridge_lock: NodeLock,
    veth_mtu: u32,
}

impl LinuxNetworkBuilder {
    pub fn tunnel_creator(mut self, creator: Arc<dyn TunnelCreator>) -> Self {
        self.creator = creator;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn bridge_lock(mut self, lock: NodeLock) -> Self {
        self.bridge_lock = lock;
        self
    }

    pub fn veth_mtu(mut self, mtu: u32) -> Self {
        self.veth_mtu = mtu;
        self
    }

    pub fn build(self) -> LinuxNetwork {
        LinuxNetwork {
            tunnels: GeneveTunnelManager::new(self.netlink.clone(), self.creator, self.sleeper),
            bridges: BridgeManager::new(self.netlink.clone(), self.bridge_lock),
            rules: PolicyRoutingManager::new(self.netlink.clone()),
            netlink: self.netlink,
            ns: self.ns,
            veth_mtu: self.veth_mtu,
        }
    }
}

/// Host-side orchestration of pod attachments.
pub struct LinuxNetwork {
    netlink: Arc<dyn NetLink>,
    ns: Arc<dyn Namespace>,
    tunnels: GeneveTunnelManager,
    bridges: BridgeManager,
    rules: PolicyRoutingManager,
    veth_mtu: u32,
}

impl LinuxNetwork {
    /// Production wiring. Bridge mutations are serialized through a lock
    /// file in `state_dir`.
    pub fn new(state_dir: &Path) -> Self {
        Self::node_builder(state_dir).build()
    }

    /// Builder with the production backends, for callers that still need
    /// to tune the result.
    pub fn node_builder(state_dir: &Path) -> LinuxNetworkBuilder {
        Self::builder(Arc::new(IpRoute2::new()), Arc::new(ThreadNetns::new()))
            .bridge_lock(NodeLock::at(state_dir.join("bridge.lock")))
    }

    pub fn builder(netlink: Arc<dyn NetLink>, ns: Arc<dyn Namespace>) -> LinuxNetworkBuilder {
        LinuxNetworkBuilder {
            netlink,
            ns,
            creator: Arc::new(IpLinkTunnelCreator),
            sleeper: Arc::new(ThreadSleeper),
            bridge_lock: NodeLock::in_process(),
            veth_mtu: VETH_MTU,
        }
    }

    fn apply_setup(&self, req: &AttachmentRequest, undo: &mut Vec<Undo>) -> Result<()> {
        undo.push(Undo::DeleteLink(req.tunnel_name.clone()));
        self.tunnels.ensure_tunnel(&req.tunnel_spec())?;

        // A retried attach may find the previous attempt's host veth.
        if self.netlink.link_by_name(&req.host_veth_name).is_ok() {
            self.netlink.link_del(&req.host_veth_name).with_context(|| {
                format!(
                    "setup NS network: failed to delete old hostVeth {:?}",
                    req.host_veth_name
                )
            })?;
            debug!(host_veth = %req.host_veth_name, "cleaned up old hostVeth");
        }

        undo.push(Undo::DeleteLink(req.host_veth_name.clone()));
        let mtu = self.veth_mtu;
        self.ns
            .with_netns_path(
                &req.netns_path,
                &mut |nl: &dyn NetLink, host_ns: &HostNetns| {
                    let result = VethPairFactory::new(
                        nl,
                        &req.container_veth_name,
                        &req.host_veth_name,
                        req.addr,
                    )
                    .with_mtu(mtu)
                    .run(host_ns);
                    if result.is_err() {
                        // Leave the pod namespace clean for the next attempt.
                        if let Err(e) = ignore_missing(nl.link_del(&req.container_veth_name)) {
                            warn!(
                                container_veth = %req.container_veth_name,
                                "failed to remove partial veth pair: {}", e
                            );
                        }
                    }
                    result
                },
            )
            .context("setup NS network: failed to setup NS network")?;

        self.netlink.link_by_name(&req.host_veth_name).with_context(|| {
            format!("setup NS network: failed to find link {:?}", req.host_veth_name)
        })?;
        self.netlink.link_set_up(&req.host_veth_name).with_context(|| {
            format!("setup NS network: failed to set link {:?} up", req.host_veth_name)
        })?;

        // Promiscuous: fabric-originated unicast must be forwarded between
        // tunnel and veth without learned FDB entries.
        self.bridges
            .attach_ports(
                &req.bridge_name,
                BRIDGE_MTU,
                true,
                &[req.host_veth_name.as_str(), req.tunnel_name.as_str()],
            )
            .context("setup NS network")?;

        let host_route = Route::link_scope(host_prefix(req.addr), &req.host_veth_name);
        self.netlink
            .route_add(&host_route)
            .context("setup NS network: failed to add host route")?;
        undo.push(Undo::DeleteRoute(host_route));

        self.rules
            .add_container_rule(RuleDirection::ToPod, req.addr, TO_POD_RULE_PRIORITY, MAIN_TABLE)
            .context("setup NS network: failed to add toContainer")?;
        undo.push(Undo::DeleteRule(PolicyRule::to_pod(req.addr).to_rule()));
        info!(addr = %req.addr, "added toContainer rule");

        // From-pod rules only exist for secondary ENIs.
        if req.table > 0 {
            undo.push(Undo::RemoveRulesFrom(req.addr));
            if req.use_external_snat {
                self.rules
                    .add_container_rule(
                        RuleDirection::FromPod,
                        req.addr,
                        FROM_POD_RULE_PRIORITY,
                        req.table,
                    )
                    .context("setup NS network: failed to add fromContainer rule")?;
                info!(
                    "Added rule priority {} from {} table {}",
                    FROM_POD_RULE_PRIORITY, req.addr, req.table
                );
            } else {
                self.rules
                    .add_cidr_rules(req.addr, &req.vpc_cidrs, req.table)
                    .context("setup NS network: failed to add fromContainer rule")?;
            }
        }
        Ok(())
    }

    fn unwind(&self, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            let result: Result<()> = match &step {
                Undo::DeleteLink(name) => ignore_missing(self.netlink.link_del(name)).map_err(Into::into),
                Undo::DeleteRoute(route) => ignore_missing(self.netlink.route_del(route)).map_err(Into::into),
                Undo::DeleteRule(rule) => ignore_missing(self.netlink.rule_del(rule)).map_err(Into::into),
                Undo::RemoveRulesFrom(addr) => self.rules.remove_rules_by_source(*addr).map(drop),
            };
            match result {
                Ok(()) => debug!(?step, "rolled back setup step"),
                Err(e) => warn!(?step, "failed to roll back setup step: {:#}", e),
            }
        }
    }
}

impl NetworkApis for LinuxNetwork {
    fn setup_ns(&self, req: &AttachmentRequest) -> Result<()> {
        debug!(
            host_veth = %req.host_veth_name,
            container_veth = %req.container_veth_name,
            netns = %req.netns_path.display(),
            table = req.table,
            "SetupNS"
        );

        let mut undo = Vec::new();
        match self.apply_setup(req, &mut undo) {
            Ok(()) => {
                info!(addr = %req.addr, tunnel = %req.tunnel_name, "pod attached");
                Ok(())
            }
            Err(err) => {
                error!("Failed to setup NS network: {:#}", err);
                self.unwind(undo);
                Err(err)
            }
        }
    }

    fn teardown_ns(&self, req: &DetachmentRequest) -> Result<()> {
        debug!(addr = ?req.addr, table = req.table, "TeardownNS");

        match self.tunnels.remove_tunnel(&req.tunnel_name) {
            Ok(true) => info!(tunnel = %req.tunnel_name, "tearDownNS network: deleted tunnel"),
            Ok(false) => info!(tunnel = %req.tunnel_name, "tearDownNS network: tunnel already gone"),
            Err(e) => warn!(tunnel = %req.tunnel_name, "tearDownNS network: {:#}", e),
        }

        let departing = [req.host_veth_name.as_str(), req.tunnel_name.as_str()];
        match self.bridges.release(&req.bridge_name, &departing) {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {
                info!(bridge = %req.bridge_name, "tearDownNS network: bridge already gone")
            }
            Err(e) => warn!(bridge = %req.bridge_name, "tearDownNS network: {:#}", e),
        }

        let Some(addr) = req.addr else {
            info!("tearDownNS network: no pod address, skipping rules and host route");
            return Ok(());
        };

        match self.rules.remove_to_pod_rule(addr) {
            Ok(()) => info!("Delete toContainer rule for {}", addr),
            Err(e) => warn!("Failed to delete toContainer rule for {}: {:#}", addr, e),
        }

        // Stale source rules would misroute a reused pod IP, so this is the
        // one failure reported to the caller.
        let mut outcome = Ok(());
        if req.table > 0 {
            match self.rules.remove_rules_by_source(addr) {
                Ok(removed) => info!(
                    "Delete {} fromContainer rule(s) for {} in table {}",
                    removed, addr, req.table
                ),
                Err(e) => {
                    error!("Failed to delete fromContainer for {}: {:#}", addr, e);
                    outcome = Err(e.context(format!(
                        "delete NS network: failed to delete fromContainer rule for {addr}"
                    )));
                }
            }
        }

        let host_route = Route {
            dst: Some(host_prefix(addr)),
            gateway: None,
            device: None,
            scope: RouteScope::Link,
        };
        match self.netlink.route_del(&host_route) {
            Ok(()) => debug!(%addr, "deleted host route"),
            Err(e) if e.is_no_such_entry() => debug!(%addr, "host route already gone"),
            Err(e) => warn!("delete NS network: failed to delete host route for {}: {}", addr, e),
        }

        outcome
    }
}

fn host_prefix(addr: Ipv4Network) -> Ipv4Network {
    Ipv4Network::from(addr.ip())
}

fn ignore_missing(result: Result<(), NetlinkError>) -> Result<(), NetlinkError> {
    match result {
        Err(e) if e.is_not_found() || e.is_no_such_entry() => Ok(()),
        other => other,
    }
}

impl std::fmt::Debug for LinuxNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinuxNetwork")
            .field("tunnels", &self.tunnels)
            .field("bridges", &self.bridges)
            .field("veth_mtu", &self.veth_mtu)
            .finish_non_exhaustive()
    }
}
