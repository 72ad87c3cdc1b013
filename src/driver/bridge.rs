//! Linux bridge management.
//!
//! The bridge is shared by every pod on the node. Creation treats "already
//! exists" as success so racing first attaches are harmless, and every
//! mutation runs under a node-scoped lock so that a concurrent teardown
//! cannot delete the bridge between verification and use.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::lock::NodeLock;
use crate::netlink::{Link, LinkKind, LinkSpec, NetLink};

/// MTU of the shared bridge.
pub const BRIDGE_MTU: u32 = 1500;

/// Bridge manager for pod attachments.
pub struct BridgeManager {
    netlink: Arc<dyn NetLink>,
    lock: NodeLock,
}

impl BridgeManager {
    pub fn new(netlink: Arc<dyn NetLink>, lock: NodeLock) -> Self {
        Self { netlink, lock }
    }

    /// Create the bridge, or re-validate an existing one, and bring it up.
    pub fn ensure_bridge(&self, name: &str, mtu: u32, promisc: bool) -> Result<Link> {
        let _guard = self.lock.acquire()?;
        self.ensure_locked(name, mtu, promisc)
    }

    /// Ensure the bridge and enslave `ports` to it in one critical section.
    pub fn attach_ports(&self, name: &str, mtu: u32, promisc: bool, ports: &[&str]) -> Result<Link> {
        let _guard = self.lock.acquire()?;
        let bridge = self
            .ensure_locked(name, mtu, promisc)
            .with_context(|| format!("failed to create bridge {name:?}"))?;

        for port in ports {
            self.netlink
                .link_set_master(port, &bridge.name)
                .with_context(|| format!("failed to connect {port:?} to bridge {:?}", bridge.name))?;
            debug!(bridge = %bridge.name, port, "attached port to bridge");
        }
        Ok(bridge)
    }

    /// Resolve `name`, failing if it is absent or not a bridge.
    pub fn bridge_by_name(&self, name: &str) -> Result<Link> {
        bridge_by_name(self.netlink.as_ref(), name)
    }

    /// Delete the bridge unless a port other than `departing` is still
    /// enslaved to it. Returns whether the bridge was deleted.
    pub fn release(&self, name: &str, departing: &[&str]) -> Result<bool> {
        let _guard = self.lock.acquire()?;
        let bridge = self.bridge_by_name(name)?;

        let remaining: Vec<String> = self
            .netlink
            .link_list()
            .context("failed to list links")?
            .into_iter()
            .filter(|l| l.master.as_deref() == Some(bridge.name.as_str()))
            .filter(|l| !departing.contains(&l.name.as_str()))
            .map(|l| l.name)
            .collect();

        if !remaining.is_empty() {
            info!(
                bridge = name,
                ports = ?remaining,
                "bridge still has attached ports, keeping it"
            );
            return Ok(false);
        }

        self.netlink
            .link_del(&bridge.name)
            .with_context(|| format!("failed to delete bridge {name:?}"))?;
        info!(bridge = name, "deleted bridge");
        Ok(true)
    }

    fn ensure_locked(&self, name: &str, mtu: u32, promisc: bool) -> Result<Link> {
        let spec = LinkSpec::Bridge {
            name: name.to_string(),
            mtu,
            tx_queue_len: None,
        };
        match self.netlink.link_add(&spec) {
            Ok(()) => info!(bridge = name, mtu, "created bridge"),
            Err(e) if e.is_exists() => debug!(bridge = name, "bridge already exists"),
            Err(e) => return Err(e).with_context(|| format!("could not add {name:?}")),
        }

        // Re-fetch so a pre-existing device of another type is rejected.
        let bridge = self.bridge_by_name(name)?;

        if promisc {
            self.netlink
                .link_set_promisc_on(name)
                .with_context(|| format!("could not set promiscuous mode on {name:?}"))?;
        }

        self.netlink
            .link_set_up(name)
            .with_context(|| format!("could not set bridge {name:?} up"))?;

        Ok(Link {
            up: true,
            promisc: bridge.promisc || promisc,
            ..bridge
        })
    }
}

pub(crate) fn bridge_by_name(netlink: &dyn NetLink, name: &str) -> Result<Link> {
    let link = netlink
        .link_by_name(name)
        .with_context(|| format!("could not lookup {name:?}"))?;
    if link.kind != LinkKind::Bridge {
        anyhow::bail!("{name:?} already exists but is not a bridge");
    }
    Ok(link)
}

impl std::fmt::Debug for BridgeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeManager")
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}
