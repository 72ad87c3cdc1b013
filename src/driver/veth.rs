//! Veth pair construction inside the pod namespace.

use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use ipnetwork::Ipv4Network;
use tracing::debug;

use crate::netlink::{LinkSpec, MacAddr, NetLink, Neigh, Route};
use crate::netns::HostNetns;

/// Link-local next hop every pod routes through.
pub const POD_GATEWAY: Ipv4Addr = Ipv4Addr::new(169, 254, 1, 1);

/// Hardware address the pod resolves [`POD_GATEWAY`] to. The host routes
/// rather than bridges toward the pod, so nothing answers ARP for the
/// gateway and the entry has to be static.
pub const POD_GATEWAY_MAC: MacAddr = MacAddr([0x00, 0x01, 0x02, 0x03, 0x04, 0x05]);

/// MTU of the pod veth pair.
pub const VETH_MTU: u32 = 9001;

/// Builds the veth pair from inside the pod namespace and hands the host
/// end back to the host namespace.
///
/// Steps are not rolled back individually; a failure aborts with an error
/// naming the step and the caller cleans up.
pub struct VethPairFactory<'a> {
    netlink: &'a dyn NetLink,
    container_name: &'a str,
    host_name: &'a str,
    addr: Ipv4Network,
    mtu: u32,
}

impl<'a> VethPairFactory<'a> {
    /// `netlink` must be bound to the pod namespace.
    pub fn new(
        netlink: &'a dyn NetLink,
        container_name: &'a str,
        host_name: &'a str,
        addr: Ipv4Network,
    ) -> Self {
        Self {
            netlink,
            container_name,
            host_name,
            addr,
            mtu: VETH_MTU,
        }
    }

    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn run(&self, host_ns: &HostNetns) -> Result<()> {
        let nl = self.netlink;

        nl.link_add(&LinkSpec::Veth {
            name: self.container_name.to_string(),
            peer: self.host_name.to_string(),
            mtu: self.mtu,
        })
        .with_context(|| {
            format!(
                "setup NS network: failed to create veth pair {:?}/{:?}",
                self.container_name, self.host_name
            )
        })?;

        // Creation flags do not reliably bring veths up on every platform,
        // and a down veth never gets a link-local address.
        for name in [self.host_name, self.container_name] {
            nl.link_by_name(name)
                .with_context(|| format!("setup NS network: failed to find link {name:?}"))?;
            nl.link_set_up(name)
                .with_context(|| format!("setup NS network: failed to set link {name:?} up"))?;
        }

        // default via 169.254.1.1 dev eth0
        // 169.254.1.1 dev eth0 scope link
        let gateway = Ipv4Network::from(POD_GATEWAY);
        nl.route_add(&Route::link_scope(gateway, self.container_name))
            .context("setup NS network: failed to add default gateway")?;
        nl.route_add(&Route::default_via(POD_GATEWAY, self.container_name))
            .context("setup NS network: failed to add default route")?;

        nl.addr_add(self.container_name, self.addr).with_context(|| {
            format!(
                "setup NS network: failed to add IP addr to {:?}",
                self.container_name
            )
        })?;

        nl.neigh_add(&Neigh {
            device: self.container_name.to_string(),
            ip: POD_GATEWAY,
            lladdr: POD_GATEWAY_MAC,
        })
        .context("setup NS network: failed to add static ARP")?;

        nl.link_set_ns_fd(self.host_name, host_ns.fd())
            .context("setup NS network: failed to move veth to host netns")?;

        debug!(
            container = self.container_name,
            host = self.host_name,
            addr = %self.addr,
            "veth pair configured in pod namespace"
        );
        Ok(())
    }
}
