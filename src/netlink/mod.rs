//! Kernel-object operations used by the attachment driver.
//!
//! Everything the driver does to links, addresses, routes, neighbors and
//! policy rules goes through the [`NetLink`] trait. [`IpRoute2`] is the
//! production backend; tests substitute an in-memory kernel.

use std::fmt;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;

use ipnetwork::Ipv4Network;

use crate::error::NetlinkError;

mod ip;

pub use ip::IpRoute2;

/// Main routing table id (`RT_TABLE_MAIN`).
pub const MAIN_TABLE: u32 = 254;

/// Kind of a link as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Veth,
    Bridge,
    Geneve,
    Other(String),
}

impl LinkKind {
    pub fn from_info_kind(kind: Option<&str>) -> Self {
        match kind {
            Some("veth") => Self::Veth,
            Some("bridge") => Self::Bridge,
            Some("geneve") => Self::Geneve,
            Some(other) => Self::Other(other.to_string()),
            None => Self::Other(String::new()),
        }
    }
}

/// A resolved link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    pub index: u32,
    pub kind: LinkKind,
    pub mtu: u32,
    pub up: bool,
    pub promisc: bool,
    /// Name of the bridge this link is enslaved to, if any.
    pub master: Option<String>,
}

/// Link creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSpec {
    Veth {
        name: String,
        peer: String,
        mtu: u32,
    },
    Bridge {
        name: String,
        mtu: u32,
        /// `None` leaves the queue length to the kernel instead of forcing zero.
        tx_queue_len: Option<u32>,
    },
}

impl LinkSpec {
    pub fn name(&self) -> &str {
        match self {
            Self::Veth { name, .. } | Self::Bridge { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteScope {
    Universe,
    Link,
}

/// An IPv4 route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// `None` is the default route.
    pub dst: Option<Ipv4Network>,
    pub gateway: Option<Ipv4Addr>,
    pub device: Option<String>,
    pub scope: RouteScope,
}

impl Route {
    /// Connected route to `dst` out of `device`.
    pub fn link_scope(dst: Ipv4Network, device: &str) -> Self {
        Self {
            dst: Some(dst),
            gateway: None,
            device: Some(device.to_string()),
            scope: RouteScope::Link,
        }
    }

    /// Default route via `gateway` out of `device`.
    pub fn default_via(gateway: Ipv4Addr, device: &str) -> Self {
        Self {
            dst: None,
            gateway: Some(gateway),
            device: Some(device.to_string()),
            scope: RouteScope::Universe,
        }
    }
}

/// A policy-routing rule. Unset fields are wildcards when deleting.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Rule {
    pub priority: Option<u32>,
    pub src: Option<Ipv4Network>,
    pub dst: Option<Ipv4Network>,
    pub table: Option<u32>,
}

impl Rule {
    /// True when every field set on `self` equals the same field on `other`.
    pub fn matches(&self, other: &Rule) -> bool {
        fn field<T: PartialEq>(want: &Option<T>, have: &Option<T>) -> bool {
            want.as_ref().map_or(true, |w| have.as_ref() == Some(w))
        }
        field(&self.priority, &other.priority)
            && field(&self.src, &other.src)
            && field(&self.dst, &other.dst)
            && field(&self.table, &other.table)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(priority) = self.priority {
            write!(f, "{priority}:")?;
        }
        match &self.src {
            Some(src) => write!(f, " from {src}")?,
            None => write!(f, " from all")?,
        }
        if let Some(dst) = &self.dst {
            write!(f, " to {dst}")?;
        }
        match self.table {
            Some(MAIN_TABLE) => write!(f, " lookup main"),
            Some(table) => write!(f, " lookup {table}"),
            None => Ok(()),
        }
    }
}

/// An Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// A permanent neighbor (ARP) entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neigh {
    pub device: String,
    pub ip: Ipv4Addr,
    pub lladdr: MacAddr,
}

/// Kernel-object operations, scoped to the network namespace the
/// implementation is bound to.
pub trait NetLink: Send + Sync {
    fn link_by_name(&self, name: &str) -> Result<Link, NetlinkError>;
    fn link_list(&self) -> Result<Vec<Link>, NetlinkError>;
    fn link_add(&self, spec: &LinkSpec) -> Result<(), NetlinkError>;
    fn link_del(&self, name: &str) -> Result<(), NetlinkError>;
    fn link_set_up(&self, name: &str) -> Result<(), NetlinkError>;
    fn link_set_promisc_on(&self, name: &str) -> Result<(), NetlinkError>;
    fn link_set_master(&self, name: &str, master: &str) -> Result<(), NetlinkError>;
    fn link_set_nomaster(&self, name: &str) -> Result<(), NetlinkError>;
    /// Move a link into the namespace referenced by an open file descriptor.
    fn link_set_ns_fd(&self, name: &str, fd: RawFd) -> Result<(), NetlinkError>;
    fn addr_add(&self, name: &str, addr: Ipv4Network) -> Result<(), NetlinkError>;
    fn route_add(&self, route: &Route) -> Result<(), NetlinkError>;
    fn route_del(&self, route: &Route) -> Result<(), NetlinkError>;
    fn neigh_add(&self, neigh: &Neigh) -> Result<(), NetlinkError>;
    fn rule_add(&self, rule: &Rule) -> Result<(), NetlinkError>;
    /// Delete the first rule matching every field set on `rule`.
    fn rule_del(&self, rule: &Rule) -> Result<(), NetlinkError>;
    fn rule_list(&self) -> Result<Vec<Rule>, NetlinkError>;
}
