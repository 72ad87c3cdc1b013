//! GENEVE tunnel lifecycle.
//!
//! GENEVE devices need remote/VNI/port/checksum parameters that the
//! [`NetLink`] seam does not model, so creation sits behind
//! [`TunnelCreator`] and its result is only trusted once the link is
//! visible.

use std::net::Ipv4Addr;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::error::NetlinkError;
use crate::netlink::{Link, NetLink};

/// How many times the tunnel is looked up before giving up.
pub const TUNNEL_LOOKUP_ATTEMPTS: u32 = 5;

/// Delay between tunnel lookups.
pub const TUNNEL_LOOKUP_INTERVAL: Duration = Duration::from_secs(1);

/// Parameters of one pod's tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub name: String,
    pub remote: Ipv4Addr,
    pub vni: u32,
    pub port: u16,
}

/// Creates a GENEVE link. Success only means the request was issued.
pub trait TunnelCreator: Send + Sync {
    fn create_tunnel(&self, spec: &TunnelSpec) -> Result<()>;
}

/// Creates the tunnel with `ip link add ... type geneve`.
#[derive(Debug, Default, Clone)]
pub struct IpLinkTunnelCreator;

impl TunnelCreator for IpLinkTunnelCreator {
    fn create_tunnel(&self, spec: &TunnelSpec) -> Result<()> {
        let output = Command::new("ip")
            .args(geneve_args(spec))
            .output()
            .context("Failed to execute ip link add command")?;

        if !output.status.success() {
            anyhow::bail!(
                "Failed to create GENEVE interface {}: {}",
                spec.name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// `ip link add dev <name> type geneve remote <gw> vni <vni> udpcsum dstport <port>`
fn geneve_args(spec: &TunnelSpec) -> Vec<String> {
    vec![
        "link".to_string(),
        "add".to_string(),
        "dev".to_string(),
        spec.name.clone(),
        "type".to_string(),
        "geneve".to_string(),
        "remote".to_string(),
        spec.remote.to_string(),
        "vni".to_string(),
        spec.vni.to_string(),
        "udpcsum".to_string(),
        "dstport".to_string(),
        spec.port.to_string(),
    ]
}

/// Sleep seam so the visibility poll can run under a fake clock.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Creates tunnels and waits for them to show up.
///
/// `Creating -> Polling(1..=attempts) -> Found -> Up`, or
/// `Polling -> Exhausted` which fails the attach.
pub struct GeneveTunnelManager {
    netlink: Arc<dyn NetLink>,
    creator: Arc<dyn TunnelCreator>,
    sleeper: Arc<dyn Sleeper>,
    attempts: u32,
    interval: Duration,
}

impl GeneveTunnelManager {
    pub fn new(
        netlink: Arc<dyn NetLink>,
        creator: Arc<dyn TunnelCreator>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            netlink,
            creator,
            sleeper,
            attempts: TUNNEL_LOOKUP_ATTEMPTS,
            interval: TUNNEL_LOOKUP_INTERVAL,
        }
    }

    /// Create the tunnel, wait until it is visible and bring it up.
    pub fn ensure_tunnel(&self, spec: &TunnelSpec) -> Result<Link> {
        // A failed invocation is not fatal here: the link may already exist
        // from a retried attach. The poll below decides.
        if let Err(e) = self.creator.create_tunnel(spec) {
            error!(tunnel = %spec.name, "setupNS: {:#}", e);
        }

        let link = self.wait_for_link(&spec.name)?;

        self.netlink.link_set_up(&link.name).with_context(|| {
            format!("setup NS network: failed to set link {:?} up", spec.name)
        })?;

        info!(
            tunnel = %spec.name,
            remote = %spec.remote,
            vni = spec.vni,
            port = spec.port,
            "GENEVE tunnel is up"
        );
        Ok(link)
    }

    fn wait_for_link(&self, name: &str) -> Result<Link> {
        let mut last_err = NetlinkError::NotFound(name.to_string());
        for attempt in 1..=self.attempts {
            match self.netlink.link_by_name(name) {
                Ok(link) => {
                    info!(tunnel = name, attempt, "found tunnel link");
                    return Ok(link);
                }
                Err(e) => {
                    warn!(
                        tunnel = name,
                        "failed to find link (attempt {}/{}): {}",
                        attempt,
                        self.attempts,
                        e
                    );
                    last_err = e;
                    if attempt < self.attempts {
                        self.sleeper.sleep(self.interval);
                    }
                }
            }
        }
        Err(last_err).with_context(|| format!("setup NS network: failed to find link {name:?}"))
    }

    /// Detach the tunnel from its bridge and delete it. Returns false when
    /// the tunnel was already gone.
    pub fn remove_tunnel(&self, name: &str) -> Result<bool> {
        match self.netlink.link_by_name(name) {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to find link {name:?}"));
            }
        }

        if let Err(e) = self.netlink.link_set_nomaster(name) {
            warn!(tunnel = name, "failed to detach tunnel from bridge: {}", e);
        }
        self.netlink
            .link_del(name)
            .with_context(|| format!("failed to delete link {name:?}"))?;
        Ok(true)
    }
}

impl std::fmt::Debug for GeneveTunnelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneveTunnelManager")
            .field("attempts", &self.attempts)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
