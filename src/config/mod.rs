use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::store::{NetworkSpec, VNI_LIMIT};

/// Longest interface name the kernel accepts.
pub const MAX_IFNAME_LEN: usize = 15;

fn default_bridge() -> String {
    "gnvbr0".to_string()
}

fn default_mtu() -> u32 {
    crate::driver::VETH_MTU
}

fn default_network() -> String {
    "default".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/cni/geneve")
}

/// A GENEVE header carries 24 bits of VNI.
pub fn validate_vni(vni: u32) -> Result<()> {
    if vni >= VNI_LIMIT {
        anyhow::bail!("Invalid VNI {} (must be below {})", vni, VNI_LIMIT);
    }
    Ok(())
}

/// Network configuration for the GENEVE CNI, read from stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    /// CNI specification version
    pub cni_version: String,
    /// Name of the network
    pub name: String,
    /// Type of CNI plugin
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// Bridge every pod veth and tunnel is enslaved to
    #[serde(default = "default_bridge")]
    pub bridge: String,
    /// MTU of the pod veth pair
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    /// Destinations reached through the pod table when SNAT is internal
    #[serde(default)]
    pub vpc_cidrs: Vec<String>,
    #[serde(default)]
    pub use_external_snat: bool,
    /// Pod routing table, 0 for pods on the primary ENI
    #[serde(default)]
    pub route_table: u32,
    #[serde(default = "default_network")]
    pub default_network: String,
    /// Overlay networks by name
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkSpec>,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl NetConf {
    /// Parse NetConf from bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let conf: NetConf =
            serde_json::from_slice(bytes).context("Failed to parse network configuration")?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bridge.is_empty() || self.bridge.len() > MAX_IFNAME_LEN {
            anyhow::bail!(
                "Invalid bridge name {:?} (must be 1 to {} characters)",
                self.bridge,
                MAX_IFNAME_LEN
            );
        }

        self.vpc_cidrs()?;

        for (name, network) in &self.networks {
            validate_vni(network.vni).with_context(|| format!("Invalid network {name:?}"))?;
        }
        Ok(())
    }

    pub fn vpc_cidrs(&self) -> Result<Vec<Ipv4Network>> {
        self.vpc_cidrs
            .iter()
            .map(|cidr| {
                cidr.parse::<Ipv4Network>()
                    .with_context(|| format!("Invalid VPC CIDR {cidr:?}"))
            })
            .collect()
    }

    /// A minimal configuration for one overlay network.
    pub fn new_default(name: &str, network: &str, spec: NetworkSpec) -> Self {
        let mut networks = BTreeMap::new();
        networks.insert(network.to_string(), spec);
        Self {
            cni_version: "1.0.0".to_string(),
            name: name.to_string(),
            plugin_type: "geneve-cni".to_string(),
            bridge: default_bridge(),
            mtu: default_mtu(),
            vpc_cidrs: Vec::new(),
            use_external_snat: false,
            route_table: 0,
            default_network: network.to_string(),
            networks,
            state_dir: default_state_dir(),
            log_level: None,
            log_file: None,
        }
    }
}
