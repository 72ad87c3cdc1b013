use anyhow::Context;
use ipnetwork::Ipv4Network;
use ring::digest::{digest, SHA256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// CNI command arguments
#[derive(Debug, Clone)]
pub struct CmdArgs {
    /// Container ID
    pub container_id: String,
    /// Network namespace path
    pub netns: String,
    /// Interface name
    pub ifname: String,
    /// Arguments
    pub args: HashMap<String, String>,
    /// Path
    pub path: String,
    /// Standard input data
    pub stdin_data: Vec<u8>,
}

/// Current result format (CNI 1.0.0)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Result {
    /// CNI specification version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Interfaces created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<Interface>>,
    /// IP configurations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ips: Option<Vec<IPConfig>>,
    /// DNS configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<DNS>,
    /// Routes to configure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<Route>>,
}

/// Interface information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    /// Interface name
    pub name: String,
    /// MAC address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Sandbox path (network namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// IP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IPConfig {
    /// Interface index this IP is assigned to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
    /// IP address with prefix length
    pub address: String,
    /// Gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// DNS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DNS {
    pub nameservers: Option<Vec<String>>,
    pub search: Option<Vec<String>>,
    pub options: Option<Vec<String>>,
}

/// Route configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    /// Destination CIDR
    pub dst: String,
    /// Gateway for this route
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

impl Result {
    /// Create a new empty result
    pub fn new(cni_version: &str) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            interfaces: None,
            ips: None,
            dns: None,
            routes: None,
        }
    }

    /// Add an interface and return its index
    pub fn add_interface(&mut self, interface: Interface) -> usize {
        let interfaces = self.interfaces.get_or_insert_with(Vec::new);
        interfaces.push(interface);
        interfaces.len() - 1
    }

    pub fn add_ip(&mut self, ip: IPConfig) {
        self.ips.get_or_insert_with(Vec::new).push(ip);
    }

    pub fn add_route(&mut self, route: Route) {
        self.routes.get_or_insert_with(Vec::new).push(route);
    }

    /// Print result as JSON
    pub fn print(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        println!("{}", json);
        Ok(())
    }
}

/// Generic failure.
pub const ERR_GENERIC: u32 = 100;
/// The requested overlay network is not configured.
pub const ERR_UNKNOWN_NETWORK: u32 = 101;
/// Transient condition, the runtime should retry.
pub const ERR_TRY_AGAIN_LATER: u32 = 11;
/// Malformed network configuration.
pub const ERR_INVALID_NETCONF: u32 = 4;

/// Error result printed on stdout when a command fails
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Error {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl Error {
    pub fn new(cni_version: &str, code: u32, err: &anyhow::Error) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            code,
            msg: err.to_string(),
            details: format!("{err:#}"),
        }
    }

    pub fn print(&self) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string(self)?);
        Ok(())
    }
}

/// Pod identity and per-pod overrides passed through CNI_ARGS.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodArgs {
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub ip: Option<Ipv4Network>,
    pub network: Option<String>,
    pub table: Option<u32>,
}

impl PodArgs {
    pub fn from_cni_args(args: &HashMap<String, String>) -> anyhow::Result<Self> {
        let value = |key: &str| args.get(key).filter(|v| !v.is_empty()).cloned();

        let ip = value("IP")
            .map(|ip| {
                ip.parse::<Ipv4Network>()
                    .with_context(|| format!("Invalid IP argument {ip:?}"))
            })
            .transpose()?;
        let table = value("TABLE")
            .map(|t| {
                t.parse::<u32>()
                    .with_context(|| format!("Invalid TABLE argument {t:?}"))
            })
            .transpose()?;

        Ok(Self {
            namespace: value("K8S_POD_NAMESPACE"),
            name: value("K8S_POD_NAME"),
            ip,
            network: value("NETWORK"),
            table,
        })
    }

    /// Stable key for the pod, falling back to the container ID when the
    /// runtime did not pass pod identity.
    pub fn pod_key(&self, container_id: &str) -> String {
        match (&self.namespace, &self.name) {
            (Some(ns), Some(name)) => format!("{ns}/{name}"),
            _ => container_id.to_string(),
        }
    }
}

/// Host-side interface names of one pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceNames {
    pub host_veth: String,
    pub tunnel: String,
    pub container_veth: String,
}

impl InterfaceNames {
    /// `gnv`/`gnt` plus 12 hex chars of SHA-256 over `seed`, which keeps
    /// both names within the 15 character limit.
    pub fn derive(seed: &str, container_ifname: &str) -> Self {
        let hash = digest(&SHA256, seed.as_bytes());
        let suffix: String = hash.as_ref()[..6]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        Self {
            host_veth: format!("gnv{suffix}"),
            tunnel: format!("gnt{suffix}"),
            container_veth: container_ifname.to_string(),
        }
    }

    pub fn for_pod(pod: &PodArgs, container_id: &str, container_ifname: &str) -> Self {
        let seed = match (&pod.namespace, &pod.name) {
            (Some(ns), Some(name)) => format!("{ns}.{name}"),
            _ => container_id.to_string(),
        };
        Self::derive(&seed, container_ifname)
    }
}
