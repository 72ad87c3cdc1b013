//! Overlay network definitions and per-network tunnel port allocation.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

mod ledger;
mod ports;

pub use ledger::PortLedger;
pub use ports::{PortMap, PORT_RANGE_SIZE, PORT_RANGE_START};

/// Largest VNI a GENEVE header can carry, exclusive.
pub const VNI_LIMIT: u32 = 1 << 24;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("unknown network {0:?}")]
    UnknownNetwork(String),

    #[error("no free tunnel port left for network {0:?}")]
    PortsExhausted(String),
}

/// Where a network's overlay terminates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    pub gateway_ip: Ipv4Addr,
    pub vni: u32,
}

/// Tunnel parameters handed to a new attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAllocation {
    pub port: u16,
    pub gateway_ip: Ipv4Addr,
    pub vni: u32,
}

/// Known networks plus their port allocations. Readers get copies, never
/// references into the shared state.
#[derive(Debug, Default)]
pub struct NetworkStore {
    networks: RwLock<BTreeMap<String, NetworkSpec>>,
    ports: RwLock<PortMap>,
}

impl NetworkStore {
    pub fn new(networks: BTreeMap<String, NetworkSpec>) -> Self {
        Self::with_ports(networks, PortMap::new())
    }

    pub fn with_ports(networks: BTreeMap<String, NetworkSpec>, ports: PortMap) -> Self {
        Self {
            networks: RwLock::new(networks),
            ports: RwLock::new(ports),
        }
    }

    pub fn lookup(&self, network: &str) -> Result<NetworkSpec, StoreError> {
        self.networks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(network)
            .cloned()
            .ok_or_else(|| StoreError::UnknownNetwork(network.to_string()))
    }

    pub fn allocate_port(&self, network: &str, pod: &str) -> Result<PortAllocation, StoreError> {
        let spec = self.lookup(network)?;
        let port = self
            .ports
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .allocate(network, pod)?;
        debug!(network, pod, port, "allocated tunnel port");
        Ok(PortAllocation {
            port,
            gateway_ip: spec.gateway_ip,
            vni: spec.vni,
        })
    }

    pub fn release_port(&self, network: &str, port: u16) -> Result<(), StoreError> {
        self.lookup(network)?;
        let holder = self
            .ports
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .release(network, port);
        debug!(network, port, holder = ?holder, "released tunnel port");
        Ok(())
    }

    pub fn port_of(&self, network: &str, pod: &str) -> Result<Option<u16>, StoreError> {
        self.lookup(network)?;
        Ok(self
            .ports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .port_of(network, pod))
    }

    pub fn ports(&self) -> PortMap {
        self.ports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
