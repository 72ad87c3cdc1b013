use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::StoreError;

/// First tunnel port handed out per network.
pub const PORT_RANGE_START: u16 = 4000;

/// Number of tunnel ports available per network.
pub const PORT_RANGE_SIZE: u16 = 300;

/// Tunnel port allocations, network name -> port -> pod key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortMap {
    networks: BTreeMap<String, BTreeMap<u16, String>>,
}

impl PortMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lowest free port in the range, or the port `pod` already holds.
    pub fn allocate(&mut self, network: &str, pod: &str) -> Result<u16, StoreError> {
        if let Some(port) = self.port_of(network, pod) {
            return Ok(port);
        }

        let used = self.networks.entry(network.to_string()).or_default();
        let port = (PORT_RANGE_START..PORT_RANGE_START + PORT_RANGE_SIZE)
            .find(|p| !used.contains_key(p))
            .ok_or_else(|| StoreError::PortsExhausted(network.to_string()))?;
        used.insert(port, pod.to_string());
        Ok(port)
    }

    /// Returns the pod that held `port`, if any.
    pub fn release(&mut self, network: &str, port: u16) -> Option<String> {
        let used = self.networks.get_mut(network)?;
        let pod = used.remove(&port);
        if used.is_empty() {
            self.networks.remove(network);
        }
        pod
    }

    pub fn port_of(&self, network: &str, pod: &str) -> Option<u16> {
        self.networks
            .get(network)?
            .iter()
            .find(|(_, holder)| holder.as_str() == pod)
            .map(|(port, _)| *port)
    }

    /// `(network, port, pod)` for every allocation, ordered.
    pub fn entries(&self) -> impl Iterator<Item = (&str, u16, &str)> {
        self.networks.iter().flat_map(|(network, ports)| {
            ports
                .iter()
                .map(move |(port, pod)| (network.as_str(), *port, pod.as_str()))
        })
    }

    pub fn len(&self) -> usize {
        self.networks.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}
