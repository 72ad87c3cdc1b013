use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::debug;

use super::{NetworkSpec, NetworkStore, PortMap};
use crate::lock::FileLock;

const PORTS_FILE: &str = "ports.json";
const LOCK_FILE: &str = "ports.lock";

/// Port allocations persisted in a state directory, shared by every CNI
/// invocation on the node.
#[derive(Debug, Clone)]
pub struct PortLedger {
    dir: PathBuf,
}

impl PortLedger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Run `f` against a store holding the persisted allocations and write
    /// them back if it succeeds. The ledger is locked for the whole call.
    pub fn transaction<T>(
        &self,
        networks: &BTreeMap<String, NetworkSpec>,
        f: impl FnOnce(&NetworkStore) -> Result<T>,
    ) -> Result<T> {
        let _lock = FileLock::exclusive(&self.dir.join(LOCK_FILE))?;

        let before = self.read()?;
        let store = NetworkStore::with_ports(networks.clone(), before.clone());
        let value = f(&store)?;

        let after = store.ports();
        if after != before {
            self.write(&after)?;
        }
        Ok(value)
    }

    /// Current allocations.
    pub fn load(&self) -> Result<PortMap> {
        let _lock = FileLock::exclusive(&self.dir.join(LOCK_FILE))?;
        self.read()
    }

    /// Release `port` without consulting network definitions. Returns the
    /// pod that held it.
    pub fn release(&self, network: &str, port: u16) -> Result<Option<String>> {
        let _lock = FileLock::exclusive(&self.dir.join(LOCK_FILE))?;
        let mut ports = self.read()?;
        let holder = ports.release(network, port);
        if holder.is_some() {
            self.write(&ports)?;
        }
        Ok(holder)
    }

    fn read(&self) -> Result<PortMap> {
        let path = self.dir.join(PORTS_FILE);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Failed to parse port ledger {}", path.display())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(PortMap::new()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read port ledger {}", path.display()))
            }
        }
    }

    fn write(&self, ports: &PortMap) -> Result<()> {
        let path = self.dir.join(PORTS_FILE);
        let tmp = self.dir.join(format!("{PORTS_FILE}.tmp"));
        let json = serde_json::to_vec_pretty(ports)?;
        fs::write(&tmp, json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        debug!(path = %path.display(), allocations = ports.len(), "saved port ledger");
        Ok(())
    }
}
