use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::NetConf;
use crate::driver::{
    self, AttachmentRequest, DetachmentRequest, LinuxNetwork, NetworkApis, PolicyRoutingManager,
    PolicyRule, POD_GATEWAY,
};
use crate::netlink::{IpRoute2, NetLink};
use crate::store::{PortLedger, StoreError};
use crate::types::{
    CmdArgs, IPConfig, Interface, InterfaceNames, PodArgs, Result as CniResult, Route as CniRoute,
};

/// GENEVE plugin implementation
pub struct GenevePlugin {
    config: NetConf,
    args: CmdArgs,
    network: Arc<dyn NetworkApis>,
    netlink: Arc<dyn NetLink>,
    ledger: PortLedger,
}

impl GenevePlugin {
    pub fn new(config: NetConf, args: CmdArgs) -> Self {
        let network = Arc::new(
            LinuxNetwork::node_builder(&config.state_dir)
                .veth_mtu(config.mtu)
                .build(),
        );
        let ledger = PortLedger::new(config.state_dir.clone());
        Self::with_parts(config, args, network, Arc::new(IpRoute2::new()), ledger)
    }

    pub fn with_parts(
        config: NetConf,
        args: CmdArgs,
        network: Arc<dyn NetworkApis>,
        netlink: Arc<dyn NetLink>,
        ledger: PortLedger,
    ) -> Self {
        Self {
            config,
            args,
            network,
            netlink,
            ledger,
        }
    }

    fn pod(&self) -> Result<PodArgs> {
        PodArgs::from_cni_args(&self.args.args)
    }

    fn names(&self, pod: &PodArgs) -> InterfaceNames {
        InterfaceNames::for_pod(pod, &self.args.container_id, &self.args.ifname)
    }

    fn network_name(&self, pod: &PodArgs) -> String {
        pod.network
            .clone()
            .unwrap_or_else(|| self.config.default_network.clone())
    }

    /// Attach the pod to its overlay network
    pub fn add_network(&self) -> Result<CniResult> {
        let pod = self.pod()?;
        let addr = pod
            .ip
            .context("IP must be passed in CNI_ARGS for ADD")?;
        let names = self.names(&pod);
        let network = self.network_name(&pod);
        let pod_key = pod.pod_key(&self.args.container_id);

        let alloc = self
            .ledger
            .transaction(&self.config.networks, |store| {
                Ok(store.allocate_port(&network, &pod_key)?)
            })
            .with_context(|| format!("Failed to allocate tunnel port on network {network:?}"))?;
        info!(
            pod = %pod_key,
            network = %network,
            port = alloc.port,
            vni = alloc.vni,
            "allocated tunnel port"
        );

        let req = AttachmentRequest {
            host_veth_name: names.host_veth.clone(),
            container_veth_name: names.container_veth.clone(),
            tunnel_name: names.tunnel.clone(),
            bridge_name: self.config.bridge.clone(),
            netns_path: PathBuf::from(&self.args.netns),
            addr,
            table: pod.table.unwrap_or(self.config.route_table),
            vpc_cidrs: self.config.vpc_cidrs()?,
            use_external_snat: self.config.use_external_snat,
            gateway_ip: alloc.gateway_ip,
            vni: alloc.vni,
            tunnel_port: alloc.port,
        };

        if let Err(err) = self.network.setup_ns(&req) {
            if let Err(e) = self
                .ledger
                .transaction(&self.config.networks, |store| {
                    Ok(store.release_port(&network, alloc.port)?)
                })
            {
                warn!(port = alloc.port, "Failed to release tunnel port: {:#}", e);
            }
            return Err(err);
        }

        let mut result = CniResult::new(&self.config.cni_version);
        result.add_interface(Interface {
            name: names.host_veth,
            mac: None,
            sandbox: None,
        });
        let container = result.add_interface(Interface {
            name: names.container_veth,
            mac: None,
            sandbox: Some(self.args.netns.clone()),
        });
        result.add_ip(IPConfig {
            interface: Some(container),
            address: addr.to_string(),
            gateway: Some(POD_GATEWAY.to_string()),
        });
        result.add_route(CniRoute {
            dst: "0.0.0.0/0".to_string(),
            gw: Some(POD_GATEWAY.to_string()),
        });
        Ok(result)
    }

    /// Detach the pod. Safe to repeat.
    pub fn del_network(&self) -> Result<()> {
        let pod = self.pod()?;
        let names = self.names(&pod);
        let network = self.network_name(&pod);
        let pod_key = pod.pod_key(&self.args.container_id);

        let req = DetachmentRequest {
            addr: pod.ip,
            table: pod.table.unwrap_or(self.config.route_table),
            host_veth_name: names.host_veth,
            tunnel_name: names.tunnel,
            bridge_name: self.config.bridge.clone(),
        };
        let teardown = self.network.teardown_ns(&req);

        let released = self.ledger.transaction(&self.config.networks, |store| {
            match store.port_of(&network, &pod_key)? {
                Some(port) => {
                    store.release_port(&network, port)?;
                    Ok(Some(port))
                }
                None => Ok(None),
            }
        });
        match released {
            Ok(Some(port)) => info!(pod = %pod_key, port, "released tunnel port"),
            Ok(None) => {}
            Err(e) if matches!(e.downcast_ref::<StoreError>(), Some(StoreError::UnknownNetwork(_))) => {
                warn!(network = %network, "network no longer configured, nothing to release")
            }
            Err(e) => warn!(pod = %pod_key, "Failed to release tunnel port: {:#}", e),
        }

        teardown
    }

    /// Verify the host side of the attachment is intact, including the
    /// to-pod rule when the pod address is known
    pub fn check_network(&self) -> Result<()> {
        let pod = self.pod()?;
        let names = self.names(&pod);

        self.netlink
            .link_by_name(&names.host_veth)
            .with_context(|| format!("host veth {} is missing", names.host_veth))?;
        let tunnel = self
            .netlink
            .link_by_name(&names.tunnel)
            .with_context(|| format!("tunnel {} is missing", names.tunnel))?;
        let bridge = driver::bridge::bridge_by_name(self.netlink.as_ref(), &self.config.bridge)?;

        if tunnel.master.as_deref() != Some(bridge.name.as_str()) {
            anyhow::bail!(
                "tunnel {} is not attached to bridge {}",
                names.tunnel,
                bridge.name
            );
        }

        if let Some(addr) = pod.ip {
            let want = PolicyRule::to_pod(addr).to_rule();
            let rules = PolicyRoutingManager::new(self.netlink.clone()).rules_for(addr)?;
            if !rules.iter().any(|r| want.matches(r)) {
                anyhow::bail!("rule {} is missing", want);
            }
        }
        Ok(())
    }
}
