use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ipnetwork::Ipv4Network;
use tracing::info;
use tracing_subscriber::EnvFilter;

use geneve_cni::config::validate_vni;
use geneve_cni::driver::{AttachmentRequest, DetachmentRequest, LinuxNetwork, NetworkApis};
use geneve_cni::netlink::{IpRoute2, LinkKind, NetLink};
use geneve_cni::store::PortLedger;
use geneve_cni::types::InterfaceNames;

/// Operator tool for GENEVE pod attachments
#[derive(Parser)]
#[command(name = "geneve-cni-ctl", author, version, about)]
struct Cli {
    /// Directory holding the port ledger and lock files
    #[arg(long, default_value = "/var/lib/cni/geneve")]
    state_dir: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach a namespace to the overlay
    Setup {
        /// Pod as namespace/name, used to derive interface names
        #[arg(long)]
        pod: String,

        /// Path of the pod network namespace
        #[arg(long)]
        netns: PathBuf,

        /// Interface name inside the pod
        #[arg(long, default_value = "eth0")]
        ifname: String,

        /// Pod address with prefix
        #[arg(long)]
        addr: Ipv4Network,

        #[arg(long, default_value = "gnvbr0")]
        bridge: String,

        /// Pod routing table, 0 for none
        #[arg(long, default_value_t = 0)]
        table: u32,

        /// VPC CIDR reached through the pod table (repeatable)
        #[arg(long = "vpc-cidr")]
        vpc_cidrs: Vec<Ipv4Network>,

        #[arg(long)]
        external_snat: bool,

        /// Remote tunnel endpoint
        #[arg(long)]
        gateway: Ipv4Addr,

        #[arg(long, value_parser = parse_vni)]
        vni: u32,

        /// Tunnel UDP destination port
        #[arg(long)]
        port: u16,
    },

    /// Detach a pod from the overlay
    Teardown {
        /// Pod as namespace/name
        #[arg(long)]
        pod: String,

        /// Pod address; rules and routes are left alone without it
        #[arg(long)]
        addr: Option<Ipv4Network>,

        #[arg(long, default_value = "gnvbr0")]
        bridge: String,

        #[arg(long, default_value_t = 0)]
        table: u32,
    },

    /// List tunnel port allocations
    Ports,

    /// Release a tunnel port
    Release {
        #[arg(long)]
        network: String,

        #[arg(long)]
        port: u16,
    },

    /// List GENEVE links and their bridge
    Status,
}

fn parse_vni(value: &str) -> Result<u32, String> {
    let vni: u32 = value.parse().map_err(|e| format!("{e}"))?;
    validate_vni(vni).map_err(|e| e.to_string())?;
    Ok(vni)
}

fn names_for(pod: &str, ifname: &str) -> Result<InterfaceNames> {
    let (namespace, name) = pod
        .split_once('/')
        .with_context(|| format!("Invalid pod {pod:?}, expected namespace/name"))?;
    Ok(InterfaceNames::derive(&format!("{namespace}.{name}"), ifname))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(anyhow::Error::msg)
        .context("Failed to set default subscriber")?;

    match cli.command {
        Commands::Setup {
            pod,
            netns,
            ifname,
            addr,
            bridge,
            table,
            vpc_cidrs,
            external_snat,
            gateway,
            vni,
            port,
        } => {
            let names = names_for(&pod, &ifname)?;
            let req = AttachmentRequest {
                host_veth_name: names.host_veth,
                container_veth_name: names.container_veth,
                tunnel_name: names.tunnel,
                bridge_name: bridge,
                netns_path: netns,
                addr,
                table,
                vpc_cidrs,
                use_external_snat: external_snat,
                gateway_ip: gateway,
                vni,
                tunnel_port: port,
            };
            LinuxNetwork::new(&cli.state_dir).setup_ns(&req)?;
            println!(
                "Attached {} ({}) via tunnel {} to {}",
                pod, req.host_veth_name, req.tunnel_name, req.bridge_name
            );
        }

        Commands::Teardown {
            pod,
            addr,
            bridge,
            table,
        } => {
            let names = names_for(&pod, "eth0")?;
            let req = DetachmentRequest {
                addr,
                table,
                host_veth_name: names.host_veth,
                tunnel_name: names.tunnel,
                bridge_name: bridge,
            };
            LinuxNetwork::new(&cli.state_dir).teardown_ns(&req)?;
            println!("Detached {}", pod);
        }

        Commands::Ports => {
            let ports = PortLedger::new(&cli.state_dir).load()?;
            if ports.is_empty() {
                println!("No tunnel ports allocated");
            }
            for (network, port, pod) in ports.entries() {
                println!("  {:<16} {:>5}  {}", network, port, pod);
            }
        }

        Commands::Release { network, port } => {
            match PortLedger::new(&cli.state_dir).release(&network, port)? {
                Some(pod) => println!("Released port {} on {} (held by {})", port, network, pod),
                None => println!("Port {} on {} was not allocated", port, network),
            }
        }

        Commands::Status => {
            let links = IpRoute2::new().link_list()?;
            let tunnels: Vec<_> = links
                .iter()
                .filter(|l| l.kind == LinkKind::Geneve)
                .collect();
            info!(count = tunnels.len(), "found GENEVE links");
            for link in tunnels {
                println!(
                    "  {:<16} {:<5} master={}",
                    link.name,
                    if link.up { "UP" } else { "DOWN" },
                    link.master.as_deref().unwrap_or("-")
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_args(vni: &str) -> Vec<String> {
        [
            "geneve-cni-ctl",
            "setup",
            "--pod",
            "default/web",
            "--netns",
            "/var/run/netns/web",
            "--addr",
            "10.0.1.5/32",
            "--gateway",
            "10.0.2.10",
            "--vni",
            vni,
            "--port",
            "4000",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    #[test]
    fn setup_accepts_24_bit_vni() {
        let cli = Cli::try_parse_from(setup_args("16777215")).unwrap();
        match cli.command {
            Commands::Setup { vni, .. } => assert_eq!(vni, 16_777_215),
            _ => panic!("expected setup"),
        }
    }

    #[test]
    fn setup_rejects_oversized_vni() {
        let err = Cli::try_parse_from(setup_args("16777216"))
            .err()
            .expect("vni above 24 bits must be rejected");
        assert!(err.to_string().contains("Invalid VNI"));
    }
}
