use std::ffi::OsStr;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::process::Command;

use ipnetwork::Ipv4Network;
use serde::Deserialize;
use tracing::trace;

use super::{Link, LinkKind, LinkSpec, NetLink, Neigh, Route, RouteScope, Rule, MAIN_TABLE};
use crate::error::NetlinkError;

/// [`NetLink`] backend driving iproute2.
///
/// Commands are forked from the calling thread, so they act on whichever
/// network namespace that thread is in. Namespace file descriptors handed to
/// [`NetLink::link_set_ns_fd`] must be inheritable (opened without
/// `O_CLOEXEC`) for the child to resolve `/proc/self/fd/<fd>`.
#[derive(Debug, Clone)]
pub struct IpRoute2 {
    binary: PathBuf,
}

impl Default for IpRoute2 {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ip"),
        }
    }
}

impl IpRoute2 {
    pub fn new() -> Self {
        Self::default()
    }

    fn run<S: AsRef<OsStr>>(&self, args: &[S], subject: &str) -> Result<Vec<u8>, NetlinkError> {
        let cmd = command_line(args);
        trace!(%cmd, "running iproute2");

        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(|source| NetlinkError::Io {
                cmd: cmd.clone(),
                source,
            })?;

        if output.status.success() {
            return Ok(output.stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify(cmd, stderr, subject))
    }

    fn links(&self, args: &[&str], subject: &str) -> Result<Vec<Link>, NetlinkError> {
        let stdout = self.run(args, subject)?;
        parse_links(&stdout).map_err(|source| NetlinkError::Parse {
            cmd: command_line(args),
            source,
        })
    }
}

fn command_line<S: AsRef<OsStr>>(args: &[S]) -> String {
    let mut cmd = String::from("ip");
    for arg in args {
        cmd.push(' ');
        cmd.push_str(&arg.as_ref().to_string_lossy());
    }
    cmd
}

/// Map iproute2's error text onto the outcomes the driver branches on.
fn classify(cmd: String, stderr: String, subject: &str) -> NetlinkError {
    if stderr.contains("File exists") {
        NetlinkError::AlreadyExists(subject.to_string())
    } else if stderr.contains("does not exist") || stderr.contains("Cannot find device") {
        NetlinkError::NotFound(subject.to_string())
    } else if stderr.contains("No such file or directory") || stderr.contains("No such process") {
        NetlinkError::NoSuchEntry(subject.to_string())
    } else {
        NetlinkError::Command { cmd, stderr }
    }
}

#[derive(Debug, Deserialize)]
struct LinkJson {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    mtu: u32,
    master: Option<String>,
    #[serde(default)]
    promiscuity: u32,
    linkinfo: Option<LinkInfoJson>,
}

#[derive(Debug, Deserialize)]
struct LinkInfoJson {
    info_kind: Option<String>,
}

fn parse_links(stdout: &[u8]) -> Result<Vec<Link>, serde_json::Error> {
    let raw: Vec<LinkJson> = serde_json::from_slice(stdout)?;
    Ok(raw
        .into_iter()
        .map(|l| {
            let kind = LinkKind::from_info_kind(
                l.linkinfo.as_ref().and_then(|info| info.info_kind.as_deref()),
            );
            let up = l.flags.iter().any(|f| f == "UP");
            let promisc = l.promiscuity > 0 || l.flags.iter().any(|f| f == "PROMISC");
            Link {
                name: l.ifname,
                index: l.ifindex,
                kind,
                mtu: l.mtu,
                up,
                promisc,
                master: l.master,
            }
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct RuleJson {
    priority: Option<u32>,
    src: Option<String>,
    srclen: Option<u8>,
    dst: Option<String>,
    dstlen: Option<u8>,
    table: Option<String>,
}

fn parse_table(table: &str) -> Option<u32> {
    match table {
        "main" => Some(MAIN_TABLE),
        "local" => Some(255),
        "default" => Some(253),
        other => other.parse().ok(),
    }
}

fn parse_prefix(addr: Option<&str>, len: Option<u8>) -> Option<Ipv4Network> {
    let addr = addr?;
    if addr == "all" {
        return None;
    }
    let ip: Ipv4Addr = addr.parse().ok()?;
    Ipv4Network::new(ip, len.unwrap_or(32)).ok()
}

/// Parse `ip -4 -j rule show`. Rules that are not IPv4 prefix/table
/// rules (e.g. fwmark or goto rules) still parse, with the unknown parts
/// left unset.
fn parse_rules(stdout: &[u8]) -> Result<Vec<Rule>, serde_json::Error> {
    let raw: Vec<RuleJson> = serde_json::from_slice(stdout)?;
    Ok(raw
        .into_iter()
        .map(|r| Rule {
            priority: r.priority,
            src: parse_prefix(r.src.as_deref(), r.srclen),
            dst: parse_prefix(r.dst.as_deref(), r.dstlen),
            table: r.table.as_deref().and_then(parse_table),
        })
        .collect())
}

/// Both ends of a veth pair get the MTU; without the trailing `mtu` the
/// peer keeps the kernel default.
fn link_add_args(spec: &LinkSpec) -> Vec<String> {
    let mut args = vec!["link".to_string(), "add".to_string()];
    match spec {
        LinkSpec::Veth { name, peer, mtu } => {
            args.extend([
                name.clone(),
                "mtu".to_string(),
                mtu.to_string(),
                "type".to_string(),
                "veth".to_string(),
                "peer".to_string(),
                "name".to_string(),
                peer.clone(),
                "mtu".to_string(),
                mtu.to_string(),
            ]);
        }
        LinkSpec::Bridge {
            name,
            mtu,
            tx_queue_len,
        } => {
            args.extend([
                "name".to_string(),
                name.clone(),
                "mtu".to_string(),
                mtu.to_string(),
            ]);
            if let Some(qlen) = tx_queue_len {
                args.extend(["txqueuelen".to_string(), qlen.to_string()]);
            }
            args.extend(["type".to_string(), "bridge".to_string()]);
        }
    }
    args
}

fn rule_args(verb: &str, rule: &Rule) -> Vec<String> {
    let mut args = vec!["-4".to_string(), "rule".to_string(), verb.to_string()];
    if let Some(priority) = rule.priority {
        args.extend(["priority".to_string(), priority.to_string()]);
    }
    if let Some(src) = rule.src {
        args.extend(["from".to_string(), src.to_string()]);
    }
    if let Some(dst) = rule.dst {
        args.extend(["to".to_string(), dst.to_string()]);
    }
    if let Some(table) = rule.table {
        args.extend(["table".to_string(), table.to_string()]);
    }
    args
}

fn route_args(verb: &str, route: &Route) -> Vec<String> {
    let mut args = vec!["-4".to_string(), "route".to_string(), verb.to_string()];
    match route.dst {
        Some(dst) => args.push(dst.to_string()),
        None => args.push("default".to_string()),
    }
    if let Some(gateway) = route.gateway {
        args.extend(["via".to_string(), gateway.to_string()]);
    }
    if let Some(device) = &route.device {
        args.extend(["dev".to_string(), device.clone()]);
    }
    if route.scope == RouteScope::Link {
        args.extend(["scope".to_string(), "link".to_string()]);
    }
    args
}

fn route_subject(route: &Route) -> String {
    route
        .dst
        .map_or_else(|| "default".to_string(), |dst| dst.to_string())
}

impl NetLink for IpRoute2 {
    fn link_by_name(&self, name: &str) -> Result<Link, NetlinkError> {
        self.links(&["-j", "-d", "link", "show", "dev", name], name)?
            .into_iter()
            .next()
            .ok_or_else(|| NetlinkError::NotFound(name.to_string()))
    }

    fn link_list(&self) -> Result<Vec<Link>, NetlinkError> {
        self.links(&["-j", "-d", "link", "show"], "links")
    }

    fn link_add(&self, spec: &LinkSpec) -> Result<(), NetlinkError> {
        self.run(&link_add_args(spec), spec.name()).map(drop)
    }

    fn link_del(&self, name: &str) -> Result<(), NetlinkError> {
        self.run(&["link", "del", "dev", name], name).map(drop)
    }

    fn link_set_up(&self, name: &str) -> Result<(), NetlinkError> {
        self.run(&["link", "set", "dev", name, "up"], name).map(drop)
    }

    fn link_set_promisc_on(&self, name: &str) -> Result<(), NetlinkError> {
        self.run(&["link", "set", "dev", name, "promisc", "on"], name)
            .map(drop)
    }

    fn link_set_master(&self, name: &str, master: &str) -> Result<(), NetlinkError> {
        self.run(&["link", "set", "dev", name, "master", master], name)
            .map(drop)
    }

    fn link_set_nomaster(&self, name: &str) -> Result<(), NetlinkError> {
        self.run(&["link", "set", "dev", name, "nomaster"], name)
            .map(drop)
    }

    fn link_set_ns_fd(&self, name: &str, fd: RawFd) -> Result<(), NetlinkError> {
        let target = format!("/proc/self/fd/{fd}");
        self.run(&["link", "set", "dev", name, "netns", target.as_str()], name)
            .map(drop)
    }

    fn addr_add(&self, name: &str, addr: Ipv4Network) -> Result<(), NetlinkError> {
        let addr = addr.to_string();
        self.run(&["-4", "addr", "add", addr.as_str(), "dev", name], name)
            .map(drop)
    }

    fn route_add(&self, route: &Route) -> Result<(), NetlinkError> {
        self.run(&route_args("add", route), &route_subject(route))
            .map(drop)
    }

    fn route_del(&self, route: &Route) -> Result<(), NetlinkError> {
        self.run(&route_args("del", route), &route_subject(route))
            .map(drop)
    }

    fn neigh_add(&self, neigh: &Neigh) -> Result<(), NetlinkError> {
        let ip = neigh.ip.to_string();
        let lladdr = neigh.lladdr.to_string();
        self.run(
            &[
                "-4",
                "neigh",
                "add",
                ip.as_str(),
                "lladdr",
                lladdr.as_str(),
                "dev",
                neigh.device.as_str(),
                "nud",
                "permanent",
            ],
            &ip,
        )
        .map(drop)
    }

    fn rule_add(&self, rule: &Rule) -> Result<(), NetlinkError> {
        self.run(&rule_args("add", rule), &rule.to_string())
            .map(drop)
    }

    fn rule_del(&self, rule: &Rule) -> Result<(), NetlinkError> {
        self.run(&rule_args("del", rule), &rule.to_string())
            .map(drop)
    }

    fn rule_list(&self) -> Result<Vec<Rule>, NetlinkError> {
        let args = ["-4", "-j", "rule", "show"];
        let stdout = self.run(&args, "rules")?;
        parse_rules(&stdout).map_err(|source| NetlinkError::Parse {
            cmd: command_line(&args),
            source,
        })
    }
}
