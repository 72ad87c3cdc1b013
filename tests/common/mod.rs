#![allow(dead_code)]

//! In-memory kernel used by the integration tests.

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use ipnetwork::Ipv4Network;

use geneve_cni::driver::{AttachmentRequest, LinuxNetwork, Sleeper, TunnelCreator, TunnelSpec};
use geneve_cni::netlink::{Link, LinkKind, LinkSpec, NetLink, Neigh, Route, Rule};
use geneve_cni::netns::{HostNetns, Namespace, NsWork};
use geneve_cni::NetlinkError;

/// Name of the host namespace in [`FakeKernel`].
pub const HOST: &str = "host";

#[derive(Debug, Clone)]
struct Fault {
    op: String,
    subject: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    namespaces: BTreeMap<String, BTreeMap<String, Link>>,
    peers: BTreeMap<u32, u32>,
    next_index: u32,
    pending: BTreeMap<String, (u32, Link)>,
    lookups: BTreeMap<String, u32>,
    routes: BTreeMap<String, Vec<Route>>,
    addrs: BTreeMap<String, Vec<(String, Ipv4Network)>>,
    neighs: BTreeMap<String, Vec<Neigh>>,
    rules: BTreeMap<String, Vec<Rule>>,
    faults: Vec<Fault>,
    ops: Vec<String>,
}

impl State {
    fn links(&mut self, ns: &str) -> &mut BTreeMap<String, Link> {
        self.namespaces.entry(ns.to_string()).or_default()
    }

    fn new_link(&mut self, name: &str, kind: LinkKind, mtu: u32) -> Link {
        self.next_index += 1;
        Link {
            name: name.to_string(),
            index: self.next_index,
            kind,
            mtu,
            up: false,
            promisc: false,
            master: None,
        }
    }

    fn exists(&self, ns: &str, name: &str) -> bool {
        self.namespaces
            .get(ns)
            .is_some_and(|links| links.contains_key(name))
    }

    fn remove_by_index(&mut self, index: u32) {
        let mut removed = None;
        for (ns, links) in self.namespaces.iter_mut() {
            if let Some(name) = links
                .values()
                .find(|l| l.index == index)
                .map(|l| l.name.clone())
            {
                links.remove(&name);
                removed = Some((ns.clone(), name));
                break;
            }
        }
        let Some((ns, name)) = removed else {
            return;
        };

        if let Some(links) = self.namespaces.get_mut(&ns) {
            for link in links.values_mut() {
                if link.master.as_deref() == Some(name.as_str()) {
                    link.master = None;
                }
            }
        }
        if let Some(routes) = self.routes.get_mut(&ns) {
            routes.retain(|r| r.device.as_deref() != Some(name.as_str()));
        }
        if let Some(addrs) = self.addrs.get_mut(&ns) {
            addrs.retain(|(dev, _)| dev != &name);
        }
        if let Some(neighs) = self.neighs.get_mut(&ns) {
            neighs.retain(|n| n.device != name);
        }
    }

    fn is_faulty(&self, op: &str, subject: &str) -> bool {
        self.faults.iter().any(|f| {
            f.op == op && f.subject.as_deref().map_or(true, |s| subject.contains(s))
        })
    }
}

/// Kernel objects of every namespace, shared between all handles.
#[derive(Debug, Clone, Default)]
pub struct FakeKernel {
    state: Arc<Mutex<State>>,
}

impl FakeKernel {
    pub fn new() -> Self {
        let kernel = Self::default();
        kernel.state.lock().unwrap().links(HOST);
        kernel
    }

    fn host(&self) -> NsHandle {
        self.handle(HOST)
    }

    pub fn handle(&self, ns: &str) -> NsHandle {
        NsHandle {
            state: self.state.clone(),
            ns: ns.to_string(),
        }
    }

    /// Register a pod namespace reachable at `path`.
    pub fn add_netns(&self, path: impl AsRef<Path>) {
        let ns = path.as_ref().to_string_lossy().to_string();
        self.state.lock().unwrap().links(&ns);
    }

    /// Drop a pod namespace, taking its veths and their peers with it.
    pub fn remove_netns(&self, path: impl AsRef<Path>) {
        let ns = path.as_ref().to_string_lossy().to_string();
        let mut state = self.state.lock().unwrap();
        let indexes: Vec<u32> = state
            .namespaces
            .get(&ns)
            .map(|links| links.values().map(|l| l.index).collect())
            .unwrap_or_default();
        for index in indexes {
            if let Some(peer) = state.peers.remove(&index) {
                state.peers.remove(&peer);
                state.remove_by_index(peer);
            }
            state.remove_by_index(index);
        }
        state.namespaces.remove(&ns);
    }

    /// Add a link directly, bypassing faults.
    pub fn insert_link(&self, ns: &str, name: &str, kind: LinkKind) {
        let mut state = self.state.lock().unwrap();
        let link = state.new_link(name, kind, 1500);
        state.links(ns).insert(name.to_string(), link);
    }

    /// Create a GENEVE link that becomes visible after `hidden_lookups`
    /// failed lookups.
    pub fn create_geneve(&self, name: &str, hidden_lookups: u32) -> Result<(), String> {
        let mut state = self.state.lock().unwrap();
        if state.exists(HOST, name) || state.pending.contains_key(name) {
            return Err("RTNETLINK answers: File exists".to_string());
        }
        let link = state.new_link(name, LinkKind::Geneve, 1500);
        if hidden_lookups == 0 {
            state.links(HOST).insert(name.to_string(), link);
        } else {
            state.pending.insert(name.to_string(), (hidden_lookups, link));
        }
        Ok(())
    }

    pub fn link(&self, ns: &str, name: &str) -> Option<Link> {
        self.state
            .lock()
            .unwrap()
            .namespaces
            .get(ns)
            .and_then(|links| links.get(name).cloned())
    }

    pub fn has_link(&self, ns: &str, name: &str) -> bool {
        self.link(ns, name).is_some()
    }

    pub fn links_in(&self, ns: &str) -> Vec<Link> {
        self.state
            .lock()
            .unwrap()
            .namespaces
            .get(ns)
            .map(|links| links.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.rules_in(HOST)
    }

    pub fn rules_in(&self, ns: &str) -> Vec<Rule> {
        self.state
            .lock()
            .unwrap()
            .rules
            .get(ns)
            .cloned()
            .unwrap_or_default()
    }

    pub fn routes(&self, ns: &str) -> Vec<Route> {
        self.state
            .lock()
            .unwrap()
            .routes
            .get(ns)
            .cloned()
            .unwrap_or_default()
    }

    pub fn addrs(&self, ns: &str) -> Vec<(String, Ipv4Network)> {
        self.state
            .lock()
            .unwrap()
            .addrs
            .get(ns)
            .cloned()
            .unwrap_or_default()
    }

    pub fn neighs(&self, ns: &str) -> Vec<Neigh> {
        self.state
            .lock()
            .unwrap()
            .neighs
            .get(ns)
            .cloned()
            .unwrap_or_default()
    }

    /// How many times `name` was looked up, in any namespace.
    pub fn lookups(&self, name: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .lookups
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Fail every `op` call.
    pub fn fail(&self, op: &str) {
        self.push_fault(op, None);
    }

    /// Fail `op` calls whose subject contains `subject`.
    pub fn fail_when(&self, op: &str, subject: &str) {
        self.push_fault(op, Some(subject.to_string()));
    }

    pub fn clear_faults(&self) {
        self.state.lock().unwrap().faults.clear();
    }

    fn push_fault(&self, op: &str, subject: Option<String>) {
        self.state.lock().unwrap().faults.push(Fault {
            op: op.to_string(),
            subject,
        });
    }

    /// `<ns>:<op> <subject>` for every call made, in order.
    pub fn ops(&self) -> Vec<String> {
        self.state.lock().unwrap().ops.clone()
    }
}

/// [`NetLink`] view of one namespace of a [`FakeKernel`].
pub struct NsHandle {
    state: Arc<Mutex<State>>,
    ns: String,
}

impl NsHandle {
    fn with<T>(
        &self,
        op: &str,
        subject: &str,
        f: impl FnOnce(&mut State, &str) -> Result<T, NetlinkError>,
    ) -> Result<T, NetlinkError> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("{}:{} {}", self.ns, op, subject));
        if state.is_faulty(op, subject) {
            return Err(NetlinkError::Command {
                cmd: format!("{op} {subject}"),
                stderr: "injected fault".to_string(),
            });
        }
        f(&mut state, &self.ns)
    }

    fn modify_link(
        &self,
        op: &str,
        name: &str,
        f: impl FnOnce(&mut Link),
    ) -> Result<(), NetlinkError> {
        self.with(op, name, |s, ns| {
            let link = s
                .links(ns)
                .get_mut(name)
                .ok_or_else(|| NetlinkError::NotFound(name.to_string()))?;
            f(link);
            Ok(())
        })
    }
}

fn require_link(s: &mut State, ns: &str, name: &str) -> Result<(), NetlinkError> {
    if s.exists(ns, name) {
        Ok(())
    } else {
        Err(NetlinkError::NotFound(name.to_string()))
    }
}

impl NetLink for NsHandle {
    fn link_by_name(&self, name: &str) -> Result<Link, NetlinkError> {
        self.with("link_by_name", name, |s, ns| {
            *s.lookups.entry(name.to_string()).or_default() += 1;
            if let Some(link) = s.links(ns).get(name) {
                return Ok(link.clone());
            }
            if ns == HOST {
                if let Some((remaining, _)) = s.pending.get_mut(name) {
                    if *remaining == 0 {
                        let (_, link) = s.pending.remove(name).unwrap();
                        s.links(ns).insert(name.to_string(), link.clone());
                        return Ok(link);
                    }
                    *remaining -= 1;
                }
            }
            Err(NetlinkError::NotFound(name.to_string()))
        })
    }

    fn link_list(&self) -> Result<Vec<Link>, NetlinkError> {
        self.with("link_list", "", |s, ns| Ok(s.links(ns).values().cloned().collect()))
    }

    fn link_add(&self, spec: &LinkSpec) -> Result<(), NetlinkError> {
        self.with("link_add", spec.name(), |s, ns| match spec {
            LinkSpec::Veth { name, peer, mtu } => {
                if s.exists(ns, name) || s.exists(ns, peer) {
                    return Err(NetlinkError::AlreadyExists(name.clone()));
                }
                let a = s.new_link(name, LinkKind::Veth, *mtu);
                let b = s.new_link(peer, LinkKind::Veth, *mtu);
                s.peers.insert(a.index, b.index);
                s.peers.insert(b.index, a.index);
                s.links(ns).insert(name.clone(), a);
                s.links(ns).insert(peer.clone(), b);
                Ok(())
            }
            LinkSpec::Bridge { name, mtu, .. } => {
                if s.exists(ns, name) {
                    return Err(NetlinkError::AlreadyExists(name.clone()));
                }
                let bridge = s.new_link(name, LinkKind::Bridge, *mtu);
                s.links(ns).insert(name.clone(), bridge);
                Ok(())
            }
        })
    }

    fn link_del(&self, name: &str) -> Result<(), NetlinkError> {
        self.with("link_del", name, |s, ns| {
            let index = s
                .links(ns)
                .get(name)
                .map(|l| l.index)
                .ok_or_else(|| NetlinkError::NotFound(name.to_string()))?;
            if let Some(peer) = s.peers.remove(&index) {
                s.peers.remove(&peer);
                s.remove_by_index(peer);
            }
            s.remove_by_index(index);
            Ok(())
        })
    }

    fn link_set_up(&self, name: &str) -> Result<(), NetlinkError> {
        self.modify_link("link_set_up", name, |l| l.up = true)
    }

    fn link_set_promisc_on(&self, name: &str) -> Result<(), NetlinkError> {
        self.modify_link("link_set_promisc_on", name, |l| l.promisc = true)
    }

    fn link_set_master(&self, name: &str, master: &str) -> Result<(), NetlinkError> {
        self.with("link_set_master", name, |s, ns| {
            match s.links(ns).get(master) {
                Some(m) if m.kind == LinkKind::Bridge => {}
                Some(_) => {
                    return Err(NetlinkError::Command {
                        cmd: format!("link set {name} master {master}"),
                        stderr: "Operation not supported".to_string(),
                    })
                }
                None => return Err(NetlinkError::NotFound(master.to_string())),
            }
            let link = s
                .links(ns)
                .get_mut(name)
                .ok_or_else(|| NetlinkError::NotFound(name.to_string()))?;
            link.master = Some(master.to_string());
            Ok(())
        })
    }

    fn link_set_nomaster(&self, name: &str) -> Result<(), NetlinkError> {
        self.modify_link("link_set_nomaster", name, |l| l.master = None)
    }

    fn link_set_ns_fd(&self, name: &str, _fd: RawFd) -> Result<(), NetlinkError> {
        self.with("link_set_ns_fd", name, |s, ns| {
            let link = s
                .links(ns)
                .remove(name)
                .ok_or_else(|| NetlinkError::NotFound(name.to_string()))?;
            s.links(HOST).insert(name.to_string(), link);
            Ok(())
        })
    }

    fn addr_add(&self, name: &str, addr: Ipv4Network) -> Result<(), NetlinkError> {
        self.with("addr_add", name, |s, ns| {
            require_link(s, ns, name)?;
            let addrs = s.addrs.entry(ns.to_string()).or_default();
            if addrs.iter().any(|(dev, a)| dev == name && *a == addr) {
                return Err(NetlinkError::AlreadyExists(addr.to_string()));
            }
            addrs.push((name.to_string(), addr));
            Ok(())
        })
    }

    fn route_add(&self, route: &Route) -> Result<(), NetlinkError> {
        let subject = format!("{:?}", route.dst);
        self.with("route_add", &subject, |s, ns| {
            if let Some(dev) = &route.device {
                require_link(s, ns, dev)?;
            }
            let routes = s.routes.entry(ns.to_string()).or_default();
            if routes
                .iter()
                .any(|r| r.dst == route.dst && r.device == route.device)
            {
                return Err(NetlinkError::AlreadyExists(subject.clone()));
            }
            routes.push(route.clone());
            Ok(())
        })
    }

    fn route_del(&self, route: &Route) -> Result<(), NetlinkError> {
        let subject = format!("{:?}", route.dst);
        self.with("route_del", &subject, |s, ns| {
            let routes = s.routes.entry(ns.to_string()).or_default();
            let pos = routes.iter().position(|r| {
                r.dst == route.dst
                    && route.device.as_ref().map_or(true, |d| r.device.as_ref() == Some(d))
                    && route.gateway.map_or(true, |g| r.gateway == Some(g))
            });
            match pos {
                Some(pos) => {
                    routes.remove(pos);
                    Ok(())
                }
                None => Err(NetlinkError::NoSuchEntry(subject.clone())),
            }
        })
    }

    fn neigh_add(&self, neigh: &Neigh) -> Result<(), NetlinkError> {
        self.with("neigh_add", &neigh.device, |s, ns| {
            require_link(s, ns, &neigh.device)?;
            s.neighs.entry(ns.to_string()).or_default().push(neigh.clone());
            Ok(())
        })
    }

    fn rule_add(&self, rule: &Rule) -> Result<(), NetlinkError> {
        self.with("rule_add", &rule.to_string(), |s, ns| {
            let rules = s.rules.entry(ns.to_string()).or_default();
            if rules.contains(rule) {
                return Err(NetlinkError::AlreadyExists(rule.to_string()));
            }
            rules.push(rule.clone());
            Ok(())
        })
    }

    fn rule_del(&self, rule: &Rule) -> Result<(), NetlinkError> {
        self.with("rule_del", &rule.to_string(), |s, ns| {
            let rules = s.rules.entry(ns.to_string()).or_default();
            match rules.iter().position(|r| rule.matches(r)) {
                Some(pos) => {
                    rules.remove(pos);
                    Ok(())
                }
                None => Err(NetlinkError::NoSuchEntry(rule.to_string())),
            }
        })
    }

    fn rule_list(&self) -> Result<Vec<Rule>, NetlinkError> {
        self.with("rule_list", "", |s, ns| {
            Ok(s.rules.get(ns).cloned().unwrap_or_default())
        })
    }
}

impl NetLink for FakeKernel {
    fn link_by_name(&self, name: &str) -> Result<Link, NetlinkError> {
        self.host().link_by_name(name)
    }
    fn link_list(&self) -> Result<Vec<Link>, NetlinkError> {
        self.host().link_list()
    }
    fn link_add(&self, spec: &LinkSpec) -> Result<(), NetlinkError> {
        self.host().link_add(spec)
    }
    fn link_del(&self, name: &str) -> Result<(), NetlinkError> {
        self.host().link_del(name)
    }
    fn link_set_up(&self, name: &str) -> Result<(), NetlinkError> {
        self.host().link_set_up(name)
    }
    fn link_set_promisc_on(&self, name: &str) -> Result<(), NetlinkError> {
        self.host().link_set_promisc_on(name)
    }
    fn link_set_master(&self, name: &str, master: &str) -> Result<(), NetlinkError> {
        self.host().link_set_master(name, master)
    }
    fn link_set_nomaster(&self, name: &str) -> Result<(), NetlinkError> {
        self.host().link_set_nomaster(name)
    }
    fn link_set_ns_fd(&self, name: &str, fd: RawFd) -> Result<(), NetlinkError> {
        self.host().link_set_ns_fd(name, fd)
    }
    fn addr_add(&self, name: &str, addr: Ipv4Network) -> Result<(), NetlinkError> {
        self.host().addr_add(name, addr)
    }
    fn route_add(&self, route: &Route) -> Result<(), NetlinkError> {
        self.host().route_add(route)
    }
    fn route_del(&self, route: &Route) -> Result<(), NetlinkError> {
        self.host().route_del(route)
    }
    fn neigh_add(&self, neigh: &Neigh) -> Result<(), NetlinkError> {
        self.host().neigh_add(neigh)
    }
    fn rule_add(&self, rule: &Rule) -> Result<(), NetlinkError> {
        self.host().rule_add(rule)
    }
    fn rule_del(&self, rule: &Rule) -> Result<(), NetlinkError> {
        self.host().rule_del(rule)
    }
    fn rule_list(&self) -> Result<Vec<Rule>, NetlinkError> {
        self.host().rule_list()
    }
}

impl Namespace for FakeKernel {
    fn with_netns_path(&self, path: &Path, work: &mut NsWork<'_>) -> Result<()> {
        let ns = path.to_string_lossy().to_string();
        if ns == HOST || !self.state.lock().unwrap().namespaces.contains_key(&ns) {
            return Err(anyhow!(
                "Failed to open network namespace {}",
                path.display()
            ));
        }
        let handle = self.handle(&ns);
        work(&handle, &HostNetns::from_raw_fd(-1))
    }
}

#[derive(Debug, Clone, Copy)]
pub enum TunnelMode {
    /// Visible after this many failed lookups.
    VisibleAfter(u32),
    /// Creation reports success but the link never shows up.
    NeverVisible,
    /// Creation fails without creating anything.
    Fail,
}

/// [`TunnelCreator`] recording every request.
#[derive(Debug)]
pub struct FakeTunnels {
    kernel: FakeKernel,
    mode: Mutex<TunnelMode>,
    created: Mutex<Vec<TunnelSpec>>,
}

impl FakeTunnels {
    pub fn new(kernel: &FakeKernel) -> Self {
        Self::with_mode(kernel, TunnelMode::VisibleAfter(0))
    }

    pub fn with_mode(kernel: &FakeKernel, mode: TunnelMode) -> Self {
        Self {
            kernel: kernel.clone(),
            mode: Mutex::new(mode),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn set_mode(&self, mode: TunnelMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn created(&self) -> Vec<TunnelSpec> {
        self.created.lock().unwrap().clone()
    }
}

impl TunnelCreator for FakeTunnels {
    fn create_tunnel(&self, spec: &TunnelSpec) -> Result<()> {
        self.created.lock().unwrap().push(spec.clone());
        let mode = *self.mode.lock().unwrap();
        match mode {
            TunnelMode::VisibleAfter(n) => self
                .kernel
                .create_geneve(&spec.name, n)
                .map_err(|e| anyhow!("Failed to create GENEVE interface {}: {}", spec.name, e)),
            TunnelMode::NeverVisible => Ok(()),
            TunnelMode::Fail => Err(anyhow!(
                "Failed to create GENEVE interface {}: Operation not permitted",
                spec.name
            )),
        }
    }
}

/// Fake clock recording requested sleeps.
#[derive(Debug, Default)]
pub struct CountingSleeper {
    count: AtomicU32,
    slept: Mutex<Vec<Duration>>,
}

impl CountingSleeper {
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().unwrap().clone()
    }
}

impl Sleeper for CountingSleeper {
    fn sleep(&self, duration: Duration) {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.slept.lock().unwrap().push(duration);
    }
}

/// Coordinator wired to fakes.
pub struct Harness {
    pub kernel: FakeKernel,
    pub tunnels: Arc<FakeTunnels>,
    pub sleeper: Arc<CountingSleeper>,
    pub network: LinuxNetwork,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_tunnel_mode(TunnelMode::VisibleAfter(0))
    }

    pub fn with_tunnel_mode(mode: TunnelMode) -> Self {
        let kernel = FakeKernel::new();
        let tunnels = Arc::new(FakeTunnels::with_mode(&kernel, mode));
        let sleeper = Arc::new(CountingSleeper::default());
        let network = LinuxNetwork::builder(Arc::new(kernel.clone()), Arc::new(kernel.clone()))
            .tunnel_creator(tunnels.clone())
            .sleeper(sleeper.clone())
            .build();
        Self {
            kernel,
            tunnels,
            sleeper,
            network,
        }
    }

    /// Attachment request for `pod`, registering its namespace.
    pub fn request(&self, pod: &str, addr: &str, table: u32) -> AttachmentRequest {
        let netns_path = PathBuf::from(format!("/var/run/netns/{pod}"));
        self.kernel.add_netns(&netns_path);
        request(pod, addr, table, netns_path)
    }
}

pub fn request(pod: &str, addr: &str, table: u32, netns_path: PathBuf) -> AttachmentRequest {
    AttachmentRequest {
        host_veth_name: format!("gnv{pod}"),
        container_veth_name: "eth0".to_string(),
        tunnel_name: format!("gnt{pod}"),
        bridge_name: "gnvbr0".to_string(),
        netns_path,
        addr: addr.parse().unwrap(),
        table,
        vpc_cidrs: vec![
            "10.0.0.0/16".parse().unwrap(),
            "172.16.0.0/12".parse().unwrap(),
        ],
        use_external_snat: false,
        gateway_ip: "10.0.2.10".parse().unwrap(),
        vni: 100,
        tunnel_port: 4000,
    }
}

pub fn netns_key(req: &AttachmentRequest) -> String {
    req.netns_path.to_string_lossy().to_string()
}
