//! Running work inside another network namespace.

use std::os::unix::io::RawFd;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use nix::fcntl::{open, OFlag};
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;
use nix::unistd::close;
use tracing::{debug, error};

use crate::netlink::{IpRoute2, NetLink};

/// Work executed inside a namespace. It receives a [`NetLink`] bound to that
/// namespace and a handle to the namespace the caller came from.
pub type NsWork<'a> = dyn FnMut(&dyn NetLink, &HostNetns) -> Result<()> + Send + 'a;

/// Namespace-execution primitive.
pub trait Namespace: Send + Sync {
    /// Enter the namespace at `path`, run `work`, and return to the
    /// caller's namespace on every exit path.
    fn with_netns_path(&self, path: &Path, work: &mut NsWork<'_>) -> Result<()>;
}

/// Open handle on the namespace the caller was in before switching.
///
/// The descriptor is opened without `O_CLOEXEC` so that iproute2 children
/// can refer to it as `/proc/self/fd/<fd>`.
#[derive(Debug)]
pub struct HostNetns {
    fd: RawFd,
}

impl HostNetns {
    fn open_current() -> Result<Self> {
        let fd = open("/proc/thread-self/ns/net", OFlag::O_RDONLY, Mode::empty())
            .context("Failed to open current network namespace")?;
        Ok(Self { fd })
    }

    /// Wrap an already-open namespace descriptor. Negative descriptors are
    /// accepted and never closed.
    pub fn from_raw_fd(fd: RawFd) -> Self {
        Self { fd }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for HostNetns {
    fn drop(&mut self) {
        if self.fd >= 0 {
            let _ = close(self.fd);
        }
    }
}

/// Switches the current thread back to `original` when dropped.
struct RestoreGuard<'a> {
    original: &'a HostNetns,
}

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = setns(self.original.fd(), CloneFlags::CLONE_NEWNET) {
            error!("Failed to restore original network namespace: {}", e);
        }
    }
}

/// [`Namespace`] implementation that switches a dedicated OS thread.
///
/// `setns` only affects the calling thread, so the work runs on a scoped
/// thread and the caller's own thread never leaves its namespace.
#[derive(Debug, Default, Clone)]
pub struct ThreadNetns;

impl ThreadNetns {
    pub fn new() -> Self {
        Self
    }
}

impl Namespace for ThreadNetns {
    fn with_netns_path(&self, path: &Path, work: &mut NsWork<'_>) -> Result<()> {
        std::thread::scope(|scope| {
            match scope.spawn(|| run_in_netns(path, work)).join() {
                Ok(result) => result,
                Err(_) => Err(anyhow!(
                    "namespace worker for {} panicked",
                    path.display()
                )),
            }
        })
    }
}

fn run_in_netns(path: &Path, work: &mut NsWork<'_>) -> Result<()> {
    let host = HostNetns::open_current()?;

    let target = open(path, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())
        .with_context(|| format!("Failed to open network namespace {}", path.display()))?;
    let switched = setns(target, CloneFlags::CLONE_NEWNET);
    let _ = close(target);
    switched.with_context(|| format!("Failed to enter network namespace {}", path.display()))?;

    let _restore = RestoreGuard { original: &host };
    debug!(netns = %path.display(), "entered network namespace");

    let netlink = IpRoute2::new();
    work(&netlink, &host)
}
