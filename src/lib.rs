//! GENEVE overlay CNI plugin for Kubernetes
//!
//! Attaches a pod to a GENEVE overlay network:
//! - a veth pair between the pod namespace and the host
//! - a per-pod GENEVE tunnel to the network gateway
//! - a shared host bridge joining the two
//! - policy routing rules steering pod traffic

pub mod commands;
pub mod config;
pub mod driver;
pub mod error;
pub mod lock;
pub mod netlink;
pub mod netns;
pub mod plugin;
pub mod store;
pub mod types;

// Re-export commonly used items
pub use commands::{cmd_add, cmd_check, cmd_del, run_cni};
pub use config::NetConf;
pub use driver::{AttachmentRequest, DetachmentRequest, LinuxNetwork, NetworkApis};
pub use error::NetlinkError;
pub use plugin::GenevePlugin;
