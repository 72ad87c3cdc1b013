use std::io;

use thiserror::Error;

/// Failure of a single kernel-object operation.
///
/// The variants separate the outcomes callers branch on (missing object,
/// duplicate object, missing rule/route) from hard failures, so that the
/// driver can treat "already exists" and "no such entry" as success where
/// the operation is meant to be idempotent.
#[derive(Debug, Error)]
pub enum NetlinkError {
    /// The named link does not exist in the current namespace.
    #[error("link {0:?} not found")]
    NotFound(String),

    /// The object being created is already present.
    #[error("{0:?} already exists")]
    AlreadyExists(String),

    /// A rule, route or neighbor entry to delete is not present.
    #[error("no such entry: {0}")]
    NoSuchEntry(String),

    /// The backend ran but reported a failure.
    #[error("`{cmd}` failed: {stderr}")]
    Command { cmd: String, stderr: String },

    /// The backend could not be executed at all.
    #[error("failed to execute `{cmd}`")]
    Io {
        cmd: String,
        #[source]
        source: io::Error,
    },

    /// The backend output could not be decoded.
    #[error("failed to parse output of `{cmd}`")]
    Parse {
        cmd: String,
        #[source]
        source: serde_json::Error,
    },
}

impl NetlinkError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    pub fn is_no_such_entry(&self) -> bool {
        matches!(self, Self::NoSuchEntry(_))
    }
}

/// Returns true when `err` wraps a [`NetlinkError::NotFound`] anywhere in its chain.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<NetlinkError>())
        .any(NetlinkError::is_not_found)
}
