//! Scoped network-namespace switching.

use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::Path;

use nix::sched::{setns, CloneFlags};
use tracing::{error, trace};

use crate::error::{NetlinkError, NetlinkResult};

const HOST_NS_PATH: &str = "/proc/self/ns/net";

/// RAII guard that switches the calling thread into a target network
/// namespace and restores the original namespace on drop.
///
/// Netlink sockets stay bound to the namespace they were opened in, so code
/// holding the guard opens a fresh rtnetlink connection after entering.
pub struct NetnsGuard {
    host_ns: File,
}

impl NetnsGuard {
    /// Enters the namespace at `path` (for example
    /// `/var/run/netns/<container>`).
    pub fn enter(path: impl AsRef<Path>) -> NetlinkResult<Self> {
        let path = path.as_ref();
        let host_ns = File::open(HOST_NS_PATH).map_err(|e| NetlinkError::Namespace {
            path: HOST_NS_PATH.to_string(),
            message: e.to_string(),
        })?;
        let target = File::open(path).map_err(|e| NetlinkError::Namespace {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        setns(target.as_fd(), CloneFlags::CLONE_NEWNET).map_err(|e| NetlinkError::Namespace {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        trace!(netns = %path.display(), "Entered container network namespace");
        Ok(NetnsGuard { host_ns })
    }

    /// File descriptor of the original (host) namespace, usable for
    /// `setns_by_fd`-style link moves while inside the target namespace.
    pub fn host_ns_fd(&self) -> RawFd {
        self.host_ns.as_raw_fd()
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(self.host_ns.as_fd(), CloneFlags::CLONE_NEWNET) {
            // Nothing sane to do here; the thread is stuck in the container
            // namespace and the process should exit soon anyway.
            error!("Failed to restore host network namespace: {e}");
        } else {
            trace!("Restored host network namespace");
        }
    }
}
