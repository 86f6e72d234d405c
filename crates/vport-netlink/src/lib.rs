//! Veth pair and network-namespace plumbing for the overlay CNI plugin.
//!
//! All link manipulation goes through rtnetlink rather than shelling out to
//! `ip`. Operations that must happen inside the container's namespace use a
//! scoped [`netns::NetnsGuard`]: enter the namespace, open a fresh netlink
//! socket (sockets stay bound to the namespace they were created in), do the
//! work, and restore the host namespace on drop.
//!
//! `setns(2)` binds the *calling thread*, so binaries using this crate run a
//! current-thread tokio runtime for attach/detach work (the async equivalent
//! of locking the OS thread for namespace operations).

pub mod error;
pub mod netns;
pub mod veth;

pub use error::{NetlinkError, NetlinkResult};
pub use netns::NetnsGuard;
pub use veth::{
    assign_address, create_veth_pair, delete_veth_pair, mask_to_prefix, ConfiguredAddress,
};
