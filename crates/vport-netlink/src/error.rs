//! Error types for veth and namespace operations.

use thiserror::Error;

/// Result type alias for netlink operations.
pub type NetlinkResult<T> = Result<T, NetlinkError>;

/// Errors that can occur while wiring up the container datapath.
#[derive(Debug, Error)]
pub enum NetlinkError {
    /// Failed to enter or restore a network namespace.
    #[error("Namespace operation on '{path}' failed: {message}")]
    Namespace {
        /// The namespace path.
        path: String,
        /// Error message.
        message: String,
    },

    /// Failed to open a netlink socket.
    #[error("Failed to open netlink socket: {source}")]
    Socket {
        #[source]
        source: std::io::Error,
    },

    /// Creating the veth pair failed.
    #[error("Failed to create veth pair {host}/{container}: {message}")]
    PairCreate {
        host: String,
        container: String,
        message: String,
    },

    /// A link could not be found by name.
    #[error("Link '{name}' not found: {message}")]
    LinkLookup { name: String, message: String },

    /// Bringing a link up (or setting its MTU) failed.
    #[error("Failed to bring link '{name}' up: {message}")]
    LinkUp { name: String, message: String },

    /// Moving the host-side link back out of the container namespace failed.
    #[error("Failed to move link '{name}' to the host namespace: {message}")]
    MoveToHostNamespace { name: String, message: String },

    /// Deleting a link failed.
    #[error("Failed to delete link '{name}': {message}")]
    LinkDelete { name: String, message: String },

    /// Adding a route failed.
    #[error("Failed to add route: {message}")]
    Route { message: String },

    /// Assigning an address to an interface failed.
    #[error("Failed to assign {address} to '{name}': {message}")]
    AddressAssign {
        name: String,
        address: String,
        message: String,
    },

    /// A subnet mask that is not a contiguous prefix.
    #[error("Invalid subnet mask '{mask}'")]
    InvalidMask { mask: String },

    /// A link message without a hardware address attribute.
    #[error("Link '{name}' has no hardware address")]
    NoHardwareAddress { name: String },
}
