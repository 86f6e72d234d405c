//! Error types for the CNI plugin surface.

use thiserror::Error;

/// Result type alias for plugin operations.
pub type CniResult<T> = Result<T, CniError>;

/// Errors surfaced by the plugin. CNI ADD failures are reported back to the
/// runtime as structured error JSON built from these.
#[derive(Debug, Error)]
pub enum CniError {
    /// A required CNI environment variable is missing or empty.
    #[error("Required environment variable {var} is missing")]
    MissingEnvironment { var: &'static str },

    /// The CNI_COMMAND value is not one we implement.
    #[error("Unsupported CNI command {command}")]
    UnsupportedCommand { command: String },

    /// Reading or parsing the plugin configuration file failed.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Reading or parsing the network config on stdin failed.
    #[error("Invalid network configuration on stdin: {message}")]
    NetworkConfig { message: String },

    /// The resolved network identity is missing a mandatory field.
    #[error("Incomplete network metadata: {field} is not set")]
    IncompleteMetadata { field: &'static str },

    /// Querying the orchestrator or monitor for metadata failed.
    #[error("Metadata resolution failed: {message}")]
    MetadataResolve { message: String },

    /// A switch control-plane operation failed.
    #[error(transparent)]
    ControlPlane(#[from] vport_ovsdb::OvsdbError),

    /// A veth or namespace operation failed.
    #[error(transparent)]
    Datapath(#[from] vport_netlink::NetlinkError),

    /// The control plane never resolved an address for the port.
    #[error("Timed out after {secs}s waiting for address resolution of port {port}")]
    PortResolutionTimeout { port: String, secs: u64 },

    /// The port row was withdrawn while we were waiting on it.
    #[error("Port {port} was withdrawn by the control plane during resolution")]
    PortWithdrawn { port: String },

    /// An address update arrived without the fields needed to configure
    /// the interface.
    #[error("Address resolution for port {port} is missing {field}")]
    IncompleteResolution { port: String, field: &'static str },

    /// A resolved address string did not parse.
    #[error("Control plane returned unparseable {field} {value:?} for port {port}")]
    BadAddress {
        port: String,
        field: &'static str,
        value: String,
    },

    /// An entity row exists but reports no bound ports.
    #[error("Entity {id} exists on the switch but has no bound ports")]
    EntityWithoutPorts { id: String },
}

impl CniError {
    /// Numeric error code reported in the CNI error JSON. Well-known CNI
    /// codes live below 100; plugin-specific conditions start at 100.
    pub fn code(&self) -> u32 {
        match self {
            CniError::MissingEnvironment { .. } => 4,
            CniError::UnsupportedCommand { .. } => 4,
            CniError::Config { .. } => 6,
            CniError::NetworkConfig { .. } => 6,
            CniError::IncompleteMetadata { .. } => 100,
            CniError::MetadataResolve { .. } => 101,
            CniError::ControlPlane(_) => 102,
            CniError::Datapath(_) => 103,
            CniError::PortResolutionTimeout { .. } => 104,
            CniError::PortWithdrawn { .. } => 105,
            CniError::IncompleteResolution { .. } => 106,
            CniError::BadAddress { .. } => 106,
            CniError::EntityWithoutPorts { .. } => 107,
        }
    }
}
