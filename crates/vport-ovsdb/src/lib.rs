//! Typed OVSDB client for the overlay vswitch control tables.
//!
//! This crate owns the single long-lived connection between the CNI plugin
//! (or the audit daemon) and the local vswitch's OVSDB server:
//!
//! - [`rpc`]: the JSON-RPC transport over a Unix domain socket, including the
//!   `monitor` subscription and `echo` keepalive handling
//! - [`table`]: generic conditional CRUD on a named control table
//! - [`connection`]: [`SwitchConnection`], which multiplexes one port-table
//!   monitor across many concurrent port-resolution waiters
//! - [`port`] / [`entity`] / [`controller`]: typed operations on the port
//!   table, the VM (entity) table and the controller table
//! - [`bridge`]: attaching and detaching veth host ports on the vswitch bridge
//!
//! # Concurrency
//!
//! All mutable subscription state (the waiter map and the pending-notification
//! buffer) is owned by a single dispatcher task inside [`SwitchConnection`].
//! Registrations, deregistrations and incoming row-change notifications are
//! messages sent to that task; no other task ever touches the maps.

pub mod bridge;
pub mod connection;
pub mod controller;
pub mod entity;
pub mod error;
pub mod port;
pub mod rpc;
pub mod table;

pub use connection::SwitchConnection;
pub use controller::ControllerHealth;
pub use entity::{EntityEvents, EntityInfo, EntityType, PlatformDomain};
pub use error::{OvsdbError, OvsdbResult};
pub use port::{PortAttributes, PortMetadata, PortState, PortUpdate};
pub use table::{Condition, ControlTable};

/// Database name the vswitch exposes over OVSDB.
pub const DATABASE: &str = "Open_vSwitch";

/// Control table holding one row per attached virtual port.
pub const PORT_TABLE: &str = "Overlay_Port_Table";

/// Control table holding one row per workload (container/pod) entity.
pub const ENTITY_TABLE: &str = "Overlay_VM_Table";

/// Standard OVSDB controller table, used for the health probe.
pub const CONTROLLER_TABLE: &str = "Controller";
