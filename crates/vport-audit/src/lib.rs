//! Audit daemon for the overlay CNI plugin.
//!
//! The reconciler periodically diffs the set of entities and ports known to
//! the vswitch control plane against the orchestrator's live-workload
//! inventory, ages stale entries through a debounce window, and deletes the
//! ones that stay stale — but only those the plugin itself created
//! (recognized by the port-name prefix).
//!
//! The reconciler is orchestrator-agnostic: everything it needs from the
//! outside world comes in through three small capability traits
//! ([`ControlPlane`], [`WorkloadInventory`], [`DeletionNotifier`]), so one
//! reconciler serves Kubernetes, OpenShift and Mesos alike, and tests drive
//! it with in-memory fakes.

pub mod daemon;
pub mod error;
pub mod reconciler;
pub mod switch;
pub mod traits;

pub use daemon::{run, DaemonConfig};
pub use error::{AuditError, AuditResult};
pub use reconciler::{CycleReport, Reconciler};
pub use switch::SwitchControlPlane;
pub use traits::{ControlPlane, DeletionNotifier, WorkloadInventory};
