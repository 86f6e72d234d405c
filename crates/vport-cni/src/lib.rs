//! CNI plugin attaching container workloads to the vswitch overlay.
//!
//! One binary, two personalities. As a CNI plugin it handles ADD/DEL: a
//! deterministic port name, a veth pair into the container namespace, port
//! and entity rows on the switch control plane, then it waits for the
//! control plane to resolve an address and configures it on the container
//! interface. With `--daemon` it runs the audit loop from `vport-audit`
//! against the orchestrator's live-workload inventory instead.

pub mod attach;
pub mod cni;
pub mod config;
pub mod error;
pub mod inventory;
pub mod metadata;
pub mod port_name;

pub use attach::{AttachRequest, Attacher, CleanupReport, LiveControlPlane, LiveDatapath};
pub use cni::{CniArgs, CniCommand, CniErrorReply, CniReply, K8sArgs, NetworkConfig};
pub use config::Config;
pub use error::{CniError, CniResult};
pub use inventory::{KubernetesInventory, MesosInventory, MonitorNotifier};
pub use metadata::{KubernetesResolver, MesosResolver, MetadataResolver, NetworkIdentity};
pub use port_name::{normalize_mesos_id, port_name, PORT_NAME_PREFIX};
