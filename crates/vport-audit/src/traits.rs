//! Capability traits the reconciler is parameterized over.

use async_trait::async_trait;

use crate::error::AuditResult;

/// The slice of the switch control plane the reconciler consumes.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Cheap liveness probe for the connection-check ticker.
    async fn probe(&self) -> AuditResult<()>;

    /// All entity ids known to the switch.
    async fn entity_ids(&self) -> AuditResult<Vec<String>>;

    /// All port names known to the switch.
    async fn port_names(&self) -> AuditResult<Vec<String>>;

    /// Port names bound to one entity.
    async fn entity_ports(&self, id: &str) -> AuditResult<Vec<String>>;

    /// Human-readable name of one entity.
    async fn entity_name(&self, id: &str) -> AuditResult<String>;

    /// The zone recorded on a port row, if any.
    async fn port_zone(&self, port: &str) -> AuditResult<Option<String>>;

    /// Deletes an entity row.
    async fn destroy_entity(&self, id: &str) -> AuditResult<()>;

    /// Deletes a port row.
    async fn destroy_port(&self, name: &str) -> AuditResult<()>;

    /// Detaches a stale port's datapath remnants: the bridge attachment and
    /// any leftover veth pair.
    async fn detach_port(&self, name: &str) -> AuditResult<()>;
}

/// Orchestrator-specific inventory of live workloads.
#[async_trait]
pub trait WorkloadInventory: Send + Sync {
    /// Ids of all workloads currently live on the orchestrator (filtered to
    /// this host where the orchestrator supports it).
    async fn list_live_ids(&self) -> AuditResult<Vec<String>>;

    /// Normalizes a raw orchestrator id into the form stored in the entity
    /// table (for example, Mesos container ids are dash-stripped and
    /// doubled).
    fn normalize_id(&self, raw: &str) -> String;
}

/// Sink for stale-entity deletion notifications.
#[async_trait]
pub trait DeletionNotifier: Send + Sync {
    /// Reports that `name` (in `zone`) was removed from the switch.
    async fn notify_deleted(&self, name: &str, zone: &str) -> AuditResult<()>;
}
