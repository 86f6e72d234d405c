//! [`ControlPlane`] adapter over the live vswitch connection.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};
use vport_ovsdb::{ControllerHealth, SwitchConnection};

use crate::error::{AuditError, AuditResult};
use crate::traits::ControlPlane;

/// The audit daemon's view of a running vswitch: the OVSDB connection plus
/// the bridge our ports attach to.
pub struct SwitchControlPlane {
    conn: SwitchConnection,
    bridge: String,
    endpoint: PathBuf,
}

impl SwitchControlPlane {
    /// Connects to the vswitch database socket at `endpoint`.
    pub async fn connect(endpoint: impl AsRef<Path>, bridge: &str) -> AuditResult<Self> {
        let endpoint = endpoint.as_ref().to_path_buf();
        let conn = SwitchConnection::connect(&endpoint)
            .await
            .map_err(|e| AuditError::control_plane("connect", e))?;
        Ok(SwitchControlPlane {
            conn,
            bridge: bridge.to_string(),
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }
}

#[async_trait]
impl ControlPlane for SwitchControlPlane {
    async fn probe(&self) -> AuditResult<()> {
        // A controller-table read exercises the socket; failing to read it
        // means the database connection itself is gone. A reachable switch
        // without a master controller is degraded, not dead.
        match self.conn.controller_health().await {
            ControllerHealth::Unknown { reason } => {
                Err(AuditError::control_plane("probe", reason))
            }
            ControllerHealth::Disconnected => {
                warn!("Switch has no master controller connection");
                Ok(())
            }
            ControllerHealth::Connected => Ok(()),
        }
    }

    async fn entity_ids(&self) -> AuditResult<Vec<String>> {
        self.conn
            .get_all_entities()
            .await
            .map_err(|e| AuditError::control_plane("entity_ids", e))
    }

    async fn port_names(&self) -> AuditResult<Vec<String>> {
        self.conn
            .get_all_ports()
            .await
            .map_err(|e| AuditError::control_plane("port_names", e))
    }

    async fn entity_ports(&self, id: &str) -> AuditResult<Vec<String>> {
        self.conn
            .get_entity_ports(id)
            .await
            .map_err(|e| AuditError::control_plane("entity_ports", e))
    }

    async fn entity_name(&self, id: &str) -> AuditResult<String> {
        self.conn
            .get_entity_name(id)
            .await
            .map_err(|e| AuditError::control_plane("entity_name", e))
    }

    async fn port_zone(&self, port: &str) -> AuditResult<Option<String>> {
        let state = self
            .conn
            .get_port_state(port)
            .await
            .map_err(|e| AuditError::control_plane("port_zone", e))?;
        Ok(state.zone)
    }

    async fn destroy_entity(&self, id: &str) -> AuditResult<()> {
        self.conn
            .destroy_entity(id)
            .await
            .map_err(|e| AuditError::control_plane("destroy_entity", e))
    }

    async fn destroy_port(&self, name: &str) -> AuditResult<()> {
        self.conn
            .destroy_port(name)
            .await
            .map_err(|e| AuditError::control_plane("destroy_port", e))
    }

    async fn detach_port(&self, name: &str) -> AuditResult<()> {
        // Both steps are best-effort: the bridge row or the veth pair may
        // already be gone if the container runtime cleaned up part-way.
        if let Err(e) = self.conn.remove_port_from_bridge(&self.bridge, name).await {
            debug!(port = %name, bridge = %self.bridge, "Bridge detach skipped: {e}");
        }
        if let Err(e) = vport_netlink::delete_veth_pair(name, name).await {
            debug!(port = %name, "Veth cleanup skipped: {e}");
        } else {
            warn!(port = %name, "Deleted orphaned veth pair");
        }
        Ok(())
    }
}
