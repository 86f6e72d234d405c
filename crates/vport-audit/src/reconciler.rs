//! The reconciliation cycle: diff, debounce, ownership gate, delete.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::error::AuditResult;
use crate::traits::{ControlPlane, DeletionNotifier, WorkloadInventory};

/// What one reconciliation cycle did, for logging and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub deleted_entities: Vec<String>,
    pub deleted_ports: Vec<String>,
    pub stale_entities: usize,
    pub stale_ports: usize,
}

/// Stale-state reconciler.
///
/// Owns the two first-seen bookkeeping maps; a single daemon loop drives it,
/// so there is no locking. An id stays a stale candidate across cycles until
/// it either reappears in the live set (candidate purged, fresh countdown
/// next time) or its age passes `stale_entry_timeout` (candidate deleted).
pub struct Reconciler {
    stale_entities: HashMap<String, i64>,
    stale_ports: HashMap<String, i64>,
    /// Seconds a candidate must stay stale before deletion. Zero means
    /// immediately eligible.
    stale_entry_timeout: i64,
    /// Port-name prefix marking plugin-owned state.
    owned_prefix: String,
}

impl Reconciler {
    pub fn new(owned_prefix: &str, stale_entry_timeout: i64) -> Self {
        Reconciler {
            stale_entities: HashMap::new(),
            stale_ports: HashMap::new(),
            stale_entry_timeout,
            owned_prefix: owned_prefix.to_string(),
        }
    }

    /// Runs one full cycle against the control plane and the orchestrator
    /// inventory. Individual deletions are best-effort; only snapshot
    /// failures abort the cycle.
    pub async fn run_cycle<C, I, N>(
        &mut self,
        control_plane: &C,
        inventory: &I,
        notifier: &N,
    ) -> AuditResult<CycleReport>
    where
        C: ControlPlane,
        I: WorkloadInventory,
        N: DeletionNotifier,
    {
        // Snapshot the switch first, then the orchestrator, so a workload
        // created between the two reads shows up as live rather than stale.
        let switch_entities = control_plane.entity_ids().await?;
        let switch_ports = control_plane.port_names().await?;

        let live_ids: Vec<String> = inventory
            .list_live_ids()
            .await?
            .iter()
            .map(|raw| inventory.normalize_id(raw))
            .collect();

        let mut live_ports: Vec<String> = Vec::new();
        for id in &live_ids {
            match control_plane.entity_ports(id).await {
                Ok(ports) => live_ports.extend(ports),
                Err(e) => warn!(entity = %id, "Could not read ports for live entity: {e}"),
            }
        }

        let stale_entities = set_difference(&switch_entities, &live_ids);
        let stale_ports = set_difference(&switch_ports, &live_ports);
        let now = now_millis();

        let mut report = CycleReport {
            stale_entities: stale_entities.len(),
            stale_ports: stale_ports.len(),
            ..Default::default()
        };

        let expired_entities = age_candidates(
            &mut self.stale_entities,
            &stale_entities,
            now,
            self.stale_entry_timeout,
        );
        let expired_ports = age_candidates(
            &mut self.stale_ports,
            &stale_ports,
            now,
            self.stale_entry_timeout,
        );

        for id in expired_entities {
            if !self.entity_is_owned(control_plane, &id).await {
                debug!(entity = %id, "Skipping entity not created by this plugin");
                continue;
            }
            self.delete_entity(control_plane, notifier, &id, &mut report)
                .await;
        }

        for port in expired_ports {
            if !port.starts_with(&self.owned_prefix) {
                debug!(port = %port, "Skipping port not created by this plugin");
                continue;
            }
            self.delete_port(control_plane, &port, &mut report).await;
        }

        if !report.deleted_entities.is_empty() || !report.deleted_ports.is_empty() {
            info!(
                entities = ?report.deleted_entities,
                ports = ?report.deleted_ports,
                "Cleaned up stale control-plane state"
            );
        }
        Ok(report)
    }

    /// An entity is plugin-owned when at least one of its ports carries the
    /// plugin's port-name prefix. A read failure errs on the side of
    /// ownership so a transient error cannot park an entity forever.
    async fn entity_is_owned<C: ControlPlane>(&self, control_plane: &C, id: &str) -> bool {
        match control_plane.entity_ports(id).await {
            Ok(ports) => ports.iter().any(|p| p.starts_with(&self.owned_prefix)),
            Err(e) => {
                warn!(entity = %id, "Could not audit entity ownership: {e}");
                true
            }
        }
    }

    async fn delete_entity<C: ControlPlane, N: DeletionNotifier>(
        &mut self,
        control_plane: &C,
        notifier: &N,
        id: &str,
        report: &mut CycleReport,
    ) {
        let name = match control_plane.entity_name(id).await {
            Ok(name) => name,
            Err(e) => {
                debug!(entity = %id, "Could not read entity name: {e}");
                String::new()
            }
        };
        // Capture the zone before the rows disappear.
        let zone = match control_plane.entity_ports(id).await {
            Ok(ports) => {
                let mut zone = None;
                for port in &ports {
                    match control_plane.port_zone(port).await {
                        Ok(Some(z)) => zone = Some(z),
                        Ok(None) => {}
                        Err(e) => debug!(port = %port, "Could not read port zone: {e}"),
                    }
                }
                zone
            }
            Err(e) => {
                debug!(entity = %id, "Could not read entity ports: {e}");
                None
            }
        };

        info!(entity = %id, "Removing stale entity entry");
        match control_plane.destroy_entity(id).await {
            Ok(()) => {
                report.deleted_entities.push(id.to_string());
                if let Some(zone) = zone {
                    if let Err(e) = notifier.notify_deleted(&name, &zone).await {
                        warn!(entity = %name, "Deletion notification failed: {e}");
                    }
                }
            }
            Err(e) => warn!(entity = %id, "Unable to delete stale entity: {e}"),
        }
        self.stale_entities.remove(id);
    }

    async fn delete_port<C: ControlPlane>(
        &mut self,
        control_plane: &C,
        port: &str,
        report: &mut CycleReport,
    ) {
        info!(port = %port, "Removing stale port");
        match control_plane.destroy_port(port).await {
            Ok(()) => report.deleted_ports.push(port.to_string()),
            Err(e) => warn!(port = %port, "Unable to delete stale port: {e}"),
        }
        if let Err(e) = control_plane.detach_port(port).await {
            warn!(port = %port, "Unable to detach stale port datapath: {e}");
        }
        self.stale_ports.remove(port);
    }

    #[cfg(test)]
    pub(crate) fn backdate_entity(&mut self, id: &str, millis: i64) {
        if let Some(first_seen) = self.stale_entities.get_mut(id) {
            *first_seen -= millis;
        }
    }

    #[cfg(test)]
    pub(crate) fn is_candidate(&self, id: &str) -> bool {
        self.stale_entities.contains_key(id)
    }
}

/// Ids present on the switch but absent from the orchestrator.
fn set_difference(switch_data: &[String], orchestrator_data: &[String]) -> Vec<String> {
    let live: HashSet<&str> = orchestrator_data.iter().map(String::as_str).collect();
    switch_data
        .iter()
        .filter(|id| !live.contains(id.as_str()))
        .cloned()
        .collect()
}

/// Advances the debounce bookkeeping for one cycle's stale set and returns
/// the ids whose age now exceeds the timeout. Ids no longer stale are purged
/// so they get a fresh countdown if they go stale again later.
fn age_candidates(
    first_seen: &mut HashMap<String, i64>,
    stale_ids: &[String],
    now_ms: i64,
    timeout_secs: i64,
) -> Vec<String> {
    let mut expired = Vec::new();
    for id in stale_ids {
        let seen = *first_seen.entry(id.clone()).or_insert(now_ms);
        if (now_ms - seen) / 1000 >= timeout_secs {
            expired.push(id.clone());
        }
    }
    let stale: HashSet<&str> = stale_ids.iter().map(String::as_str).collect();
    first_seen.retain(|id, _| stale.contains(id.as_str()));
    expired
}

/// Milliseconds since the Unix epoch.
fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
