//! The attach/detach state machine.
//!
//! Attach is a nine-step sequence against two external systems (the switch
//! control plane and the kernel datapath), any step of which can fail.
//! Failures roll back everything built so far, in reverse order; rollback
//! failures are collected into a [`CleanupReport`] and logged, never allowed
//! to mask the original error.
//!
//! The machine is generic over its three seams (control plane, datapath,
//! metadata resolver) so the whole sequence, including every rollback path,
//! runs under test against in-memory fakes.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vport_audit::DeletionNotifier;
use vport_ovsdb::{
    EntityEvents, EntityInfo, EntityType, PlatformDomain, PortAttributes, PortMetadata,
    PortUpdate, SwitchConnection,
};

use crate::error::{CniError, CniResult};
use crate::metadata::{MetadataResolver, NetworkIdentity};
use crate::port_name::port_name;

/// The slice of the switch control plane the attach sequence drives.
#[async_trait]
pub trait AttachControlPlane: Send + Sync {
    async fn create_port(
        &self,
        name: &str,
        attributes: &PortAttributes,
        metadata: &PortMetadata,
    ) -> CniResult<()>;
    /// Rewrites the attributes and metadata of an existing port row.
    async fn update_port(
        &self,
        name: &str,
        attributes: &PortAttributes,
        metadata: &PortMetadata,
    ) -> CniResult<()>;
    async fn destroy_port(&self, name: &str) -> CniResult<()>;
    async fn port_zone(&self, name: &str) -> CniResult<Option<String>>;
    async fn attach_to_bridge(
        &self,
        port: &str,
        entity_uuid: &str,
        entity_name: &str,
    ) -> CniResult<()>;
    async fn detach_from_bridge(&self, port: &str) -> CniResult<()>;
    async fn create_entity(&self, info: &EntityInfo) -> CniResult<()>;
    async fn destroy_entity(&self, uuid: &str) -> CniResult<()>;
    /// By-name fallback for rows whose uuid is no longer recoverable.
    async fn destroy_entity_by_name(&self, name: &str) -> CniResult<()>;
    async fn entity_exists(&self, uuid: &str) -> CniResult<bool>;
    async fn entity_ports(&self, uuid: &str) -> CniResult<Vec<String>>;
    async fn entity_ports_by_name(&self, name: &str) -> CniResult<Vec<String>>;
    async fn register_for_port_updates(
        &self,
        name: &str,
        tx: mpsc::Sender<PortUpdate>,
    ) -> CniResult<()>;
    async fn deregister_for_port_updates(&self, name: &str) -> CniResult<()>;
}

/// The kernel-side operations the attach sequence drives.
#[async_trait]
pub trait Datapath: Send + Sync {
    /// Creates the veth pair and returns the container end's MAC.
    async fn create_veth(
        &self,
        netns: &str,
        host_if: &str,
        container_if: &str,
        mtu: u32,
    ) -> CniResult<String>;
    async fn delete_veth(&self, host_if: &str, container_if: &str) -> CniResult<()>;
    async fn assign_address(
        &self,
        netns: &str,
        ifname: &str,
        ip: Ipv4Addr,
        gateway: Ipv4Addr,
        mask: Ipv4Addr,
    ) -> CniResult<vport_netlink::ConfiguredAddress>;
}

/// One attach/detach request, normalized from the CNI invocation.
#[derive(Debug, Clone)]
pub struct AttachRequest {
    /// Normalized workload id (pod UID, or the doubled Mesos id).
    pub entity_id: String,
    /// Human-readable workload name.
    pub entity_name: String,
    /// Path to the container network namespace.
    pub netns: String,
    /// Interface name inside the container.
    pub ifname: String,
    /// MTU for both veth ends.
    pub mtu: u32,
    /// Seconds to wait for address resolution.
    pub resolve_timeout: u64,
    /// Bridge name recorded on the port row.
    pub bridge: String,
}

/// Rollback failures collected while unwinding a failed attach. Logged as a
/// unit; the original error is what the caller sees.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub failures: Vec<(&'static str, String)>,
}

impl CleanupReport {
    fn record(&mut self, step: &'static str, result: CniResult<()>) {
        if let Err(e) = result {
            self.failures.push((step, e.to_string()));
        }
    }

    fn log(&self, context: &str) {
        for (step, message) in &self.failures {
            warn!(step, "Rollback failure during {context}: {message}");
        }
    }
}

/// Tracks what the attach sequence has built, so unwinding is exact.
#[derive(Debug, Default)]
struct Progress {
    veth: bool,
    bridge: bool,
    port_row: bool,
    entity_row: bool,
    /// Port name a waiter is registered under. On the existing-entity
    /// reuse path this can differ from the computed name.
    waiter: Option<String>,
}

/// Drives attach and detach against the three seams.
pub struct Attacher<'a, C, D> {
    control: &'a C,
    datapath: &'a D,
}

impl<'a, C, D> Attacher<'a, C, D>
where
    C: AttachControlPlane,
    D: Datapath,
{
    pub fn new(control: &'a C, datapath: &'a D) -> Self {
        Attacher { control, datapath }
    }

    /// Attaches a workload: veth pair, bridge attachment, port and entity
    /// rows, then blocks until the control plane resolves an address and
    /// configures it on the container interface.
    pub async fn connect<R: MetadataResolver + ?Sized>(
        &self,
        request: &AttachRequest,
        resolver: &R,
    ) -> CniResult<vport_netlink::ConfiguredAddress> {
        let identity = resolver.resolve().await?;
        identity.validate()?;

        let port = port_name(&request.ifname, &request.entity_id);
        info!(port = %port, entity = %request.entity_id, "Attaching workload");

        let mut progress = Progress::default();
        match self.build(request, &identity, &port, &mut progress).await {
            Ok(address) => Ok(address),
            Err(e) => {
                let report = self.unwind(request, &port, progress).await;
                report.log("attach rollback");
                Err(e)
            }
        }
    }

    async fn build(
        &self,
        request: &AttachRequest,
        identity: &NetworkIdentity,
        port: &str,
        progress: &mut Progress,
    ) -> CniResult<vport_netlink::ConfiguredAddress> {
        let mac = self
            .datapath
            .create_veth(&request.netns, port, &request.ifname, request.mtu)
            .await?;
        progress.veth = true;

        self.control
            .attach_to_bridge(port, &request.entity_id, &request.entity_name)
            .await?;
        progress.bridge = true;

        let attributes = PortAttributes {
            mac,
            bridge: request.bridge.clone(),
            platform: PlatformDomain::Docker,
        };
        let metadata = PortMetadata {
            domain: identity.domain.clone(),
            network: identity.network.clone(),
            zone: identity.zone.clone(),
            network_type: "ipv4".to_string(),
            static_ip: identity.static_ip.clone(),
            policy_group: identity.policy_group.clone(),
            redirection_target: identity.redirection_target.clone(),
        };
        // The workload may already have an entity row (a replayed ADD after
        // a partial failure): rebind its existing port row instead of
        // stacking a second one. The fresh veth means fresh attributes.
        let wait_port = if self.control.entity_exists(&request.entity_id).await? {
            let existing = self.control.entity_ports(&request.entity_id).await?;
            match existing.into_iter().next() {
                Some(existing) => {
                    if existing != port {
                        debug!(port = %existing, "Reusing port already bound to entity");
                    }
                    self.control
                        .update_port(&existing, &attributes, &metadata)
                        .await?;
                    existing
                }
                None => {
                    return Err(CniError::EntityWithoutPorts {
                        id: request.entity_id.clone(),
                    })
                }
            }
        } else {
            self.control.create_port(port, &attributes, &metadata).await?;
            progress.port_row = true;
            let mut entity_metadata = HashMap::new();
            entity_metadata.insert("user".to_string(), identity.user.clone());
            entity_metadata.insert("enterprise".to_string(), identity.enterprise.clone());
            self.control
                .create_entity(&EntityInfo {
                    uuid: request.entity_id.clone(),
                    name: request.entity_name.clone(),
                    platform: PlatformDomain::Docker,
                    entity_type: EntityType::Container,
                    ports: vec![port.to_string()],
                    metadata: entity_metadata,
                    events: Some(EntityEvents::container_started()),
                })
                .await?;
            progress.entity_row = true;
            port.to_string()
        };

        let (tx, mut rx) = mpsc::channel(1);
        self.control
            .register_for_port_updates(&wait_port, tx)
            .await?;
        progress.waiter = Some(wait_port.clone());

        let update = tokio::time::timeout(
            Duration::from_secs(request.resolve_timeout),
            rx.recv(),
        )
        .await
        .map_err(|_| CniError::PortResolutionTimeout {
            port: wait_port.clone(),
            secs: request.resolve_timeout,
        })?
        .ok_or_else(|| CniError::PortResolutionTimeout {
            port: wait_port.clone(),
            secs: request.resolve_timeout,
        })?;

        if !update.registered {
            return Err(CniError::PortWithdrawn { port: wait_port });
        }

        let ip = parse_addr(&wait_port, "ip_addr", update.ip)?;
        let mask = parse_addr(&wait_port, "subnet_mask", update.mask)?;
        let gateway = parse_addr(&wait_port, "gateway", update.gateway)?;

        let address = self
            .datapath
            .assign_address(&request.netns, &request.ifname, ip, gateway, mask)
            .await?;

        if let Err(e) = self.control.deregister_for_port_updates(&wait_port).await {
            debug!(port = %wait_port, "Deregistration failed after attach: {e}");
        }
        info!(port = %wait_port, ip = %address.ip, "Workload attached");
        Ok(address)
    }

    /// Reverse teardown of a partially built attach.
    async fn unwind(&self, request: &AttachRequest, port: &str, progress: Progress) -> CleanupReport {
        let mut report = CleanupReport::default();
        if let Some(waiter) = &progress.waiter {
            report.record(
                "deregister",
                self.control.deregister_for_port_updates(waiter).await,
            );
        }
        if progress.entity_row {
            report.record(
                "destroy entity",
                self.control.destroy_entity(&request.entity_id).await,
            );
        }
        if progress.port_row {
            report.record("destroy port row", self.control.destroy_port(port).await);
        }
        if progress.bridge {
            report.record(
                "detach from bridge",
                self.control.detach_from_bridge(port).await,
            );
        }
        if progress.veth {
            report.record(
                "delete veth",
                self.datapath.delete_veth(port, &request.ifname).await,
            );
        }
        report
    }

    /// Detaches a workload. Every step is best-effort: DEL must leave the
    /// host as clean as it can and never fail the runtime over sub-errors.
    pub async fn disconnect<N: DeletionNotifier>(
        &self,
        request: &AttachRequest,
        notifier: &N,
    ) -> CleanupReport {
        let port = port_name(&request.ifname, &request.entity_id);
        info!(port = %port, entity = %request.entity_id, "Detaching workload");
        let mut report = CleanupReport::default();

        // Entity rows are keyed by workload uuid. Names are not unique over
        // time (a replacement pod reuses its predecessor's name), so the
        // name-keyed row is consulted only when the uuid row is gone.
        let uuid_row_exists = match self.control.entity_exists(&request.entity_id).await {
            Ok(exists) => exists,
            Err(e) => {
                report.failures.push(("check entity", e.to_string()));
                true
            }
        };

        let bound_ports = if uuid_row_exists {
            match self.control.entity_ports(&request.entity_id).await {
                Ok(ports) if !ports.is_empty() => ports,
                Ok(_) => vec![port.clone()],
                Err(e) => {
                    report.failures.push(("read entity ports", e.to_string()));
                    vec![port.clone()]
                }
            }
        } else {
            match self
                .control
                .entity_ports_by_name(&request.entity_name)
                .await
            {
                Ok(ports) if !ports.is_empty() => ports,
                Ok(_) => vec![port.clone()],
                Err(e) => {
                    report.failures.push(("read entity ports", e.to_string()));
                    vec![port.clone()]
                }
            }
        };

        // Only the last interface tears the datapath down.
        if bound_ports.len() == 1 {
            let zone = match self.control.port_zone(&port).await {
                Ok(zone) => zone,
                Err(e) => {
                    debug!(port = %port, "Could not read port zone: {e}");
                    None
                }
            };
            report.record("destroy port row", self.control.destroy_port(&port).await);
            if let Some(zone) = zone {
                if let Err(e) = notifier.notify_deleted(&request.entity_name, &zone).await {
                    report.failures.push(("deletion notification", e.to_string()));
                }
            }
            report.record(
                "detach from bridge",
                self.control.detach_from_bridge(&port).await,
            );
            report.record(
                "delete veth",
                self.datapath.delete_veth(&port, &request.ifname).await,
            );
        }

        // The entity row goes regardless of how many ports were bound.
        if uuid_row_exists {
            report.record(
                "destroy entity",
                self.control.destroy_entity(&request.entity_id).await,
            );
        } else {
            report.record(
                "destroy entity by name",
                self.control.destroy_entity_by_name(&request.entity_name).await,
            );
        }

        report.log("detach");
        report
    }
}

fn parse_addr(port: &str, field: &'static str, value: Option<String>) -> CniResult<Ipv4Addr> {
    let value = value.ok_or(CniError::IncompleteResolution {
        port: port.to_string(),
        field,
    })?;
    value.parse().map_err(|_| CniError::BadAddress {
        port: port.to_string(),
        field,
        value,
    })
}

/// Production control plane: the live OVSDB connection plus the bridge.
pub struct LiveControlPlane {
    conn: SwitchConnection,
    bridge: String,
}

impl LiveControlPlane {
    pub fn new(conn: SwitchConnection, bridge: &str) -> Self {
        LiveControlPlane {
            conn,
            bridge: bridge.to_string(),
        }
    }

    /// Retries the database connection indefinitely at a fixed delay; the
    /// vswitch may come up after the runtime starts scheduling workloads.
    pub async fn connect_with_retry(endpoint: &str, bridge: &str) -> Self {
        const RETRY_DELAY: Duration = Duration::from_secs(5);
        loop {
            match SwitchConnection::connect(endpoint).await {
                Ok(conn) => return LiveControlPlane::new(conn, bridge),
                Err(e) => {
                    warn!(endpoint, "Vswitch not reachable, retrying: {e}");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    /// Hands the connection back for an orderly shutdown.
    pub fn into_connection(self) -> SwitchConnection {
        self.conn
    }
}

#[async_trait]
impl AttachControlPlane for LiveControlPlane {
    async fn create_port(
        &self,
        name: &str,
        attributes: &PortAttributes,
        metadata: &PortMetadata,
    ) -> CniResult<()> {
        Ok(self.conn.create_port(name, attributes, metadata).await?)
    }

    async fn update_port(
        &self,
        name: &str,
        attributes: &PortAttributes,
        metadata: &PortMetadata,
    ) -> CniResult<()> {
        self.conn.update_port_attributes(name, attributes).await?;
        Ok(self.conn.update_port_metadata(name, metadata).await?)
    }

    async fn destroy_port(&self, name: &str) -> CniResult<()> {
        Ok(self.conn.destroy_port(name).await?)
    }

    async fn port_zone(&self, name: &str) -> CniResult<Option<String>> {
        Ok(self.conn.get_port_state(name).await?.zone)
    }

    async fn attach_to_bridge(
        &self,
        port: &str,
        entity_uuid: &str,
        entity_name: &str,
    ) -> CniResult<()> {
        Ok(self
            .conn
            .add_port_to_bridge(&self.bridge, port, entity_uuid, entity_name)
            .await?)
    }

    async fn detach_from_bridge(&self, port: &str) -> CniResult<()> {
        Ok(self.conn.remove_port_from_bridge(&self.bridge, port).await?)
    }

    async fn create_entity(&self, info: &EntityInfo) -> CniResult<()> {
        Ok(self.conn.create_entity(info).await?)
    }

    async fn destroy_entity(&self, uuid: &str) -> CniResult<()> {
        Ok(self.conn.destroy_entity(uuid).await?)
    }

    async fn destroy_entity_by_name(&self, name: &str) -> CniResult<()> {
        Ok(self.conn.destroy_entity_by_name(name).await?)
    }

    async fn entity_exists(&self, uuid: &str) -> CniResult<bool> {
        Ok(self.conn.entity_exists(uuid).await?)
    }

    async fn entity_ports(&self, uuid: &str) -> CniResult<Vec<String>> {
        Ok(self.conn.get_entity_ports(uuid).await?)
    }

    async fn entity_ports_by_name(&self, name: &str) -> CniResult<Vec<String>> {
        Ok(self.conn.get_entity_ports_by_name(name).await?)
    }

    async fn register_for_port_updates(
        &self,
        name: &str,
        tx: mpsc::Sender<PortUpdate>,
    ) -> CniResult<()> {
        Ok(self.conn.register_for_port_updates(name, tx).await?)
    }

    async fn deregister_for_port_updates(&self, name: &str) -> CniResult<()> {
        Ok(self.conn.deregister_for_port_updates(name).await?)
    }
}

/// Production datapath: rtnetlink veth plumbing.
pub struct LiveDatapath;

#[async_trait]
impl Datapath for LiveDatapath {
    async fn create_veth(
        &self,
        netns: &str,
        host_if: &str,
        container_if: &str,
        mtu: u32,
    ) -> CniResult<String> {
        Ok(vport_netlink::create_veth_pair(netns, host_if, container_if, mtu).await?)
    }

    async fn delete_veth(&self, host_if: &str, container_if: &str) -> CniResult<()> {
        Ok(vport_netlink::delete_veth_pair(host_if, container_if).await?)
    }

    async fn assign_address(
        &self,
        netns: &str,
        ifname: &str,
        ip: Ipv4Addr,
        gateway: Ipv4Addr,
        mask: Ipv4Addr,
    ) -> CniResult<vport_netlink::ConfiguredAddress> {
        Ok(vport_netlink::assign_address(netns, ifname, ip, gateway, mask).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MesosResolver;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use vport_audit::AuditResult;
    use vport_netlink::ConfiguredAddress;

    /// Which control-plane step to fail, for rollback testing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Fault {
        None,
        BridgeAttach,
        PortCreate,
        EntityCreate,
        NeverResolves,
    }

    #[derive(Default)]
    struct State {
        ports: Vec<String>,
        updated: Vec<String>,
        entities: HashMap<String, Vec<String>>,
        /// Name-keyed entity rows, for the uuid-loss fallback path.
        named_entities: HashMap<String, Vec<String>>,
        destroyed_by_name: Vec<String>,
        bridged: Vec<String>,
        zones: HashMap<String, String>,
        registrations: Vec<String>,
        deregistrations: Vec<String>,
    }

    struct FakeControlPlane {
        fault: Fault,
        state: Mutex<State>,
        /// Update handed to a registering waiter, unless NeverResolves.
        update: PortUpdate,
    }

    impl FakeControlPlane {
        fn new(fault: Fault) -> Self {
            FakeControlPlane {
                fault,
                state: Mutex::new(State::default()),
                update: PortUpdate {
                    ip: Some("10.1.2.3".to_string()),
                    mask: Some("255.255.255.0".to_string()),
                    gateway: Some("10.1.2.1".to_string()),
                    mac: None,
                    registered: true,
                },
            }
        }

        fn is_clean(&self) -> bool {
            let state = self.state.lock().unwrap();
            state.ports.is_empty() && state.entities.is_empty() && state.bridged.is_empty()
        }
    }

    fn control_err(what: &str) -> CniError {
        CniError::MetadataResolve {
            message: format!("injected {what} failure"),
        }
    }

    #[async_trait]
    impl AttachControlPlane for FakeControlPlane {
        async fn create_port(
            &self,
            name: &str,
            _attributes: &PortAttributes,
            _metadata: &PortMetadata,
        ) -> CniResult<()> {
            if self.fault == Fault::PortCreate {
                return Err(control_err("port create"));
            }
            self.state.lock().unwrap().ports.push(name.to_string());
            Ok(())
        }

        async fn update_port(
            &self,
            name: &str,
            _attributes: &PortAttributes,
            _metadata: &PortMetadata,
        ) -> CniResult<()> {
            self.state.lock().unwrap().updated.push(name.to_string());
            Ok(())
        }

        async fn destroy_port(&self, name: &str) -> CniResult<()> {
            self.state.lock().unwrap().ports.retain(|p| p != name);
            Ok(())
        }

        async fn port_zone(&self, name: &str) -> CniResult<Option<String>> {
            Ok(self.state.lock().unwrap().zones.get(name).cloned())
        }

        async fn attach_to_bridge(
            &self,
            port: &str,
            _entity_uuid: &str,
            _entity_name: &str,
        ) -> CniResult<()> {
            if self.fault == Fault::BridgeAttach {
                return Err(control_err("bridge attach"));
            }
            self.state.lock().unwrap().bridged.push(port.to_string());
            Ok(())
        }

        async fn detach_from_bridge(&self, port: &str) -> CniResult<()> {
            self.state.lock().unwrap().bridged.retain(|p| p != port);
            Ok(())
        }

        async fn create_entity(&self, info: &EntityInfo) -> CniResult<()> {
            if self.fault == Fault::EntityCreate {
                return Err(control_err("entity create"));
            }
            self.state
                .lock()
                .unwrap()
                .entities
                .insert(info.uuid.clone(), info.ports.clone());
            Ok(())
        }

        async fn destroy_entity(&self, uuid: &str) -> CniResult<()> {
            self.state.lock().unwrap().entities.remove(uuid);
            Ok(())
        }

        async fn destroy_entity_by_name(&self, name: &str) -> CniResult<()> {
            let mut state = self.state.lock().unwrap();
            state.named_entities.remove(name);
            state.destroyed_by_name.push(name.to_string());
            Ok(())
        }

        async fn entity_exists(&self, uuid: &str) -> CniResult<bool> {
            Ok(self.state.lock().unwrap().entities.contains_key(uuid))
        }

        async fn entity_ports(&self, uuid: &str) -> CniResult<Vec<String>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .entities
                .get(uuid)
                .cloned()
                .unwrap_or_default())
        }

        async fn entity_ports_by_name(&self, name: &str) -> CniResult<Vec<String>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .named_entities
                .get(name)
                .cloned()
                .unwrap_or_default())
        }

        async fn register_for_port_updates(
            &self,
            name: &str,
            tx: mpsc::Sender<PortUpdate>,
        ) -> CniResult<()> {
            self.state.lock().unwrap().registrations.push(name.to_string());
            if self.fault != Fault::NeverResolves {
                let _ = tx.try_send(self.update.clone());
            }
            Ok(())
        }

        async fn deregister_for_port_updates(&self, name: &str) -> CniResult<()> {
            self.state
                .lock()
                .unwrap()
                .deregistrations
                .push(name.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeDatapath {
        veths: Mutex<Vec<String>>,
        assigned: Mutex<Vec<ConfiguredAddress>>,
    }

    #[async_trait]
    impl Datapath for FakeDatapath {
        async fn create_veth(
            &self,
            _netns: &str,
            host_if: &str,
            _container_if: &str,
            _mtu: u32,
        ) -> CniResult<String> {
            self.veths.lock().unwrap().push(host_if.to_string());
            Ok("aa:bb:cc:dd:ee:ff".to_string())
        }

        async fn delete_veth(&self, host_if: &str, _container_if: &str) -> CniResult<()> {
            self.veths.lock().unwrap().retain(|v| v != host_if);
            Ok(())
        }

        async fn assign_address(
            &self,
            _netns: &str,
            _ifname: &str,
            ip: Ipv4Addr,
            gateway: Ipv4Addr,
            mask: Ipv4Addr,
        ) -> CniResult<ConfiguredAddress> {
            let address = ConfiguredAddress {
                ip,
                gateway,
                prefix_len: vport_netlink::mask_to_prefix(mask).unwrap(),
            };
            self.assigned.lock().unwrap().push(address);
            Ok(address)
        }
    }

    struct NullNotifier;

    #[async_trait]
    impl DeletionNotifier for NullNotifier {
        async fn notify_deleted(&self, _name: &str, _zone: &str) -> AuditResult<()> {
            Ok(())
        }
    }

    fn request() -> AttachRequest {
        AttachRequest {
            entity_id: "73c1c37604bb48a69668d8d9c65d7cf5".to_string(),
            entity_name: "frontend-1".to_string(),
            netns: "/proc/42/ns/net".to_string(),
            ifname: "eth0".to_string(),
            mtu: 1500,
            resolve_timeout: 1,
            bridge: "alubr0".to_string(),
        }
    }

    fn resolver() -> MesosResolver {
        let labels = [
            ("enterprise", "acme"),
            ("domain", "prod"),
            ("zone", "web"),
            ("network", "10.1.2.0"),
            ("user", "ops"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        MesosResolver::new(labels)
    }

    #[tokio::test]
    async fn attach_creates_rows_and_configures_address() {
        let control = FakeControlPlane::new(Fault::None);
        let datapath = FakeDatapath::default();
        let attacher = Attacher::new(&control, &datapath);
        let req = request();

        let address = attacher.connect(&req, &resolver()).await.unwrap();
        assert_eq!(address.ip, Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(address.prefix_len, 24);
        assert_eq!(address.gateway, Ipv4Addr::new(10, 1, 2, 1));

        let port = port_name(&req.ifname, &req.entity_id);
        let state = control.state.lock().unwrap();
        assert_eq!(state.ports, vec![port.clone()]);
        assert_eq!(state.bridged, vec![port.clone()]);
        assert_eq!(state.entities.get(&req.entity_id), Some(&vec![port.clone()]));
        assert_eq!(datapath.veths.lock().unwrap().clone(), vec![port]);
    }

    #[tokio::test]
    async fn detach_removes_everything_and_notifies() {
        let control = FakeControlPlane::new(Fault::None);
        let datapath = FakeDatapath::default();
        let attacher = Attacher::new(&control, &datapath);
        let req = request();
        attacher.connect(&req, &resolver()).await.unwrap();

        let port = port_name(&req.ifname, &req.entity_id);
        control
            .state
            .lock()
            .unwrap()
            .zones
            .insert(port, "web".to_string());

        #[derive(Default)]
        struct Recorder(Mutex<Vec<(String, String)>>);
        #[async_trait]
        impl DeletionNotifier for Recorder {
            async fn notify_deleted(&self, name: &str, zone: &str) -> AuditResult<()> {
                self.0.lock().unwrap().push((name.to_string(), zone.to_string()));
                Ok(())
            }
        }
        let notifier = Recorder::default();

        let report = attacher.disconnect(&req, &notifier).await;
        assert!(report.failures.is_empty(), "{:?}", report.failures);
        assert!(control.is_clean());
        assert!(datapath.veths.lock().unwrap().is_empty());
        assert_eq!(
            notifier.0.lock().unwrap().clone(),
            vec![("frontend-1".to_string(), "web".to_string())]
        );
    }

    #[tokio::test]
    async fn bridge_attach_failure_rolls_back_the_veth() {
        let control = FakeControlPlane::new(Fault::BridgeAttach);
        let datapath = FakeDatapath::default();
        let attacher = Attacher::new(&control, &datapath);

        attacher.connect(&request(), &resolver()).await.unwrap_err();
        assert!(control.is_clean());
        assert!(datapath.veths.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn port_create_failure_rolls_back_veth_and_bridge() {
        let control = FakeControlPlane::new(Fault::PortCreate);
        let datapath = FakeDatapath::default();
        let attacher = Attacher::new(&control, &datapath);

        attacher.connect(&request(), &resolver()).await.unwrap_err();
        assert!(control.is_clean());
        assert!(datapath.veths.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn entity_create_failure_rolls_back_the_port_row_too() {
        let control = FakeControlPlane::new(Fault::EntityCreate);
        let datapath = FakeDatapath::default();
        let attacher = Attacher::new(&control, &datapath);

        attacher.connect(&request(), &resolver()).await.unwrap_err();
        assert!(control.is_clean());
        assert!(datapath.veths.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolution_timeout_rolls_back_everything() {
        let control = FakeControlPlane::new(Fault::NeverResolves);
        let datapath = FakeDatapath::default();
        let attacher = Attacher::new(&control, &datapath);

        let err = attacher.connect(&request(), &resolver()).await.unwrap_err();
        assert!(matches!(err, CniError::PortResolutionTimeout { .. }));
        assert!(control.is_clean());
        assert!(datapath.veths.lock().unwrap().is_empty());
        assert!(datapath.assigned.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn existing_entity_with_no_ports_is_an_error() {
        let control = FakeControlPlane::new(Fault::None);
        control
            .state
            .lock()
            .unwrap()
            .entities
            .insert(request().entity_id, Vec::new());
        let datapath = FakeDatapath::default();
        let attacher = Attacher::new(&control, &datapath);

        let err = attacher.connect(&request(), &resolver()).await.unwrap_err();
        assert!(matches!(err, CniError::EntityWithoutPorts { .. }));
        // The rows built before the check are rolled back; the pre-existing
        // entity row is left alone.
        let state = control.state.lock().unwrap();
        assert!(state.ports.is_empty());
        assert!(state.bridged.is_empty());
        assert_eq!(state.entities.len(), 1);
    }

    #[tokio::test]
    async fn replayed_add_rebinds_the_existing_port_row() {
        let control = FakeControlPlane::new(Fault::None);
        let req = request();
        let port = port_name(&req.ifname, &req.entity_id);
        {
            let mut state = control.state.lock().unwrap();
            state.ports.push(port.clone());
            state
                .entities
                .insert(req.entity_id.clone(), vec![port.clone()]);
        }
        let datapath = FakeDatapath::default();
        let attacher = Attacher::new(&control, &datapath);

        attacher.connect(&req, &resolver()).await.unwrap();
        let state = control.state.lock().unwrap();
        // No second row; the existing one was rewritten.
        assert_eq!(state.ports, vec![port.clone()]);
        assert_eq!(state.updated, vec![port]);
    }

    #[tokio::test]
    async fn detach_with_multiple_bound_ports_still_destroys_the_entity() {
        let control = FakeControlPlane::new(Fault::None);
        let req = request();
        let port = port_name(&req.ifname, &req.entity_id);
        let other = "vp1111111111111".to_string();
        {
            let mut state = control.state.lock().unwrap();
            state.ports = vec![port.clone(), other.clone()];
            state.bridged = vec![port.clone(), other.clone()];
            state
                .entities
                .insert(req.entity_id.clone(), vec![port.clone(), other.clone()]);
        }
        let datapath = FakeDatapath::default();
        let attacher = Attacher::new(&control, &datapath);

        let report = attacher.disconnect(&req, &NullNotifier).await;
        assert!(report.failures.is_empty(), "{:?}", report.failures);
        let state = control.state.lock().unwrap();
        assert!(state.entities.is_empty());
        // Datapath teardown is reserved for the last bound interface.
        assert_eq!(state.ports, vec![port.clone(), other.clone()]);
        assert_eq!(state.bridged, vec![port, other]);
    }

    #[tokio::test]
    async fn detach_leaves_a_same_named_entity_under_a_new_uuid_alone() {
        let control = FakeControlPlane::new(Fault::None);
        let datapath = FakeDatapath::default();
        let attacher = Attacher::new(&control, &datapath);
        let req = request();
        attacher.connect(&req, &resolver()).await.unwrap();

        // A replacement workload reusing the name, attached under its own
        // uuid, with its row also reachable by name.
        let replacement_port = "vp2222222222222".to_string();
        control
            .state
            .lock()
            .unwrap()
            .named_entities
            .insert(req.entity_name.clone(), vec![replacement_port.clone()]);

        attacher.disconnect(&req, &NullNotifier).await;
        let state = control.state.lock().unwrap();
        assert!(state.entities.is_empty());
        assert!(state.destroyed_by_name.is_empty());
        assert_eq!(
            state.named_entities.get(&req.entity_name),
            Some(&vec![replacement_port])
        );
    }

    #[tokio::test]
    async fn detach_falls_back_to_the_name_keyed_row_when_the_uuid_is_gone() {
        let control = FakeControlPlane::new(Fault::None);
        let req = request();
        let port = port_name(&req.ifname, &req.entity_id);
        {
            let mut state = control.state.lock().unwrap();
            state.ports = vec![port.clone()];
            state.bridged = vec![port.clone()];
            state
                .named_entities
                .insert(req.entity_name.clone(), vec![port]);
        }
        let datapath = FakeDatapath::default();
        let attacher = Attacher::new(&control, &datapath);

        let report = attacher.disconnect(&req, &NullNotifier).await;
        assert!(report.failures.is_empty(), "{:?}", report.failures);
        let state = control.state.lock().unwrap();
        assert!(state.ports.is_empty());
        assert!(state.bridged.is_empty());
        assert!(state.named_entities.is_empty());
        assert_eq!(state.destroyed_by_name, vec![req.entity_name]);
    }

    #[tokio::test]
    async fn rollback_deregisters_the_reused_port_waiter() {
        let control = FakeControlPlane::new(Fault::NeverResolves);
        let req = request();
        let existing = "vp3333333333333".to_string();
        {
            let mut state = control.state.lock().unwrap();
            state.ports = vec![existing.clone()];
            state
                .entities
                .insert(req.entity_id.clone(), vec![existing.clone()]);
        }
        let datapath = FakeDatapath::default();
        let attacher = Attacher::new(&control, &datapath);

        let err = attacher.connect(&req, &resolver()).await.unwrap_err();
        assert!(matches!(err, CniError::PortResolutionTimeout { .. }));
        let state = control.state.lock().unwrap();
        // The waiter was registered on the reused port, so that is the one
        // the rollback must deregister.
        assert_eq!(state.registrations, vec![existing.clone()]);
        assert_eq!(state.deregistrations, vec![existing]);
    }

    #[tokio::test]
    async fn incomplete_metadata_fails_before_touching_anything() {
        let control = FakeControlPlane::new(Fault::None);
        let datapath = FakeDatapath::default();
        let attacher = Attacher::new(&control, &datapath);
        let empty = MesosResolver::new(HashMap::new());

        let err = attacher.connect(&request(), &empty).await.unwrap_err();
        assert!(matches!(err, CniError::IncompleteMetadata { .. }));
        assert!(control.is_clean());
        assert!(datapath.veths.lock().unwrap().is_empty());
    }
}
