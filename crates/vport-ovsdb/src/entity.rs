//! Entity (VM) table operations.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::connection::SwitchConnection;
use crate::error::OvsdbResult;
use crate::table::{from_ovs_set, ovs_map, ovs_set, Condition};

const COL_UUID: &str = "vm_uuid";
const COL_VM_NAME: &str = "vm_name";
const COL_PLATFORM: &str = "domain";
const COL_TYPE: &str = "type";
const COL_PORTS: &str = "ports";
const COL_METADATA: &str = "metadata";
const COL_EVENT_CATEGORY: &str = "event_category";
const COL_EVENT_TYPE: &str = "event_type";
const COL_STATE: &str = "state";
const COL_REASON: &str = "reason";

/// Container platform tag carried on entity and port rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformDomain {
    Docker,
    Kvm,
}

impl PlatformDomain {
    pub fn as_str(self) -> &'static str {
        match self {
            PlatformDomain::Docker => "docker",
            PlatformDomain::Kvm => "kvm",
        }
    }
}

/// Entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityType {
    Container,
    Vm,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Container => "container",
            EntityType::Vm => "vm",
        }
    }
}

/// Activation event tuple, consumed by the control plane at creation time.
#[derive(Debug, Clone)]
pub struct EntityEvents {
    pub category: String,
    pub event: String,
    pub state: String,
    pub reason: String,
}

impl EntityEvents {
    /// The started/booted/running tuple emitted for a freshly attached
    /// container.
    pub fn container_started() -> Self {
        EntityEvents {
            category: "started".to_string(),
            event: "booted".to_string(),
            state: "running".to_string(),
            reason: "booted".to_string(),
        }
    }
}

/// One workload (container/pod) as known to the switch control plane.
#[derive(Debug, Clone)]
pub struct EntityInfo {
    pub uuid: String,
    pub name: String,
    pub platform: PlatformDomain,
    pub entity_type: EntityType,
    /// Port names owned by this entity, in binding order.
    pub ports: Vec<String>,
    /// User, enterprise/tenant.
    pub metadata: HashMap<String, String>,
    pub events: Option<EntityEvents>,
}

impl SwitchConnection {
    /// Creates an entity row.
    pub async fn create_entity(&self, info: &EntityInfo) -> OvsdbResult<()> {
        let mut row = Map::new();
        row.insert(COL_UUID.to_string(), Value::String(info.uuid.clone()));
        row.insert(COL_VM_NAME.to_string(), Value::String(info.name.clone()));
        row.insert(
            COL_PLATFORM.to_string(),
            Value::String(info.platform.as_str().to_string()),
        );
        row.insert(
            COL_TYPE.to_string(),
            Value::String(info.entity_type.as_str().to_string()),
        );
        row.insert(
            COL_PORTS.to_string(),
            ovs_set(info.ports.iter().map(String::as_str)),
        );
        row.insert(
            COL_METADATA.to_string(),
            ovs_map(info.metadata.iter().map(|(k, v)| (k.as_str(), v.as_str()))),
        );
        if let Some(events) = &info.events {
            row.insert(
                COL_EVENT_CATEGORY.to_string(),
                Value::String(events.category.clone()),
            );
            row.insert(
                COL_EVENT_TYPE.to_string(),
                Value::String(events.event.clone()),
            );
            row.insert(COL_STATE.to_string(), Value::String(events.state.clone()));
            row.insert(COL_REASON.to_string(), Value::String(events.reason.clone()));
        }
        self.entity_table.insert_row(&self.client, row).await
    }

    /// Removes an entity row by uuid.
    pub async fn destroy_entity(&self, uuid: &str) -> OvsdbResult<()> {
        self.entity_table
            .delete_row(&self.client, Condition::eq(COL_UUID, uuid))
            .await
    }

    /// Removes an entity row by name. Detach falls back to this when the
    /// uuid the row was created under is no longer recoverable.
    pub async fn destroy_entity_by_name(&self, name: &str) -> OvsdbResult<()> {
        self.entity_table
            .delete_row(&self.client, Condition::eq(COL_VM_NAME, name))
            .await
    }

    /// All entity uuids currently known to the switch.
    pub async fn get_all_entities(&self) -> OvsdbResult<Vec<String>> {
        let rows = self
            .entity_table
            .read_rows(&self.client, &[COL_UUID], Condition::ne(COL_UUID, ""))
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.get(COL_UUID).and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    /// Whether an entity row exists for `uuid`.
    pub async fn entity_exists(&self, uuid: &str) -> OvsdbResult<bool> {
        let rows = self
            .entity_table
            .read_rows(&self.client, &[COL_UUID], Condition::eq(COL_UUID, uuid))
            .await?;
        Ok(!rows.is_empty())
    }

    /// Ordered port names bound to the entity with `uuid`. Empty when the
    /// entity does not exist.
    pub async fn get_entity_ports(&self, uuid: &str) -> OvsdbResult<Vec<String>> {
        let rows = self
            .entity_table
            .read_rows(&self.client, &[COL_PORTS], Condition::eq(COL_UUID, uuid))
            .await?;
        Ok(rows
            .first()
            .and_then(|r| r.get(COL_PORTS))
            .map(from_ovs_set)
            .unwrap_or_default())
    }

    /// Ordered port names bound to the entity with `name`.
    pub async fn get_entity_ports_by_name(&self, name: &str) -> OvsdbResult<Vec<String>> {
        let rows = self
            .entity_table
            .read_rows(&self.client, &[COL_PORTS], Condition::eq(COL_VM_NAME, name))
            .await?;
        Ok(rows
            .first()
            .and_then(|r| r.get(COL_PORTS))
            .map(from_ovs_set)
            .unwrap_or_default())
    }

    /// The human-readable name of the entity with `uuid`.
    pub async fn get_entity_name(&self, uuid: &str) -> OvsdbResult<String> {
        let row = self
            .entity_table
            .read_row(&self.client, &[COL_VM_NAME], Condition::eq(COL_UUID, uuid))
            .await?;
        Ok(row
            .get(COL_VM_NAME)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }
}
