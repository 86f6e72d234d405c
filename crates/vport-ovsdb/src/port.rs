//! Port table operations and row-update parsing.

use serde_json::{Map, Value};

use crate::connection::SwitchConnection;
use crate::entity::PlatformDomain;
use crate::error::{OvsdbError, OvsdbResult};
use crate::table::{ovs_map, Condition};

pub(crate) const COL_NAME: &str = "name";
pub(crate) const COL_MAC: &str = "mac";
pub(crate) const COL_BRIDGE: &str = "bridge";
pub(crate) const COL_IP: &str = "ip_addr";
pub(crate) const COL_MASK: &str = "subnet_mask";
pub(crate) const COL_GATEWAY: &str = "gateway";
pub(crate) const COL_DOMAIN: &str = "domain";
pub(crate) const COL_NETWORK: &str = "network";
pub(crate) const COL_NETWORK_TYPE: &str = "network_type";
pub(crate) const COL_ZONE: &str = "zone";
pub(crate) const COL_VM_DOMAIN: &str = "vm_domain";
pub(crate) const COL_METADATA: &str = "metadata";

/// Fixed attributes of a port row.
#[derive(Debug, Clone)]
pub struct PortAttributes {
    /// MAC address of the container-side veth end.
    pub mac: String,
    /// The vswitch bridge the host-side end is attached to.
    pub bridge: String,
    /// Container platform tag.
    pub platform: PlatformDomain,
}

/// Network-identity metadata attached to a port row.
///
/// Domain, network, network type and zone are promoted to first-class
/// columns; the whole set also lands in the generic `metadata` map column so
/// downstream consumers (and the audit daemon) see one place of record.
#[derive(Debug, Clone, Default)]
pub struct PortMetadata {
    pub domain: String,
    pub network: String,
    pub zone: String,
    pub network_type: String,
    pub static_ip: Option<String>,
    pub policy_group: Option<String>,
    pub redirection_target: Option<String>,
}

impl PortMetadata {
    /// Flattens to the key-value form stored in the `metadata` map column.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("domain".to_string(), self.domain.clone()),
            ("network".to_string(), self.network.clone()),
            ("zone".to_string(), self.zone.clone()),
            ("network_type".to_string(), self.network_type.clone()),
        ];
        if let Some(ip) = &self.static_ip {
            pairs.push(("static_ip".to_string(), ip.clone()));
        }
        if let Some(pg) = &self.policy_group {
            pairs.push(("policy_group".to_string(), pg.clone()));
        }
        if let Some(rt) = &self.redirection_target {
            pairs.push(("redirection_target".to_string(), rt.clone()));
        }
        pairs
    }
}

/// Resolution state of a port, read back from the port table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortState {
    pub ip: Option<String>,
    pub mask: Option<String>,
    pub gateway: Option<String>,
    pub zone: Option<String>,
}

/// One asynchronous row-change notification for a port.
///
/// `registered == false` is the withdrawn marker synthesized when the row is
/// deleted while a waiter is blocked on it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortUpdate {
    pub ip: Option<String>,
    pub mask: Option<String>,
    pub gateway: Option<String>,
    pub mac: Option<String>,
    pub registered: bool,
}

impl PortUpdate {
    /// The marker delivered when the port row disappears mid-wait.
    pub fn withdrawn() -> Self {
        PortUpdate {
            registered: false,
            ..Default::default()
        }
    }
}

/// Parses the interesting columns out of a monitor row.
///
/// A present-but-empty value is a malformed update, not "unset"; a row
/// carrying none of the interesting columns yields `None`.
pub(crate) fn parse_port_update(row: &Map<String, Value>) -> OvsdbResult<Option<PortUpdate>> {
    let mut update = PortUpdate {
        registered: true,
        ..Default::default()
    };
    let mut interesting = false;
    for (column, slot) in [
        (COL_IP, &mut update.ip),
        (COL_MASK, &mut update.mask),
        (COL_GATEWAY, &mut update.gateway),
        (COL_MAC, &mut update.mac),
    ] {
        if let Some(value) = row.get(column).and_then(Value::as_str) {
            if value.is_empty() {
                return Err(OvsdbError::MalformedRowUpdate {
                    column: column.to_string(),
                });
            }
            *slot = Some(value.to_string());
            interesting = true;
        }
    }
    Ok(interesting.then_some(update))
}

impl SwitchConnection {
    /// Creates a new port row. Name and MAC are the only mandatory inputs;
    /// the metadata columns carry everything the control plane needs to
    /// resolve an address for the port.
    pub async fn create_port(
        &self,
        name: &str,
        attributes: &PortAttributes,
        metadata: &PortMetadata,
    ) -> OvsdbResult<()> {
        let pairs = metadata.to_pairs();
        let mut row = Map::new();
        row.insert(COL_NAME.to_string(), Value::String(name.to_string()));
        row.insert(COL_MAC.to_string(), Value::String(attributes.mac.clone()));
        row.insert(
            COL_BRIDGE.to_string(),
            Value::String(attributes.bridge.clone()),
        );
        row.insert(
            COL_VM_DOMAIN.to_string(),
            Value::String(attributes.platform.as_str().to_string()),
        );
        row.insert(
            COL_DOMAIN.to_string(),
            Value::String(metadata.domain.clone()),
        );
        row.insert(
            COL_NETWORK.to_string(),
            Value::String(metadata.network.clone()),
        );
        row.insert(
            COL_NETWORK_TYPE.to_string(),
            Value::String(metadata.network_type.clone()),
        );
        row.insert(COL_ZONE.to_string(), Value::String(metadata.zone.clone()));
        row.insert(
            COL_METADATA.to_string(),
            ovs_map(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))),
        );
        self.port_table.insert_row(&self.client, row).await
    }

    /// Purges a port row.
    pub async fn destroy_port(&self, name: &str) -> OvsdbResult<()> {
        self.port_table
            .delete_row(&self.client, Condition::eq(COL_NAME, name))
            .await
    }

    /// All vport names currently known to the switch.
    pub async fn get_all_ports(&self) -> OvsdbResult<Vec<String>> {
        let rows = self
            .port_table
            .read_rows(&self.client, &[COL_NAME], Condition::ne(COL_NAME, ""))
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.get(COL_NAME).and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    /// Current resolution state of a port.
    pub async fn get_port_state(&self, name: &str) -> OvsdbResult<PortState> {
        let row = self
            .port_table
            .read_row(
                &self.client,
                &[COL_IP, COL_MASK, COL_GATEWAY, COL_ZONE],
                Condition::eq(COL_NAME, name),
            )
            .await?;
        let field = |col: &str| {
            row.get(col)
                .and_then(Value::as_str)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        Ok(PortState {
            ip: field(COL_IP),
            mask: field(COL_MASK),
            gateway: field(COL_GATEWAY),
            zone: field(COL_ZONE),
        })
    }

    /// Rewrites the fixed attributes of a port row.
    pub async fn update_port_attributes(
        &self,
        name: &str,
        attributes: &PortAttributes,
    ) -> OvsdbResult<()> {
        let mut row = Map::new();
        row.insert(COL_MAC.to_string(), Value::String(attributes.mac.clone()));
        row.insert(
            COL_BRIDGE.to_string(),
            Value::String(attributes.bridge.clone()),
        );
        row.insert(
            COL_VM_DOMAIN.to_string(),
            Value::String(attributes.platform.as_str().to_string()),
        );
        self.port_table
            .update_row(&self.client, row, Condition::eq(COL_NAME, name))
            .await
    }

    /// Rewrites the metadata of a port row, promoting domain, network and
    /// zone into their first-class columns.
    pub async fn update_port_metadata(
        &self,
        name: &str,
        metadata: &PortMetadata,
    ) -> OvsdbResult<()> {
        let pairs = metadata.to_pairs();
        let mut row = Map::new();
        row.insert(
            COL_METADATA.to_string(),
            ovs_map(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))),
        );
        if !metadata.domain.is_empty() {
            row.insert(
                COL_DOMAIN.to_string(),
                Value::String(metadata.domain.clone()),
            );
        }
        if !metadata.network.is_empty() {
            row.insert(
                COL_NETWORK.to_string(),
                Value::String(metadata.network.clone()),
            );
        }
        if !metadata.zone.is_empty() {
            row.insert(COL_ZONE.to_string(), Value::String(metadata.zone.clone()));
        }
        self.port_table
            .update_row(&self.client, row, Condition::eq(COL_NAME, name))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(fields: Value) -> Map<String, Value> {
        fields.as_object().unwrap().clone()
    }

    #[test]
    fn parses_full_row() {
        let update = parse_port_update(&row(json!({
            "name": "vpabc",
            "ip_addr": "10.0.0.5",
            "subnet_mask": "255.255.255.0",
            "gateway": "10.0.0.1",
            "mac": "aa:bb:cc:dd:ee:ff",
        })))
        .unwrap()
        .unwrap();
        assert_eq!(update.ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(update.mask.as_deref(), Some("255.255.255.0"));
        assert_eq!(update.gateway.as_deref(), Some("10.0.0.1"));
        assert_eq!(update.mac.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert!(update.registered);
    }

    #[test]
    fn present_but_empty_column_is_malformed() {
        let err = parse_port_update(&row(json!({
            "name": "vpabc",
            "ip_addr": "",
        })))
        .unwrap_err();
        assert!(matches!(err, OvsdbError::MalformedRowUpdate { column } if column == "ip_addr"));
    }

    #[test]
    fn row_without_state_columns_is_not_an_update() {
        let parsed = parse_port_update(&row(json!({ "name": "vpabc" }))).unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn metadata_pairs_include_optional_keys_only_when_set() {
        let mut metadata = PortMetadata {
            domain: "dom".to_string(),
            network: "net1".to_string(),
            zone: "prod".to_string(),
            network_type: "ipv4".to_string(),
            ..Default::default()
        };
        assert_eq!(metadata.to_pairs().len(), 4);
        metadata.static_ip = Some("10.0.0.9".to_string());
        metadata.policy_group = Some("pg1".to_string());
        let pairs = metadata.to_pairs();
        assert_eq!(pairs.len(), 6);
        assert!(pairs.contains(&("static_ip".to_string(), "10.0.0.9".to_string())));
    }
}
