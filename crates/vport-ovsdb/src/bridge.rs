//! Attaching and detaching veth host ports on the vswitch bridge.
//!
//! These are standard OVSDB `Bridge`/`Port`/`Interface` rows, created in one
//! transaction with named-uuid linkage and removed by mutating the bridge's
//! port set before deleting the rows.

use serde_json::{json, Value};

use crate::connection::SwitchConnection;
use crate::error::{OvsdbError, OvsdbResult};
use crate::table::ovs_map;

const BRIDGE_TABLE: &str = "Bridge";
const OVS_PORT_TABLE: &str = "Port";
const INTERFACE_TABLE: &str = "Interface";

impl SwitchConnection {
    /// Attaches the named veth host end to `bridge`, tagging the interface
    /// row with the owning entity's uuid and name so the control plane can
    /// correlate the datapath port with the entity row.
    pub async fn add_port_to_bridge(
        &self,
        bridge: &str,
        port_name: &str,
        entity_uuid: &str,
        entity_name: &str,
    ) -> OvsdbResult<()> {
        let external_ids = ovs_map([("vm-uuid", entity_uuid), ("vm-name", entity_name)]);
        let ops = vec![
            json!({
                "op": "insert",
                "table": INTERFACE_TABLE,
                "row": { "name": port_name, "external_ids": external_ids },
                "uuid-name": "new_intf",
            }),
            json!({
                "op": "insert",
                "table": OVS_PORT_TABLE,
                "row": { "name": port_name, "interfaces": ["named-uuid", "new_intf"] },
                "uuid-name": "new_port",
            }),
            json!({
                "op": "mutate",
                "table": BRIDGE_TABLE,
                "where": [["name", "==", bridge]],
                "mutations": [["ports", "insert", ["set", [["named-uuid", "new_port"]]]]],
            }),
        ];
        self.client
            .transact(ops)
            .await
            .map_err(|e| OvsdbError::table(BRIDGE_TABLE, "attach", e))?;
        Ok(())
    }

    /// Detaches the named veth host end from `bridge` and deletes its
    /// `Port`/`Interface` rows.
    pub async fn remove_port_from_bridge(&self, bridge: &str, port_name: &str) -> OvsdbResult<()> {
        // The bridge's port set references the Port row by uuid, so resolve
        // it first.
        let select = json!({
            "op": "select",
            "table": OVS_PORT_TABLE,
            "where": [["name", "==", port_name]],
            "columns": ["_uuid"],
        });
        let results = self
            .client
            .transact(vec![select])
            .await
            .map_err(|e| OvsdbError::table(BRIDGE_TABLE, "detach", e))?;
        let port_uuid = results
            .first()
            .and_then(|r| r.get("rows"))
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("_uuid"))
            .cloned()
            .ok_or_else(|| OvsdbError::RowNotFound {
                table: OVS_PORT_TABLE.to_string(),
                condition: format!("name == {port_name}"),
            })?;

        let ops = vec![
            json!({
                "op": "mutate",
                "table": BRIDGE_TABLE,
                "where": [["name", "==", bridge]],
                "mutations": [["ports", "delete", ["set", [port_uuid]]]],
            }),
            json!({
                "op": "delete",
                "table": OVS_PORT_TABLE,
                "where": [["name", "==", port_name]],
            }),
            json!({
                "op": "delete",
                "table": INTERFACE_TABLE,
                "where": [["name", "==", port_name]],
            }),
        ];
        self.client
            .transact(ops)
            .await
            .map_err(|e| OvsdbError::table(BRIDGE_TABLE, "detach", e))?;
        Ok(())
    }
}
