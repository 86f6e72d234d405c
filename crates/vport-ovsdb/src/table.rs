//! Generic conditional CRUD on a named OVSDB control table.
//!
//! The operator set for conditions is deliberately minimal: `==` and `!=`
//! cover every query the plugin issues. There is no atomicity across rows;
//! multi-step sequences (and their rollback) are the caller's concern.

use serde_json::{json, Map, Value};

use crate::error::{OvsdbError, OvsdbResult};
use crate::rpc::OvsdbClient;

/// Condition operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Column equals value.
    Eq,
    /// Column does not equal value.
    Ne,
}

impl Op {
    fn as_str(self) -> &'static str {
        match self {
            Op::Eq => "==",
            Op::Ne => "!=",
        }
    }
}

/// A single-column match condition.
#[derive(Debug, Clone)]
pub struct Condition {
    column: String,
    op: Op,
    value: Value,
}

impl Condition {
    /// `column == value`.
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Condition {
            column: column.to_string(),
            op: Op::Eq,
            value: value.into(),
        }
    }

    /// `column != value`.
    pub fn ne(column: &str, value: impl Into<Value>) -> Self {
        Condition {
            column: column.to_string(),
            op: Op::Ne,
            value: value.into(),
        }
    }

    /// The OVSDB wire form: `[column, op, value]`.
    pub fn to_value(&self) -> Value {
        json!([self.column, self.op.as_str(), self.value])
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.column, self.op.as_str(), self.value)
    }
}

/// Typed row content, keyed by column name.
pub type Row = Map<String, Value>;

/// Conditional CRUD access to one named control table.
#[derive(Debug, Clone)]
pub struct ControlTable {
    name: String,
}

impl ControlTable {
    /// Creates a handle for the named table.
    pub fn new(name: &str) -> Self {
        ControlTable {
            name: name.to_string(),
        }
    }

    /// The table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Inserts a single row.
    pub async fn insert_row(&self, client: &OvsdbClient, row: Row) -> OvsdbResult<()> {
        let op = json!({ "op": "insert", "table": self.name, "row": row });
        client
            .transact(vec![op])
            .await
            .map_err(|e| OvsdbError::table(&self.name, "insert", e))?;
        Ok(())
    }

    /// Deletes all rows matching the condition.
    pub async fn delete_row(&self, client: &OvsdbClient, condition: Condition) -> OvsdbResult<()> {
        let op = json!({ "op": "delete", "table": self.name, "where": [condition.to_value()] });
        client
            .transact(vec![op])
            .await
            .map_err(|e| OvsdbError::table(&self.name, "delete", e))?;
        Ok(())
    }

    /// Reads the first row matching the condition, projected to `columns`.
    pub async fn read_row(
        &self,
        client: &OvsdbClient,
        columns: &[&str],
        condition: Condition,
    ) -> OvsdbResult<Row> {
        let mut rows = self.read_rows(client, columns, condition.clone()).await?;
        if rows.is_empty() {
            return Err(OvsdbError::RowNotFound {
                table: self.name.clone(),
                condition: condition.to_string(),
            });
        }
        Ok(rows.swap_remove(0))
    }

    /// Reads all rows matching the condition, projected to `columns`.
    pub async fn read_rows(
        &self,
        client: &OvsdbClient,
        columns: &[&str],
        condition: Condition,
    ) -> OvsdbResult<Vec<Row>> {
        let op = json!({
            "op": "select",
            "table": self.name,
            "where": [condition.to_value()],
            "columns": columns,
        });
        let results = client
            .transact(vec![op])
            .await
            .map_err(|e| OvsdbError::table(&self.name, "select", e))?;

        let rows = results
            .first()
            .and_then(|r| r.get("rows"))
            .and_then(Value::as_array)
            .ok_or_else(|| OvsdbError::table(&self.name, "select", "no rows member in result"))?;
        Ok(rows
            .iter()
            .filter_map(|r| r.as_object().cloned())
            .collect())
    }

    /// Updates the given columns of all rows matching the condition.
    pub async fn update_row(
        &self,
        client: &OvsdbClient,
        values: Row,
        condition: Condition,
    ) -> OvsdbResult<()> {
        let op = json!({
            "op": "update",
            "table": self.name,
            "where": [condition.to_value()],
            "row": values,
        });
        client
            .transact(vec![op])
            .await
            .map_err(|e| OvsdbError::table(&self.name, "update", e))?;
        Ok(())
    }
}

/// Encodes a string map as an OVSDB map value: `["map", [[k, v], ...]]`.
pub fn ovs_map<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Value {
    let pairs: Vec<Value> = entries
        .into_iter()
        .map(|(k, v)| json!([k, v]))
        .collect();
    json!(["map", pairs])
}

/// Encodes a string sequence as an OVSDB set value: `["set", [v, ...]]`.
pub fn ovs_set<'a>(values: impl IntoIterator<Item = &'a str>) -> Value {
    let items: Vec<Value> = values.into_iter().map(|v| json!(v)).collect();
    json!(["set", items])
}

/// Decodes an OVSDB set column into its member strings. A bare string (the
/// single-element encoding) is accepted as well.
pub fn from_ovs_set(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(parts) if parts.first().and_then(Value::as_str) == Some("set") => parts
            .get(1)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn condition_wire_form() {
        let c = Condition::eq("name", "vp0123");
        assert_eq!(c.to_value(), json!(["name", "==", "vp0123"]));
        let c = Condition::ne("name", "xxxx");
        assert_eq!(c.to_value(), json!(["name", "!=", "xxxx"]));
    }

    #[test]
    fn map_and_set_encoding() {
        let m = ovs_map([("user", "admin"), ("enterprise", "corp")]);
        assert_eq!(m, json!(["map", [["user", "admin"], ["enterprise", "corp"]]]));
        let s = ovs_set(["vp1", "vp2"]);
        assert_eq!(s, json!(["set", ["vp1", "vp2"]]));
    }

    #[test]
    fn set_decoding_accepts_both_encodings() {
        assert_eq!(from_ovs_set(&json!("vp1")), vec!["vp1".to_string()]);
        assert_eq!(
            from_ovs_set(&json!(["set", ["vp1", "vp2"]])),
            vec!["vp1".to_string(), "vp2".to_string()]
        );
        assert!(from_ovs_set(&json!(42)).is_empty());
    }
}
