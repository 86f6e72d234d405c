//! Controller-table health probe.
//!
//! This is a point-in-time read, not a subscription: the daemon's health
//! ticker calls it (or any cheap table read) to decide whether the control
//! plane is still reachable.

use crate::connection::SwitchConnection;
use crate::error::OvsdbResult;
use crate::table::{Condition, Row};

const COL_ROLE: &str = "role";
const ROLE_MASTER: &str = "master";

/// Tri-state controller connection health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerHealth {
    /// Exactly one master-role controller row.
    Connected,
    /// No master-role controller row.
    Disconnected,
    /// The controller table could not be read; the reason is surfaced.
    Unknown { reason: String },
}

/// Classifies the rows of a `role == master` query.
fn health_from_rows(rows: OvsdbResult<Vec<Row>>) -> ControllerHealth {
    match rows {
        Ok(rows) if rows.len() == 1 => ControllerHealth::Connected,
        Ok(_) => ControllerHealth::Disconnected,
        Err(e) => ControllerHealth::Unknown {
            reason: e.to_string(),
        },
    }
}

impl SwitchConnection {
    /// Probes the controller table: exactly one `role == master` row means
    /// the switch is connected to its controller.
    pub async fn controller_health(&self) -> ControllerHealth {
        let rows = self
            .controller_table
            .read_rows(
                &self.client,
                &[COL_ROLE],
                Condition::eq(COL_ROLE, ROLE_MASTER),
            )
            .await;
        health_from_rows(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OvsdbError;
    use serde_json::json;

    fn master_row() -> Row {
        json!({ "role": "master" }).as_object().unwrap().clone()
    }

    #[test]
    fn one_master_row_is_connected() {
        assert_eq!(
            health_from_rows(Ok(vec![master_row()])),
            ControllerHealth::Connected
        );
    }

    #[test]
    fn zero_rows_is_disconnected() {
        assert_eq!(health_from_rows(Ok(vec![])), ControllerHealth::Disconnected);
    }

    #[test]
    fn two_master_rows_is_not_connected() {
        assert_eq!(
            health_from_rows(Ok(vec![master_row(), master_row()])),
            ControllerHealth::Disconnected
        );
    }

    #[test]
    fn read_error_is_unknown_with_reason() {
        let err = OvsdbError::table("Controller", "select", "socket gone");
        let health = health_from_rows(Err(err));
        match health {
            ControllerHealth::Unknown { reason } => assert!(reason.contains("socket gone")),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }
}
