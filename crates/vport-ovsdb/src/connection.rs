//! The switch connection: one OVSDB connection, three control tables, and the
//! port-update subscription dispatcher.
//!
//! # Subscription protocol
//!
//! A single dispatcher task owns two maps: `waiters` (port name → the channel
//! of the attach sequence currently blocked on that port) and `pending` (port
//! name → the last row state that arrived before anyone registered, capacity
//! one per name, last write wins). Registrations and monitor notifications
//! both funnel through channels into the task, so the maps are never touched
//! concurrently.
//!
//! Delivery is non-blocking everywhere: attach logic only needs the *latest*
//! state, and each send races a fresh probe anyway, so a full waiter channel
//! means the update is dropped. Drops are counted and traced so tests (and
//! operators) can observe them.

use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::{OvsdbError, OvsdbResult};
use crate::port::{parse_port_update, PortUpdate, COL_NAME};
use crate::rpc::OvsdbClient;
use crate::table::ControlTable;
use crate::{CONTROLLER_TABLE, ENTITY_TABLE, PORT_TABLE};

/// Columns monitored on the port table.
const MONITOR_COLUMNS: [&str; 5] = ["ip_addr", "subnet_mask", "gateway", "name", "mac"];

/// A registration request sent to the dispatcher.
pub(crate) enum Registration {
    Register {
        name: String,
        tx: mpsc::Sender<PortUpdate>,
        reply: oneshot::Sender<OvsdbResult<()>>,
    },
    Deregister {
        name: String,
    },
}

/// Live connection to the vswitch control database.
pub struct SwitchConnection {
    pub(crate) client: OvsdbClient,
    pub(crate) entity_table: ControlTable,
    pub(crate) port_table: ControlTable,
    pub(crate) controller_table: ControlTable,
    reg_tx: mpsc::Sender<Registration>,
    stop_tx: oneshot::Sender<()>,
}

impl SwitchConnection {
    /// Dials the control database, establishes the port-table monitor
    /// (initial snapshot + modify + delete) and starts the dispatcher task.
    ///
    /// Fails fast on any connection or monitor error; callers retry with
    /// their own backoff.
    pub async fn connect(endpoint: impl AsRef<Path>) -> OvsdbResult<Self> {
        let (client, mut update_rx) = OvsdbClient::connect_unix(endpoint).await?;
        let initial = client.monitor(PORT_TABLE, &MONITOR_COLUMNS).await?;

        let mut state = SubscriptionState::new();
        state.apply_table_updates(&initial);

        let (reg_tx, mut reg_rx) = mpsc::channel::<Registration>(16);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = reg_rx.recv() => match msg {
                        Some(msg) => state.handle_registration(msg),
                        None => break,
                    },
                    updates = update_rx.recv() => match updates {
                        Some(updates) => state.apply_table_updates(&updates),
                        None => {
                            debug!("Monitor update stream ended; dispatcher exiting");
                            break;
                        }
                    },
                    _ = &mut stop_rx => break,
                }
            }
        });

        Ok(SwitchConnection {
            client,
            entity_table: ControlTable::new(ENTITY_TABLE),
            port_table: ControlTable::new(PORT_TABLE),
            controller_table: ControlTable::new(CONTROLLER_TABLE),
            reg_tx,
            stop_tx,
        })
    }

    /// Registers `tx` to receive updates for `name`.
    ///
    /// At most one registration may be active per port name; a second attempt
    /// for a still-active name fails with
    /// [`OvsdbError::DuplicateRegistration`]. If a row state for the name was
    /// buffered before registration, it is delivered immediately and the
    /// buffer entry cleared.
    pub async fn register_for_port_updates(
        &self,
        name: &str,
        tx: mpsc::Sender<PortUpdate>,
    ) -> OvsdbResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.reg_tx
            .send(Registration::Register {
                name: name.to_string(),
                tx,
                reply: reply_tx,
            })
            .await
            .map_err(|_| OvsdbError::ConnectionClosed)?;
        reply_rx.await.map_err(|_| OvsdbError::ConnectionClosed)?
    }

    /// Removes any active waiter for `name`. No-op when none is registered.
    pub async fn deregister_for_port_updates(&self, name: &str) -> OvsdbResult<()> {
        self.reg_tx
            .send(Registration::Deregister {
                name: name.to_string(),
            })
            .await
            .map_err(|_| OvsdbError::ConnectionClosed)
    }

    /// Closes the transport and stops the dispatcher. Consumes the
    /// connection, so it can only be called once.
    pub fn disconnect(self) {
        let _ = self.stop_tx.send(());
        // Dropping `self.client` here releases the last long-lived handle and
        // lets the I/O task shut the socket down.
    }
}

/// All mutable subscription state. Owned exclusively by the dispatcher task;
/// kept as a plain struct so the protocol is unit-testable without a socket.
pub(crate) struct SubscriptionState {
    waiters: HashMap<String, mpsc::Sender<PortUpdate>>,
    pending: HashMap<String, PortUpdate>,
    dropped_updates: u64,
}

impl SubscriptionState {
    pub(crate) fn new() -> Self {
        SubscriptionState {
            waiters: HashMap::new(),
            pending: HashMap::new(),
            dropped_updates: 0,
        }
    }

    /// Number of updates dropped on unready waiter channels.
    #[cfg(test)]
    pub(crate) fn dropped_updates(&self) -> u64 {
        self.dropped_updates
    }

    #[cfg(test)]
    pub(crate) fn has_pending(&self, name: &str) -> bool {
        self.pending.contains_key(name)
    }

    pub(crate) fn handle_registration(&mut self, msg: Registration) {
        match msg {
            Registration::Register { name, tx, reply } => {
                let _ = reply.send(self.register(name, tx));
            }
            Registration::Deregister { name } => self.deregister(&name),
        }
    }

    pub(crate) fn register(
        &mut self,
        name: String,
        tx: mpsc::Sender<PortUpdate>,
    ) -> OvsdbResult<()> {
        if self.waiters.contains_key(&name) {
            return Err(OvsdbError::DuplicateRegistration { port: name });
        }
        if let Some(buffered) = self.pending.remove(&name) {
            self.deliver(&name, &tx, buffered);
        }
        self.waiters.insert(name, tx);
        Ok(())
    }

    pub(crate) fn deregister(&mut self, name: &str) {
        self.waiters.remove(name);
    }

    /// A row for `name` changed (insert, initial snapshot, or modify).
    pub(crate) fn row_changed(&mut self, name: &str, update: PortUpdate) {
        if let Some(tx) = self.waiters.get(name) {
            let tx = tx.clone();
            self.deliver(name, &tx, update);
        } else {
            // Last write wins; size one per name.
            self.pending.insert(name.to_string(), update);
        }
    }

    /// The row for `name` disappeared: synthesize a withdrawn marker so a
    /// blocked waiter unblocks instead of hanging forever.
    pub(crate) fn row_deleted(&mut self, name: &str) {
        if let Some(tx) = self.waiters.remove(name) {
            self.deliver(name, &tx, PortUpdate::withdrawn());
        }
        self.pending.remove(name);
    }

    fn deliver(&mut self, name: &str, tx: &mpsc::Sender<PortUpdate>, update: PortUpdate) {
        if tx.try_send(update).is_err() {
            self.dropped_updates += 1;
            trace!(
                port = name,
                dropped = self.dropped_updates,
                "Waiter channel unready; dropped port update"
            );
        }
    }

    /// Walks a raw table-updates blob from the monitor and feeds each row
    /// event into the maps. Rows without any interesting column are ignored;
    /// malformed rows are reported and skipped.
    pub(crate) fn apply_table_updates(&mut self, updates: &Value) {
        let Some(tables) = updates.as_object() else {
            return;
        };
        for rows in tables.values() {
            let Some(rows) = rows.as_object() else {
                continue;
            };
            for row in rows.values() {
                let new = row.get("new").and_then(Value::as_object);
                let old = row.get("old").and_then(Value::as_object);
                match (new, old) {
                    (Some(new), _) => {
                        let Some(name) = new.get(COL_NAME).and_then(Value::as_str) else {
                            continue;
                        };
                        match parse_port_update(new) {
                            Ok(Some(update)) => self.row_changed(name, update),
                            Ok(None) => {}
                            Err(e) => warn!(port = name, "Discarding row update: {e}"),
                        }
                    }
                    (None, Some(old)) => {
                        if let Some(name) = old.get(COL_NAME).and_then(Value::as_str) {
                            self.row_deleted(name);
                        }
                    }
                    (None, None) => {}
                }
            }
        }
    }
}
