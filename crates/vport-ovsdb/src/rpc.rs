//! JSON-RPC transport to the OVSDB server.
//!
//! OVSDB speaks JSON-RPC 1.0 over a stream socket with no framing beyond the
//! JSON values themselves, so the reader incrementally parses concatenated
//! values out of a growing buffer. A single I/O task owns the socket; callers
//! submit requests over a channel and receive their responses on oneshots,
//! while server-initiated `update` notifications are forwarded to a separate
//! channel for the monitor dispatcher. Server `echo` keepalives are answered
//! in-line.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::{OvsdbError, OvsdbResult};

/// Depth of the request and notification channels.
const CHANNEL_DEPTH: usize = 64;

/// A pending outbound call.
struct Call {
    id: u64,
    method: String,
    params: Value,
    reply: oneshot::Sender<OvsdbResult<Value>>,
}

/// Handle to the OVSDB JSON-RPC connection.
///
/// Cloning is cheap; all clones share the single underlying socket. Dropping
/// the last clone stops the I/O task and closes the socket.
#[derive(Clone)]
pub struct OvsdbClient {
    call_tx: mpsc::Sender<Call>,
    next_id: Arc<AtomicU64>,
}

impl OvsdbClient {
    /// Dials the OVSDB server over a Unix domain socket.
    ///
    /// Returns the client handle plus the receiver on which `update`
    /// notifications (the raw table-updates JSON) are delivered.
    pub async fn connect_unix(
        endpoint: impl AsRef<Path>,
    ) -> OvsdbResult<(Self, mpsc::Receiver<Value>)> {
        let endpoint = endpoint.as_ref();
        let stream = UnixStream::connect(endpoint)
            .await
            .map_err(|source| OvsdbError::Connect {
                endpoint: endpoint.display().to_string(),
                source,
            })?;

        let (call_tx, call_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (update_tx, update_rx) = mpsc::channel(CHANNEL_DEPTH);

        tokio::spawn(io_loop(stream, call_rx, update_tx));

        let client = OvsdbClient {
            call_tx,
            next_id: Arc::new(AtomicU64::new(0)),
        };
        Ok((client, update_rx))
    }

    /// Issues a raw JSON-RPC call and waits for the response.
    pub async fn call(&self, method: &str, params: Value) -> OvsdbResult<Value> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let call = Call {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: method.to_string(),
            params,
            reply: reply_tx,
        };
        self.call_tx
            .send(call)
            .await
            .map_err(|_| OvsdbError::ConnectionClosed)?;
        reply_rx.await.map_err(|_| OvsdbError::ConnectionClosed)?
    }

    /// Runs a `transact` against the database and checks every per-operation
    /// result for an `error` member.
    pub async fn transact(&self, ops: Vec<Value>) -> OvsdbResult<Vec<Value>> {
        let mut params = vec![Value::String(crate::DATABASE.to_string())];
        params.extend(ops);
        let result = self.call("transact", Value::Array(params)).await?;

        let results = match result {
            Value::Array(items) => items,
            other => {
                return Err(OvsdbError::Rpc {
                    method: "transact".to_string(),
                    message: format!("unexpected transact result: {other}"),
                })
            }
        };
        for item in &results {
            if let Some(err) = item.get("error") {
                if !err.is_null() {
                    let details = item
                        .get("details")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    return Err(OvsdbError::Rpc {
                        method: "transact".to_string(),
                        message: format!("{err} {details}"),
                    });
                }
            }
        }
        Ok(results)
    }

    /// Establishes a monitor on `table` for the given columns, selecting the
    /// initial snapshot plus modify and delete events. Returns the initial
    /// table-updates blob.
    pub async fn monitor(&self, table: &str, columns: &[&str]) -> OvsdbResult<Value> {
        let request = json!({
            table: {
                "columns": columns,
                "select": { "initial": true, "modify": true, "delete": true },
            }
        });
        self.call("monitor", json!([crate::DATABASE, Value::Null, request]))
            .await
    }
}

/// Single task owning the socket: writes submitted calls, reads concatenated
/// JSON values, routes responses to their oneshots and notifications to the
/// update channel.
async fn io_loop(stream: UnixStream, mut call_rx: mpsc::Receiver<Call>, update_tx: mpsc::Sender<Value>) {
    let (mut reader, mut writer) = stream.into_split();
    let mut pending: HashMap<u64, (String, oneshot::Sender<OvsdbResult<Value>>)> = HashMap::new();
    let mut buf: Vec<u8> = Vec::with_capacity(4096);

    loop {
        tokio::select! {
            call = call_rx.recv() => {
                let Some(call) = call else {
                    debug!("All OVSDB client handles dropped; closing connection");
                    break;
                };
                let msg = json!({ "method": call.method, "params": call.params, "id": call.id });
                let bytes = match serde_json::to_vec(&msg) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = call.reply.send(Err(OvsdbError::Rpc {
                            method: call.method,
                            message: e.to_string(),
                        }));
                        continue;
                    }
                };
                if let Err(e) = writer.write_all(&bytes).await {
                    let _ = call.reply.send(Err(OvsdbError::Rpc {
                        method: call.method,
                        message: e.to_string(),
                    }));
                    break;
                }
                pending.insert(call.id, (call.method, call.reply));
            }
            read = reader.read_buf(&mut buf) => {
                match read {
                    Ok(0) => {
                        warn!("OVSDB server closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("OVSDB socket read failed: {e}");
                        break;
                    }
                }
                let values = match drain_values(&mut buf) {
                    Ok(values) => values,
                    Err(e) => {
                        warn!("Unparseable data from OVSDB server: {e}");
                        break;
                    }
                };
                for value in values {
                    dispatch_incoming(value, &mut pending, &update_tx, &mut writer).await;
                }
            }
        }
    }

    // Unblock any caller still waiting on a response.
    for (_, (_, reply)) in pending.drain() {
        let _ = reply.send(Err(OvsdbError::ConnectionClosed));
    }
}

/// Splits as many complete JSON values as possible off the front of `buf`.
fn drain_values(buf: &mut Vec<u8>) -> serde_json::Result<Vec<Value>> {
    let mut values = Vec::new();
    loop {
        let mut iter = serde_json::Deserializer::from_slice(buf).into_iter::<Value>();
        match iter.next() {
            Some(Ok(value)) => {
                let consumed = iter.byte_offset();
                buf.drain(..consumed);
                values.push(value);
            }
            Some(Err(e)) if e.is_eof() => break,
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }
    Ok(values)
}

/// Routes one incoming JSON value: a response to a pending call, an `update`
/// notification, or a server `echo` request that must be answered.
async fn dispatch_incoming(
    value: Value,
    pending: &mut HashMap<u64, (String, oneshot::Sender<OvsdbResult<Value>>)>,
    update_tx: &mpsc::Sender<Value>,
    writer: &mut (impl AsyncWriteExt + Unpin),
) {
    let method = value.get("method").and_then(Value::as_str);
    match method {
        Some("update") => {
            let updates = value
                .get("params")
                .and_then(|p| p.get(1))
                .cloned()
                .unwrap_or(Value::Null);
            if update_tx.send(updates).await.is_err() {
                trace!("Monitor updates receiver gone; dropping notification");
            }
        }
        Some("echo") => {
            let reply = json!({
                "result": value.get("params").cloned().unwrap_or(Value::Null),
                "error": Value::Null,
                "id": value.get("id").cloned().unwrap_or(Value::Null),
            });
            if let Ok(bytes) = serde_json::to_vec(&reply) {
                if let Err(e) = writer.write_all(&bytes).await {
                    warn!("Failed to answer OVSDB echo: {e}");
                }
            }
        }
        Some(other) => {
            debug!("Ignoring unsupported OVSDB method '{other}'");
        }
        None => {
            let Some(id) = value.get("id").and_then(Value::as_u64) else {
                debug!("Response without id from OVSDB server");
                return;
            };
            let Some((method, reply)) = pending.remove(&id) else {
                debug!("Response for unknown call id {id}");
                return;
            };
            let error = value.get("error").cloned().unwrap_or(Value::Null);
            let outcome = if error.is_null() {
                Ok(value.get("result").cloned().unwrap_or(Value::Null))
            } else {
                Err(OvsdbError::Rpc {
                    method,
                    message: error.to_string(),
                })
            };
            let _ = reply.send(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_concatenated_values() {
        let mut buf = br#"{"a":1}{"b":2} {"c":3}"#.to_vec();
        let values = drain_values(&mut buf).unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values[1], json!({"b": 2}));
        assert!(buf.is_empty());
    }

    #[test]
    fn keeps_incomplete_tail_in_buffer() {
        let mut buf = br#"{"a":1}{"b":"#.to_vec();
        let values = drain_values(&mut buf).unwrap();
        assert_eq!(values, vec![json!({"a": 1})]);
        assert_eq!(buf, br#"{"b":"#.to_vec());
    }

    #[test]
    fn rejects_garbage() {
        let mut buf = b"not json at all".to_vec();
        assert!(drain_values(&mut buf).is_err());
    }

    #[tokio::test]
    async fn echo_is_answered_inline() {
        let (tx, _rx) = mpsc::channel(1);
        let mut pending = HashMap::new();
        let mut out: Vec<u8> = Vec::new();
        let echo = json!({ "method": "echo", "params": ["ping"], "id": 7 });
        dispatch_incoming(echo, &mut pending, &tx, &mut out).await;
        let reply: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(reply["result"], json!(["ping"]));
        assert_eq!(reply["id"], json!(7));
    }

    #[tokio::test]
    async fn response_error_member_becomes_rpc_error() {
        let (tx, _rx) = mpsc::channel(1);
        let (reply_tx, reply_rx) = oneshot::channel();
        let mut pending = HashMap::new();
        pending.insert(3, ("transact".to_string(), reply_tx));
        let mut out: Vec<u8> = Vec::new();
        let resp = json!({ "id": 3, "result": Value::Null, "error": "syntax error" });
        dispatch_incoming(resp, &mut pending, &tx, &mut out).await;
        let outcome = reply_rx.await.unwrap();
        assert!(matches!(outcome, Err(OvsdbError::Rpc { .. })));
    }
}
