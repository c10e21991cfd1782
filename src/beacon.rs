//! `BeaconServer` / `BeaconClient` — the loopback lookup service tool
//! processes use to discover which conversation spawned them (spec.md §4.5).
//! Grounded on the teacher's `ipc::run` TCP accept loop, adapted from
//! WebSocket+JSON-RPC framing to line-delimited JSON.

use crate::errors::{PylonError, PylonResult};
use crate::identity::ConversationId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);
const MAX_ENTRIES: usize = 10_000;
const CLIENT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
const CLIENT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

struct Entry {
    conversation_id: ConversationId,
    raw: Value,
    last_touched: Instant,
}

struct Table {
    entries: HashMap<String, Entry>,
    /// Insertion/touch order, oldest first — drives LRU eviction once
    /// `MAX_ENTRIES` is exceeded.
    order: Vec<String>,
}

impl Table {
    fn touch(&mut self, tool_use_id: &str) {
        self.order.retain(|id| id != tool_use_id);
        self.order.push(tool_use_id.to_string());
    }

    fn evict_if_needed(&mut self) {
        while self.entries.len() > MAX_ENTRIES {
            if self.order.is_empty() {
                break;
            }
            let oldest = self.order.remove(0);
            self.entries.remove(&oldest);
        }
    }

    fn evict_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_touched) > DEFAULT_TTL)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.entries.remove(&id);
            self.order.retain(|o| o != &id);
        }
    }
}

pub struct BeaconServer {
    table: Arc<Mutex<Table>>,
    listener_addr: Mutex<Option<SocketAddr>>,
    shutdown: Arc<tokio::sync::Notify>,
    /// Advertised in `lookup` responses so a tool process knows where to
    /// dial the MCP bridge (spec.md §4.5).
    mcp_port: u16,
}

impl BeaconServer {
    pub fn new(mcp_port: u16) -> Arc<Self> {
        Arc::new(Self {
            table: Arc::new(Mutex::new(Table {
                entries: HashMap::new(),
                order: Vec::new(),
            })),
            listener_addr: Mutex::new(None),
            shutdown: Arc::new(tokio::sync::Notify::new()),
            mcp_port,
        })
    }

    /// Called the moment a tool invocation begins.
    pub async fn register_tool(&self, tool_use_id: String, conversation_id: ConversationId, raw: Value) {
        let mut table = self.table.lock().await;
        table.entries.insert(
            tool_use_id.clone(),
            Entry {
                conversation_id,
                raw,
                last_touched: Instant::now(),
            },
        );
        table.touch(&tool_use_id);
        table.evict_if_needed();
    }

    /// Called when the invocation completes or is aborted.
    pub async fn unregister(&self, tool_use_id: &str) {
        let mut table = self.table.lock().await;
        table.entries.remove(tool_use_id);
        table.order.retain(|id| id != tool_use_id);
    }

    pub async fn listen(self: &Arc<Self>, port: u16) -> PylonResult<()> {
        let addr = format!("127.0.0.1:{port}");
        let listener = TcpListener::bind(&addr).await.map_err(|e| PylonError::Fatal(format!("beacon: bind {addr} failed: {e}")))?;
        *self.listener_addr.lock().await = listener.local_addr().ok();
        info!(addr = %addr, "beacon server listening");

        let table_for_sweep = self.table.clone();
        let shutdown_for_sweep = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(DEFAULT_TTL / 2) => {
                        table_for_sweep.lock().await.evict_expired();
                    }
                    _ = shutdown_for_sweep.notified() => break,
                }
            }
        });

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.shutdown.notified() => break,
                    conn = listener.accept() => {
                        match conn {
                            Ok((stream, peer)) => {
                                let table = this.table.clone();
                                let mcp_port = this.mcp_port;
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, table, mcp_port).await {
                                        debug!(peer = %peer, err = %e, "beacon connection error");
                                    }
                                });
                            }
                            Err(e) => warn!(err = %e, "beacon accept error"),
                        }
                    }
                }
            }
        });

        Ok(())
    }

    pub async fn close(&self) {
        self.shutdown.notify_waiters();
    }

    /// In-process shortcut for `PylonMcpServer`'s `lookup_and_*` actions —
    /// same table `lookup` serves over TCP, called directly since both
    /// servers live in the same Pylon (spec.md §9: callback wiring, not a
    /// back-reference).
    pub async fn lookup_conversation(&self, tool_use_id: &str) -> Option<(ConversationId, Value)> {
        let mut table = self.table.lock().await;
        let entry = table.entries.get(tool_use_id)?;
        let result = (entry.conversation_id, entry.raw.clone());
        table.touch(tool_use_id);
        Some(result)
    }
}

async fn handle_connection(stream: TcpStream, table: Arc<Mutex<Table>>, mcp_port: u16) -> PylonResult<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Value>(&line) {
            Ok(request) => handle_request(&table, request, mcp_port).await,
            Err(_) => json!({"success": false, "error": "Invalid JSON format"}),
        };
        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        writer.write_all(&out).await?;
    }
    Ok(())
}

async fn handle_request(table: &Arc<Mutex<Table>>, request: Value, mcp_port: u16) -> Value {
    match request.get("action").and_then(Value::as_str) {
        Some("lookup") => {
            let tool_use_id = request.get("toolUseId").and_then(Value::as_str).unwrap_or("");
            if tool_use_id.is_empty() {
                return json!({"success": false, "error": "empty toolUseId"});
            }
            let mut table = table.lock().await;
            match table.entries.get(tool_use_id) {
                Some(entry) => {
                    let result = json!({
                        "success": true,
                        "conversationId": entry.conversation_id,
                        "mcpHost": "127.0.0.1",
                        "mcpPort": mcp_port,
                        "raw": entry.raw,
                    });
                    table.touch(tool_use_id);
                    result
                }
                None => json!({"success": false, "error": "unknown toolUseId"}),
            }
        }
        Some("register") => {
            // A Pylon identifying itself — no per-connection state to keep
            // beyond acknowledging receipt; real routing happens over the relay.
            json!({"success": true})
        }
        Some("query") => {
            // Legacy adapter path: this crate has no ClaudeBeaconAdapter to
            // delegate to, so report unsupported rather than guess.
            json!({"success": false, "error": "query is not supported by this beacon"})
        }
        _ => json!({"success": false, "error": "unknown action"}),
    }
}

/// Embedded in tool processes: one connection, one lookup, a bounded timeout.
pub struct BeaconClient {
    port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BeaconLookup {
    pub conversation_id: ConversationId,
    pub mcp_host: String,
    pub mcp_port: u16,
    pub raw: Value,
}

impl BeaconClient {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn lookup(&self, tool_use_id: &str) -> PylonResult<BeaconLookup> {
        if tool_use_id.is_empty() {
            return Err(PylonError::InvalidInput("empty toolUseId".into()));
        }
        let addr = format!("127.0.0.1:{}", self.port);
        let stream = tokio::time::timeout(CLIENT_CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| PylonError::Timeout(format!("beacon connect to {addr} timed out")))?
            .map_err(|e| PylonError::Upstream(format!("beacon connect failed: {e}")))?;

        let (reader, mut writer) = stream.into_split();
        let request = json!({"action": "lookup", "toolUseId": tool_use_id});
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');
        writer.write_all(&line).await?;

        let mut lines = BufReader::new(reader).lines();
        let response = tokio::time::timeout(CLIENT_LOOKUP_TIMEOUT, lines.next_line())
            .await
            .map_err(|_| PylonError::Timeout("beacon lookup timed out".into()))??
            .ok_or_else(|| PylonError::Upstream("beacon closed connection without a response".into()))?;

        let value: Value = serde_json::from_str(&response)?;
        if value.get("success").and_then(Value::as_bool) != Some(true) {
            let message = value.get("error").and_then(Value::as_str).unwrap_or("lookup failed").to_string();
            return Err(PylonError::NotFound(message));
        }
        let conversation_id = value.get("conversationId").and_then(Value::as_u64).ok_or_else(|| PylonError::Upstream("missing conversationId".into()))? as ConversationId;
        let mcp_host = value.get("mcpHost").and_then(Value::as_str).unwrap_or("127.0.0.1").to_string();
        let mcp_port = value.get("mcpPort").and_then(Value::as_u64).unwrap_or(0) as u16;
        let raw = value.get("raw").cloned().unwrap_or(Value::Null);
        Ok(BeaconLookup { conversation_id, mcp_host, mcp_port, raw })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookup_round_trips_through_real_socket() {
        let server = BeaconServer::new(9880);
        server.listen(0).await.unwrap();
        // `listen(0)` binds an ephemeral port; re-read it for the client.
        let port = server.listener_addr.lock().await.unwrap().port();

        server.register_tool("tool-1".into(), 42, json!({"hint": "grep"})).await;

        let client = BeaconClient::new(port);
        let looked_up = client.lookup("tool-1").await.unwrap();
        assert_eq!(looked_up.conversation_id, 42);
        assert_eq!(looked_up.mcp_port, 9880);

        server.unregister("tool-1").await;
        assert!(client.lookup("tool-1").await.is_err());
    }

    #[tokio::test]
    async fn client_rejects_empty_tool_use_id_without_connecting() {
        let client = BeaconClient::new(65535);
        assert!(client.lookup("").await.is_err());
    }

    #[tokio::test]
    async fn eviction_keeps_table_under_capacity() {
        let server = BeaconServer::new(9880);
        for i in 0..5 {
            server.register_tool(format!("t{i}"), i as ConversationId, Value::Null).await;
        }
        let mut table = server.table.lock().await;
        for _ in 0..2 {
            table.evict_if_needed();
        }
        // All five fit comfortably under MAX_ENTRIES; nothing should be evicted.
        assert_eq!(table.entries.len(), 5);
    }
}
