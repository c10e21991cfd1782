//! The Pylon router — the apex component (spec.md §4.4). Owns the relay
//! connection, the viewer registry, and the inbound envelope dispatch table;
//! subscribes to every conversation's normalized `ClaudeManager` event
//! stream and fans it out per the multicast rules.

pub mod envelope;
mod relay;

use crate::adapters::{BlobAdapter, FsFolderAdapter, TaskAdapter};
use crate::claude_manager::{AssistantEvent, ClaudeManager, EventSender, PermissionDecision};
use crate::config::PylonConfig;
use crate::errors::PylonError;
use crate::identity::ConversationId;
use crate::message_store::MessageStore;
use crate::share::ShareStore;
use crate::workspace_store::{ConversationStatus, WorkspaceStore};
use envelope::{device_id_as_string, Envelope};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::warn;

/// Default request/reply timeout (spec.md §5).
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct PylonRouter {
    config: Arc<PylonConfig>,
    workspace_store: Arc<WorkspaceStore>,
    message_store: Arc<MessageStore>,
    claude_manager: Arc<ClaudeManager>,
    share_store: Arc<ShareStore>,
    blob_adapter: Arc<BlobAdapter>,
    /// `ConversationId -> set of viewing clientDeviceId`.
    viewers: RwLock<HashMap<ConversationId, HashSet<String>>>,
    pending_requests: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    outbound_tx: mpsc::UnboundedSender<Envelope>,
    conversation_channels: Mutex<HashMap<ConversationId, EventSender>>,
}

impl PylonRouter {
    pub fn new(
        config: Arc<PylonConfig>,
        workspace_store: Arc<WorkspaceStore>,
        message_store: Arc<MessageStore>,
        claude_manager: Arc<ClaudeManager>,
        share_store: Arc<ShareStore>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Envelope>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let blob_adapter = Arc::new(BlobAdapter::new(config.data_dir.clone()));
        let router = Arc::new(Self {
            config,
            workspace_store,
            message_store,
            claude_manager,
            share_store,
            blob_adapter,
            viewers: RwLock::new(HashMap::new()),
            pending_requests: Mutex::new(HashMap::new()),
            outbound_tx,
            conversation_channels: Mutex::new(HashMap::new()),
        });
        (router, outbound_rx)
    }

    /// Spawns the relay connection loop. Returns immediately; the loop runs
    /// for the lifetime of the process, reconnecting with backoff.
    pub fn spawn_relay(self: &Arc<Self>, outbound_rx: mpsc::UnboundedReceiver<Envelope>) {
        tokio::spawn(relay::run(self.clone(), self.config.relay_url.clone(), self.config.pylon_id, outbound_rx));
    }

    fn send(&self, envelope: Envelope) {
        if self.outbound_tx.send(envelope).is_err() {
            warn!("router: outbound channel closed — relay task gone");
        }
    }

    // ─── Startup / shutdown (spec.md §4.4) ────────────────────────────────

    /// Resets any conversation left mid-turn by a previous crash/restart,
    /// appending an `aborted(session_ended)` message to each.
    pub fn recover_on_startup(&self) {
        for cid in self.workspace_store.reset_active_conversations() {
            self.message_store.add_aborted(cid, uuid::Uuid::new_v4().to_string(), now_ms(), "session_ended");
        }
    }

    /// `ClaudeManager.cleanup -> MessageStore.flushAll -> (Beacon/Mcp closed
    /// by the caller) -> relay disconnect` — the relay task simply stops
    /// being polled once main drops this router's outbound sender.
    pub async fn shutdown(&self) {
        self.claude_manager.cleanup().await;
        let flushed = self.message_store.flush_all().await;
        tracing::info!(flushed, "router: message store flushed on shutdown");
    }

    // ─── Viewer registry ───────────────────────────────────────────────────

    async fn add_viewer(&self, cid: ConversationId, device_id: String) {
        self.viewers.write().await.entry(cid).or_default().insert(device_id);
    }

    async fn remove_viewer(&self, cid: ConversationId, device_id: &str) {
        if let Some(set) = self.viewers.write().await.get_mut(&cid) {
            set.remove(device_id);
        }
    }

    async fn remove_viewer_everywhere(&self, device_id: &str) {
        let mut viewers = self.viewers.write().await;
        for set in viewers.values_mut() {
            set.remove(device_id);
        }
    }

    async fn viewers_of(&self, cid: ConversationId) -> Vec<String> {
        self.viewers.read().await.get(&cid).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }

    // ─── ClaudeManager event fan-out (spec.md §4.4 outbound rules) ────────

    /// Lazily creates the per-conversation event channel and spawns its
    /// forwarding task the first time a conversation is addressed.
    async fn event_sender_for(self: &Arc<Self>, cid: ConversationId) -> EventSender {
        let mut channels = self.conversation_channels.lock().await;
        if let Some(tx) = channels.get(&cid) {
            return tx.clone();
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        channels.insert(cid, tx.clone());
        drop(channels);

        let router = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                router.forward_event(cid, event).await;
            }
        });
        tx
    }

    async fn forward_event(&self, cid: ConversationId, event: AssistantEvent) {
        match event {
            AssistantEvent::State(status) => {
                self.send(Envelope::broadcast_all(
                    "conversation_status",
                    json!({"conversationId": cid, "status": status_str(status)}),
                ));
            }
            other => {
                let payload = json!({"conversationId": cid, "event": event_to_json(&other)});
                for device_id in self.viewers_of(cid).await {
                    self.send(Envelope::to_device("claude_event", payload.clone(), &device_id));
                }
            }
        }
    }

    // ─── Inbound dispatch (spec.md §4.4 dispatch table) ───────────────────

    pub async fn dispatch_inbound(self: &Arc<Self>, envelope: Envelope) {
        let from_device = envelope.from.as_ref().map(|f| device_id_as_string(&f.device_id));
        let payload = envelope.payload.clone().unwrap_or(Value::Null);

        let reply = match envelope.kind.as_str() {
            "ping" => envelope.reply_to("pong", Value::Null),

            "workspace_list" => {
                let workspaces: Vec<Value> = self
                    .workspace_store
                    .get_all_workspaces()
                    .into_iter()
                    .map(|(w, active)| json!({"workspace": w, "isActive": active}))
                    .collect();
                envelope.reply_to("workspace_list_result", json!({"workspaces": workspaces}))
            }

            "workspace_create" => {
                let name = payload.get("name").and_then(Value::as_str).unwrap_or("Untitled").to_string();
                let working_dir = payload.get("workingDir").and_then(Value::as_str).map(std::path::PathBuf::from);
                let (workspace, _conv) = self.workspace_store.create_workspace(name, working_dir);
                envelope.reply_to("workspace_create_result", json!({"success": true, "workspace": workspace}))
            }

            "workspace_rename" => {
                let id = payload.get("workspaceId").and_then(Value::as_u64).unwrap_or(0) as u32;
                let name = payload.get("name").and_then(Value::as_str).unwrap_or("").to_string();
                let ok = self.workspace_store.rename_workspace(id, name);
                envelope.reply_to("workspace_rename_result", success_or_error(ok, "workspace not found or invalid name"))
            }

            "workspace_delete" => {
                let id = payload.get("workspaceId").and_then(Value::as_u64).unwrap_or(0) as u32;
                let ok = self.workspace_store.delete_workspace(id);
                envelope.reply_to("workspace_delete_result", success_or_error(ok, "workspace not found"))
            }

            "workspace_reorder" => {
                let order: Vec<u32> = payload.get("order").and_then(Value::as_array).map(|a| a.iter().filter_map(Value::as_u64).map(|v| v as u32).collect()).unwrap_or_default();
                let ok = self.workspace_store.reorder_workspaces(order);
                envelope.reply_to("workspace_reorder_result", success_or_error(ok, "order is not a valid permutation"))
            }

            "conversation_create" => {
                let workspace_id = payload.get("workspaceId").and_then(Value::as_u64).unwrap_or(0) as u32;
                let name = payload.get("name").and_then(Value::as_str).map(str::to_string);
                match self.workspace_store.create_conversation(workspace_id, name) {
                    Some(conv) => envelope.reply_to("conversation_create_result", json!({"success": true, "conversation": conv})),
                    None => envelope.reply_to("conversation_create_result", json!({"success": false, "error": "workspace not found"})),
                }
            }

            "conversation_rename" => {
                let cid = payload.get("conversationId").and_then(Value::as_u64).unwrap_or(0) as ConversationId;
                let name = payload.get("name").and_then(Value::as_str).unwrap_or("").to_string();
                let ok = self.workspace_store.rename_conversation(cid, name);
                envelope.reply_to("conversation_rename_result", success_or_error(ok, "conversation not found or invalid name"))
            }

            "conversation_delete" => {
                let cid = payload.get("conversationId").and_then(Value::as_u64).unwrap_or(0) as ConversationId;
                let events_out = self.event_sender_for(cid).await;
                self.claude_manager.new_session(cid, &events_out).await;
                let ok = self.workspace_store.delete_conversation(cid);
                envelope.reply_to("conversation_delete_result", success_or_error(ok, "conversation not found"))
            }

            "conversation_reorder" => {
                let workspace_id = payload.get("workspaceId").and_then(Value::as_u64).unwrap_or(0) as u32;
                let order: Vec<u32> = payload.get("order").and_then(Value::as_array).map(|a| a.iter().filter_map(Value::as_u64).map(|v| v as u32).collect()).unwrap_or_default();
                let ok = self.workspace_store.reorder_conversations(workspace_id, order);
                envelope.reply_to("conversation_reorder_result", success_or_error(ok, "order is not a valid permutation"))
            }

            "conversation_select" => {
                let cid = payload.get("conversationId").and_then(Value::as_u64).unwrap_or(0) as ConversationId;
                if let Some(device_id) = from_device.clone() {
                    self.add_viewer(cid, device_id).await;
                }
                self.workspace_store.set_active_conversation(cid);
                let messages = self.message_store.get_messages(cid);
                if let Some(status) = self.workspace_store.get_conversation(cid).map(|c| c.status) {
                    self.send(Envelope::broadcast_all("conversation_status", json!({"conversationId": cid, "status": status_str(status)})));
                }
                envelope.reply_to("history_result", json!({"conversationId": cid, "messages": messages}))
            }

            "conversation_deselect" => {
                let cid = payload.get("conversationId").and_then(Value::as_u64).unwrap_or(0) as ConversationId;
                if let Some(device_id) = from_device.clone() {
                    self.remove_viewer(cid, &device_id).await;
                }
                None
            }

            "user_message" => {
                let cid = payload.get("conversationId").and_then(Value::as_u64).unwrap_or(0) as ConversationId;
                let text = payload.get("text").and_then(Value::as_str).unwrap_or("").to_string();
                let attachments = payload.get("attachments").cloned();
                self.handle_user_message(cid, text, attachments).await;
                None
            }

            "stop" => {
                let cid = payload.get("conversationId").and_then(Value::as_u64).unwrap_or(0) as ConversationId;
                let _ = self.claude_manager.stop(cid).await;
                None
            }

            "new_session" => {
                let cid = payload.get("conversationId").and_then(Value::as_u64).unwrap_or(0) as ConversationId;
                let events_out = self.event_sender_for(cid).await;
                self.claude_manager.new_session(cid, &events_out).await;
                None
            }

            "permission_response" => {
                let cid = payload.get("conversationId").and_then(Value::as_u64).unwrap_or(0) as ConversationId;
                let tool_use_id = payload.get("toolUseId").and_then(Value::as_str).unwrap_or("").to_string();
                let allow = payload.get("allow").and_then(Value::as_bool).unwrap_or(false);
                let message = payload.get("message").and_then(Value::as_str).map(str::to_string);
                let decision = if allow { PermissionDecision::Allow } else { PermissionDecision::Deny };
                if let Err(e) = self.claude_manager.respond_permission(cid, &tool_use_id, decision, message).await {
                    warn!(conversation_id = cid, err = %e, "permission_response failed");
                }
                None
            }

            "question_response" => {
                let cid = payload.get("conversationId").and_then(Value::as_u64).unwrap_or(0) as ConversationId;
                let tool_use_id = payload.get("toolUseId").and_then(Value::as_str).unwrap_or("").to_string();
                let answer = payload.get("answer").and_then(Value::as_str).unwrap_or("").to_string();
                if let Err(e) = self.claude_manager.respond_question(cid, &tool_use_id, &answer).await {
                    warn!(conversation_id = cid, err = %e, "question_response failed");
                }
                None
            }

            "folder_list" | "folder_create" | "folder_rename" => Some(self.handle_folder(&envelope, &payload).await),

            "blob_start" | "blob_chunk" | "blob_end" => Some(self.handle_blob(&envelope, &payload).await),

            "task_list" | "task_get" | "task_update_status" => self.handle_task(&envelope, &payload).await,

            "client_disconnect" => {
                if let Some(device_id) = payload.get("deviceId").and_then(Value::as_str) {
                    self.remove_viewer_everywhere(device_id).await;
                }
                None
            }

            other => {
                warn!(kind = other, "router: unrecognized envelope type, dropped");
                None
            }
        };

        if let Some(reply) = reply {
            self.send(reply);
        }
    }

    async fn handle_user_message(self: &Arc<Self>, cid: ConversationId, text: String, attachments: Option<Value>) {
        let working_dir = match self.workspace_store.get_conversation(cid).and_then(|c| self.workspace_store.get_workspace(c.workspace_id)) {
            Some(w) => w.working_dir,
            None => {
                warn!(conversation_id = cid, "user_message: unknown conversation");
                return;
            }
        };
        let events_out = self.event_sender_for(cid).await;
        if let Err(e) = self.claude_manager.send_message(cid, working_dir, text, attachments, events_out).await {
            warn!(conversation_id = cid, err = %e, "user_message: send failed");
        }
    }

    async fn handle_folder(&self, envelope: &Envelope, payload: &Value) -> Envelope {
        let cid = payload.get("conversationId").and_then(Value::as_u64).unwrap_or(0) as ConversationId;
        let root = match self.workspace_store.get_conversation(cid).and_then(|c| self.workspace_store.get_workspace(c.workspace_id)) {
            Some(w) => w.working_dir,
            None => return envelope.reply_to(&format!("{}_result", envelope.kind), json!({"success": false, "error": "conversation not found"})).unwrap(),
        };
        let adapter = FsFolderAdapter::new(root);
        let path = payload.get("path").and_then(Value::as_str).unwrap_or(".");

        let result = match envelope.kind.as_str() {
            "folder_list" => adapter.list(path).await.map(|entries| json!({"success": true, "entries": entries})),
            "folder_create" => adapter.create(path).await.map(|_| json!({"success": true})),
            "folder_rename" => {
                let to = payload.get("to").and_then(Value::as_str).unwrap_or("");
                adapter.rename(path, to).await.map(|_| json!({"success": true}))
            }
            _ => unreachable!(),
        };
        let body = result.unwrap_or_else(error_body);
        envelope.reply_to(&format!("{}_result", envelope.kind), body).unwrap_or_else(|| Envelope::broadcast_all(&format!("{}_result", envelope.kind), body.clone()))
    }

    async fn handle_blob(&self, envelope: &Envelope, payload: &Value) -> Envelope {
        let blob_id = payload.get("blobId").and_then(Value::as_str).unwrap_or("").to_string();
        let result = match envelope.kind.as_str() {
            "blob_start" => {
                let filename = payload.get("filename").and_then(Value::as_str).unwrap_or("upload.bin");
                self.blob_adapter.start(&blob_id, filename).await.map(|_| json!({"success": true}))
            }
            "blob_chunk" => {
                let data = payload
                    .get("data")
                    .and_then(Value::as_str)
                    .map(|s| base64_decode(s))
                    .unwrap_or_default();
                self.blob_adapter.chunk(&blob_id, &data).await.map(|_| json!({"success": true}))
            }
            "blob_end" => self.blob_adapter.end(&blob_id).await.map(|path| json!({"success": true, "path": path.to_string_lossy()})),
            _ => unreachable!(),
        };
        let body = result.unwrap_or_else(error_body);
        envelope.reply_to(&format!("{}_result", envelope.kind), body.clone()).unwrap_or_else(|| Envelope::broadcast_all(&format!("{}_result", envelope.kind), body))
    }

    async fn handle_task(&self, envelope: &Envelope, payload: &Value) -> Option<Envelope> {
        let cid = payload.get("conversationId").and_then(Value::as_u64).unwrap_or(0) as ConversationId;
        let workspace_dir = self.workspace_store.get_conversation(cid).and_then(|c| self.workspace_store.get_workspace(c.workspace_id)).map(|w| w.working_dir)?;
        let adapter = TaskAdapter::new(workspace_dir);

        let body = match envelope.kind.as_str() {
            "task_list" => adapter.list().await.map(|tasks| json!({"success": true, "tasks": tasks})),
            "task_get" => {
                let id = payload.get("taskId").and_then(Value::as_str).unwrap_or("");
                adapter.get(id).await.map(|task| json!({"success": true, "task": task}))
            }
            "task_update_status" => {
                let id = payload.get("taskId").and_then(Value::as_str).unwrap_or("");
                let status = payload.get("status").and_then(Value::as_str).unwrap_or("");
                adapter.update_status(id, status).await.map(|_| json!({"success": true}))
            }
            _ => unreachable!(),
        }
        .unwrap_or_else(error_body);

        envelope.reply_to(&format!("{}_result", envelope.kind), body)
    }

    /// Registers a pending request awaiting a reply from another pylon
    /// (e.g. a cross-fabric `workspace_list`); resolved by
    /// [`PylonRouter::resolve_pending`] or timed out at `request_timeout_secs`.
    pub async fn send_request(self: &Arc<Self>, request_id: String, envelope: Envelope) -> Result<Value, PylonError> {
        let (tx, rx) = oneshot::channel();
        self.pending_requests.lock().await.insert(request_id.clone(), tx);
        self.send(envelope);

        let timeout = Duration::from_secs(self.config.request_timeout_secs);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(PylonError::Upstream("pending request sender dropped".into())),
            Err(_) => {
                self.pending_requests.lock().await.remove(&request_id);
                Err(PylonError::Timeout(format!("request {request_id} timed out after {}s", timeout.as_secs())))
            }
        }
    }

    pub async fn resolve_pending(&self, request_id: &str, value: Value) {
        if let Some(tx) = self.pending_requests.lock().await.remove(request_id) {
            let _ = tx.send(value);
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn success_or_error(ok: bool, error: &str) -> Value {
    if ok {
        json!({"success": true})
    } else {
        json!({"success": false, "error": error})
    }
}

fn error_body(e: PylonError) -> Value {
    json!({"success": false, "error": e.message()})
}

fn status_str(status: ConversationStatus) -> &'static str {
    match status {
        ConversationStatus::Idle => "idle",
        ConversationStatus::Working => "working",
        ConversationStatus::Waiting => "waiting",
        ConversationStatus::Permission => "permission",
    }
}

fn event_to_json(event: &AssistantEvent) -> Value {
    match event {
        AssistantEvent::Text(delta) => json!({"kind": "text", "delta": delta}),
        AssistantEvent::TextComplete(text) => json!({"kind": "textComplete", "text": text}),
        AssistantEvent::ToolInfo { tool_use_id, tool_name, tool_input, parent_tool_use_id } => {
            json!({"kind": "toolInfo", "toolUseId": tool_use_id, "toolName": tool_name, "toolInput": tool_input, "parentToolUseId": parent_tool_use_id})
        }
        AssistantEvent::ToolProgress { tool_name, elapsed_seconds } => json!({"kind": "toolProgress", "toolName": tool_name, "elapsedSeconds": elapsed_seconds}),
        AssistantEvent::ToolComplete { tool_use_id, tool_name, success, output } => {
            json!({"kind": "toolComplete", "toolUseId": tool_use_id, "toolName": tool_name, "success": success, "output": output})
        }
        AssistantEvent::PermissionRequest { tool_use_id, tool_name, tool_input } => {
            json!({"kind": "permissionRequest", "toolUseId": tool_use_id, "toolName": tool_name, "toolInput": tool_input})
        }
        AssistantEvent::AskQuestion { tool_use_id, questions } => json!({"kind": "askQuestion", "toolUseId": tool_use_id, "questions": questions}),
        AssistantEvent::Result { subtype, duration_ms, total_cost_usd, num_turns, usage } => {
            json!({"kind": "result", "subtype": subtype, "durationMs": duration_ms, "totalCostUsd": total_cost_usd, "numTurns": num_turns, "usage": {
                "inputTokens": usage.input_tokens, "outputTokens": usage.output_tokens,
                "cacheReadInputTokens": usage.cache_read_input_tokens, "cacheCreationInputTokens": usage.cache_creation_input_tokens,
            }})
        }
        AssistantEvent::Error { message } => json!({"kind": "error", "message": message}),
        AssistantEvent::Aborted { reason } => json!({"kind": "aborted", "reason": reason}),
        AssistantEvent::UsageUpdate(value) => json!({"kind": "usageUpdate", "usage": value}),
        AssistantEvent::FileAttachment { file } => json!({"kind": "fileAttachment", "file": file}),
        AssistantEvent::State(_) => unreachable!("State is routed separately"),
    }
}

/// Minimal base64 decode for `blob_chunk` payloads (standard alphabet, `=`
/// padding tolerated or absent) — avoids pulling in a dedicated crate for a
/// single fixed-alphabet decode.
fn base64_decode(input: &str) -> Vec<u8> {
    fn value(c: u8) -> Option<u8> {
        match c {
            b'A'..=b'Z' => Some(c - b'A'),
            b'a'..=b'z' => Some(c - b'a' + 26),
            b'0'..=b'9' => Some(c - b'0' + 52),
            b'+' => Some(62),
            b'/' => Some(63),
            _ => None,
        }
    }
    let bytes: Vec<u8> = input.bytes().filter_map(value).collect();
    let mut out = Vec::with_capacity(bytes.len() * 3 / 4);
    for chunk in bytes.chunks(4) {
        let b0 = chunk[0];
        let b1 = *chunk.get(1).unwrap_or(&0);
        let b2 = *chunk.get(2).unwrap_or(&0);
        let b3 = *chunk.get(3).unwrap_or(&0);
        out.push((b0 << 2) | (b1 >> 4));
        if chunk.len() > 2 {
            out.push((b1 << 4) | (b2 >> 2));
        }
        if chunk.len() > 3 {
            out.push((b2 << 6) | b3);
        }
    }
    out
}
