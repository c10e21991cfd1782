//! `PylonMcpServer` / `PylonClient` — the loopback TCP service tool
//! processes use to mutate a conversation's linked documents, send files,
//! manage sibling conversations, and trigger deploys (spec.md §4.6).
//! Same wire discipline as [`crate::beacon`] but with a richer vocabulary and
//! a per-connection JSON-completeness buffer instead of line framing.

use crate::beacon::BeaconServer;
use crate::claude_manager::{ClaudeManager, EventSender};
use crate::config::PylonConfig;
use crate::errors::{PylonError, PylonResult};
use crate::identity::ConversationId;
use crate::share::ShareStore;
use crate::workspace_store::WorkspaceStore;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

const CLIENT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CLIENT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const DEPLOY_TIMEOUT: Duration = Duration::from_secs(3 * 60);
const DEPLOY_TAIL_LINES: usize = 200;
const READ_CHUNK: usize = 8192;

pub struct PylonMcpServer {
    config: Arc<PylonConfig>,
    workspace_store: Arc<WorkspaceStore>,
    message_store: Arc<crate::message_store::MessageStore>,
    claude_manager: Arc<ClaudeManager>,
    share_store: Arc<ShareStore>,
    beacon: Arc<BeaconServer>,
    shutdown: Arc<tokio::sync::Notify>,
    listener_addr: tokio::sync::Mutex<Option<std::net::SocketAddr>>,
}

impl PylonMcpServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<PylonConfig>,
        workspace_store: Arc<WorkspaceStore>,
        message_store: Arc<crate::message_store::MessageStore>,
        claude_manager: Arc<ClaudeManager>,
        share_store: Arc<ShareStore>,
        beacon: Arc<BeaconServer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            workspace_store,
            message_store,
            claude_manager,
            share_store,
            beacon,
            shutdown: Arc::new(tokio::sync::Notify::new()),
            listener_addr: tokio::sync::Mutex::new(None),
        })
    }

    pub async fn listen(self: &Arc<Self>, port: u16) -> PylonResult<()> {
        let addr = format!("127.0.0.1:{port}");
        let listener = TcpListener::bind(&addr).await.map_err(|e| PylonError::Fatal(format!("mcp: bind {addr} failed: {e}")))?;
        *self.listener_addr.lock().await = listener.local_addr().ok();
        info!(addr = %addr, "pylon-mcp server listening");

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.shutdown.notified() => break,
                    conn = listener.accept() => {
                        match conn {
                            Ok((stream, peer)) => {
                                let this = this.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = this.handle_connection(stream).await {
                                        debug!(peer = %peer, err = %e, "mcp connection error");
                                    }
                                });
                            }
                            Err(e) => warn!(err = %e, "mcp accept error"),
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

    async fn handle_connection(self: &Arc<Self>, mut stream: TcpStream) -> PylonResult<()> {
        let mut buf = Vec::new();
        let mut read_buf = [0u8; READ_CHUNK];

        loop {
            // JSON-completeness heuristic (spec.md §4.6): count unescaped
            // brace/bracket pairs; keep reading while closers < openers.
            while let Some(end) = complete_json_end(&buf) {
                let (object_bytes, rest) = buf.split_at(end);
                let response = match serde_json::from_slice::<Value>(object_bytes) {
                    Ok(request) => self.handle_request(request).await,
                    Err(_) => json!({"success": false, "error": "Invalid JSON format"}),
                };
                let mut out = serde_json::to_vec(&response).map_err(PylonError::from)?;
                out.push(b'\n');
                stream.write_all(&out).await?;
                buf = rest.to_vec();
            }

            let n = stream.read(&mut read_buf).await?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&read_buf[..n]);
        }
        Ok(())
    }

    async fn handle_request(self: &Arc<Self>, request: Value) -> Value {
        let mut action = request.get("action").and_then(Value::as_str).unwrap_or("").to_string();

        let cid = if let Some(lookup_action) = action.strip_prefix("lookup_and_") {
            let tool_use_id = request.get("toolUseId").and_then(Value::as_str).unwrap_or("");
            match self.beacon.lookup_conversation(tool_use_id).await {
                Some((cid, _raw)) => {
                    action = lookup_action.to_string();
                    Some(cid)
                }
                None => return json!({"success": false, "error": "unknown toolUseId"}),
            }
        } else {
            request.get("conversationId").and_then(Value::as_u64).map(|v| v as ConversationId)
        };

        match action.as_str() {
            "link" => self.action_link(cid, &request).await,
            "unlink" => self.action_unlink(cid, &request).await,
            "list" => self.action_list(cid).await,
            "send_file" => self.action_send_file(cid, &request).await,
            "get_status" => self.action_get_status(cid).await,
            "create_conversation" => self.action_create_conversation(cid, &request).await,
            "delete_conversation" => self.action_delete_conversation(cid, &request).await,
            "rename_conversation" => self.action_rename_conversation(cid, &request).await,
            "set_system_prompt" => self.action_set_system_prompt(cid, &request).await,
            "deploy" => self.action_deploy(&request).await,
            "share_create" => self.action_share_create(cid).await,
            "share_validate" => self.action_share_validate(&request),
            "share_delete" => self.action_share_delete(&request),
            "share_history" => self.action_share_history(&request),
            "" => json!({"success": false, "error": "missing action"}),
            other => json!({"success": false, "error": format!("unknown action: {other}")}),
        }
    }

    fn require_cid(cid: Option<ConversationId>) -> PylonResult<ConversationId> {
        cid.ok_or_else(|| PylonError::InvalidInput("missing conversationId or toolUseId".into()))
    }

    async fn action_link(&self, cid: Option<ConversationId>, request: &Value) -> Value {
        let result = (|| {
            let cid = Self::require_cid(cid)?;
            let path = request.get("path").and_then(Value::as_str).ok_or_else(|| PylonError::InvalidInput("missing path".into()))?;
            self.workspace_store.link_document(cid, path)?;
            Ok::<_, PylonError>(cid)
        })();
        match result {
            Ok(cid) => json!({"success": true, "docs": docs_json(&self.workspace_store, cid)}),
            Err(e) => json!({"success": false, "error": e.message()}),
        }
    }

    async fn action_unlink(&self, cid: Option<ConversationId>, request: &Value) -> Value {
        let result = (|| {
            let cid = Self::require_cid(cid)?;
            let path = request.get("path").and_then(Value::as_str).ok_or_else(|| PylonError::InvalidInput("missing path".into()))?;
            self.workspace_store.unlink_document(cid, path)?;
            Ok::<_, PylonError>(cid)
        })();
        match result {
            Ok(cid) => json!({"success": true, "docs": docs_json(&self.workspace_store, cid)}),
            Err(e) => json!({"success": false, "error": e.message()}),
        }
    }

    async fn action_list(&self, cid: Option<ConversationId>) -> Value {
        match Self::require_cid(cid) {
            Ok(cid) => json!({"success": true, "docs": docs_json(&self.workspace_store, cid)}),
            Err(e) => json!({"success": false, "error": e.message()}),
        }
    }

    async fn action_send_file(&self, cid: Option<ConversationId>, request: &Value) -> Value {
        let result: PylonResult<Value> = async {
            let cid = Self::require_cid(cid)?;
            let rel_path = request.get("path").and_then(Value::as_str).ok_or_else(|| PylonError::InvalidInput("missing path".into()))?;
            let working_dir = self.workspace_store.get_conversation(cid).and_then(|c| self.workspace_store.get_workspace(c.workspace_id)).ok_or_else(|| PylonError::NotFound(format!("conversation {cid}")))?.working_dir;
            let full_path = working_dir.join(rel_path);
            let metadata = tokio::fs::metadata(&full_path).await.map_err(|_| PylonError::NotFound(format!("file {rel_path}")))?;
            let filename = full_path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            Ok(json!({
                "success": true,
                "filename": filename,
                "mimeType": mime_for(&full_path),
                "size": metadata.len(),
                "path": full_path.to_string_lossy(),
                "description": format!("{filename} ({} bytes)", metadata.len()),
            }))
        }
        .await;
        result.unwrap_or_else(error_body)
    }

    async fn action_get_status(&self, cid: Option<ConversationId>) -> Value {
        let result: PylonResult<Value> = async {
            let cid = Self::require_cid(cid)?;
            let conv = self.workspace_store.get_conversation(cid).ok_or_else(|| PylonError::NotFound(format!("conversation {cid}")))?;
            let workspace = self.workspace_store.get_workspace(conv.workspace_id);
            Ok(json!({
                "success": true,
                "environment": self.config.environment.as_str(),
                "version": self.config.version,
                "workspace": workspace.map(|w| w.name),
                "conversationId": cid,
                "linkedDocuments": conv.linked_documents,
            }))
        }
        .await;
        result.unwrap_or_else(error_body)
    }

    async fn action_create_conversation(&self, cid: Option<ConversationId>, request: &Value) -> Value {
        let result: PylonResult<Value> = async {
            let cid = Self::require_cid(cid)?;
            let workspace_id = self.workspace_store.get_conversation(cid).ok_or_else(|| PylonError::NotFound(format!("conversation {cid}")))?.workspace_id;
            let name = request.get("name").and_then(Value::as_str).map(str::to_string);
            let conv = self.workspace_store.create_conversation(workspace_id, name).ok_or_else(|| PylonError::NotFound(format!("workspace {workspace_id}")))?;

            let mut link_errors = Vec::new();
            if let Some(files) = request.get("files").and_then(Value::as_array) {
                for file in files {
                    if let Some(path) = file.as_str() {
                        if let Err(e) = self.workspace_store.link_document(conv.conversation_id, path) {
                            link_errors.push(format!("{path}: {e}"));
                        }
                    }
                }
            }

            Ok(json!({
                "success": true,
                "conversation": conv,
                "linkErrors": link_errors,
            }))
        }
        .await;
        result.unwrap_or_else(error_body)
    }

    async fn action_delete_conversation(&self, cid: Option<ConversationId>, request: &Value) -> Value {
        let result: PylonResult<()> = async {
            let own = Self::require_cid(cid)?;
            let target = resolve_conversation_target(&self.workspace_store, own, request)?;
            if target == own {
                return Err(PylonError::Conflict("cannot delete the calling conversation".into()));
            }
            let (events_out, _rx): (EventSender, _) = tokio::sync::mpsc::unbounded_channel();
            self.claude_manager.new_session(target, &events_out).await;
            if !self.workspace_store.delete_conversation(target) {
                return Err(PylonError::NotFound(format!("conversation {target}")));
            }
            Ok(())
        }
        .await;
        match result {
            Ok(()) => json!({"success": true}),
            Err(e) => json!({"success": false, "error": e.message()}),
        }
    }

    async fn action_rename_conversation(&self, cid: Option<ConversationId>, request: &Value) -> Value {
        let result: PylonResult<()> = (|| {
            let own = Self::require_cid(cid)?;
            let target = resolve_conversation_target(&self.workspace_store, own, request)?;
            let name = request.get("name").and_then(Value::as_str).unwrap_or("").trim().to_string();
            if name.is_empty() {
                return Err(PylonError::InvalidInput("name must not be empty".into()));
            }
            if !self.workspace_store.rename_conversation(target, name) {
                return Err(PylonError::NotFound(format!("conversation {target}")));
            }
            Ok(())
        })();
        match result {
            Ok(()) => json!({"success": true}),
            Err(e) => json!({"success": false, "error": e.message()}),
        }
    }

    async fn action_set_system_prompt(&self, cid: Option<ConversationId>, request: &Value) -> Value {
        let result: PylonResult<()> = async {
            let cid = Self::require_cid(cid)?;
            let content = request.get("content").and_then(Value::as_str).unwrap_or("");
            let prompt = if content.trim().is_empty() { None } else { Some(content.to_string()) };
            if !self.workspace_store.set_custom_system_prompt(cid, prompt) {
                return Err(PylonError::NotFound(format!("conversation {cid}")));
            }
            let (events_out, _rx): (EventSender, _) = tokio::sync::mpsc::unbounded_channel();
            self.claude_manager.new_session(cid, &events_out).await;
            Ok(())
        }
        .await;
        match result {
            Ok(()) => json!({"success": true, "newSession": true}),
            Err(e) => json!({"success": false, "error": e.message()}),
        }
    }

    async fn action_deploy(&self, request: &Value) -> Value {
        let target = request.get("target").and_then(Value::as_str).unwrap_or("");
        let current_env = self.config.environment.as_str();

        if target != "stage" && target != "release" && target != "promote" {
            return json!({"success": false, "error": format!("invalid deploy target: {target}")});
        }
        if target == current_env {
            return json!({"success": false, "error": format!("cannot deploy to own environment ({current_env})")});
        }
        if target == "promote" && current_env != "stage" {
            return json!({"success": false, "error": "promote is only valid from stage"});
        }

        match run_deploy_script(&self.config.data_dir, target).await {
            Ok((success, tail)) => json!({"success": success, "output": tail}),
            Err(e) => json!({"success": false, "error": e.message()}),
        }
    }

    async fn action_share_create(&self, cid: Option<ConversationId>) -> Value {
        match Self::require_cid(cid) {
            Ok(cid) => {
                let info = self.share_store.create(cid);
                json!({"success": true, "shareId": info.share_id, "url": ShareStore::url_for(&info.share_id)})
            }
            Err(e) => json!({"success": false, "error": e.message()}),
        }
    }

    fn action_share_validate(&self, request: &Value) -> Value {
        let share_id = request.get("shareId").and_then(Value::as_str).unwrap_or("");
        match self.share_store.validate(share_id) {
            Ok(info) => {
                let messages = self.message_store.get_messages(info.conversation_id);
                json!({"success": true, "conversationId": info.conversation_id, "createdAt": info.created_at, "messages": messages})
            }
            Err(e) => json!({"success": false, "error": e.message()}),
        }
    }

    fn action_share_delete(&self, request: &Value) -> Value {
        let share_id = request.get("shareId").and_then(Value::as_str).unwrap_or("");
        match self.share_store.delete(share_id) {
            Ok(()) => json!({"success": true}),
            Err(e) => json!({"success": false, "error": e.message()}),
        }
    }

    fn action_share_history(&self, request: &Value) -> Value {
        let share_id = request.get("shareId").and_then(Value::as_str).unwrap_or("");
        match self.share_store.history(share_id) {
            Ok(info) => json!({"success": true, "accessCount": info.access_count, "createdAt": info.created_at}),
            Err(e) => json!({"success": false, "error": e.message()}),
        }
    }
}

fn error_body(e: PylonError) -> Value {
    json!({"success": false, "error": e.message()})
}

fn docs_json(workspace_store: &Arc<WorkspaceStore>, cid: ConversationId) -> Value {
    json!(workspace_store.get_linked_documents(cid))
}

/// Resolves a `delete_conversation`/`rename_conversation` target: by packed
/// id if `conversationId` is present, else by case-insensitive name within
/// the caller's own workspace.
fn resolve_conversation_target(workspace_store: &Arc<WorkspaceStore>, own: ConversationId, request: &Value) -> PylonResult<ConversationId> {
    if let Some(id) = request.get("conversationId").and_then(Value::as_u64) {
        return Ok(id as ConversationId);
    }
    let name = request.get("name").and_then(Value::as_str).ok_or_else(|| PylonError::InvalidInput("missing conversationId or name".into()))?;
    let workspace_id = workspace_store.get_conversation(own).ok_or_else(|| PylonError::NotFound(format!("conversation {own}")))?.workspace_id;
    let workspace = workspace_store.get_workspace(workspace_id).ok_or_else(|| PylonError::NotFound(format!("workspace {workspace_id}")))?;
    let needle = name.to_lowercase();
    workspace
        .conversations
        .values()
        .find(|c| c.name.to_lowercase() == needle)
        .map(|c| c.conversation_id)
        .ok_or_else(|| PylonError::NotFound(format!("conversation named {name}")))
}

/// Counts unescaped brace/bracket pairs to find the byte offset one past a
/// complete top-level JSON value, if the buffer holds one (spec.md §4.6).
fn complete_json_end(buf: &[u8]) -> Option<usize> {
    let mut depth: i64 = 0;
    let mut started = false;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in buf.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => {
                depth += 1;
                started = true;
            }
            b'}' | b']' => {
                depth -= 1;
                if started && depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Fixed extension → MIME map for `send_file` (spec.md §6). Unknown
/// extensions fall back to `application/octet-stream`.
fn mime_for(path: &Path) -> &'static str {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("").to_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "bmp" => "image/bmp",
        "ico" => "image/x-icon",
        "md" | "markdown" => "text/markdown",
        "txt" | "log" => "text/plain",
        "csv" => "text/csv",
        "json" => "application/json",
        "xml" => "text/xml",
        "yaml" | "yml" => "text/yaml",
        "html" => "text/html",
        "css" => "text/css",
        "js" => "text/javascript",
        "ts" => "text/typescript",
        "dart" => "text/x-dart",
        "py" => "text/x-python",
        "java" => "text/x-java",
        "c" | "h" => "text/x-c",
        "cpp" => "text/x-c++",
        "go" => "text/x-go",
        "rs" => "text/x-rust",
        "sh" => "text/x-shellscript",
        "bat" => "text/x-batch",
        "ps1" => "text/x-powershell",
        _ => "application/octet-stream",
    }
}

/// Spawns the fixed per-target deploy script, piping stdout/stderr
/// concurrently and bounding the whole operation at [`DEPLOY_TIMEOUT`].
/// Grounded on the teacher's `update::spawn` subprocess/timeout idiom. The
/// full output is persisted to a per-target log file; only the tail is
/// returned to the caller.
async fn run_deploy_script(data_dir: &Path, target: &str) -> PylonResult<(bool, String)> {
    let script = data_dir.join("scripts").join(format!("deploy-{target}.sh"));
    if !script.exists() {
        return Err(PylonError::InvalidInput(format!("no deploy script for target {target} at {}", script.display())));
    }

    let mut child = tokio::process::Command::new(&script)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| PylonError::Upstream(format!("failed to spawn deploy script: {e}")))?;

    let stdout = child.stdout.take().ok_or_else(|| PylonError::Fatal("deploy: no stdout".into()))?;
    let stderr = child.stderr.take().ok_or_else(|| PylonError::Fatal("deploy: no stderr".into()))?;

    let run = async move {
        use tokio::io::{AsyncBufReadExt, BufReader};
        let mut out_lines = Vec::new();
        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();
        loop {
            tokio::select! {
                line = stdout_reader.next_line() => match line {
                    Ok(Some(l)) => out_lines.push(l),
                    Ok(None) => break,
                    Err(_) => break,
                },
                line = stderr_reader.next_line() => match line {
                    Ok(Some(l)) => out_lines.push(l),
                    Ok(None) => {},
                    Err(_) => {},
                },
            }
        }
        let status = child.wait().await;
        (status, out_lines)
    };

    let (status, out_lines) = tokio::time::timeout(DEPLOY_TIMEOUT, run)
        .await
        .map_err(|_| PylonError::Timeout(format!("deploy to {target} exceeded {}s", DEPLOY_TIMEOUT.as_secs())))?;

    let full_output = out_lines.join("\n");
    let log_path = data_dir.join("logs").join(format!("deploy-{target}.log"));
    if let Some(parent) = log_path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    let _ = tokio::fs::write(&log_path, &full_output).await;

    let tail: String = out_lines.iter().rev().take(DEPLOY_TAIL_LINES).rev().cloned().collect::<Vec<_>>().join("\n");
    let success = matches!(status, Ok(s) if s.success());
    Ok((success, tail))
}

/// Embedded in tool processes: one connection, one request/response,
/// bounded timeouts (spec.md §4.6, §5).
pub struct PylonClient {
    port: u16,
}

impl PylonClient {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn request(&self, payload: Value) -> PylonResult<Value> {
        let addr = format!("127.0.0.1:{}", self.port);
        let mut stream = tokio::time::timeout(CLIENT_CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| PylonError::Timeout(format!("mcp connect to {addr} timed out")))?
            .map_err(|e| PylonError::Upstream(format!("mcp connect failed: {e}")))?;

        let mut line = serde_json::to_vec(&payload)?;
        line.push(b'\n');
        stream.write_all(&line).await?;

        let mut buf = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        let response = tokio::time::timeout(CLIENT_REQUEST_TIMEOUT, async {
            loop {
                if let Some(end) = complete_json_end(&buf) {
                    return serde_json::from_slice::<Value>(&buf[..end]).map_err(PylonError::from);
                }
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    return Err(PylonError::Upstream("mcp closed connection without a response".into()));
                }
                buf.extend_from_slice(&chunk[..n]);
            }
        })
        .await
        .map_err(|_| PylonError::Timeout("mcp request timed out".into()))??;

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_json_end_waits_for_closing_brace() {
        assert_eq!(complete_json_end(b"{\"a\":1"), None);
        assert_eq!(complete_json_end(b"{\"a\":1}"), Some(7));
    }

    #[test]
    fn complete_json_end_ignores_braces_inside_strings() {
        let buf = br#"{"a":"}"}"#;
        assert_eq!(complete_json_end(buf), Some(buf.len()));
    }

    #[test]
    fn complete_json_end_handles_trailing_bytes_after_object() {
        let buf = br#"{"a":1}{"b":2}"#;
        assert_eq!(complete_json_end(buf), Some(7));
    }

    #[test]
    fn mime_for_known_and_unknown_extensions() {
        assert_eq!(mime_for(Path::new("a.rs")), "text/x-rust");
        assert_eq!(mime_for(Path::new("a.PNG")), "image/png");
        assert_eq!(mime_for(Path::new("a.unknownext")), "application/octet-stream");
    }
}
