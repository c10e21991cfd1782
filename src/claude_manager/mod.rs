//! `ClaudeManager` — per-conversation assistant session lifecycle and event
//! normalization (spec.md §4.3).

mod process_runner;

pub use process_runner::{ClaudeCodeRunner, ProcessRunnerFactory};

use crate::errors::{PylonError, PylonResult};
use crate::identity::ConversationId;
use crate::message_store::MessageStore;
use crate::workspace_store::{ConversationStatus, WorkspaceStore};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{error, info, warn};

/// Auto-deny/auto-cancel timeout for a pending permission or question
/// (spec.md §4.3: "a bounded timeout (implementation-defined but required)").
pub const PENDING_TIMEOUT: Duration = Duration::from_secs(300);

// ─── Normalized event stream ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuestionOption {
    pub label: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Question {
    pub question: String,
    pub header: Option<String>,
    pub options: Vec<QuestionOption>,
    pub multi_select: Option<bool>,
}

/// The closed sum type of event kinds a session can emit. Unknown event
/// kinds coming from the assistant SDK are logged and dropped (spec.md §9).
#[derive(Debug, Clone)]
pub enum AssistantEvent {
    State(ConversationStatus),
    Text(String),
    TextComplete(String),
    ToolInfo {
        tool_use_id: String,
        tool_name: String,
        tool_input: serde_json::Value,
        parent_tool_use_id: Option<String>,
    },
    ToolProgress {
        tool_name: String,
        elapsed_seconds: u64,
    },
    ToolComplete {
        tool_use_id: String,
        tool_name: String,
        success: bool,
        output: serde_json::Value,
    },
    PermissionRequest {
        tool_use_id: String,
        tool_name: String,
        tool_input: serde_json::Value,
    },
    AskQuestion {
        tool_use_id: String,
        questions: Vec<Question>,
    },
    Result {
        subtype: String,
        duration_ms: u64,
        total_cost_usd: f64,
        num_turns: u32,
        usage: UsageStats,
    },
    Error {
        message: String,
    },
    Aborted {
        reason: String,
    },
    UsageUpdate(serde_json::Value),
    FileAttachment {
        file: serde_json::Value,
    },
}

pub type EventSender = mpsc::UnboundedSender<AssistantEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<AssistantEvent>;

/// Decision passed to [`Runner::respond_permission`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    Deny,
}

/// Common interface for the subprocess/SDK handle behind one conversation's
/// assistant session — grounded on the teacher's `session::runner::Runner`.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn send_message(&self, prompt: &str, attachments: Option<serde_json::Value>) -> PylonResult<()>;
    async fn stop(&self) -> PylonResult<()>;
    async fn respond_permission(&self, tool_use_id: &str, decision: PermissionDecision, message: Option<String>) -> PylonResult<()>;
    async fn respond_question(&self, tool_use_id: &str, answer: &str) -> PylonResult<()>;
    /// Hard-terminate, used by `newSession`.
    async fn kill(&self);
}

/// Constructs a fresh [`Runner`] + its event stream for one conversation.
/// A production factory spawns the real `claude` subprocess
/// ([`ClaudeCodeRunner`]); tests inject a scripted fake.
#[async_trait]
pub trait RunnerFactory: Send + Sync {
    async fn spawn(
        &self,
        conversation_id: ConversationId,
        working_dir: PathBuf,
        system_prompt: Option<String>,
        resume_session_id: Option<String>,
    ) -> PylonResult<(Arc<dyn Runner>, EventReceiver)>;
}

enum PendingInteraction {
    Permission(oneshot::Sender<()>),
    Question(oneshot::Sender<()>),
}

struct SessionState {
    runner: Arc<dyn Runner>,
    status: ConversationStatus,
    /// Cancels the auto-deny/auto-cancel timer when the interaction resolves
    /// (respond_*) before the bounded timeout elapses.
    pending: Option<PendingInteraction>,
}

pub struct ClaudeManager {
    sessions: RwLock<HashMap<ConversationId, Arc<Mutex<SessionState>>>>,
    workspace_store: Arc<WorkspaceStore>,
    message_store: Arc<MessageStore>,
    factory: Arc<dyn RunnerFactory>,
    /// Invoked every time a tool invocation begins/ends, wiring into
    /// BeaconServer without a back-reference (spec.md §9: "callback
    /// functions passed at construction").
    on_tool_start: Arc<dyn Fn(String, ConversationId, serde_json::Value) + Send + Sync>,
    on_tool_end: Arc<dyn Fn(String) + Send + Sync>,
}

impl ClaudeManager {
    pub fn new(
        workspace_store: Arc<WorkspaceStore>,
        message_store: Arc<MessageStore>,
        factory: Arc<dyn RunnerFactory>,
        on_tool_start: Arc<dyn Fn(String, ConversationId, serde_json::Value) + Send + Sync>,
        on_tool_end: Arc<dyn Fn(String) + Send + Sync>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            workspace_store,
            message_store,
            factory,
            on_tool_start,
            on_tool_end,
        }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Forwards a turn to an existing session, or starts a fresh one in the
    /// conversation's workingDir with its customSystemPrompt and linked
    /// documents context (spec.md §4.3).
    pub async fn send_message(
        &self,
        cid: ConversationId,
        working_dir: PathBuf,
        prompt: String,
        attachments: Option<serde_json::Value>,
        events_out: EventSender,
    ) -> PylonResult<()> {
        // The user message is appended before the assistant starts producing
        // output, regardless of whether a session already exists.
        self.message_store.add_user_message(cid, uuid::Uuid::new_v4().to_string(), Self::now_ms(), &prompt, attachments.clone());

        let handle = self.get_or_start_session(cid, working_dir, events_out).await?;
        let runner = {
            let state = handle.lock().await;
            state.runner.clone()
        };
        self.workspace_store.update_conversation_status(cid, ConversationStatus::Working);
        runner.send_message(&prompt, attachments).await
    }

    async fn get_or_start_session(
        &self,
        cid: ConversationId,
        working_dir: PathBuf,
        events_out: EventSender,
    ) -> PylonResult<Arc<Mutex<SessionState>>> {
        if let Some(handle) = self.sessions.read().await.get(&cid).cloned() {
            return Ok(handle);
        }

        let conversation = self
            .workspace_store
            .get_conversation(cid)
            .ok_or_else(|| PylonError::NotFound(format!("conversation {cid}")))?;

        let (runner, mut events_in) = self
            .factory
            .spawn(cid, working_dir, conversation.custom_system_prompt.clone(), conversation.assistant_session_id.clone())
            .await?;

        let handle = Arc::new(Mutex::new(SessionState {
            runner,
            status: ConversationStatus::Idle,
            pending: None,
        }));

        self.sessions.write().await.insert(cid, handle.clone());

        // Drain the runner's raw event stream, normalize, and fan out.
        let workspace_store = self.workspace_store.clone();
        let message_store = self.message_store.clone();
        let on_tool_start = self.on_tool_start.clone();
        let on_tool_end = self.on_tool_end.clone();
        let handle_for_task = handle.clone();

        tokio::spawn(async move {
            while let Some(event) = events_in.recv().await {
                handle_event(
                    cid,
                    event,
                    &workspace_store,
                    &message_store,
                    &on_tool_start,
                    &on_tool_end,
                    &handle_for_task,
                    &events_out,
                )
                .await;
            }
        });

        Ok(handle)
    }

    /// Cancels the in-flight turn; the session remains alive for further turns.
    pub async fn stop(&self, cid: ConversationId) -> PylonResult<()> {
        let handle = self
            .sessions
            .read()
            .await
            .get(&cid)
            .cloned()
            .ok_or_else(|| PylonError::NotFound(format!("conversation {cid}")))?;
        let runner = handle.lock().await.runner.clone();
        runner.stop().await
    }

    /// Hard-terminates any session, emits `aborted(session_ended)`, drops
    /// state; the next `sendMessage` starts fresh.
    pub async fn new_session(&self, cid: ConversationId, events_out: &EventSender) {
        if let Some(handle) = self.sessions.write().await.remove(&cid) {
            let runner = handle.lock().await.runner.clone();
            runner.kill().await;
        }
        self.workspace_store.update_conversation_status(cid, ConversationStatus::Idle);
        let id = uuid::Uuid::new_v4().to_string();
        self.message_store.add_aborted(cid, id, Self::now_ms(), "session_ended");
        let _ = events_out.send(AssistantEvent::Aborted { reason: "session_ended".into() });
        let _ = events_out.send(AssistantEvent::State(ConversationStatus::Idle));
    }

    pub async fn respond_permission(&self, cid: ConversationId, tool_use_id: &str, decision: PermissionDecision, message: Option<String>) -> PylonResult<()> {
        let handle = self
            .sessions
            .read()
            .await
            .get(&cid)
            .cloned()
            .ok_or_else(|| PylonError::NotFound(format!("conversation {cid}")))?;
        let (runner, resolved) = {
            let mut state = handle.lock().await;
            let resolved = match state.pending.take() {
                Some(PendingInteraction::Permission(tx)) => {
                    let _ = tx.send(());
                    true
                }
                other => {
                    state.pending = other;
                    false
                }
            };
            (state.runner.clone(), resolved)
        };
        if !resolved {
            warn!(conversation_id = cid, "respond_permission: no pending permission request");
        }
        runner.respond_permission(tool_use_id, decision, message).await
    }

    pub async fn respond_question(&self, cid: ConversationId, tool_use_id: &str, answer: &str) -> PylonResult<()> {
        let handle = self
            .sessions
            .read()
            .await
            .get(&cid)
            .cloned()
            .ok_or_else(|| PylonError::NotFound(format!("conversation {cid}")))?;
        let (runner, resolved) = {
            let mut state = handle.lock().await;
            let resolved = match state.pending.take() {
                Some(PendingInteraction::Question(tx)) => {
                    let _ = tx.send(());
                    true
                }
                other => {
                    state.pending = other;
                    false
                }
            };
            (state.runner.clone(), resolved)
        };
        if !resolved {
            warn!(conversation_id = cid, "respond_question: no pending question");
        }
        runner.respond_question(tool_use_id, answer).await
    }

    pub async fn cleanup(&self) {
        let handles: Vec<Arc<Mutex<SessionState>>> = self.sessions.write().await.drain().map(|(_, v)| v).collect();
        for handle in handles {
            let runner = handle.lock().await.runner.clone();
            runner.kill().await;
        }
        info!("ClaudeManager: all sessions terminated");
    }

    pub async fn active_session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_event(
    cid: ConversationId,
    event: AssistantEvent,
    workspace_store: &Arc<WorkspaceStore>,
    message_store: &Arc<MessageStore>,
    on_tool_start: &Arc<dyn Fn(String, ConversationId, serde_json::Value) + Send + Sync>,
    on_tool_end: &Arc<dyn Fn(String) + Send + Sync>,
    handle: &Arc<Mutex<SessionState>>,
    events_out: &EventSender,
) {
    let now = ClaudeManager::now_ms();
    let id = || uuid::Uuid::new_v4().to_string();

    match &event {
        AssistantEvent::State(status) => {
            workspace_store.update_conversation_status(cid, *status);
            handle.lock().await.status = *status;
        }
        AssistantEvent::TextComplete(text) => {
            message_store.add_assistant_text(cid, id(), now, text);
        }
        AssistantEvent::ToolInfo { tool_use_id, tool_name, tool_input, .. } => {
            message_store.add_tool_start(cid, id(), now, tool_use_id, tool_name, tool_input.clone());
            on_tool_start(tool_use_id.clone(), cid, tool_input.clone());
        }
        AssistantEvent::ToolComplete { tool_use_id, tool_name, success, output } => {
            message_store.add_tool_complete(cid, id(), now, tool_use_id, tool_name, *success, output.clone());
            on_tool_end(tool_use_id.clone());
        }
        AssistantEvent::PermissionRequest { .. } => {
            workspace_store.update_conversation_status(cid, ConversationStatus::Permission);
            arm_pending_timeout(cid, handle.clone(), events_out.clone(), true);
        }
        AssistantEvent::AskQuestion { .. } => {
            workspace_store.update_conversation_status(cid, ConversationStatus::Waiting);
            arm_pending_timeout(cid, handle.clone(), events_out.clone(), false);
        }
        AssistantEvent::Result { subtype, duration_ms, total_cost_usd, num_turns, usage } => {
            message_store.add_result(
                cid,
                id(),
                now,
                serde_json::json!({
                    "subtype": subtype,
                    "durationMs": duration_ms,
                    "totalCostUsd": total_cost_usd,
                    "numTurns": num_turns,
                    "usage": {
                        "inputTokens": usage.input_tokens,
                        "outputTokens": usage.output_tokens,
                        "cacheReadInputTokens": usage.cache_read_input_tokens,
                        "cacheCreationInputTokens": usage.cache_creation_input_tokens,
                    }
                }),
            );
            workspace_store.update_conversation_status(cid, ConversationStatus::Idle);
        }
        AssistantEvent::Error { message } => {
            message_store.add_error(cid, id(), now, message);
        }
        AssistantEvent::Aborted { reason } => {
            message_store.add_aborted(cid, id(), now, reason);
            workspace_store.update_conversation_status(cid, ConversationStatus::Idle);
        }
        AssistantEvent::FileAttachment { file } => {
            message_store.add_file_attachment(cid, id(), now, file.clone());
        }
        AssistantEvent::Text(_) | AssistantEvent::ToolProgress { .. } | AssistantEvent::UsageUpdate(_) => {
            // Deltas/progress/usage ticks have no standalone StoreMessage form.
        }
    }

    if events_out.send(event).is_err() {
        error!(conversation_id = cid, "event receiver dropped — router no longer listening");
    }
}

/// Starts the bounded auto-deny/auto-cancel timer for a permission request
/// or question. If nothing resolves it within [`PENDING_TIMEOUT`], emits
/// `error` and returns the session to idle (spec.md §4.3).
fn arm_pending_timeout(cid: ConversationId, handle: Arc<Mutex<SessionState>>, events_out: EventSender, is_permission: bool) {
    let (tx, rx) = oneshot::channel();
    tokio::spawn({
        let handle = handle.clone();
        async move {
            let mut state = handle.lock().await;
            state.pending = Some(if is_permission {
                PendingInteraction::Permission(tx)
            } else {
                PendingInteraction::Question(tx)
            });
        }
    });

    tokio::spawn(async move {
        tokio::select! {
            _ = rx => {}
            _ = tokio::time::sleep(PENDING_TIMEOUT) => {
                let mut state = handle.lock().await;
                state.pending = None;
                state.status = ConversationStatus::Idle;
                drop(state);
                let _ = events_out.send(AssistantEvent::Error {
                    message: format!(
                        "{} timed out after {}s — auto-{}",
                        if is_permission { "permission request" } else { "question" },
                        PENDING_TIMEOUT.as_secs(),
                        if is_permission { "denied" } else { "cancelled" },
                    ),
                });
                let _ = events_out.send(AssistantEvent::State(ConversationStatus::Idle));
            }
        }
    });
}
