//! `ClaudeCodeRunner` — the production [`Runner`]: one `claude` CLI
//! subprocess per conversation, speaking line-delimited `stream-json` on
//! stdin/stdout. Grounded on the teacher's `session::claude::ClaudeCodeRunner`;
//! the multi-account/license/rate-limit plumbing around it has no
//! counterpart here and was not carried over.

use super::{AssistantEvent, EventReceiver, EventSender, PermissionDecision, Question, QuestionOption, Runner, RunnerFactory, UsageStats};
use crate::errors::{PylonError, PylonResult};
use crate::identity::ConversationId;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, warn};

/// Grace period between SIGTERM and SIGKILL on `stop()`.
const STOP_GRACE: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClaudeEvent {
    Assistant { message: AssistantMessage },
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String, input: Value },
    #[serde(rename = "tool_result")]
    ToolResult { tool_use_id: String, content: Value, is_error: Option<bool> },
    Result {
        subtype: String,
        #[serde(default)]
        duration_ms: u64,
        #[serde(default)]
        total_cost_usd: f64,
        #[serde(default)]
        num_turns: u32,
        usage: Option<ClaudeUsage>,
        session_id: Option<String>,
    },
    System { subtype: Option<String>, session_id: Option<String> },
    /// Bidirectional control channel the CLI uses for permission prompts and
    /// clarifying questions (`AskUserQuestion`-style tool calls).
    ControlRequest { request_id: String, request: ControlRequestBody },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "subtype", rename_all = "snake_case")]
enum ControlRequestBody {
    CanUseTool {
        tool_name: String,
        input: Value,
        tool_use_id: Option<String>,
    },
    AskQuestion {
        tool_use_id: String,
        questions: Vec<QuestionPayload>,
    },
}

#[derive(Deserialize, Debug)]
struct QuestionPayload {
    question: String,
    header: Option<String>,
    #[serde(default)]
    options: Vec<String>,
    multi_select: Option<bool>,
}

#[derive(Deserialize, Debug)]
struct ClaudeUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
}

#[derive(Deserialize, Debug)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

/// One `claude` subprocess per conversation. `send_message` spawns the
/// process on the first turn and pipes subsequent turns into its stdin as
/// `stream-json` user messages; claude's own `--resume` session id is
/// captured from the first `system` event and reused on restart.
pub struct ClaudeCodeRunner {
    conversation_id: ConversationId,
    working_dir: PathBuf,
    system_prompt: Option<String>,
    claude_session_id: Arc<RwLock<Option<String>>>,
    child_pid: Arc<AtomicU32>,
    current_child: Arc<Mutex<Option<Child>>>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    cancelled: Arc<AtomicBool>,
    events_out: EventSender,
}

impl ClaudeCodeRunner {
    fn spawn_process(&self) -> PylonResult<(Child, tokio::process::ChildStdout, tokio::process::ChildStderr, ChildStdin)> {
        let mut cmd = Command::new("claude");
        cmd.args(["--output-format", "stream-json", "--input-format", "stream-json", "--verbose"]);
        if let Some(ref prompt) = self.system_prompt {
            cmd.args(["--append-system-prompt", prompt]);
        }
        if let Some(sid) = self.claude_session_id.try_read().ok().and_then(|g| g.clone()) {
            cmd.args(["--resume", &sid]);
        }

        let mut child = cmd
            .current_dir(&self.working_dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .stdin(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| PylonError::Upstream(format!("failed to spawn `claude` — is it installed and on PATH? ({e})")))?;

        let stdout = child.stdout.take().ok_or_else(|| PylonError::Fatal("claude: no stdout".into()))?;
        let stderr = child.stderr.take().ok_or_else(|| PylonError::Fatal("claude: no stderr".into()))?;
        let stdin = child.stdin.take().ok_or_else(|| PylonError::Fatal("claude: no stdin".into()))?;
        Ok((child, stdout, stderr, stdin))
    }

    async fn ensure_started(&self) -> PylonResult<()> {
        if self.current_child.lock().await.is_some() {
            return Ok(());
        }

        let (mut child, stdout, stderr, stdin) = self.spawn_process()?;
        if let Some(pid) = child.id() {
            self.child_pid.store(pid, Ordering::Relaxed);
        }
        *self.current_child.lock().await = Some(child);
        *self.stdin.lock().await = Some(stdin);

        let cid = self.conversation_id;
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(conversation_id = cid, "claude stderr: {line}");
            }
        });

        tokio::spawn(run_event_loop(
            stdout,
            self.conversation_id,
            self.claude_session_id.clone(),
            self.current_child.clone(),
            self.child_pid.clone(),
            self.cancelled.clone(),
            self.events_out.clone(),
        ));

        Ok(())
    }

    async fn write_stdin_line(&self, payload: Value) -> PylonResult<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| PylonError::InvalidInput("no active claude session".into()))?;
        let mut line = serde_json::to_vec(&payload)?;
        line.push(b'\n');
        stdin.write_all(&line).await.map_err(|e| PylonError::Upstream(format!("write to claude stdin failed: {e}")))
    }
}

async fn run_event_loop(
    stdout: tokio::process::ChildStdout,
    cid: ConversationId,
    claude_session_id: Arc<RwLock<Option<String>>>,
    current_child: Arc<Mutex<Option<Child>>>,
    child_pid: Arc<AtomicU32>,
    cancelled: Arc<AtomicBool>,
    events_out: EventSender,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut current_text = String::new();
    let mut received_result = false;

    let _ = events_out.send(AssistantEvent::State(crate::workspace_store::ConversationStatus::Working));

    loop {
        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) => break,
            Err(e) => {
                warn!(conversation_id = cid, err = %e, "claude stdout read error");
                break;
            }
        };

        let event: ClaudeEvent = match serde_json::from_str(&line) {
            Ok(e) => e,
            Err(_) => {
                warn!(conversation_id = cid, line = %line, "unparseable claude event, dropped");
                continue;
            }
        };

        match event {
            ClaudeEvent::System { session_id, .. } => {
                if let Some(sid) = session_id {
                    *claude_session_id.write().await = Some(sid);
                }
            }
            ClaudeEvent::Assistant { message } => {
                let text = message
                    .content
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => Some(text.as_str()),
                        ContentBlock::Other => None,
                    })
                    .collect::<Vec<_>>()
                    .join("");
                if !text.is_empty() {
                    current_text.push_str(&text);
                    let _ = events_out.send(AssistantEvent::Text(text));
                }
            }
            ClaudeEvent::ToolUse { id, name, input } => {
                if !current_text.is_empty() {
                    let _ = events_out.send(AssistantEvent::TextComplete(std::mem::take(&mut current_text)));
                }
                let _ = events_out.send(AssistantEvent::ToolInfo {
                    tool_use_id: id,
                    tool_name: name,
                    tool_input: input,
                    parent_tool_use_id: None,
                });
            }
            ClaudeEvent::ToolResult { tool_use_id, content, is_error } => {
                let _ = events_out.send(AssistantEvent::ToolComplete {
                    tool_use_id,
                    tool_name: String::new(),
                    success: !is_error.unwrap_or(false),
                    output: content,
                });
            }
            ClaudeEvent::ControlRequest { request, .. } => match request {
                ControlRequestBody::CanUseTool { tool_name, input, tool_use_id } => {
                    let _ = events_out.send(AssistantEvent::PermissionRequest {
                        tool_use_id: tool_use_id.unwrap_or_default(),
                        tool_name,
                        tool_input: input,
                    });
                }
                ControlRequestBody::AskQuestion { tool_use_id, questions } => {
                    let questions = questions
                        .into_iter()
                        .map(|q| Question {
                            question: q.question,
                            header: q.header,
                            options: q.options.into_iter().map(|label| QuestionOption { label }).collect(),
                            multi_select: q.multi_select,
                        })
                        .collect();
                    let _ = events_out.send(AssistantEvent::AskQuestion { tool_use_id, questions });
                }
            },
            ClaudeEvent::Result { subtype, duration_ms, total_cost_usd, num_turns, usage, session_id } => {
                if let Some(sid) = session_id {
                    *claude_session_id.write().await = Some(sid);
                }
                if !current_text.is_empty() {
                    let _ = events_out.send(AssistantEvent::TextComplete(std::mem::take(&mut current_text)));
                }
                let usage = usage.unwrap_or(ClaudeUsage {
                    input_tokens: 0,
                    output_tokens: 0,
                    cache_read_input_tokens: 0,
                    cache_creation_input_tokens: 0,
                });
                let _ = events_out.send(AssistantEvent::Result {
                    subtype,
                    duration_ms,
                    total_cost_usd,
                    num_turns,
                    usage: UsageStats {
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                        cache_read_input_tokens: usage.cache_read_input_tokens,
                        cache_creation_input_tokens: usage.cache_creation_input_tokens,
                    },
                });
                let _ = events_out.send(AssistantEvent::State(crate::workspace_store::ConversationStatus::Idle));
                received_result = true;
            }
            ClaudeEvent::Unknown => {}
        }
    }

    if let Some(mut child) = current_child.lock().await.take() {
        let _ = child.wait().await;
    }
    child_pid.store(0, Ordering::Relaxed);

    // The process exited without a terminal Result — crashed, or killed
    // externally rather than through `stop()`.
    if !received_result && !cancelled.load(Ordering::Acquire) {
        let _ = events_out.send(AssistantEvent::Error { message: "claude process exited unexpectedly".into() });
        let _ = events_out.send(AssistantEvent::Aborted { reason: "crashed".into() });
        let _ = events_out.send(AssistantEvent::State(crate::workspace_store::ConversationStatus::Idle));
    }
}

#[async_trait]
impl Runner for ClaudeCodeRunner {
    async fn send_message(&self, prompt: &str, attachments: Option<Value>) -> PylonResult<()> {
        self.cancelled.store(false, Ordering::Release);
        self.ensure_started().await?;
        let payload = json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": prompt,
            },
            "attachments": attachments,
        });
        self.write_stdin_line(payload).await
    }

    async fn stop(&self) -> PylonResult<()> {
        self.cancelled.store(true, Ordering::Release);
        let pid = self.child_pid.load(Ordering::Relaxed);
        if pid == 0 {
            return Ok(());
        }

        #[cfg(unix)]
        {
            // SIGTERM first so `claude` can flush its own state; escalate to
            // SIGKILL after a grace period if it hasn't exited.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        let mut guard = self.current_child.lock().await;
        if let Some(child) = guard.as_mut() {
            match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
            }
        }
        *guard = None;
        drop(guard);
        self.child_pid.store(0, Ordering::Relaxed);
        Ok(())
    }

    async fn respond_permission(&self, tool_use_id: &str, decision: PermissionDecision, message: Option<String>) -> PylonResult<()> {
        if tool_use_id.is_empty() {
            return Err(PylonError::InvalidInput("empty toolUseId".into()));
        }
        let behavior = match decision {
            PermissionDecision::Allow => "allow",
            PermissionDecision::Deny => "deny",
        };
        let payload = json!({
            "type": "control_response",
            "tool_use_id": tool_use_id,
            "response": { "behavior": behavior, "message": message },
        });
        self.write_stdin_line(payload).await
    }

    async fn respond_question(&self, tool_use_id: &str, answer: &str) -> PylonResult<()> {
        if tool_use_id.is_empty() {
            return Err(PylonError::InvalidInput("empty toolUseId".into()));
        }
        let payload = json!({
            "type": "control_response",
            "tool_use_id": tool_use_id,
            "response": { "answer": answer },
        });
        self.write_stdin_line(payload).await
    }

    async fn kill(&self) {
        self.cancelled.store(true, Ordering::Release);
        let pid = self.child_pid.load(Ordering::Relaxed);
        #[cfg(unix)]
        if pid != 0 {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
        }
        if let Some(mut child) = self.current_child.lock().await.take() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
        self.child_pid.store(0, Ordering::Relaxed);
    }
}

/// Production [`RunnerFactory`]: one [`ClaudeCodeRunner`] per call.
pub struct ProcessRunnerFactory;

#[async_trait]
impl RunnerFactory for ProcessRunnerFactory {
    async fn spawn(
        &self,
        conversation_id: ConversationId,
        working_dir: PathBuf,
        system_prompt: Option<String>,
        resume_session_id: Option<String>,
    ) -> PylonResult<(Arc<dyn Runner>, EventReceiver)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let runner = Arc::new(ClaudeCodeRunner {
            conversation_id,
            working_dir,
            system_prompt,
            claude_session_id: Arc::new(RwLock::new(resume_session_id)),
            child_pid: Arc::new(AtomicU32::new(0)),
            current_child: Arc::new(Mutex::new(None)),
            stdin: Arc::new(Mutex::new(None)),
            cancelled: Arc::new(AtomicBool::new(false)),
            events_out: tx,
        });
        Ok((runner, rx))
    }
}
