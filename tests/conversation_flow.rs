//! End-to-end coverage of the router + `ClaudeManager` wiring against a
//! scripted fake assistant session, exercising several of the end-to-end
//! scenarios and testable properties this crate is built to satisfy: the
//! first-run workspace/conversation flow, a full user-turn round trip,
//! viewer fan-out vs. non-viewer isolation, and restart semantics.

#![cfg(feature = "test-util")]

use async_trait::async_trait;
use pylon::claude_manager::{AssistantEvent, ClaudeManager, EventReceiver, EventSender, PermissionDecision, Runner, RunnerFactory, UsageStats};
use pylon::workspace_store::ConversationStatus;
use pylon::config::PylonConfig;
use pylon::errors::PylonResult;
use pylon::identity::ConversationId;
use pylon::message_store::MessageStore;
use pylon::persistence::{MemoryPersistence, Persistence};
use pylon::router::envelope::{Envelope, EnvelopeFrom};
use pylon::router::PylonRouter;
use pylon::share::ShareStore;
use pylon::workspace_store::WorkspaceStore;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Immediately echoes the prompt back as a complete assistant turn — no
/// real subprocess, no delay.
struct FakeRunner {
    events_out: EventSender,
}

#[async_trait]
impl Runner for FakeRunner {
    async fn send_message(&self, prompt: &str, _attachments: Option<Value>) -> PylonResult<()> {
        // Mirrors the real `ClaudeCodeRunner`'s event loop: a State(Working)
        // bracket around the turn, then the text/result payload.
        let _ = self.events_out.send(AssistantEvent::State(ConversationStatus::Working));
        let _ = self.events_out.send(AssistantEvent::TextComplete(format!("echo: {prompt}")));
        let _ = self.events_out.send(AssistantEvent::Result {
            subtype: "success".into(),
            duration_ms: 1,
            total_cost_usd: 0.0,
            num_turns: 1,
            usage: UsageStats {
                input_tokens: 1,
                output_tokens: 1,
                cache_read_input_tokens: 0,
                cache_creation_input_tokens: 0,
            },
        });
        let _ = self.events_out.send(AssistantEvent::State(ConversationStatus::Idle));
        Ok(())
    }

    async fn stop(&self) -> PylonResult<()> {
        Ok(())
    }

    async fn respond_permission(&self, _tool_use_id: &str, _decision: PermissionDecision, _message: Option<String>) -> PylonResult<()> {
        Ok(())
    }

    async fn respond_question(&self, _tool_use_id: &str, _answer: &str) -> PylonResult<()> {
        Ok(())
    }

    async fn kill(&self) {}
}

struct FakeRunnerFactory;

#[async_trait]
impl RunnerFactory for FakeRunnerFactory {
    async fn spawn(
        &self,
        _conversation_id: ConversationId,
        _working_dir: PathBuf,
        _system_prompt: Option<String>,
        _resume_session_id: Option<String>,
    ) -> PylonResult<(Arc<dyn Runner>, EventReceiver)> {
        let (tx, rx) = mpsc::unbounded_channel();
        Ok((Arc::new(FakeRunner { events_out: tx }), rx))
    }
}

fn from_device(device_id: &str) -> EnvelopeFrom {
    EnvelopeFrom {
        device_id: Value::String(device_id.to_string()),
        device_type: Some("client".into()),
        name: None,
        icon: None,
    }
}

fn inbound(kind: &str, payload: Value, device_id: &str) -> Envelope {
    Envelope {
        kind: kind.to_string(),
        payload: Some(payload),
        to: None,
        broadcast: None,
        from: Some(from_device(device_id)),
    }
}

async fn new_router() -> (Arc<PylonRouter>, mpsc::UnboundedReceiver<Envelope>) {
    let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::default());
    let config = Arc::new(PylonConfig::new(1, Some(PathBuf::from(std::env::temp_dir())), None, None, None, None, None));
    let workspace_store = Arc::new(WorkspaceStore::new_from_persistence(1, persistence.clone()).await.unwrap());
    let message_store = Arc::new(MessageStore::new(persistence));
    let share_store = Arc::new(ShareStore::new());
    let claude_manager = Arc::new(ClaudeManager::new(
        workspace_store.clone(),
        message_store.clone(),
        Arc::new(FakeRunnerFactory),
        Arc::new(|_tool_use_id, _cid, _raw| {}),
        Arc::new(|_tool_use_id| {}),
    ));
    PylonRouter::new(config, workspace_store, message_store, claude_manager, share_store)
}

/// Drains `outbound_rx` until `pred` matches an envelope, or panics after
/// a generous timeout — avoids a hand-rolled retry/sleep loop per test.
async fn recv_until(rx: &mut mpsc::UnboundedReceiver<Envelope>, pred: impl Fn(&Envelope) -> bool) -> Envelope {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let envelope = rx.recv().await.expect("outbound channel closed before match");
            if pred(&envelope) {
                return envelope;
            }
        }
    })
    .await
    .expect("expected envelope never arrived")
}

#[tokio::test]
async fn first_run_flow_creates_workspace_and_default_conversation() {
    let (router, mut rx) = new_router().await;

    router
        .dispatch_inbound(inbound("workspace_create", json!({"name": "Demo", "workingDir": "/tmp/demo"}), "dev-1"))
        .await;
    let reply = recv_until(&mut rx, |e| e.kind == "workspace_create_result").await;
    let payload = reply.payload.unwrap();
    assert_eq!(payload["success"], true);
    assert_eq!(payload["workspace"]["conversationOrder"], json!([1]));

    router.dispatch_inbound(inbound("workspace_list", Value::Null, "dev-1")).await;
    let reply = recv_until(&mut rx, |e| e.kind == "workspace_list_result").await;
    let workspaces = reply.payload.unwrap()["workspaces"].as_array().unwrap().len();
    assert_eq!(workspaces, 1);
}

#[tokio::test]
async fn user_message_round_trips_through_fake_assistant() {
    let (router, mut rx) = new_router().await;

    router.dispatch_inbound(inbound("workspace_create", json!({"name": "Demo"}), "dev-1")).await;
    let created = recv_until(&mut rx, |e| e.kind == "workspace_create_result").await;
    let conversation_id = created.payload.unwrap()["workspace"]["conversations"]["1"]["conversationId"].as_u64().unwrap() as ConversationId;

    router
        .dispatch_inbound(inbound("conversation_select", json!({"conversationId": conversation_id}), "dev-1"))
        .await;
    let _history = recv_until(&mut rx, |e| e.kind == "history_result").await;

    router
        .dispatch_inbound(inbound(
            "user_message",
            json!({"conversationId": conversation_id, "text": "hello there"}),
            "dev-1",
        ))
        .await;

    // The fake runner drives status Idle -> (no explicit Working event in
    // this fake) -> a claude_event text turn -> back to Idle via Result.
    let text_event = recv_until(&mut rx, |e| e.kind == "claude_event" && e.to == Some(Value::String("dev-1".into()))).await;
    let body = text_event.payload.unwrap();
    assert_eq!(body["event"]["kind"], "textComplete");
    assert_eq!(body["event"]["text"], "echo: hello there");

    let status_event = recv_until(&mut rx, |e| e.kind == "conversation_status").await;
    assert_eq!(status_event.payload.unwrap()["status"], "idle");
}

#[tokio::test]
async fn non_viewer_does_not_receive_claude_events() {
    let (router, mut rx) = new_router().await;
    router.dispatch_inbound(inbound("workspace_create", json!({"name": "Demo"}), "viewer")).await;
    let _ = recv_until(&mut rx, |e| e.kind == "workspace_create_result").await;

    let conversation_id = 1u32 << 14 | 1 << 7 | 1;

    // "viewer" selects the conversation; "bystander" never does.
    router
        .dispatch_inbound(inbound("conversation_select", json!({"conversationId": conversation_id}), "viewer"))
        .await;
    let _ = recv_until(&mut rx, |e| e.kind == "history_result").await;

    router
        .dispatch_inbound(inbound("user_message", json!({"conversationId": conversation_id, "text": "hi"}), "bystander"))
        .await;

    let event = recv_until(&mut rx, |e| e.kind == "claude_event").await;
    assert_eq!(event.to, Some(Value::String("viewer".into())));
}

#[tokio::test]
async fn new_session_aborts_and_resets_to_idle() {
    let (router, mut rx) = new_router().await;
    router.dispatch_inbound(inbound("workspace_create", json!({"name": "Demo"}), "dev-1")).await;
    let _ = recv_until(&mut rx, |e| e.kind == "workspace_create_result").await;
    let conversation_id = 1u32 << 14 | 1 << 7 | 1;

    router
        .dispatch_inbound(inbound("conversation_select", json!({"conversationId": conversation_id}), "dev-1"))
        .await;
    let _ = recv_until(&mut rx, |e| e.kind == "history_result").await;

    router
        .dispatch_inbound(inbound("user_message", json!({"conversationId": conversation_id, "text": "first turn"}), "dev-1"))
        .await;
    let _ = recv_until(&mut rx, |e| e.kind == "claude_event").await;

    router.dispatch_inbound(inbound("new_session", json!({"conversationId": conversation_id}), "dev-1")).await;
    let status = recv_until(&mut rx, |e| e.kind == "conversation_status").await;
    assert_eq!(status.payload.unwrap()["status"], "idle");
}
