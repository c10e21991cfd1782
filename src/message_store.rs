//! `MessageStore` — append-only per-conversation message log with debounced
//! persistence (spec.md §4.2).

use crate::identity::ConversationId;
use crate::persistence::Persistence;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::warn;

/// Debounce window per spec.md §4.2.
const DEBOUNCE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    Text,
    ToolStart,
    ToolComplete,
    Result,
    Error,
    Aborted,
    FileAttachment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreMessage {
    pub id: String,
    pub role: MessageRole,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    /// Type-specific payload — kept schema-free like the relay envelopes it
    /// mirrors (text, tool name/input, result usage stats, error message...).
    pub payload: serde_json::Value,
}

struct ConversationLog {
    messages: Vec<StoreMessage>,
    /// Bumped on every mutation; the debounce task only flushes if the
    /// generation it captured is still current when its sleep elapses.
    generation: Arc<AtomicU64>,
}

pub struct MessageStore {
    persistence: Arc<dyn Persistence>,
    logs: Arc<RwLock<HashMap<ConversationId, ConversationLog>>>,
}

impl MessageStore {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            persistence,
            logs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn with_log<T>(&self, cid: ConversationId, f: impl FnOnce(&mut ConversationLog) -> T) -> T {
        let mut logs = self.logs.write().unwrap();
        let log = logs.entry(cid).or_insert_with(|| ConversationLog {
            messages: Vec::new(),
            generation: Arc::new(AtomicU64::new(0)),
        });
        f(log)
    }

    fn append(&self, cid: ConversationId, message: StoreMessage) {
        self.with_log(cid, |log| {
            log.messages.push(message);
            log.messages.sort_by_key(|m| m.timestamp);
        });
        self.schedule_flush(cid);
    }

    fn schedule_flush(&self, cid: ConversationId) {
        let generation = {
            let mut logs = self.logs.write().unwrap();
            let log = logs.get_mut(&cid).expect("log exists after append");
            log.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        // One timer-driven task per mutation, coalesced by the generation
        // check: only the last-scheduled task for this conversation still
        // matches `generation` when its sleep elapses.
        let gen_counter = {
            let logs = self.logs.read().unwrap();
            logs.get(&cid).unwrap().generation.clone()
        };
        let persistence = self.persistence.clone();
        let logs = self.logs.clone();

        tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;
            if gen_counter.load(Ordering::SeqCst) != generation {
                return; // superseded by a later mutation
            }
            let messages = logs.read().unwrap().get(&cid).map(|l| l.messages.clone()).unwrap_or_default();
            if let Err(e) = persistence.save_message_session(cid, &messages).await {
                warn!(err = %e, conversation_id = cid, "failed to flush message log — in-memory state retained");
            }
        });
    }

    /// Explicit synchronous flush of every conversation's log. Invoked on
    /// shutdown; bypasses the debounce window entirely.
    pub async fn flush_all(&self) -> usize {
        let snapshot: Vec<(ConversationId, Vec<StoreMessage>)> = {
            let logs = self.logs.read().unwrap();
            logs.iter().map(|(cid, log)| (*cid, log.messages.clone())).collect()
        };
        let mut flushed = 0;
        for (cid, messages) in snapshot {
            if let Err(e) = self.persistence.save_message_session(cid, &messages).await {
                warn!(err = %e, conversation_id = cid, "flush_all: failed to persist conversation");
            } else {
                flushed += 1;
            }
        }
        flushed
    }

    pub async fn load(&self, cid: ConversationId) -> crate::errors::PylonResult<()> {
        let messages = self.persistence.load_message_session(cid).await?;
        self.with_log(cid, |log| log.messages = messages);
        Ok(())
    }

    pub fn get_messages(&self, cid: ConversationId) -> Vec<StoreMessage> {
        self.logs.read().unwrap().get(&cid).map(|l| l.messages.clone()).unwrap_or_default()
    }

    // ─── Typed append helpers ────────────────────────────────────────────

    pub fn add_user_message(&self, cid: ConversationId, id: String, timestamp: i64, text: &str, attachments: Option<serde_json::Value>) {
        self.append(
            cid,
            StoreMessage {
                id,
                role: MessageRole::User,
                message_type: MessageType::Text,
                timestamp,
                payload: serde_json::json!({"text": text, "attachments": attachments}),
            },
        );
    }

    pub fn add_assistant_text(&self, cid: ConversationId, id: String, timestamp: i64, text: &str) {
        self.append(
            cid,
            StoreMessage {
                id,
                role: MessageRole::Assistant,
                message_type: MessageType::Text,
                timestamp,
                payload: serde_json::json!({"text": text}),
            },
        );
    }

    pub fn add_tool_start(&self, cid: ConversationId, id: String, timestamp: i64, tool_use_id: &str, tool_name: &str, tool_input: serde_json::Value) {
        self.append(
            cid,
            StoreMessage {
                id,
                role: MessageRole::Assistant,
                message_type: MessageType::ToolStart,
                timestamp,
                payload: serde_json::json!({"toolUseId": tool_use_id, "toolName": tool_name, "toolInput": tool_input}),
            },
        );
    }

    pub fn add_tool_complete(&self, cid: ConversationId, id: String, timestamp: i64, tool_use_id: &str, tool_name: &str, success: bool, output: serde_json::Value) {
        self.append(
            cid,
            StoreMessage {
                id,
                role: MessageRole::Assistant,
                message_type: MessageType::ToolComplete,
                timestamp,
                payload: serde_json::json!({"toolUseId": tool_use_id, "toolName": tool_name, "success": success, "output": output}),
            },
        );
    }

    pub fn add_result(&self, cid: ConversationId, id: String, timestamp: i64, result: serde_json::Value) {
        self.append(
            cid,
            StoreMessage {
                id,
                role: MessageRole::System,
                message_type: MessageType::Result,
                timestamp,
                payload: result,
            },
        );
    }

    pub fn add_error(&self, cid: ConversationId, id: String, timestamp: i64, message: &str) {
        self.append(
            cid,
            StoreMessage {
                id,
                role: MessageRole::System,
                message_type: MessageType::Error,
                timestamp,
                payload: serde_json::json!({"message": message}),
            },
        );
    }

    pub fn add_aborted(&self, cid: ConversationId, id: String, timestamp: i64, reason: &str) {
        self.append(
            cid,
            StoreMessage {
                id,
                role: MessageRole::System,
                message_type: MessageType::Aborted,
                timestamp,
                payload: serde_json::json!({"reason": reason}),
            },
        );
    }

    pub fn add_file_attachment(&self, cid: ConversationId, id: String, timestamp: i64, file: serde_json::Value) {
        self.append(
            cid,
            StoreMessage {
                id,
                role: MessageRole::Assistant,
                message_type: MessageType::FileAttachment,
                timestamp,
                payload: serde_json::json!({"file": file}),
            },
        );
    }

    /// Merge semantics (spec.md §4.2): `external` replaces the history
    /// prefix. Locally-stored messages whose timestamp strictly exceeds the
    /// external list's max timestamp AND whose id is absent from it are
    /// preserved and appended; the whole set is then re-sorted by timestamp
    /// (stable, so ties keep external-before-local ordering implied by the
    /// concatenation order below).
    pub fn merge_history(&self, cid: ConversationId, external: Vec<StoreMessage>) {
        self.with_log(cid, |log| {
            let max_external_ts = external.iter().map(|m| m.timestamp).max().unwrap_or(i64::MIN);
            let external_ids: HashSet<&str> = external.iter().map(|m| m.id.as_str()).collect();

            let mut preserved: Vec<StoreMessage> = log
                .messages
                .drain(..)
                .filter(|m| m.timestamp > max_external_ts && !external_ids.contains(m.id.as_str()))
                .collect();

            let mut merged = external;
            merged.append(&mut preserved);
            merged.sort_by_key(|m| m.timestamp);

            // Deduplicate by id, keeping the first occurrence (external wins
            // over any stale duplicate carried from a prior merge).
            let mut seen = HashSet::new();
            merged.retain(|m| seen.insert(m.id.clone()));

            log.messages = merged;
        });
        self.schedule_flush(cid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;

    fn store() -> MessageStore {
        MessageStore::new(Arc::new(MemoryPersistence::default()))
    }

    #[test]
    fn append_only_log_stays_in_timestamp_order() {
        let store = store();
        store.add_user_message(1, "m1".into(), 100, "hi", None);
        store.add_assistant_text(1, "m2".into(), 50, "late binding but earlier ts");
        let messages = store.get_messages(1);
        assert_eq!(messages.len(), 2);
        assert!(messages[0].timestamp <= messages[1].timestamp);
    }

    #[test]
    fn merge_keeps_newer_local_messages_not_in_external() {
        let store = store();
        store.add_user_message(1, "local-1".into(), 10, "a", None);
        store.add_user_message(1, "local-2".into(), 200, "fresher than external", None);

        let external = vec![StoreMessage {
            id: "ext-1".into(),
            role: MessageRole::User,
            message_type: MessageType::Text,
            timestamp: 100,
            payload: serde_json::json!({"text": "b"}),
        }];
        store.merge_history(1, external);

        let messages = store.get_messages(1);
        let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["ext-1", "local-2"]);
    }

    #[test]
    fn merge_deduplicates_by_id() {
        let store = store();
        store.add_user_message(1, "dup".into(), 10, "a", None);
        let external = vec![StoreMessage {
            id: "dup".into(),
            role: MessageRole::User,
            message_type: MessageType::Text,
            timestamp: 10,
            payload: serde_json::json!({"text": "replacement"}),
        }];
        store.merge_history(1, external);
        let messages = store.get_messages(1);
        assert_eq!(messages.len(), 1);
    }
}
