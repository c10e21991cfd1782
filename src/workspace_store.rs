//! `WorkspaceStore` — the in-memory authoritative state for workspaces and
//! conversations (spec.md §4.1). Exclusively owned and mutated by the Pylon
//! router; every other component only reads the data it hands out.

use crate::errors::{PylonError, PylonResult};
use crate::identity::{self, ConversationId};
use crate::persistence::Persistence;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::warn;

const DEFAULT_CONVERSATION_NAME: &str = "새 대화";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConversationStatus {
    Idle,
    Working,
    Waiting,
    Permission,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    Default,
    AcceptEdits,
    Bypass,
}

impl Default for PermissionMode {
    fn default() -> Self {
        PermissionMode::Default
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedDocument {
    pub path: String,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub conversation_id: ConversationId,
    pub local_id: u32,
    pub workspace_id: u32,
    pub name: String,
    pub assistant_session_id: Option<String>,
    pub status: ConversationStatus,
    pub unread: bool,
    pub permission_mode: PermissionMode,
    pub linked_documents: Vec<LinkedDocument>,
    pub custom_system_prompt: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub workspace_id: u32,
    pub name: String,
    pub working_dir: PathBuf,
    /// Local conversation ids in user-visible order.
    pub conversation_order: Vec<u32>,
    pub conversations: HashMap<u32, Conversation>,
    pub active_conversation: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

impl Workspace {
    fn used_conversation_ids(&self) -> BTreeSet<u32> {
        self.conversation_order.iter().copied().collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceSnapshot {
    pub workspace_order: Vec<u32>,
    pub workspaces: HashMap<u32, Workspace>,
    pub active_workspace: Option<u32>,
}

struct Inner {
    workspace_order: Vec<u32>,
    workspaces: HashMap<u32, Workspace>,
    active_workspace: Option<u32>,
}

impl Inner {
    fn used_workspace_ids(&self) -> BTreeSet<u32> {
        self.workspace_order.iter().copied().collect()
    }

    fn to_snapshot(&self) -> WorkspaceSnapshot {
        WorkspaceSnapshot {
            workspace_order: self.workspace_order.clone(),
            workspaces: self.workspaces.clone(),
            active_workspace: self.active_workspace,
        }
    }
}

/// Returns the smallest positive integer not present in `used`.
/// O(n) but n <= 127 by construction (spec.md §4.1).
fn allocate_id(used: &BTreeSet<u32>) -> u32 {
    let mut candidate = 1u32;
    for &id in used {
        if id == candidate {
            candidate += 1;
        } else if id > candidate {
            break;
        }
    }
    candidate
}

/// Normalizes a linked-document path: trims whitespace, converts both
/// forward and backward slashes to a single canonical separator so that
/// `link("a/b\c.ts")` and `unlink("a\b/c.ts")` refer to the same document
/// regardless of host. Returns an error for empty/whitespace.
fn normalize_path(raw: &str) -> PylonResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PylonError::InvalidInput("path must not be empty".into()));
    }
    let normalized = trimmed.replace('\\', "/");
    Ok(normalized)
}

pub struct WorkspaceStore {
    pylon_id: u32,
    persistence: Arc<dyn Persistence>,
    inner: RwLock<Inner>,
}

impl WorkspaceStore {
    pub fn new(pylon_id: u32, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            pylon_id,
            persistence,
            inner: RwLock::new(Inner {
                workspace_order: Vec::new(),
                workspaces: HashMap::new(),
                active_workspace: None,
            }),
        }
    }

    pub async fn new_from_persistence(pylon_id: u32, persistence: Arc<dyn Persistence>) -> PylonResult<Self> {
        let store = Self::new(pylon_id, persistence);
        if let Some(snapshot) = store.persistence.load_workspace_snapshot().await? {
            store.restore(snapshot);
        }
        Ok(store)
    }

    fn restore(&self, snapshot: WorkspaceSnapshot) {
        let mut inner = self.inner.write().unwrap();
        inner.workspace_order = snapshot.workspace_order;
        inner.workspaces = snapshot.workspaces;
        inner.active_workspace = snapshot.active_workspace;
    }

    fn persist(&self) {
        let snapshot = self.inner.read().unwrap().to_snapshot();
        let persistence = self.persistence.clone();
        tokio::spawn(async move {
            if let Err(e) = persistence.save_workspace_snapshot(&snapshot).await {
                warn!(err = %e, "failed to persist workspace snapshot — in-memory state retained");
            }
        });
    }

    fn packed(&self, workspace_id: u32, local_conv_id: u32) -> ConversationId {
        identity::encode(self.pylon_id, workspace_id, local_conv_id)
            .expect("workspace/conversation ids are always allocated in 1..=127")
    }

    // ─── Workspaces ──────────────────────────────────────────────────────

    pub fn create_workspace(&self, name: String, working_dir: Option<PathBuf>) -> (Workspace, Conversation) {
        let mut inner = self.inner.write().unwrap();
        let workspace_id = allocate_id(&inner.used_workspace_ids());
        let now = Utc::now();

        let conv_local_id = 1u32;
        let conversation_id = identity::encode(self.pylon_id, workspace_id, conv_local_id)
            .expect("fresh workspace always allocates conversation id 1");
        let first_conversation = Conversation {
            conversation_id,
            local_id: conv_local_id,
            workspace_id,
            name: DEFAULT_CONVERSATION_NAME.to_string(),
            assistant_session_id: None,
            status: ConversationStatus::Idle,
            unread: false,
            permission_mode: PermissionMode::Default,
            linked_documents: Vec::new(),
            custom_system_prompt: None,
            created_at: now,
        };

        let mut conversations = HashMap::new();
        conversations.insert(conv_local_id, first_conversation.clone());

        let workspace = Workspace {
            workspace_id,
            name,
            working_dir: working_dir.unwrap_or_else(|| PathBuf::from(".")),
            conversation_order: vec![conv_local_id],
            conversations,
            active_conversation: Some(conv_local_id),
            created_at: now,
            last_used: now,
        };

        inner.workspace_order.push(workspace_id);
        inner.workspaces.insert(workspace_id, workspace.clone());
        inner.active_workspace = Some(workspace_id);
        drop(inner);
        self.persist();
        (workspace, first_conversation)
    }

    pub fn get_workspace(&self, id: u32) -> Option<Workspace> {
        self.inner.read().unwrap().workspaces.get(&id).cloned()
    }

    /// Returns every workspace with an `isActive` flag, in user-visible order.
    pub fn get_all_workspaces(&self) -> Vec<(Workspace, bool)> {
        let inner = self.inner.read().unwrap();
        inner
            .workspace_order
            .iter()
            .filter_map(|id| inner.workspaces.get(id))
            .map(|w| (w.clone(), inner.active_workspace == Some(w.workspace_id)))
            .collect()
    }

    pub fn rename_workspace(&self, id: u32, name: String) -> bool {
        self.update_workspace(id, |w| {
            let trimmed = name.trim().to_string();
            if trimmed.is_empty() {
                return false;
            }
            w.name = trimmed;
            true
        })
    }

    fn update_workspace(&self, id: u32, f: impl FnOnce(&mut Workspace) -> bool) -> bool {
        let ok = {
            let mut inner = self.inner.write().unwrap();
            match inner.workspaces.get_mut(&id) {
                Some(w) => f(w),
                None => return false,
            }
        };
        if ok {
            self.persist();
        }
        ok
    }

    pub fn delete_workspace(&self, id: u32) -> bool {
        let mut inner = self.inner.write().unwrap();
        if !inner.workspaces.contains_key(&id) {
            return false;
        }
        inner.workspaces.remove(&id);
        inner.workspace_order.retain(|&w| w != id);
        if inner.active_workspace == Some(id) {
            inner.active_workspace = inner.workspace_order.first().copied();
        }
        drop(inner);
        self.persist();
        true
    }

    pub fn reorder_workspaces(&self, order: Vec<u32>) -> bool {
        let mut inner = self.inner.write().unwrap();
        let existing: BTreeSet<u32> = inner.workspace_order.iter().copied().collect();
        let proposed: BTreeSet<u32> = order.iter().copied().collect();
        if existing != proposed || proposed.len() != order.len() {
            return false;
        }
        inner.workspace_order = order;
        drop(inner);
        self.persist();
        true
    }

    pub fn find_workspace_by_name(&self, query: &str) -> Option<Workspace> {
        let needle = query.to_lowercase();
        let inner = self.inner.read().unwrap();
        inner
            .workspace_order
            .iter()
            .filter_map(|id| inner.workspaces.get(id))
            .find(|w| w.name.to_lowercase().contains(&needle))
            .cloned()
    }

    pub fn find_workspace_by_working_dir(&self, working_dir: &std::path::Path) -> Option<Workspace> {
        let inner = self.inner.read().unwrap();
        inner
            .workspace_order
            .iter()
            .filter_map(|id| inner.workspaces.get(id))
            .find(|w| w.working_dir == working_dir)
            .cloned()
    }

    // ─── Conversations ───────────────────────────────────────────────────

    pub fn create_conversation(&self, workspace_id: u32, name: Option<String>) -> Option<Conversation> {
        let mut inner = self.inner.write().unwrap();
        let local_id = {
            let w = inner.workspaces.get(&workspace_id)?;
            allocate_id(&w.used_conversation_ids())
        };
        let now = Utc::now();
        let conversation_id = identity::encode(self.pylon_id, workspace_id, local_id)
            .expect("conversation ids are always allocated in 1..=127");
        let conv = Conversation {
            conversation_id,
            local_id,
            workspace_id,
            name: name.unwrap_or_else(|| DEFAULT_CONVERSATION_NAME.to_string()),
            assistant_session_id: None,
            status: ConversationStatus::Idle,
            unread: false,
            permission_mode: PermissionMode::Default,
            linked_documents: Vec::new(),
            custom_system_prompt: None,
            created_at: now,
        };

        let w = inner.workspaces.get_mut(&workspace_id)?;
        w.conversation_order.push(local_id);
        w.conversations.insert(local_id, conv.clone());
        w.active_conversation = Some(local_id);
        drop(inner);
        self.persist();
        Some(conv)
    }

    pub fn get_conversation(&self, cid: ConversationId) -> Option<Conversation> {
        let (_, workspace_id, local_id) = identity::decode(cid);
        let inner = self.inner.read().unwrap();
        inner
            .workspaces
            .get(&workspace_id)?
            .conversations
            .get(&local_id)
            .cloned()
    }

    fn update_conversation<T>(
        &self,
        cid: ConversationId,
        f: impl FnOnce(&mut Conversation) -> T,
    ) -> Option<T> {
        let (_, workspace_id, local_id) = identity::decode(cid);
        let result = {
            let mut inner = self.inner.write().unwrap();
            let conv = inner.workspaces.get_mut(&workspace_id)?.conversations.get_mut(&local_id)?;
            Some(f(conv))
        };
        if result.is_some() {
            self.persist();
        }
        result
    }

    pub fn rename_conversation(&self, cid: ConversationId, name: String) -> bool {
        self.update_conversation(cid, |c| {
            let trimmed = name.trim().to_string();
            if trimmed.is_empty() {
                return false;
            }
            c.name = trimmed;
            true
        })
        .unwrap_or(false)
    }

    pub fn delete_conversation(&self, cid: ConversationId) -> bool {
        let (_, workspace_id, local_id) = identity::decode(cid);
        let mut inner = self.inner.write().unwrap();
        let deleted = match inner.workspaces.get_mut(&workspace_id) {
            Some(w) => {
                if w.conversations.remove(&local_id).is_none() {
                    false
                } else {
                    w.conversation_order.retain(|&c| c != local_id);
                    if w.active_conversation == Some(local_id) {
                        w.active_conversation = w.conversation_order.first().copied();
                    }
                    true
                }
            }
            None => false,
        };
        drop(inner);
        if deleted {
            self.persist();
        }
        deleted
    }

    pub fn reorder_conversations(&self, workspace_id: u32, order: Vec<u32>) -> bool {
        let mut inner = self.inner.write().unwrap();
        let ok = match inner.workspaces.get_mut(&workspace_id) {
            Some(w) => {
                let existing: BTreeSet<u32> = w.conversation_order.iter().copied().collect();
                let proposed: BTreeSet<u32> = order.iter().copied().collect();
                if existing == proposed && proposed.len() == order.len() {
                    w.conversation_order = order;
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        drop(inner);
        if ok {
            self.persist();
        }
        ok
    }

    pub fn set_active_conversation(&self, cid: ConversationId) -> bool {
        let (_, workspace_id, local_id) = identity::decode(cid);
        let mut inner = self.inner.write().unwrap();
        let ok = match inner.workspaces.get_mut(&workspace_id) {
            Some(w) if w.conversations.contains_key(&local_id) => {
                w.active_conversation = Some(local_id);
                w.last_used = Utc::now();
                true
            }
            _ => false,
        };
        if ok {
            inner.active_workspace = Some(workspace_id);
        }
        drop(inner);
        if ok {
            self.persist();
        }
        ok
    }

    pub fn update_conversation_status(&self, cid: ConversationId, status: ConversationStatus) -> bool {
        self.update_conversation(cid, |c| c.status = status).is_some()
    }

    pub fn update_conversation_unread(&self, cid: ConversationId, unread: bool) -> bool {
        self.update_conversation(cid, |c| c.unread = unread).is_some()
    }

    pub fn update_assistant_session_id(&self, cid: ConversationId, session_id: Option<String>) -> bool {
        self.update_conversation(cid, |c| c.assistant_session_id = session_id).is_some()
    }

    pub fn get_conversation_permission_mode(&self, cid: ConversationId) -> Option<PermissionMode> {
        self.get_conversation(cid).map(|c| c.permission_mode)
    }

    pub fn set_conversation_permission_mode(&self, cid: ConversationId, mode: PermissionMode) -> bool {
        self.update_conversation(cid, |c| c.permission_mode = mode).is_some()
    }

    pub fn set_custom_system_prompt(&self, cid: ConversationId, prompt: Option<String>) -> bool {
        self.update_conversation(cid, |c| c.custom_system_prompt = prompt).is_some()
    }

    // ─── Linked documents ────────────────────────────────────────────────

    pub fn link_document(&self, cid: ConversationId, path: &str) -> PylonResult<()> {
        let normalized = normalize_path(path)?;
        let (_, workspace_id, local_id) = identity::decode(cid);
        let mut inner = self.inner.write().unwrap();
        let conv = inner
            .workspaces
            .get_mut(&workspace_id)
            .and_then(|w| w.conversations.get_mut(&local_id))
            .ok_or_else(|| PylonError::NotFound(format!("conversation {cid}")))?;

        if conv.linked_documents.iter().any(|d| d.path == normalized) {
            return Err(PylonError::InvalidInput("Document already exists".into()));
        }
        conv.linked_documents.push(LinkedDocument {
            path: normalized,
            added_at: Utc::now(),
        });
        drop(inner);
        self.persist();
        Ok(())
    }

    pub fn unlink_document(&self, cid: ConversationId, path: &str) -> PylonResult<bool> {
        let normalized = normalize_path(path)?;
        let (_, workspace_id, local_id) = identity::decode(cid);
        let mut inner = self.inner.write().unwrap();
        let conv = inner
            .workspaces
            .get_mut(&workspace_id)
            .and_then(|w| w.conversations.get_mut(&local_id))
            .ok_or_else(|| PylonError::NotFound(format!("conversation {cid}")))?;
        let before = conv.linked_documents.len();
        conv.linked_documents.retain(|d| d.path != normalized);
        let removed = conv.linked_documents.len() != before;
        drop(inner);
        if removed {
            self.persist();
        }
        Ok(removed)
    }

    pub fn get_linked_documents(&self, cid: ConversationId) -> Vec<LinkedDocument> {
        self.get_conversation(cid).map(|c| c.linked_documents).unwrap_or_default()
    }

    // ─── Startup recovery ────────────────────────────────────────────────

    /// Forces every working/waiting/permission conversation back to idle.
    /// Returns the ids that were reset, for the caller to append an
    /// `aborted(session_ended)` message to each.
    pub fn reset_active_conversations(&self) -> Vec<ConversationId> {
        let mut inner = self.inner.write().unwrap();
        let mut reset = Vec::new();
        for workspace_id in inner.workspace_order.clone() {
            if let Some(w) = inner.workspaces.get_mut(&workspace_id) {
                for local_id in w.conversation_order.clone() {
                    if let Some(conv) = w.conversations.get_mut(&local_id) {
                        if !matches!(conv.status, ConversationStatus::Idle) {
                            conv.status = ConversationStatus::Idle;
                            reset.push(conv.conversation_id);
                        }
                    }
                }
            }
        }
        drop(inner);
        if !reset.is_empty() {
            self.persist();
        }
        reset
    }

    pub fn to_snapshot(&self) -> WorkspaceSnapshot {
        self.inner.read().unwrap().to_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;

    fn store() -> WorkspaceStore {
        WorkspaceStore::new(1, Arc::new(MemoryPersistence::default()))
    }

    #[test]
    fn id_allocation_reuses_smallest_free_slot() {
        let used: BTreeSet<u32> = [1, 2, 4].into_iter().collect();
        assert_eq!(allocate_id(&used), 3);
        let used: BTreeSet<u32> = [1, 2, 3, 4].into_iter().collect();
        assert_eq!(allocate_id(&used), 5);
        let used: BTreeSet<u32> = BTreeSet::new();
        assert_eq!(allocate_id(&used), 1);
    }

    #[test]
    fn id_reuse_matches_spec_scenario() {
        // {1,2,3,4} delete {3} -> next alloc is 3; then delete {1} -> next two are 1, then 5.
        let store = store();
        let ws_ids: Vec<u32> = (0..4).map(|_| store.create_workspace("w".into(), None).0.workspace_id).collect();
        assert_eq!(ws_ids, vec![1, 2, 3, 4]);
        assert!(store.delete_workspace(3));
        let (w, _) = store.create_workspace("w5".into(), None);
        assert_eq!(w.workspace_id, 3);
        assert!(store.delete_workspace(1));
        let (w, _) = store.create_workspace("w6".into(), None);
        assert_eq!(w.workspace_id, 1);
        let (w, _) = store.create_workspace("w7".into(), None);
        assert_eq!(w.workspace_id, 5);
    }

    #[test]
    fn create_workspace_auto_creates_first_conversation() {
        let store = store();
        let (w, conv) = store.create_workspace("Proj".into(), Some(PathBuf::from("/p")));
        assert_eq!(w.conversation_order, vec![1]);
        assert_eq!(conv.local_id, 1);
        assert_eq!(conv.conversation_id, identity::encode(1, w.workspace_id, 1).unwrap());
        assert_eq!(w.active_conversation, Some(1));
    }

    #[test]
    fn link_idempotence_and_path_normalization() {
        let store = store();
        let (_, conv) = store.create_workspace("w".into(), None);
        store.link_document(conv.conversation_id, "a/b\\c.ts").unwrap();
        let err = store.link_document(conv.conversation_id, "a\\b/c.ts").unwrap_err();
        assert!(matches!(err, PylonError::InvalidInput(_)));
        let docs = store.get_linked_documents(conv.conversation_id);
        assert_eq!(docs.len(), 1);
        let added_at = docs[0].added_at;

        // linking again leaves exactly one entry with the original addedAt
        let _ = store.link_document(conv.conversation_id, "a/b\\c.ts");
        let docs = store.get_linked_documents(conv.conversation_id);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].added_at, added_at);

        assert!(store.unlink_document(conv.conversation_id, "a\\b/c.ts").unwrap());
        assert!(store.get_linked_documents(conv.conversation_id).is_empty());
    }

    #[test]
    fn link_rejects_empty_path() {
        let store = store();
        let (_, conv) = store.create_workspace("w".into(), None);
        assert!(store.link_document(conv.conversation_id, "   ").is_err());
    }

    #[test]
    fn deleting_active_workspace_promotes_first_remaining() {
        let store = store();
        let (w1, _) = store.create_workspace("a".into(), None);
        let (_w2, _) = store.create_workspace("b".into(), None);
        assert!(store.delete_workspace(w1.workspace_id));
        let all = store.get_all_workspaces();
        assert!(all.iter().any(|(w, active)| *active && w.name == "b"));
    }

    #[test]
    fn reset_active_conversations_forces_idle() {
        let store = store();
        let (_, conv) = store.create_workspace("w".into(), None);
        store.update_conversation_status(conv.conversation_id, ConversationStatus::Working);
        let reset = store.reset_active_conversations();
        assert_eq!(reset, vec![conv.conversation_id]);
        let fetched = store.get_conversation(conv.conversation_id).unwrap();
        assert_eq!(fetched.status, ConversationStatus::Idle);
    }

    #[test]
    fn reorder_rejects_non_permutations() {
        let store = store();
        store.create_workspace("a".into(), None);
        store.create_workspace("b".into(), None);
        assert!(!store.reorder_workspaces(vec![1]));
        assert!(store.reorder_workspaces(vec![2, 1]));
    }
}
