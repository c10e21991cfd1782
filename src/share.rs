//! `ShareStore` — public read-only share links for a conversation (spec.md
//! §4.6, §6). One live share per conversation; creating a new one replaces
//! the old.

use crate::errors::{PylonError, PylonResult};
use crate::identity::ConversationId;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;

const SHARE_ID_LEN: usize = 12;
const BASE62: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

fn generate_share_id() -> String {
    let mut rng = rand::thread_rng();
    (0..SHARE_ID_LEN).map(|_| BASE62[rng.gen_range(0..BASE62.len())] as char).collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareInfo {
    pub share_id: String,
    pub conversation_id: ConversationId,
    pub created_at: DateTime<Utc>,
    pub access_count: u64,
}

struct Inner {
    by_share_id: HashMap<String, ShareInfo>,
    by_conversation: HashMap<ConversationId, String>,
}

pub struct ShareStore {
    inner: RwLock<Inner>,
}

impl ShareStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_share_id: HashMap::new(),
                by_conversation: HashMap::new(),
            }),
        }
    }

    /// Creates a fresh share, replacing any existing one for this conversation.
    pub fn create(&self, cid: ConversationId) -> ShareInfo {
        let mut inner = self.inner.write().unwrap();
        if let Some(old_id) = inner.by_conversation.remove(&cid) {
            inner.by_share_id.remove(&old_id);
        }
        let share_id = loop {
            let candidate = generate_share_id();
            if !inner.by_share_id.contains_key(&candidate) {
                break candidate;
            }
        };
        let info = ShareInfo {
            share_id: share_id.clone(),
            conversation_id: cid,
            created_at: Utc::now(),
            access_count: 0,
        };
        inner.by_conversation.insert(cid, share_id.clone());
        inner.by_share_id.insert(share_id, info.clone());
        info
    }

    pub fn url_for(share_id: &str) -> String {
        format!("/share/{share_id}")
    }

    pub fn validate(&self, share_id: &str) -> PylonResult<ShareInfo> {
        self.inner
            .read()
            .unwrap()
            .by_share_id
            .get(share_id)
            .cloned()
            .ok_or_else(|| PylonError::NotFound(format!("share {share_id}")))
    }

    pub fn delete(&self, share_id: &str) -> PylonResult<()> {
        let mut inner = self.inner.write().unwrap();
        let info = inner.by_share_id.remove(share_id).ok_or_else(|| PylonError::NotFound(format!("share {share_id}")))?;
        inner.by_conversation.remove(&info.conversation_id);
        Ok(())
    }

    /// Returns the share's info after incrementing `accessCount`.
    pub fn history(&self, share_id: &str) -> PylonResult<ShareInfo> {
        let mut inner = self.inner.write().unwrap();
        let info = inner.by_share_id.get_mut(share_id).ok_or_else(|| PylonError::NotFound(format!("share {share_id}")))?;
        info.access_count += 1;
        Ok(info.clone())
    }
}

impl Default for ShareStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_replaces_existing_share_for_conversation() {
        let store = ShareStore::new();
        let first = store.create(1);
        let second = store.create(1);
        assert_ne!(first.share_id, second.share_id);
        assert!(store.validate(&first.share_id).is_err());
        assert!(store.validate(&second.share_id).is_ok());
    }

    #[test]
    fn history_increments_access_count() {
        let store = ShareStore::new();
        let info = store.create(1);
        store.history(&info.share_id).unwrap();
        let after = store.history(&info.share_id).unwrap();
        assert_eq!(after.access_count, 2);
    }

    #[test]
    fn share_ids_are_twelve_char_base62_and_unique_across_many_calls() {
        let store = ShareStore::new();
        let mut seen = std::collections::HashSet::new();
        for cid in 1..1000u32 {
            let info = store.create(cid);
            assert_eq!(info.share_id.len(), SHARE_ID_LEN);
            assert!(info.share_id.chars().all(|c| c.is_ascii_alphanumeric()));
            assert!(seen.insert(info.share_id));
        }
    }

    #[test]
    fn delete_removes_both_indices() {
        let store = ShareStore::new();
        let info = store.create(1);
        store.delete(&info.share_id).unwrap();
        assert!(store.validate(&info.share_id).is_err());
        // A fresh create for the same conversation must succeed cleanly.
        let second = store.create(1);
        assert_ne!(second.share_id, info.share_id);
    }
}
