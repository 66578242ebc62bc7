//! In-memory message cache.
//!
//! Process-wide map from message identity to the current in-flight copy,
//! partitioned by conversation scope. The persistent store remains the
//! owner of record; the cache is reconciled after every persisted mutation
//! and only exposes atomic get/put/invalidate operations -- the lock itself
//! never leaks to callers.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use estafette_shared::types::ConversationScope;
use estafette_store::Message;

#[derive(Default)]
pub struct MessageCache {
    inner: Mutex<HashMap<ConversationScope, HashMap<String, Message>>>,
}

impl MessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the cached copy of a message. A stale object for
    /// the same uid is dropped rather than mutated in place.
    pub fn put(&self, message: &Message) {
        let mut inner = self.lock();
        inner
            .entry(message.conversation.scope())
            .or_default()
            .insert(message.uid.clone(), message.clone());
    }

    pub fn get_by_uid(&self, scope: ConversationScope, uid: &str) -> Option<Message> {
        self.lock().get(&scope).and_then(|m| m.get(uid)).cloned()
    }

    /// Deduplication lookup used by the inbound pipeline.
    pub fn get_by_api_id_and_identity(
        &self,
        scope: ConversationScope,
        api_message_id: &str,
        sender_identity: &str,
    ) -> Option<Message> {
        self.lock().get(&scope).and_then(|messages| {
            messages
                .values()
                .find(|m| {
                    m.api_message_id.as_deref() == Some(api_message_id)
                        && m.sender_identity.as_deref() == Some(sender_identity)
                })
                .cloned()
        })
    }

    pub fn invalidate(&self, scope: ConversationScope, uid: &str) {
        if let Some(messages) = self.lock().get_mut(&scope) {
            messages.remove(uid);
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<ConversationScope, HashMap<String, Message>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
