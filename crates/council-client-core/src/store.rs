use std::collections::HashMap;
use std::sync::Mutex;

use crate::conversation::ConversationSnapshot;
use crate::session::SessionSummary;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("state store error: {message}")]
pub struct StoreError {
    pub message: String,
}

impl StoreError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Client-side persistence seam. Conversation snapshots are keyed by the
/// signed-in uid so switching accounts never leaks another user's history;
/// the key is derived once at the sign-in/sign-out transition, not looked up
/// per access.
pub trait StateStore: Send + Sync {
    fn load_session(&self) -> Result<Option<SessionSummary>, StoreError>;
    fn persist_session(&self, summary: &SessionSummary) -> Result<(), StoreError>;
    fn clear_session(&self) -> Result<(), StoreError>;

    fn load_conversation(&self, uid: &str) -> Result<Option<ConversationSnapshot>, StoreError>;
    fn persist_conversation(
        &self,
        uid: &str,
        snapshot: &ConversationSnapshot,
    ) -> Result<(), StoreError>;
    fn clear_conversation(&self, uid: &str) -> Result<(), StoreError>;
}

/// Map-backed store for tests and embedders without durable storage.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    session: Mutex<Option<SessionSummary>>,
    conversations: Mutex<HashMap<String, ConversationSnapshot>>,
}

impl InMemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for InMemoryStateStore {
    fn load_session(&self) -> Result<Option<SessionSummary>, StoreError> {
        Ok(self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }

    fn persist_session(&self, summary: &SessionSummary) -> Result<(), StoreError> {
        *self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(summary.clone());
        Ok(())
    }

    fn clear_session(&self) -> Result<(), StoreError> {
        *self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        Ok(())
    }

    fn load_conversation(&self, uid: &str) -> Result<Option<ConversationSnapshot>, StoreError> {
        Ok(self
            .conversations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(uid)
            .cloned())
    }

    fn persist_conversation(
        &self,
        uid: &str,
        snapshot: &ConversationSnapshot,
    ) -> Result<(), StoreError> {
        self.conversations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(uid.to_string(), snapshot.clone());
        Ok(())
    }

    fn clear_conversation(&self, uid: &str) -> Result<(), StoreError> {
        self.conversations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(uid);
        Ok(())
    }
}
