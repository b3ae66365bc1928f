use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::balance::{BalanceGuard, BalanceSnapshot};
use crate::error::RequestError;
use crate::session::SessionHandle;

pub const ERROR_NOT_SIGNED_IN: &str = "You must be signed in to ask the council";
pub const ERROR_TOP_UP_REQUIRED: &str =
    "Your balance has run out. Top up to keep asking the council";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A chat message. Immutable once appended; the conversation list is
/// append-only from the client's perspective.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Contributor name -> the sub-query routed to that contributor, kept
    /// for the transparency panel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_queries: Option<BTreeMap<String, String>>,
}

impl Message {
    #[must_use]
    pub fn new(role: Role, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            timestamp: Utc::now(),
            agent_queries: None,
        }
    }
}

/// One assistant turn from the orchestrator. A single-object reply is the
/// one-element degenerate case of the array-of-turns contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantTurn {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub content: String,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_queries: Option<BTreeMap<String, String>>,
}

/// Full orchestrator reply: at least one turn, optionally with a fresh
/// balance snapshot piggybacked to save a round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorReply {
    pub turns: Vec<AssistantTurn>,
    pub balance: Option<BalanceSnapshot>,
}

/// Seam over the gateway for chat turns.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn send_query(
        &self,
        query: &str,
        conversation_id: Option<&str>,
    ) -> Result<OrchestratorReply, RequestError>;
}

/// Observable conversation state for the UI. While `is_loading` is true the
/// input control is expected to be disabled; the engine itself tolerates a
/// concurrent send (see `send`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationState {
    pub conversation_id: Option<String>,
    pub messages: Vec<Message>,
    pub is_loading: bool,
    pub error: Option<String>,
}

/// Persisted subset of the conversation, keyed per signed-in uid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

#[derive(Debug, Default)]
struct EngineInner {
    state: ConversationState,
    /// Bumped on every reset; replies carrying a stale generation are
    /// discarded instead of mutating the fresh conversation.
    generation: u64,
}

/// State machine owning message history and turn sequencing for the single
/// active conversation. All mutation is read-modify-write against current
/// state under a short synchronous lock, never against a snapshot captured
/// at call start.
#[derive(Clone)]
pub struct ConversationEngine {
    session: SessionHandle,
    balance: BalanceGuard,
    inner: Arc<Mutex<EngineInner>>,
}

impl ConversationEngine {
    #[must_use]
    pub fn new(session: SessionHandle, balance: BalanceGuard) -> Self {
        Self {
            session,
            balance,
            inner: Arc::new(Mutex::new(EngineInner::default())),
        }
    }

    #[must_use]
    pub fn state(&self) -> ConversationState {
        self.lock().state.clone()
    }

    /// Send one user turn. Preconditions are checked synchronously before
    /// any network call: an unauthenticated session or a closed balance gate
    /// end in `Idle+Error` with nothing appended and zero requests issued.
    /// Otherwise the user message is appended optimistically and the remote
    /// reply (or failure) is folded in afterwards; a failed send never rolls
    /// the user message back.
    pub async fn send(&self, orchestrator: &dyn Orchestrator, query: &str) {
        let query = query.trim();
        if query.is_empty() {
            return;
        }

        if !self.session.is_authenticated() {
            let mut inner = self.lock();
            inner.state.error = Some(ERROR_NOT_SIGNED_IN.to_string());
            inner.state.is_loading = false;
            return;
        }
        if self.balance.needs_top_up() {
            let mut inner = self.lock();
            inner.state.error = Some(ERROR_TOP_UP_REQUIRED.to_string());
            inner.state.is_loading = false;
            return;
        }

        let (generation, conversation_id) = {
            let mut inner = self.lock();
            inner
                .state
                .messages
                .push(Message::new(Role::User, query.to_string()));
            inner.state.is_loading = true;
            inner.state.error = None;
            (inner.generation, inner.state.conversation_id.clone())
        };

        let result = orchestrator
            .send_query(query, conversation_id.as_deref())
            .await;

        let mut inner = self.lock();
        if inner.generation != generation {
            tracing::debug!("discarding orchestrator reply for a reset conversation");
            return;
        }

        match result {
            Ok(reply) => {
                for turn in reply.turns {
                    if inner.state.conversation_id.is_none() {
                        inner.state.conversation_id = Some(turn.conversation_id.clone());
                    }
                    inner.state.messages.push(Message {
                        id: turn.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                        role: Role::Assistant,
                        content: turn.content,
                        timestamp: Utc::now(),
                        agent_queries: turn.agent_queries,
                    });
                }
                inner.state.is_loading = false;
                drop(inner);
                if let Some(snapshot) = reply.balance {
                    self.balance.apply_snapshot(snapshot);
                }
            }
            Err(error) => {
                inner.state.is_loading = false;
                inner.state.error = Some(error.message);
            }
        }
    }

    /// Start a new conversation: clears id, messages, error, and the loading
    /// flag, and invalidates any reply still in flight.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = ConversationState::default();
        inner.generation += 1;
    }

    /// Dismiss the error banner without touching messages.
    pub fn clear_error(&self) {
        self.lock().state.error = None;
    }

    /// Replace the conversation with a persisted snapshot (account re-key).
    /// Invalidates in-flight replies the same way `reset` does.
    pub fn load_snapshot(&self, snapshot: ConversationSnapshot) {
        let mut inner = self.lock();
        inner.state = ConversationState {
            conversation_id: snapshot.conversation_id,
            messages: snapshot.messages,
            is_loading: false,
            error: None,
        };
        inner.generation += 1;
    }

    #[must_use]
    pub fn snapshot(&self) -> ConversationSnapshot {
        let inner = self.lock();
        ConversationSnapshot {
            conversation_id: inner.state.conversation_id.clone(),
            messages: inner.state.messages.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
