//! Portable coordination core for the council chat client.
//!
//! Session state, the balance gate, and the conversation engine live here,
//! behind transport traits (`TokenProvider`, `BalanceSource`, `Orchestrator`,
//! `StateStore`) so the core stays runtime- and HTTP-free. The concrete
//! reqwest gateway lives in `council-api-client`.

pub mod balance;
pub mod conversation;
pub mod error;
pub mod session;
pub mod store;

pub use balance::{BalanceGuard, BalanceSnapshot, BalanceSource, BalanceState, FETCH_THROTTLE};
pub use conversation::{
    AssistantTurn, ConversationEngine, ConversationSnapshot, ConversationState, Message,
    Orchestrator, OrchestratorReply, Role,
};
pub use error::RequestError;
pub use session::{
    IdentityTransition, Session, SessionExpiredHandler, SessionHandle, SessionSummary,
    TokenProvider, UserProfile,
};
pub use store::{InMemoryStateStore, StateStore, StoreError};
