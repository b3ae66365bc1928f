//! Top-level wiring: one [`CouncilClient`] owns the session, the balance
//! guard, the conversation engine, and the gateway, and cascades identity
//! transitions between them with explicit method calls.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use council_client_core::{
    BalanceGuard, BalanceState, ConversationEngine, ConversationState, IdentityTransition,
    RequestError, Session, SessionExpiredHandler, SessionHandle, StateStore, TokenProvider,
    UserProfile,
};

use crate::config::GatewayConfig;
use crate::gateway::ApiGateway;
use crate::resources::{CouncilApi, PaymentIntent};

/// Quiet period after a visibility event before the balance is revalidated.
/// Rapid tab-switching collapses into one fetch.
pub const VISIBILITY_DEBOUNCE: Duration = Duration::from_millis(250);

/// Fires when a refreshed token is still rejected: clears the balance,
/// resets the conversation, drops the persisted session, then forwards to
/// the embedder's handler (typically navigation to the sign-in screen).
struct ExpirationCascade {
    balance: BalanceGuard,
    conversation: ConversationEngine,
    store: Arc<dyn StateStore>,
    notify: Arc<dyn SessionExpiredHandler>,
}

impl SessionExpiredHandler for ExpirationCascade {
    fn on_session_expired(&self) {
        self.balance.clear();
        self.conversation.reset();
        if let Err(error) = self.store.clear_session() {
            tracing::warn!(error = %error, "failed to clear persisted session on expiry");
        }
        self.notify.on_session_expired();
    }
}

/// Debounced balance revalidation for tab-visibility events. A newer event
/// aborts the pending one, so only the last event in a burst fetches.
struct VisibilityRevalidator {
    pending: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl VisibilityRevalidator {
    fn new() -> Self {
        Self {
            pending: Mutex::new(None),
        }
    }

    fn schedule(&self, balance: BalanceGuard, api: Arc<CouncilApi>) {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(task) = pending.take() {
            task.abort();
        }
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(VISIBILITY_DEBOUNCE).await;
            balance.fetch(api.as_ref()).await;
        }));
    }
}

/// The assembled client. Construct once per process; every piece is behind
/// an `Arc` or an internal lock, so the handle itself is cheap to share.
pub struct CouncilClient {
    session: SessionHandle,
    balance: BalanceGuard,
    conversation: ConversationEngine,
    api: Arc<CouncilApi>,
    store: Arc<dyn StateStore>,
    /// Persistence key for the signed-in account, derived once per
    /// sign-in/sign-out transition rather than looked up per access.
    active_uid: Mutex<Option<String>>,
    revalidator: VisibilityRevalidator,
}

impl CouncilClient {
    #[must_use]
    pub fn new(
        config: &GatewayConfig,
        tokens: Arc<dyn TokenProvider>,
        on_expired: Arc<dyn SessionExpiredHandler>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let session = SessionHandle::new();
        let balance = BalanceGuard::new(session.clone());
        let conversation = ConversationEngine::new(session.clone(), balance.clone());
        let cascade = Arc::new(ExpirationCascade {
            balance: balance.clone(),
            conversation: conversation.clone(),
            store: store.clone(),
            notify: on_expired,
        });
        let gateway = Arc::new(ApiGateway::new(config, session.clone(), tokens, cascade));
        let api = Arc::new(CouncilApi::new(gateway, config.orchestrator_timeout));

        Self {
            session,
            balance,
            conversation,
            api,
            store,
            active_uid: Mutex::new(None),
            revalidator: VisibilityRevalidator::new(),
        }
    }

    /// Entry point for identity callbacks. Applies the transition and runs
    /// the matching cascade: sign-in persists the summary, re-keys the
    /// conversation to the new account, and fetches a fresh balance;
    /// sign-out clears everything session-scoped.
    pub async fn handle_identity_change(&self, user: Option<UserProfile>) -> IdentityTransition {
        let transition = self.session.apply_identity(user);
        match &transition {
            IdentityTransition::SignedIn { uid } => {
                // Account switch: the previous user's balance (and its
                // throttle history) must not carry over.
                self.balance.clear();
                self.persist_session_summary();
                *self.lock_uid() = Some(uid.clone());
                match self.store.load_conversation(uid) {
                    Ok(Some(snapshot)) => self.conversation.load_snapshot(snapshot),
                    Ok(None) => self.conversation.reset(),
                    Err(error) => {
                        tracing::warn!(error = %error, uid, "failed to load conversation history");
                        self.conversation.reset();
                    }
                }
                self.balance.fetch(self.api.as_ref()).await;
            }
            IdentityTransition::SignedOut => {
                self.balance.clear();
                self.conversation.reset();
                *self.lock_uid() = None;
                if let Err(error) = self.store.clear_session() {
                    tracing::warn!(error = %error, "failed to clear persisted session");
                }
            }
            IdentityTransition::Updated => self.persist_session_summary(),
            IdentityTransition::Unchanged => {}
        }
        transition
    }

    /// Restore the persisted session at startup. The restored session is
    /// authenticated but never ready; requests wait for the identity
    /// provider to confirm it via `handle_identity_change`.
    pub fn restore_persisted_session(&self) {
        let summary = match self.store.load_session() {
            Ok(Some(summary)) => summary,
            Ok(None) => return,
            Err(error) => {
                tracing::warn!(error = %error, "failed to load persisted session");
                return;
            }
        };
        let uid = summary.user.as_ref().map(|user| user.uid.clone());
        self.session.restore_summary(summary);
        if let Some(uid) = uid {
            if let Ok(Some(snapshot)) = self.store.load_conversation(&uid) {
                self.conversation.load_snapshot(snapshot);
            }
            *self.lock_uid() = Some(uid);
        }
    }

    /// Send one user turn and persist the updated conversation.
    pub async fn send_message(&self, query: &str) {
        self.conversation.send(self.api.as_ref(), query).await;
        self.persist_active_conversation();
    }

    /// Discard the current conversation and its persisted history.
    pub fn new_conversation(&self) {
        self.conversation.reset();
        let uid = self.lock_uid().clone();
        if let Some(uid) = uid {
            if let Err(error) = self.store.clear_conversation(&uid) {
                tracing::warn!(error = %error, uid, "failed to clear persisted conversation");
            }
        }
    }

    pub fn clear_error(&self) {
        self.conversation.clear_error();
    }

    /// Tab became visible again; revalidate the balance after the debounce
    /// window. The guard's own throttle still applies on top.
    pub fn handle_visibility_visible(&self) {
        self.revalidator
            .schedule(self.balance.clone(), self.api.clone());
    }

    pub async fn refresh_balance(&self) {
        self.balance.fetch(self.api.as_ref()).await;
    }

    pub async fn create_top_up_intent(&self, amount_usd: f64) -> Result<PaymentIntent, RequestError> {
        self.api.create_payment_intent(amount_usd).await
    }

    pub async fn check_health(&self) -> bool {
        self.api.check_health().await
    }

    #[must_use]
    pub fn session(&self) -> Session {
        self.session.snapshot()
    }

    #[must_use]
    pub fn balance_state(&self) -> BalanceState {
        self.balance.state()
    }

    #[must_use]
    pub fn conversation_state(&self) -> ConversationState {
        self.conversation.state()
    }

    fn persist_session_summary(&self) {
        if let Err(error) = self.store.persist_session(&self.session.summary()) {
            tracing::warn!(error = %error, "failed to persist session summary");
        }
    }

    fn persist_active_conversation(&self) {
        let uid = self.lock_uid().clone();
        if let Some(uid) = uid {
            if let Err(error) = self
                .store
                .persist_conversation(&uid, &self.conversation.snapshot())
            {
                tracing::warn!(error = %error, uid, "failed to persist conversation");
            }
        }
    }

    fn lock_uid(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.active_uid
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;
    use async_trait::async_trait;
    use axum::{Json, Router, extract::State, http::HeaderMap, http::StatusCode, routing::get, routing::post};
    use serde_json::{Value, json};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    use council_client_core::{ConversationSnapshot, InMemoryStateStore, Message, Role};

    use super::*;

    #[derive(Clone)]
    struct StubState {
        balance_hits: Arc<AtomicUsize>,
        balance: Arc<Mutex<i64>>,
        reject_all: Arc<std::sync::atomic::AtomicBool>,
    }

    impl Default for StubState {
        fn default() -> Self {
            Self {
                balance_hits: Arc::new(AtomicUsize::new(0)),
                balance: Arc::new(Mutex::new(1000)),
                reject_all: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            }
        }
    }

    async fn balance_handler(
        State(state): State<StubState>,
        headers: HeaderMap,
    ) -> axum::response::Response {
        use axum::response::IntoResponse;
        state.balance_hits.fetch_add(1, Ordering::SeqCst);
        if state.reject_all.load(Ordering::SeqCst) || !headers.contains_key("authorization") {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        let balance = *state.balance.lock().unwrap_or_else(|p| p.into_inner());
        Json(json!({"balance_minor_units": balance})).into_response()
    }

    async fn orchestrator_handler(
        State(state): State<StubState>,
        Json(payload): Json<Value>,
    ) -> axum::response::Response {
        use axum::response::IntoResponse;
        if state.reject_all.load(Ordering::SeqCst) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        let conversation_id = payload
            .get("conversation_id")
            .and_then(|v| v.as_str())
            .unwrap_or("conv-1");
        Json(json!({
            "turns": [{"content": "the council has spoken", "conversation_id": conversation_id}],
            "balance": {"balance_minor_units": 900}
        }))
        .into_response()
    }

    struct Stub {
        base_url: String,
        state: StubState,
        shutdown: Option<oneshot::Sender<()>>,
    }

    impl Stub {
        async fn stop(mut self) {
            if let Some(shutdown) = self.shutdown.take() {
                let _ = shutdown.send(());
            }
        }
    }

    async fn spawn_stub() -> Result<Stub> {
        let state = StubState::default();
        let app = Router::new()
            .route("/orchestrator", post(orchestrator_handler))
            .route("/users/me/balance", get(balance_handler))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            let _ = server.await;
        });

        Ok(Stub {
            base_url: format!("http://{addr}"),
            state,
            shutdown: Some(shutdown_tx),
        })
    }

    struct StaticTokens;

    #[async_trait]
    impl TokenProvider for StaticTokens {
        async fn current_token(&self, _force_refresh: bool) -> Option<String> {
            Some("T1".to_string())
        }

        fn is_ready(&self) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct CountingExpired {
        calls: AtomicUsize,
    }

    impl SessionExpiredHandler for CountingExpired {
        fn on_session_expired(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn profile(uid: &str) -> UserProfile {
        UserProfile {
            uid: uid.to_string(),
            email: None,
            display_name: None,
            photo_url: None,
            email_verified: true,
        }
    }

    fn client_for(base_url: &str, store: Arc<InMemoryStateStore>) -> (CouncilClient, Arc<CountingExpired>) {
        let config = GatewayConfig::new(base_url).expect("config");
        let expired = Arc::new(CountingExpired::default());
        let client = CouncilClient::new(&config, Arc::new(StaticTokens), expired.clone(), store);
        (client, expired)
    }

    #[tokio::test]
    async fn sign_in_persists_summary_and_fetches_balance() -> Result<()> {
        let stub = spawn_stub().await?;
        let store = Arc::new(InMemoryStateStore::new());
        let (client, _) = client_for(&stub.base_url, store.clone());

        let transition = client.handle_identity_change(Some(profile("alice"))).await;
        assert_eq!(
            transition,
            IdentityTransition::SignedIn {
                uid: "alice".to_string()
            }
        );

        let persisted = store.load_session().expect("load").expect("present");
        assert_eq!(persisted.user.expect("user").uid, "alice");

        let balance = client.balance_state();
        assert_eq!(
            balance.balance.expect("fetched").balance_minor_units,
            1000
        );
        assert!(!balance.needs_top_up);

        stub.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn account_switch_loads_the_new_users_history() -> Result<()> {
        let stub = spawn_stub().await?;
        let store = Arc::new(InMemoryStateStore::new());
        store
            .persist_conversation(
                "bob",
                &ConversationSnapshot {
                    conversation_id: Some("bobs-thread".to_string()),
                    messages: vec![Message::new(Role::User, "earlier question".to_string())],
                },
            )
            .expect("seed");
        let (client, _) = client_for(&stub.base_url, store);

        client.handle_identity_change(Some(profile("alice"))).await;
        client.send_message("hello council").await;
        assert_eq!(client.conversation_state().messages.len(), 2);

        client.handle_identity_change(Some(profile("bob"))).await;
        let state = client.conversation_state();
        assert_eq!(state.conversation_id.as_deref(), Some("bobs-thread"));
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[0].content, "earlier question");

        stub.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn send_message_persists_and_adopts_conversation_id() -> Result<()> {
        let stub = spawn_stub().await?;
        let store = Arc::new(InMemoryStateStore::new());
        let (client, _) = client_for(&stub.base_url, store.clone());
        client.handle_identity_change(Some(profile("alice"))).await;

        client.send_message("hello council").await;

        let state = client.conversation_state();
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.conversation_id.as_deref(), Some("conv-1"));
        assert_eq!(state.error, None);

        // Balance piggybacked on the reply replaces the fetched one.
        assert_eq!(
            client.balance_state().balance.expect("balance").balance_minor_units,
            900
        );

        let persisted = store
            .load_conversation("alice")
            .expect("load")
            .expect("present");
        assert_eq!(persisted.messages.len(), 2);

        stub.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn sign_out_clears_session_scoped_state_but_keeps_history() -> Result<()> {
        let stub = spawn_stub().await?;
        let store = Arc::new(InMemoryStateStore::new());
        let (client, _) = client_for(&stub.base_url, store.clone());
        client.handle_identity_change(Some(profile("alice"))).await;
        client.send_message("hello council").await;

        let transition = client.handle_identity_change(None).await;
        assert_eq!(transition, IdentityTransition::SignedOut);

        assert!(client.conversation_state().messages.is_empty());
        assert_eq!(client.balance_state(), BalanceState::default());
        assert_eq!(store.load_session().expect("load"), None);
        assert!(
            store.load_conversation("alice").expect("load").is_some(),
            "history survives sign-out for the next sign-in"
        );

        stub.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn expired_session_resets_everything_once() -> Result<()> {
        let stub = spawn_stub().await?;
        let store = Arc::new(InMemoryStateStore::new());
        let (client, expired) = client_for(&stub.base_url, store.clone());
        client.handle_identity_change(Some(profile("alice"))).await;
        client.send_message("hello council").await;

        stub.state.reject_all.store(true, Ordering::SeqCst);
        client.send_message("one more").await;

        assert_eq!(expired.calls.load(Ordering::SeqCst), 1);
        assert!(!client.session().is_authenticated());
        assert!(
            client.conversation_state().messages.is_empty(),
            "conversation reset by the expiration cascade"
        );
        assert_eq!(store.load_session().expect("load"), None);

        stub.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn restored_session_is_authenticated_but_not_ready() -> Result<()> {
        let stub = spawn_stub().await?;
        let store = Arc::new(InMemoryStateStore::new());
        {
            let (client, _) = client_for(&stub.base_url, store.clone());
            client.handle_identity_change(Some(profile("alice"))).await;
            client.send_message("hello council").await;
        }

        let (client, _) = client_for(&stub.base_url, store);
        client.restore_persisted_session();

        let session = client.session();
        assert!(session.is_authenticated());
        assert!(!session.auth_ready, "readiness waits for the provider");
        assert_eq!(
            client.conversation_state().messages.len(),
            2,
            "history restored alongside the session"
        );

        stub.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn new_conversation_drops_persisted_history() -> Result<()> {
        let stub = spawn_stub().await?;
        let store = Arc::new(InMemoryStateStore::new());
        let (client, _) = client_for(&stub.base_url, store.clone());
        client.handle_identity_change(Some(profile("alice"))).await;
        client.send_message("hello council").await;

        client.new_conversation();

        assert!(client.conversation_state().messages.is_empty());
        assert_eq!(client.conversation_state().conversation_id, None);
        assert_eq!(store.load_conversation("alice").expect("load"), None);

        stub.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn visibility_burst_collapses_into_one_fetch() -> Result<()> {
        let stub = spawn_stub().await?;
        let store = Arc::new(InMemoryStateStore::new());
        let (client, _) = client_for(&stub.base_url, store);
        client.handle_identity_change(Some(profile("alice"))).await;
        let fetches_after_sign_in = stub.state.balance_hits.load(Ordering::SeqCst);

        client.handle_visibility_visible();
        client.handle_visibility_visible();
        client.handle_visibility_visible();
        tokio::time::sleep(VISIBILITY_DEBOUNCE * 3).await;

        // The first two events were aborted by the third; the survivor is
        // then dropped by the guard's 15s throttle (sign-in just fetched).
        assert_eq!(
            stub.state.balance_hits.load(Ordering::SeqCst),
            fetches_after_sign_in
        );

        stub.stop().await;
        Ok(())
    }
}
