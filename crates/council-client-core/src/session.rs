use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Profile fields mirrored from the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    #[serde(default)]
    pub email_verified: bool,
}

/// Ephemeral process-wide session state.
///
/// `auth_ready` is true only after the identity callback has confirmed a user;
/// it is forced false immediately on sign-out. `initialized` flips true on the
/// first identity callback and stays true.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub user: Option<UserProfile>,
    pub auth_ready: bool,
    pub initialized: bool,
}

impl Session {
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }
}

/// Persisted subset of the session. `auth_ready` is deliberately excluded:
/// it is always recomputed fresh from the identity provider after a reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserProfile>,
    #[serde(default)]
    pub initialized: bool,
}

/// What an identity callback changed, so the app wiring can cascade with
/// explicit method calls instead of implicit store subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityTransition {
    /// A user is now present where none (or a different one) was before.
    SignedIn { uid: String },
    /// The session transitioned from authenticated to signed-out.
    SignedOut,
    /// Same user, refreshed profile fields.
    Updated,
    /// Repeated signed-out callback; nothing to cascade.
    Unchanged,
}

/// Shared session container with a single writer: the identity callback.
#[derive(Debug, Clone, Default)]
pub struct SessionHandle {
    inner: Arc<Mutex<Session>>,
}

impl SessionHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> Session {
        self.lock().clone()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.lock().is_authenticated()
    }

    /// True when a user is present and the session has been marked ready.
    /// Callers that hold an identity handle must additionally check it still
    /// has a current user; any of the three can lag during startup or
    /// sign-out races.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        let session = self.lock();
        session.user.is_some() && session.auth_ready
    }

    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        let session = self.lock();
        SessionSummary {
            user: session.user.clone(),
            initialized: session.initialized,
        }
    }

    /// Apply an identity-change notification and report the transition.
    pub fn apply_identity(&self, user: Option<UserProfile>) -> IdentityTransition {
        let mut session = self.lock();
        session.initialized = true;
        match user {
            Some(user) => {
                let uid = user.uid.clone();
                let was_same = session
                    .user
                    .as_ref()
                    .is_some_and(|previous| previous.uid == uid);
                session.user = Some(user);
                session.auth_ready = true;
                if was_same {
                    IdentityTransition::Updated
                } else {
                    IdentityTransition::SignedIn { uid }
                }
            }
            None => {
                let was_authenticated = session.user.is_some();
                session.user = None;
                session.auth_ready = false;
                if was_authenticated {
                    IdentityTransition::SignedOut
                } else {
                    IdentityTransition::Unchanged
                }
            }
        }
    }

    /// Forced reset, used when a refreshed token is still rejected and the
    /// session is unrecoverable client-side. Returns whether a user was
    /// actually signed in, so concurrent expirations cascade only once.
    pub fn expire(&self) -> bool {
        let mut session = self.lock();
        let was_authenticated = session.user.is_some();
        session.user = None;
        session.auth_ready = false;
        session.initialized = true;
        was_authenticated
    }

    /// Restore a persisted summary at startup. `auth_ready` stays false
    /// until the identity provider confirms the session.
    pub fn restore_summary(&self, summary: SessionSummary) {
        let mut session = self.lock();
        session.user = summary.user;
        session.initialized = summary.initialized;
        session.auth_ready = false;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Session> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Seam over the identity SDK: mint tokens, report readiness.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns a cached token, or round-trips to the identity backend when
    /// `force_refresh` is set. Returns `None` (never errors) when no session
    /// exists or the readiness precondition is unmet.
    async fn current_token(&self, force_refresh: bool) -> Option<String>;

    /// True only when a user is present, the session is marked ready, and
    /// the underlying identity handle still has a current user.
    fn is_ready(&self) -> bool;
}

/// Invoked exactly once when a refreshed token is still rejected; the
/// embedder clears dependent state and navigates to the auth entry point.
pub trait SessionExpiredHandler: Send + Sync {
    fn on_session_expired(&self);
}
