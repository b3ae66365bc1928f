use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RequestError;
use crate::session::SessionHandle;

/// Minimum wall-clock gap between balance fetches. Calls inside the window
/// are dropped silently; latest-value-is-good-enough for a slowly-changing
/// figure.
pub const FETCH_THROTTLE: Duration = Duration::from_secs(15);

/// Remote balance snapshot. Minor units may go negative (tenths of a cent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub balance_minor_units: i64,
    pub updated_at: DateTime<Utc>,
}

impl BalanceSnapshot {
    #[must_use]
    pub fn now(balance_minor_units: i64) -> Self {
        Self {
            balance_minor_units,
            updated_at: Utc::now(),
        }
    }
}

/// Observable guard state for the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalanceState {
    pub balance: Option<BalanceSnapshot>,
    pub needs_top_up: bool,
    pub loading: bool,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct GuardInner {
    state: BalanceState,
    last_attempt: Option<Instant>,
}

/// Seam over the gateway for the balance resource.
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn fetch_balance(&self) -> Result<BalanceSnapshot, RequestError>;
}

/// Cached account balance with throttled refresh and the funds-exhausted
/// gate consulted before every chat send.
#[derive(Clone)]
pub struct BalanceGuard {
    session: SessionHandle,
    throttle: Duration,
    inner: Arc<Mutex<GuardInner>>,
}

impl BalanceGuard {
    #[must_use]
    pub fn new(session: SessionHandle) -> Self {
        Self::with_throttle(session, FETCH_THROTTLE)
    }

    #[must_use]
    pub fn with_throttle(session: SessionHandle, throttle: Duration) -> Self {
        Self {
            session,
            throttle,
            inner: Arc::new(Mutex::new(GuardInner::default())),
        }
    }

    /// True when the account is out of funds and the send path must be
    /// blocked. A balance of exactly zero leaves the gate open.
    #[must_use]
    pub fn needs_top_up(&self) -> bool {
        self.lock().state.needs_top_up
    }

    #[must_use]
    pub fn state(&self) -> BalanceState {
        self.lock().state.clone()
    }

    /// Refresh the cached balance. Silently skipped inside the throttle
    /// window or while the session is not ready. A 401 clears the local
    /// balance without surfacing an error (expected during startup races);
    /// any other failure lands in the guard's own error field.
    pub async fn fetch(&self, source: &dyn BalanceSource) {
        {
            let mut inner = self.lock();
            if let Some(last) = inner.last_attempt {
                if last.elapsed() < self.throttle {
                    return;
                }
            }
            if !self.session.is_ready() {
                tracing::debug!("balance fetch skipped: session not ready");
                return;
            }
            inner.last_attempt = Some(Instant::now());
            inner.state.loading = true;
            inner.state.error = None;
        }

        match source.fetch_balance().await {
            Ok(snapshot) => self.apply_snapshot(snapshot),
            Err(error) if error.is_unauthorized() => {
                tracing::warn!("balance fetch returned 401, clearing local balance");
                let mut inner = self.lock();
                inner.state.balance = None;
                inner.state.needs_top_up = false;
                inner.state.loading = false;
                inner.state.error = None;
            }
            Err(error) => {
                tracing::warn!(error = %error, "balance fetch failed");
                let mut inner = self.lock();
                inner.state.loading = false;
                inner.state.error = Some(error.message);
            }
        }
    }

    /// Accept a balance piggybacked on another response (e.g. an
    /// orchestrator reply), avoiding a second round trip. `needs_top_up` is
    /// recomputed together with the amount, never stored independently.
    pub fn apply_snapshot(&self, snapshot: BalanceSnapshot) {
        let mut inner = self.lock();
        inner.state.needs_top_up = snapshot.balance_minor_units < 0;
        inner.state.balance = Some(snapshot);
        inner.state.loading = false;
        inner.state.error = None;
        inner.last_attempt = Some(Instant::now());
    }

    /// Drop everything, including the throttle history. Invoked on sign-out.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.state = BalanceState::default();
        inner.last_attempt = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GuardInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
