//! Authenticated request gateway: the single chokepoint for outbound calls.
//!
//! Attaches bearer tokens, normalizes failures into `RequestError`, and
//! coordinates a single shared refresh-and-retry cycle when concurrent
//! requests hit 401 at the same time.

use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::Method;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use council_client_core::{RequestError, SessionExpiredHandler, SessionHandle, TokenProvider};

use crate::config::GatewayConfig;

/// Endpoints that are callable without a session. Everything else gets a
/// bearer token when one is available.
const UNAUTHENTICATED_PATHS: &[&str] = &["/health"];

fn requires_auth(path: &str) -> bool {
    !UNAUTHENTICATED_PATHS
        .iter()
        .any(|allowed| path == *allowed || path.starts_with(&format!("{allowed}/")))
}

enum RefreshState {
    Idle,
    /// Waiters registered while a refresh is in flight, released in
    /// registration order once it resolves.
    InFlight(Vec<oneshot::Sender<Result<String, RequestError>>>),
}

struct RefreshOutcome {
    token: Result<String, RequestError>,
    /// True for the caller that actually performed the refresh; only that
    /// caller fires the failure cascade, so N concurrent failures cascade
    /// once.
    was_refresher: bool,
}

struct RefreshCoordinator {
    state: Arc<Mutex<RefreshState>>,
}

impl RefreshCoordinator {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RefreshState::Idle)),
        }
    }

    /// Join an in-flight refresh or start one. The token round trip runs on
    /// a detached task that always drains the queue back to `Idle`, so a
    /// caller cancelled mid-refresh (an aborted balance revalidation, a
    /// dropped request future) can never leave the state wedged in flight.
    /// Every registrant, the starter included, receives the outcome through
    /// its own channel, in registration order.
    async fn refresh(&self, tokens: Arc<dyn TokenProvider>) -> RefreshOutcome {
        let (rx, was_refresher) = {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let (tx, rx) = oneshot::channel();
            match &mut *state {
                RefreshState::InFlight(waiters) => {
                    waiters.push(tx);
                    (rx, false)
                }
                RefreshState::Idle => {
                    *state = RefreshState::InFlight(vec![tx]);
                    (rx, true)
                }
            }
        };

        if was_refresher {
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                let token = match tokens.current_token(true).await {
                    Some(token) => Ok(token),
                    None => Err(RequestError::unauthorized("token refresh failed")),
                };
                let waiters = {
                    let mut state = state
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    match mem::replace(&mut *state, RefreshState::Idle) {
                        RefreshState::InFlight(waiters) => waiters,
                        RefreshState::Idle => Vec::new(),
                    }
                };
                for waiter in waiters {
                    let _ = waiter.send(token.clone());
                }
            });
        }

        let token = rx
            .await
            .unwrap_or_else(|_| Err(RequestError::unauthorized("token refresh was abandoned")));
        RefreshOutcome {
            token,
            was_refresher,
        }
    }
}

pub struct ApiGateway {
    base_url: String,
    timeout: Duration,
    http: reqwest::Client,
    session: SessionHandle,
    tokens: Arc<dyn TokenProvider>,
    expired: Arc<dyn SessionExpiredHandler>,
    refresh: RefreshCoordinator,
}

impl ApiGateway {
    #[must_use]
    pub fn new(
        config: &GatewayConfig,
        session: SessionHandle,
        tokens: Arc<dyn TokenProvider>,
        expired: Arc<dyn SessionExpiredHandler>,
    ) -> Self {
        Self {
            base_url: config.base_url.clone(),
            timeout: config.timeout,
            http: reqwest::Client::new(),
            session,
            tokens,
            expired,
            refresh: RefreshCoordinator::new(),
        }
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RequestError> {
        let response = self.send(Method::GET, path, None, self.timeout).await?;
        decode_json_response(response).await
    }

    pub async fn post_json<Req, Res>(&self, path: &str, payload: &Req) -> Result<Res, RequestError>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        self.post_json_with_timeout(path, payload, self.timeout)
            .await
    }

    pub async fn post_json_with_timeout<Req, Res>(
        &self,
        path: &str,
        payload: &Req,
        timeout: Duration,
    ) -> Result<Res, RequestError>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let body = serde_json::to_value(payload)
            .map_err(|error| RequestError::decode(error.to_string()))?;
        let response = self.send(Method::POST, path, Some(body), timeout).await?;
        decode_json_response(response).await
    }

    /// Issue one logical request: attach a token (unless allow-listed), and
    /// on a first 401 join-or-run the shared refresh cycle and replay once
    /// with the fresh token. A second 401 is terminal and expires the
    /// session; it is never retried again.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        timeout: Duration,
    ) -> Result<reqwest::Response, RequestError> {
        let url = self.endpoint(path);
        let authenticated = requires_auth(path);

        let token = if authenticated {
            let token = self.tokens.current_token(false).await;
            if token.is_none() {
                // Proceed anyway; the server answers 401 and the refresh
                // path below takes over. Authorization is enforced
                // server-side, not here.
                if self.tokens.is_ready() {
                    tracing::warn!(path, "no token available, request may fail with 401");
                } else {
                    tracing::warn!(path, "token provider not ready, request may fail with 401");
                }
            }
            token
        } else {
            None
        };

        let response = self
            .dispatch(&method, &url, body.as_ref(), timeout, token.as_deref())
            .await?;
        if response.status().as_u16() != 401 || !authenticated {
            return Ok(response);
        }

        // First 401 for this logical request (attempt 0): refresh and replay
        // exactly once, with an explicit attempt count rather than a mutable
        // retried flag on a shared request object.
        let outcome = self.refresh.refresh(Arc::clone(&self.tokens)).await;
        let fresh = match outcome.token {
            Ok(token) => token,
            Err(error) => {
                if outcome.was_refresher {
                    self.expire_session();
                }
                return Err(error);
            }
        };

        let retried = self
            .dispatch(&method, &url, body.as_ref(), timeout, Some(&fresh))
            .await?;
        if retried.status().as_u16() == 401 {
            // A fresh token was still rejected: the session is unrecoverable
            // client-side.
            self.expire_session();
            return Err(RequestError::unauthorized(
                "authorization failed after token refresh",
            ));
        }
        Ok(retried)
    }

    async fn dispatch(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Value>,
        timeout: Duration,
        token: Option<&str>,
    ) -> Result<reqwest::Response, RequestError> {
        let mut request = self
            .http
            .request(method.clone(), url)
            .header("x-request-id", format!("req_{}", Uuid::new_v4().simple()))
            .timeout(timeout);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        request.send().await.map_err(normalize_transport_error)
    }

    fn expire_session(&self) {
        if self.session.expire() {
            tracing::warn!("session expired after failed token refresh, signing out");
            self.expired.on_session_expired();
        }
    }
}

fn normalize_transport_error(error: reqwest::Error) -> RequestError {
    if error.is_timeout() {
        RequestError {
            message: "request timed out".to_string(),
            code: Some("timeout".to_string()),
            status: None,
        }
    } else {
        RequestError::transport(error.to_string())
    }
}

pub(crate) async fn decode_json_response<T>(response: reqwest::Response) -> Result<T, RequestError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|error| RequestError::transport(error.to_string()))?;

    if !status.is_success() {
        return Err(RequestError::http(
            status.as_u16(),
            extract_error_message(&bytes),
        ));
    }

    serde_json::from_slice::<T>(&bytes).map_err(|error| RequestError::decode(error.to_string()))
}

/// Pull the human-readable message out of an error body when the backend
/// sent one; otherwise fall back to a generic line.
fn extract_error_message(body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        for key in ["message", "error"] {
            if let Some(message) = value.get(key).and_then(|v| v.as_str()) {
                if !message.trim().is_empty() {
                    return message.to_string();
                }
            }
        }
    }
    "request failed".to_string()
}
