//! Typed clients for the council backend resources, layered on the gateway.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use council_client_core::error::CODE_AMOUNT_OUT_OF_RANGE;
use council_client_core::{
    AssistantTurn, BalanceSnapshot, BalanceSource, Orchestrator, OrchestratorReply, RequestError,
};

use crate::gateway::ApiGateway;

pub const ORCHESTRATOR_PATH: &str = "/orchestrator";
pub const BALANCE_PATH: &str = "/users/me/balance";
pub const PAYMENT_INTENT_PATH: &str = "/payments/create-payment-intent";
pub const HEALTH_PATH: &str = "/health";

/// Top-up bounds enforced client-side before any network call, in whole US
/// dollars. The backend enforces its own limits; these match the UX range.
pub const MIN_TOP_UP_USD: f64 = 3.0;
pub const MAX_TOP_UP_USD: f64 = 100.0;

#[derive(Debug, Serialize)]
struct OrchestratorRequest<'a> {
    query: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
}

/// Reply shapes the orchestrator endpoint has been observed to send. The
/// canonical contract is an envelope with an array of turns; a bare array and
/// a single turn object (a council of one) are accepted for compatibility.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireReply {
    Envelope {
        turns: Vec<AssistantTurn>,
        #[serde(default)]
        balance: Option<WireBalance>,
    },
    Turns(Vec<AssistantTurn>),
    Single(AssistantTurn),
}

/// Balance as it appears on the wire, both from the balance endpoint and
/// piggybacked on orchestrator replies. `updated_at` is optional; when the
/// backend omits it the receipt time is used.
#[derive(Debug, Deserialize)]
struct WireBalance {
    balance_minor_units: i64,
    #[serde(default)]
    updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl WireBalance {
    fn into_snapshot(self) -> BalanceSnapshot {
        match self.updated_at {
            Some(updated_at) => BalanceSnapshot {
                balance_minor_units: self.balance_minor_units,
                updated_at,
            },
            None => BalanceSnapshot::now(self.balance_minor_units),
        }
    }
}

impl WireReply {
    fn into_reply(self) -> Result<OrchestratorReply, RequestError> {
        let (turns, balance) = match self {
            WireReply::Envelope { turns, balance } => {
                (turns, balance.map(WireBalance::into_snapshot))
            }
            WireReply::Turns(turns) => (turns, None),
            WireReply::Single(turn) => (vec![turn], None),
        };
        if turns.is_empty() {
            return Err(RequestError::decode(
                "orchestrator reply contained no turns",
            ));
        }
        Ok(OrchestratorReply { turns, balance })
    }
}

#[derive(Debug, Serialize)]
struct PaymentIntentRequest {
    amount_usd: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntent {
    pub client_secret: String,
    #[serde(default)]
    pub intent_id: Option<String>,
}

/// Resource-level facade over [`ApiGateway`]: orchestrator queries, balance
/// reads, top-up intents, and the unauthenticated health probe.
pub struct CouncilApi {
    gateway: Arc<ApiGateway>,
    orchestrator_timeout: Duration,
}

impl CouncilApi {
    #[must_use]
    pub fn new(gateway: Arc<ApiGateway>, orchestrator_timeout: Duration) -> Self {
        Self {
            gateway,
            orchestrator_timeout,
        }
    }

    #[must_use]
    pub fn gateway(&self) -> &Arc<ApiGateway> {
        &self.gateway
    }

    /// Create a Stripe payment intent for a top-up of `amount_usd` dollars.
    /// Amounts outside the 3..=100 USD window are rejected without touching
    /// the network.
    pub async fn create_payment_intent(&self, amount_usd: f64) -> Result<PaymentIntent, RequestError> {
        if !amount_usd.is_finite() || amount_usd < MIN_TOP_UP_USD || amount_usd > MAX_TOP_UP_USD {
            return Err(RequestError::validation(
                CODE_AMOUNT_OUT_OF_RANGE,
                format!(
                    "top-up amount must be between ${MIN_TOP_UP_USD:.0} and ${MAX_TOP_UP_USD:.0}"
                ),
            ));
        }
        self.gateway
            .post_json(PAYMENT_INTENT_PATH, &PaymentIntentRequest { amount_usd })
            .await
    }

    /// Probe the backend without authentication. Any 2xx with a decodable
    /// body counts as healthy.
    pub async fn check_health(&self) -> bool {
        self.gateway.get_json::<Value>(HEALTH_PATH).await.is_ok()
    }
}

#[async_trait]
impl Orchestrator for CouncilApi {
    async fn send_query(
        &self,
        query: &str,
        conversation_id: Option<&str>,
    ) -> Result<OrchestratorReply, RequestError> {
        let payload = OrchestratorRequest {
            query,
            conversation_id,
        };
        let wire: WireReply = self
            .gateway
            .post_json_with_timeout(ORCHESTRATOR_PATH, &payload, self.orchestrator_timeout)
            .await?;
        wire.into_reply()
    }
}

#[async_trait]
impl BalanceSource for CouncilApi {
    async fn fetch_balance(&self) -> Result<BalanceSnapshot, RequestError> {
        let wire: WireBalance = self.gateway.get_json(BALANCE_PATH).await?;
        Ok(wire.into_snapshot())
    }
}
