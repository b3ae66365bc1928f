//! Reqwest-backed transport for the council chat client.
//!
//! [`ApiGateway`] is the single authenticated chokepoint; [`CouncilApi`]
//! layers the typed resource calls on top; [`CouncilClient`] assembles the
//! whole stack around the portable core in `council-client-core`.

pub mod client;
pub mod config;
pub mod gateway;
pub mod resources;
pub mod store;

pub use client::{CouncilClient, VISIBILITY_DEBOUNCE};
pub use config::{DEFAULT_API_BASE_URL, ENV_API_BASE_URL, ConfigError, GatewayConfig};
pub use gateway::ApiGateway;
pub use resources::{CouncilApi, MAX_TOP_UP_USD, MIN_TOP_UP_USD, PaymentIntent};
pub use store::FileStateStore;
