//! echogate: an LLM gateway proxy with a semantic response cache.
//!
//! Clients point an OpenAI-compatible SDK at the gateway and present a
//! gateway-issued project key. The gateway authenticates, enforces rate and
//! quota limits, answers from the semantic cache when it can, and otherwise
//! forwards to the configured provider with the customer's own key, teeing
//! streams into the cache and fanning usage out to the analytics store.

pub mod admin;
pub mod api_types;
pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod limits;
pub mod models;
pub mod pricing;
pub mod providers;
pub mod routes;
pub mod store;
pub mod streaming;
pub mod telemetry;
#[cfg(test)]
mod tests;
pub mod vault;

pub use config::Config;
pub use error::GatewayError;
pub use gateway::AppState;
