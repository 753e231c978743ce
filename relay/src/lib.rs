//! WebExpose Relay
//!
//! Public side of the tunnel: accepts the agent's WebSocket, turns inbound
//! HTTP requests into correlated tunnel messages, and renders the answers.

pub mod config;
pub mod hub;
pub mod proxy;
pub mod registry;

pub use config::RelayConfig;
pub use hub::{RelayHub, Tunnel};
pub use registry::{CorrelationRegistry, PendingResponse};
