//! WebExpose agent
//!
//! Private side of the tunnel: dials the relay, executes forwarded requests
//! against a local HTTP service, and returns the answers.

pub mod agent;
pub mod config;
pub mod proxy;
pub mod tunnel;

pub use agent::ForwardingAgent;
pub use config::{AgentConfig, LocalScheme};
pub use proxy::{HttpService, LocalResponse, LocalService};
