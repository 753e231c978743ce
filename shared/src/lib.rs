//! WebExpose Shared Library
//!
//! Wire messages, the error taxonomy and the tunnel endpoint used by both
//! the relay and the forwarding agent.

pub mod endpoint;
pub mod error;
pub mod protocol;

pub use endpoint::{memory_pair, TunnelEndpoint};
pub use error::{Error, Result};
pub use protocol::{CorrelationId, ForwardedRequest, Frame, HeaderMultimap, TargetUri, TunnelResponse};
