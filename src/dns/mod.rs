//! DNS-related modules.

pub mod blocker;
pub mod forwarder;

pub use blocker::{BLOCK_ADDRESS, blocked_response};
pub use forwarder::{DEFAULT_FORWARD_TIMEOUT, DnsForwarder, ForwardError, UpstreamForwarder};
