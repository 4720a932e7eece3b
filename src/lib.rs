//! nullroute - a local DNS interceptor that null-routes domain groups.
//!
//! nullroute listens on a loopback address, points the system resolver
//! configuration at itself, and answers queries for names in enabled block
//! groups with `0.0.0.0`. Everything else is relayed to the upstream servers
//! the adapters were using before redirection.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`config`]: Configuration loading and validation
//! - [`blocklist`]: Block groups, the suffix index and its hot swapping
//! - [`adapter`]: System DNS redirection and restoration
//! - [`dns`]: Block responses and upstream forwarding
//! - [`server`]: Query routing and the UDP listener
//! - [`metrics`]: Prometheus counters
//! - [`error`]: Error types
//!
//! # Testing
//!
//! The network and platform seams are traits ([`dns::DnsForwarder`],
//! [`adapter::AdapterBackend`]) so the routing and redirection logic can be
//! exercised without touching real adapters:
//!
//! ```rust
//! use nullroute::blocklist::{BlockGroup, BlocklistManager};
//!
//! let manager = BlocklistManager::new([
//!     BlockGroup::new("ads", ["example.com"]).enabled(true),
//! ]);
//! assert!(manager.current().is_blocked("ads.example.com"));
//! ```

pub mod adapter;
pub mod blocklist;
pub mod config;
pub mod dns;
pub mod error;
pub mod metrics;
pub mod server;

pub use config::Config;
pub use error::{Error, Result};
