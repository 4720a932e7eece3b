//! Error types for the nullroute DNS interceptor.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Main error type for nullroute operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The listening socket could not be acquired.
    #[error("cannot bind DNS listener on {addr}: {hint}")]
    Bind {
        addr: SocketAddr,
        hint: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to enumerate network adapters: {0}")]
    AdapterEnumeration(String),

    #[error("failed to set DNS servers for adapter {adapter:?}: {reason}")]
    AdapterWrite { adapter: String, reason: String },

    #[error("DNS snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("DNS protocol error: {0}")]
    Protocol(#[from] hickory_proto::error::ProtoError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("metrics error: {0}")]
    Metrics(String),
}

impl Error {
    /// Build a [`Error::Bind`] with a hint matching the failure kind.
    pub fn bind(addr: SocketAddr, source: io::Error) -> Self {
        let hint = match source.kind() {
            io::ErrorKind::AddrInUse => {
                "the port is already in use, stop the other DNS service listening on it"
            }
            io::ErrorKind::PermissionDenied => {
                "permission denied, run with administrator (root) privileges"
            }
            io::ErrorKind::AddrNotAvailable => "the address is not assigned to any local interface",
            _ => "check administrator privileges and that nothing else listens on this port",
        };
        Self::Bind { addr, hint, source }
    }
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[source] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
}

/// Validation errors for configuration values.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("forward_timeout_ms must be greater than 0")]
    ZeroForwardTimeout,

    #[error("drain_timeout_ms must be greater than 0")]
    ZeroDrainTimeout,

    #[error("group name cannot be empty")]
    EmptyGroupName,

    #[error("group {group:?} contains an empty domain")]
    EmptyGroupDomain { group: String },

    #[error("system_dns.snapshot_path cannot be empty")]
    EmptySnapshotPath,
}

/// Errors reading or writing the persisted adapter snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("I/O error on {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed snapshot in {path:?}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to replace snapshot file")]
    Persist(#[from] tempfile::PersistError),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;
