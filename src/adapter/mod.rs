//! System DNS redirection and restoration.
//!
//! Redirection makes the local listener authoritative by prepending its
//! address to every adapter's DNS server list. The pre-redirection lists are
//! persisted first so they can be put back on shutdown, even after a crash.
//!
//! The platform side sits behind [`AdapterBackend`]:
//! - [`ResolvConfBackend`]: a resolv.conf style file
//! - [`PowerShellBackend`]: the Windows `DnsClient` cmdlets

pub mod powershell;
pub mod resolv_conf;
pub mod store;

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use powershell::PowerShellBackend;
pub use resolv_conf::ResolvConfBackend;
pub use store::SnapshotStore;

/// Upstream addresses derived from a snapshot, in first-seen order.
pub type ForwarderList = Vec<IpAddr>;

/// DNS servers per adapter, as captured before redirection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdapterSnapshot {
    adapters: BTreeMap<String, Vec<IpAddr>>,
}

impl AdapterSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, adapter: impl Into<String>, servers: Vec<IpAddr>) {
        self.adapters.insert(adapter.into(), servers);
    }

    pub fn get(&self, adapter: &str) -> Option<&[IpAddr]> {
        self.adapters.get(adapter).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[IpAddr])> {
        self.adapters
            .iter()
            .map(|(name, servers)| (name.as_str(), servers.as_slice()))
    }

    /// Whether any adapter already lists `address`.
    pub fn contains_address(&self, address: IpAddr) -> bool {
        self.adapters
            .values()
            .any(|servers| servers.contains(&address))
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, Vec<IpAddr>)> for AdapterSnapshot {
    fn from_iter<T: IntoIterator<Item = (S, Vec<IpAddr>)>>(iter: T) -> Self {
        Self {
            adapters: iter
                .into_iter()
                .map(|(name, servers)| (name.into(), servers))
                .collect(),
        }
    }
}

/// Platform facility for reading and writing adapter DNS settings.
pub trait AdapterBackend: Send + Sync {
    /// Enumerate IP-enabled adapters and their DNS servers.
    ///
    /// Fails with [`Error::AdapterEnumeration`](crate::Error::AdapterEnumeration).
    fn enumerate(&self) -> Result<AdapterSnapshot>;

    /// Replace one adapter's DNS server list.
    ///
    /// Fails with [`Error::AdapterWrite`](crate::Error::AdapterWrite).
    fn set_dns(&self, adapter: &str, servers: &[IpAddr]) -> Result<()>;
}

impl<B: AdapterBackend + ?Sized> AdapterBackend for Box<B> {
    fn enumerate(&self) -> Result<AdapterSnapshot> {
        (**self).enumerate()
    }

    fn set_dns(&self, adapter: &str, servers: &[IpAddr]) -> Result<()> {
        (**self).set_dns(adapter, servers)
    }
}

/// Collect every address other than `local`, deduplicated, in order.
pub fn forwarders_from(snapshot: &AdapterSnapshot, local: IpAddr) -> ForwarderList {
    let mut forwarders = ForwarderList::new();
    for (_, servers) in snapshot.iter() {
        for server in servers {
            if *server != local && !forwarders.contains(server) {
                forwarders.push(*server);
            }
        }
    }
    forwarders
}

/// Redirects adapters to the local resolver and restores them.
pub struct AdapterController<B> {
    backend: B,
    store: SnapshotStore,
    local: IpAddr,
}

impl<B: AdapterBackend> AdapterController<B> {
    pub fn new(backend: B, store: SnapshotStore, local: IpAddr) -> Self {
        Self {
            backend,
            store,
            local,
        }
    }

    /// Capture the current DNS configuration of every adapter.
    pub fn snapshot(&self) -> Result<AdapterSnapshot> {
        let snapshot = self.backend.enumerate()?;
        for (adapter, servers) in snapshot.iter() {
            tracing::info!(adapter = %adapter, servers = ?servers, "adapter found");
        }
        tracing::info!(count = snapshot.len(), "enumerated adapters");
        Ok(snapshot)
    }

    /// Point every adapter at the local resolver and return the forwarders.
    ///
    /// The snapshot is persisted first, unless some adapter already lists the
    /// local address: that means an earlier redirection was never restored and
    /// the stored backup is the real original.
    ///
    /// Per-adapter failures are logged and do not stop the others. A failed
    /// persist aborts before any adapter is changed.
    pub fn redirect(&self, snapshot: &AdapterSnapshot) -> Result<ForwarderList> {
        if snapshot.contains_address(self.local) {
            tracing::info!(local = %self.local, "local DNS already set, backup not overwritten");
        } else {
            self.persist(snapshot)?;
            tracing::info!(path = ?self.store.path(), "DNS backup saved");
        }

        for (adapter, servers) in snapshot.iter() {
            if servers.contains(&self.local) {
                tracing::info!(adapter = %adapter, local = %self.local, "adapter already redirected");
                continue;
            }

            let mut redirected = Vec::with_capacity(servers.len() + 1);
            redirected.push(self.local);
            redirected.extend_from_slice(servers);

            match self.backend.set_dns(adapter, &redirected) {
                Ok(()) => {
                    tracing::info!(adapter = %adapter, servers = ?redirected, "adapter DNS redirected");
                }
                Err(err) => {
                    tracing::warn!(adapter = %adapter, error = %err, "failed to redirect adapter DNS");
                }
            }
        }

        let forwarders = forwarders_from(snapshot, self.local);
        if forwarders.is_empty() {
            tracing::warn!("no upstream DNS servers found, forwarded queries will be dropped");
        }
        Ok(forwarders)
    }

    pub fn persist(&self, snapshot: &AdapterSnapshot) -> Result<()> {
        Ok(self.store.persist(snapshot)?)
    }

    pub fn load(&self) -> Result<Option<AdapterSnapshot>> {
        Ok(self.store.load()?)
    }

    /// Re-apply the persisted DNS lists.
    ///
    /// No persisted snapshot is not an error. Adapters whose original list
    /// was empty are left alone. Returns the number of adapters restored.
    pub fn restore(&self) -> Result<usize> {
        let Some(snapshot) = self.load()? else {
            tracing::debug!(path = ?self.store.path(), "no DNS backup to restore");
            return Ok(0);
        };

        let mut restored = 0;
        for (adapter, servers) in snapshot.iter() {
            if servers.is_empty() {
                continue;
            }
            match self.backend.set_dns(adapter, servers) {
                Ok(()) => {
                    restored += 1;
                    tracing::info!(adapter = %adapter, servers = ?servers, "adapter DNS restored");
                }
                Err(err) => {
                    tracing::warn!(adapter = %adapter, error = %err, "failed to restore adapter DNS");
                }
            }
        }
        Ok(restored)
    }
}
