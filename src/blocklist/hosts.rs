//! Hosts file mirroring for kernel-level block groups.
//!
//! Groups flagged `managed_at_kernel_level` are also written to the OS hosts
//! file so they apply even to programs that bypass the configured DNS server.
//! Entries owned by this tool use [`KERNEL_BLOCK_IP`]:
//!
//! ```text
//! 127.0.0.2 ads.example.com
//! ```
//!
//! Lines mapping any other address are never touched.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;

use super::BlockGroup;

/// Address written for kernel-level entries.
pub const KERNEL_BLOCK_IP: &str = "127.0.0.2";

/// Error type for hosts file operations.
#[derive(Debug, thiserror::Error)]
pub enum HostsError {
    #[error("cannot read {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot write {path:?}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Default hosts file location for the current platform.
pub fn default_hosts_path() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\Windows\System32\drivers\etc\hosts")
    } else {
        PathBuf::from("/etc/hosts")
    }
}

/// A hosts file on disk.
#[derive(Debug, Clone)]
pub struct HostsFile {
    path: PathBuf,
}

impl HostsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bring the file in line with the group's enabled state.
    ///
    /// Groups that are not kernel-level are ignored. Returns whether the file
    /// was rewritten.
    pub async fn apply_group(&self, group: &BlockGroup) -> Result<bool, HostsError> {
        if !group.managed_at_kernel_level {
            return Ok(false);
        }

        let content = fs::read_to_string(&self.path)
            .await
            .map_err(|source| HostsError::Read {
                path: self.path.clone(),
                source,
            })?;

        let Some(patched) = patch_hosts(&content, &group.domains, group.enabled) else {
            tracing::debug!(group = %group.name, "hosts file already up to date");
            return Ok(false);
        };

        fs::write(&self.path, patched)
            .await
            .map_err(|source| HostsError::Write {
                path: self.path.clone(),
                source,
            })?;

        tracing::info!(
            group = %group.name,
            enabled = group.enabled,
            path = ?self.path,
            "hosts file updated"
        );
        Ok(true)
    }
}

/// Add or remove kernel-level entries for `domains`.
///
/// Returns `None` when nothing changes.
pub fn patch_hosts<S: AsRef<str>>(content: &str, domains: &[S], enable: bool) -> Option<String> {
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    let mut changed = false;

    if enable {
        for domain in domains {
            let domain = domain.as_ref().trim();
            if domain.is_empty() || lines.iter().any(|line| owns_domain(line, domain)) {
                continue;
            }
            tracing::info!(domain = %domain, "adding kernel host entry");
            lines.push(format!("{KERNEL_BLOCK_IP} {domain}"));
            changed = true;
        }
    } else {
        lines.retain(|line| {
            let owned = domains
                .iter()
                .any(|domain| owns_domain(line, domain.as_ref().trim()));
            if owned {
                tracing::info!(entry = %line.trim(), "removing kernel host entry");
                changed = true;
            }
            !owned
        });
    }

    if !changed {
        return None;
    }

    let mut patched = lines.join("\n");
    patched.push('\n');
    Some(patched)
}

/// Whether the line is one of our entries for `domain`.
fn owns_domain(line: &str, domain: &str) -> bool {
    let line = line.split('#').next().unwrap_or_default();
    let mut parts = line.split_whitespace();

    parts.next() == Some(KERNEL_BLOCK_IP)
        && parts.any(|host| host.eq_ignore_ascii_case(domain))
}
