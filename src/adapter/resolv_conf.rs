//! resolv.conf backend.
//!
//! The file is treated as a single adapter, named after its path, whose DNS
//! list is the sequence of `nameserver` lines. Rewriting keeps every other
//! line in place and puts the new `nameserver` block where the first one was.
//! The file is replaced atomically and keeps its permissions; a symlinked
//! resolv.conf is written through to its target.

use std::fs;
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::{AdapterBackend, AdapterSnapshot};
use crate::error::{Error, Result};

/// Default resolver configuration file on unix systems.
pub const DEFAULT_RESOLV_CONF: &str = "/etc/resolv.conf";

#[derive(Debug, Clone)]
pub struct ResolvConfBackend {
    path: PathBuf,
}

impl ResolvConfBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn adapter_name(&self) -> String {
        self.path.display().to_string()
    }
}

impl Default for ResolvConfBackend {
    fn default() -> Self {
        Self::new(DEFAULT_RESOLV_CONF)
    }
}

impl AdapterBackend for ResolvConfBackend {
    fn enumerate(&self) -> Result<AdapterSnapshot> {
        let content = fs::read_to_string(&self.path)
            .map_err(|err| Error::AdapterEnumeration(format!("{}: {err}", self.path.display())))?;

        let mut snapshot = AdapterSnapshot::new();
        snapshot.insert(self.adapter_name(), parse_nameservers(&content));
        Ok(snapshot)
    }

    fn set_dns(&self, adapter: &str, servers: &[IpAddr]) -> Result<()> {
        let write_error = |reason: String| Error::AdapterWrite {
            adapter: adapter.to_string(),
            reason,
        };

        if adapter != self.adapter_name() {
            return Err(write_error("unknown adapter".into()));
        }

        let content = fs::read_to_string(&self.path).map_err(|err| write_error(err.to_string()))?;
        replace_file(&self.path, &rewrite_nameservers(&content, servers))
            .map_err(|err| write_error(err.to_string()))
    }
}

/// Write through a temporary file in the target's directory, then rename.
fn replace_file(path: &Path, content: &str) -> io::Result<()> {
    let target = fs::canonicalize(path)?;
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let permissions = fs::metadata(&target)?.permissions();

    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(content.as_bytes())?;
    file.flush()?;
    fs::set_permissions(file.path(), permissions)?;
    file.persist(&target)?;
    Ok(())
}

fn nameserver_value(line: &str) -> Option<&str> {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("nameserver") => parts.next(),
        _ => None,
    }
}

/// Extract the `nameserver` addresses, skipping unparsable entries.
pub fn parse_nameservers(content: &str) -> Vec<IpAddr> {
    content
        .lines()
        .filter_map(nameserver_value)
        .filter_map(|value| {
            // scoped IPv6 entries look like fe80::1%eth0
            let value = value.split('%').next().unwrap_or(value);
            value.parse().ok()
        })
        .collect()
}

/// Replace the `nameserver` lines with `servers`.
pub fn rewrite_nameservers(content: &str, servers: &[IpAddr]) -> String {
    let block: Vec<String> = servers
        .iter()
        .map(|server| format!("nameserver {server}"))
        .collect();

    let mut lines = Vec::new();
    let mut inserted = false;
    for line in content.lines() {
        if nameserver_value(line).is_some() {
            if !inserted {
                lines.extend(block.iter().cloned());
                inserted = true;
            }
            continue;
        }
        lines.push(line.to_string());
    }
    if !inserted {
        lines.extend(block);
    }

    let mut rewritten = lines.join("\n");
    rewritten.push('\n');
    rewritten
}
