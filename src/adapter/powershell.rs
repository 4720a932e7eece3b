//! Windows backend driving the `DnsClient` PowerShell cmdlets.

use std::net::IpAddr;
use std::process::Command;

use serde::Deserialize;

use super::{AdapterBackend, AdapterSnapshot};
use crate::error::{Error, Result};

const ENUMERATE_SCRIPT: &str = "Get-DnsClientServerAddress -AddressFamily IPv4 \
    | Where-Object { (Get-NetIPInterface -InterfaceIndex $_.InterfaceIndex -AddressFamily IPv4).ConnectionState -eq 'Connected' } \
    | Select-Object InterfaceAlias, ServerAddresses \
    | ConvertTo-Json -Compress";

#[derive(Debug, Clone, Default)]
pub struct PowerShellBackend;

#[derive(Debug, Deserialize)]
struct InterfaceDns {
    #[serde(rename = "InterfaceAlias")]
    alias: String,
    #[serde(rename = "ServerAddresses", default)]
    servers: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(InterfaceDns),
    Many(Vec<InterfaceDns>),
}

impl PowerShellBackend {
    fn run(script: &str) -> std::result::Result<String, String> {
        let output = Command::new("powershell")
            .args(["-NoProfile", "-NonInteractive", "-Command", script])
            .output()
            .map_err(|err| err.to_string())?;

        if !output.status.success() {
            return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl AdapterBackend for PowerShellBackend {
    fn enumerate(&self) -> Result<AdapterSnapshot> {
        let stdout = Self::run(ENUMERATE_SCRIPT).map_err(Error::AdapterEnumeration)?;
        parse_interfaces(&stdout)
    }

    fn set_dns(&self, adapter: &str, servers: &[IpAddr]) -> Result<()> {
        Self::run(&set_dns_script(adapter, servers)).map_err(|reason| Error::AdapterWrite {
            adapter: adapter.to_string(),
            reason,
        })?;
        Ok(())
    }
}

/// Parse the JSON emitted by the enumeration script.
///
/// `ConvertTo-Json` emits a bare object for a single interface and nothing at
/// all for none.
pub fn parse_interfaces(json: &str) -> Result<AdapterSnapshot> {
    let json = json.trim();
    if json.is_empty() {
        return Ok(AdapterSnapshot::new());
    }

    let rows = match serde_json::from_str(json)
        .map_err(|err| Error::AdapterEnumeration(format!("unexpected cmdlet output: {err}")))?
    {
        OneOrMany::One(row) => vec![row],
        OneOrMany::Many(rows) => rows,
    };

    Ok(rows
        .into_iter()
        .map(|row| {
            let servers: Vec<IpAddr> = row
                .servers
                .unwrap_or_default()
                .iter()
                .filter_map(|server| server.parse().ok())
                .collect();
            (row.alias, servers)
        })
        .collect())
}

fn set_dns_script(adapter: &str, servers: &[IpAddr]) -> String {
    let alias = quote(adapter);
    if servers.is_empty() {
        return format!("Set-DnsClientServerAddress -InterfaceAlias {alias} -ResetServerAddresses");
    }
    let list = servers
        .iter()
        .map(|server| quote(&server.to_string()))
        .collect::<Vec<_>>()
        .join(",");
    format!("Set-DnsClientServerAddress -InterfaceAlias {alias} -ServerAddresses @({list})")
}

/// Single-quoted PowerShell literal.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
