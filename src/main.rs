//! nullroute - entry point.
//!
//! Redirects the system DNS configuration to the local listener, serves
//! queries until a shutdown signal arrives, then restores the original
//! settings. `nullroute restore` only performs the restore step, for cleaning
//! up after a crash.
//!
//! On unix, `SIGHUP` reloads the block groups from the configuration file.

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use nullroute::adapter::{
    AdapterBackend, AdapterController, ForwarderList, PowerShellBackend, ResolvConfBackend,
    SnapshotStore,
};
use nullroute::blocklist::BlocklistManager;
use nullroute::blocklist::hosts::HostsFile;
use nullroute::config::{AdapterBackendKind, Config, LoggingConfig};
use nullroute::dns::UpstreamForwarder;
use nullroute::server::{self, ListenerConfig, QueryRouter};

type Controller = AdapterController<Box<dyn AdapterBackend>>;

/// Set up the tracing subscriber, letting `RUST_LOG` win over the config.
fn setup_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let mut filter = config.level.clone();
        if !filter.contains("hickory_proto") {
            filter.push_str(",hickory_proto=off");
        }
        EnvFilter::new(filter)
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn adapter_controller(config: &Config) -> Controller {
    let backend: Box<dyn AdapterBackend> = match config.system_dns.backend {
        AdapterBackendKind::ResolvConf => {
            Box::new(ResolvConfBackend::new(&config.system_dns.resolv_conf))
        }
        AdapterBackendKind::PowerShell => Box::new(PowerShellBackend),
    };

    AdapterController::new(
        backend,
        SnapshotStore::new(&config.system_dns.snapshot_path),
        IpAddr::V4(config.listen_ip),
    )
}

/// Mirror every kernel-level group into the hosts file.
async fn sync_kernel_groups(hosts: &HostsFile, manager: &BlocklistManager) {
    for group in manager.groups() {
        if let Err(err) = hosts.apply_group(&group).await {
            warn!(group = %group.name, error = %err, "failed to update hosts file");
        }
    }
}

/// Redirect the adapters and return their upstreams.
///
/// `None` means the system configuration was left untouched.
fn redirect_system_dns(config: &Config, controller: &Controller) -> Result<Option<ForwarderList>> {
    if !config.system_dns.redirect {
        info!("system DNS redirection disabled");
        return Ok(None);
    }

    let snapshot = match controller.snapshot() {
        Ok(snapshot) => snapshot,
        Err(err) if !config.upstreams.is_empty() => {
            error!(error = %err, "cannot read adapters, using configured upstreams only");
            return Ok(None);
        }
        Err(err) => return Err(err).context("Failed to read system DNS configuration"),
    };

    let forwarders = controller
        .redirect(&snapshot)
        .context("Failed to redirect system DNS")?;
    Ok(Some(forwarders))
}

/// Adapter upstreams first, then configured ones, without the local address.
fn upstream_servers(config: &Config, adapter_forwarders: ForwarderList) -> Vec<SocketAddr> {
    let local = IpAddr::V4(config.listen_ip);
    let mut upstreams = adapter_forwarders;
    for ip in &config.upstreams {
        if *ip != local && !upstreams.contains(ip) {
            upstreams.push(*ip);
        }
    }

    upstreams
        .into_iter()
        .map(|ip| SocketAddr::new(ip, config.upstream_port))
        .collect()
}

async fn reload_groups(config_path: &str, manager: &BlocklistManager, hosts: &HostsFile) {
    match Config::load(config_path) {
        Ok(config) => {
            manager.replace_groups(config.block_groups());
            sync_kernel_groups(hosts, manager).await;
            info!("block groups reloaded");
        }
        Err(err) => {
            warn!(error = %err, "failed to reload configuration, keeping current groups");
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown(config_path: &str, manager: &BlocklistManager, hosts: &HostsFile) {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut terminate), Ok(mut hangup)) =
        (signal(SignalKind::terminate()), signal(SignalKind::hangup()))
    else {
        warn!("failed to install signal handlers, waiting for Ctrl-C only");
        let _ = tokio::signal::ctrl_c().await;
        return;
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down...");
                break;
            }
            _ = terminate.recv() => {
                info!("SIGTERM received, shutting down...");
                break;
            }
            _ = hangup.recv() => reload_groups(config_path, manager, hosts).await,
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_config_path: &str, _manager: &BlocklistManager, _hosts: &HostsFile) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to wait for Ctrl-C");
    }
    info!("Ctrl-C received, shutting down...");
}

async fn serve(
    config: &Config,
    config_path: &str,
    manager: &BlocklistManager,
    hosts: &HostsFile,
    adapter_forwarders: ForwarderList,
) -> Result<()> {
    let servers = upstream_servers(config, adapter_forwarders);
    info!(upstreams = ?servers, "forwarding allowed queries");

    let router = QueryRouter::new(
        manager.index(),
        UpstreamForwarder::new(servers, config.forward_timeout()),
    );
    let listener = ListenerConfig {
        bind_addr: config.listen_addr(),
        drain_timeout: config.drain_timeout(),
    };
    let handle = server::start(listener, router)
        .await
        .context("Failed to start DNS listener")?;

    wait_for_shutdown(config_path, manager, hosts).await;

    if !handle.stop().await {
        warn!("stopped with queries still in flight");
    }
    Ok(())
}

async fn run() -> Result<()> {
    let config_path = std::env::var("CONFIG_PATH")
        .map(Cow::Owned)
        .unwrap_or(Cow::Borrowed("config.toml"));
    let config = Config::load(config_path.as_ref()).context("Failed to load configuration")?;

    setup_logging(&config.logging);
    let controller = adapter_controller(&config);

    if std::env::args().nth(1).as_deref() == Some("restore") {
        let restored = controller
            .restore()
            .context("Failed to restore system DNS")?;
        info!(restored, "system DNS restored");
        return Ok(());
    }

    nullroute::metrics::init(&config.metrics).context("Failed to initialize metrics")?;
    if config.metrics.enabled {
        info!("Metrics enabled on {}", config.metrics.listen);
    }

    let manager = BlocklistManager::new(config.block_groups());
    let hosts = HostsFile::new(&config.hosts_file);
    sync_kernel_groups(&hosts, &manager).await;

    let redirected = redirect_system_dns(&config, &controller)?;
    let result = serve(
        &config,
        config_path.as_ref(),
        &manager,
        &hosts,
        redirected.clone().unwrap_or_default(),
    )
    .await;

    // restore on every exit path once adapters were touched
    if redirected.is_some() {
        match controller.restore() {
            Ok(restored) => info!(restored, "system DNS restored"),
            Err(err) => error!(error = %err, "failed to restore system DNS"),
        }
    }

    info!("Shutdown complete.");
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}
