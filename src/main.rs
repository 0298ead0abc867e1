//! cntdns daemon entry point.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::signal;
use tokio::sync::mpsc;

use cntdns::dns_server::{CntDns, DnsServer};
use cntdns::overrides::{FileOverrides, StaticDeclarations};
use cntdns::proxy::{ProxyServer, ReverseProxy};
use cntdns::reconciler::Reconciler;
use cntdns::runtime::{ContainerRuntime, DockerRuntime};
use cntdns::types::Trigger;
use cntdns::{Config, Registry, RegistryHandle};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting cntdns with config: {:?}", cfg);

    // Published registry, empty until the first cycle completes
    let registry = RegistryHandle::new(Registry::empty(&cfg.tld));

    // Container Runtime (Docker)
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect()?);

    let mut reconciler = Reconciler::new(Arc::clone(&runtime), registry.clone(), cfg.discovery())
        .with_fetch_timeout(cfg.docker_timeout())
        .with_interval(cfg.poll_interval())
        .with_manual_source(StaticDeclarations::from_specs(&cfg.endpoints));
    if let Some(path) = &cfg.overrides_file {
        info!("Reading manual declarations from {}", path.display());
        reconciler = reconciler.with_manual_source(FileOverrides::new(path.clone()));
    }

    // Listeners are bound once; reloads only swap the snapshot.
    let dns = DnsServer::bind(
        cfg.dns_bind,
        CntDns::new(registry.clone(), cfg.load_balancer_ip(), cfg.dns_ttl),
    )
    .await?;
    let proxy = ProxyServer::bind(cfg.proxy_bind, ReverseProxy::new(registry.clone())).await?;

    match reconciler.run_once().await {
        Ok(report) => info!(
            "Initial registry v{} with {} endpoints",
            report.version, report.endpoints
        ),
        Err(e) => warn!("Initial reconciliation failed, serving an empty registry: {}", e),
    }

    // Trigger channel
    let (trigger_tx, trigger_rx) = mpsc::channel(128);

    let monitor_tx = trigger_tx.clone();
    let runtime_handle = tokio::spawn(async move {
        if let Err(e) = runtime.monitor(monitor_tx).await {
            error!("Container runtime failed: {}", e);
        }
    });

    let reconciler_handle = tokio::spawn(reconciler.run(trigger_rx));

    let dns_handle = tokio::spawn(async move {
        if let Err(e) = dns.run().await {
            error!("DNS server failed: {}", e);
        }
    });

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!("HTTP proxy failed: {}", e);
        }
    });

    let reload_handle = tokio::spawn(forward_reloads(trigger_tx));

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    // Abort tasks
    reload_handle.abort();
    runtime_handle.abort();
    reconciler_handle.abort();
    dns_handle.abort();
    proxy_handle.abort();

    info!("Shutdown complete.");
    Ok(())
}

/// Turn SIGHUP into a reload trigger.
#[cfg(unix)]
async fn forward_reloads(trigger_tx: mpsc::Sender<Trigger>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            error!("Unable to listen for SIGHUP: {}", e);
            return;
        }
    };
    while hangup.recv().await.is_some() {
        info!("Received SIGHUP, reloading manual declarations");
        if trigger_tx.send(Trigger::Reload).await.is_err() {
            return;
        }
    }
}

#[cfg(not(unix))]
async fn forward_reloads(_trigger_tx: mpsc::Sender<Trigger>) {}
