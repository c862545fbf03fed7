//! Pingora-based gateway that exposes cluster services behind topology
//! URLs, rewriting URLs in both directions and failing over between
//! service endpoints.
//!
//! Topologies are loaded from a YAML configuration and redeployed
//! wholesale on `SIGHUP`.

mod cli;
mod config;
mod dispatch;
mod function;
mod ha;
mod health;
mod proxy;
mod rewrite;
mod template;
mod topology;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use pingora_core::server::Server;
use pingora_proxy::http_proxy_service;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::Args;
use crate::config::GatewayConfig;
use crate::proxy::{GatewayProxy, ServiceRouter};
use crate::topology::TopologyRegistry;

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    info!(config = %args.config.display(), "topology-gateway starting");

    let config = GatewayConfig::load_from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let registry = Arc::new(TopologyRegistry::new());
    registry.apply(&config).context("failed to deploy topologies")?;

    if args.validate_only {
        info!(topologies = ?registry.names(), "configuration valid");
        return Ok(());
    }

    let health_addr = config
        .health_listen
        .as_deref()
        .map(str::parse::<SocketAddr>)
        .transpose()
        .context("invalid `health_listen` address")?;
    spawn_background(args.config.clone(), health_addr, Arc::clone(&registry))?;

    let router = ServiceRouter::new(registry, &config.gateway_path);
    let proxy = GatewayProxy::new(router, &config.external_scheme);

    let mut server = Server::new(None).context("failed to create proxy server")?;
    server.bootstrap();

    let mut proxy_service = http_proxy_service(&server.configuration, proxy);
    proxy_service.add_tcp(&config.listen);
    info!(listen = %config.listen, gateway_path = %config.gateway_path, "proxy listening");
    server.add_service(proxy_service);

    server.run_forever()
}

/// Runs the health server and the `SIGHUP` reload loop on their own
/// runtime, next to Pingora's.
fn spawn_background(config_path: PathBuf, health_addr: Option<SocketAddr>, registry: Arc<TopologyRegistry>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .context("failed to build background runtime")?;

    std::thread::Builder::new()
        .name("gateway-background".into())
        .spawn(move || {
            runtime.block_on(async move {
                if let Some(addr) = health_addr {
                    let registry = Arc::clone(&registry);
                    tokio::spawn(async move {
                        if let Err(e) = health::start_health_server(addr, registry).await {
                            error!(addr = %addr, error = %e, "health server stopped");
                        }
                    });
                }
                reload_on_hangup(&config_path, &registry).await;
            })
        })
        .context("failed to spawn background thread")?;
    Ok(())
}

async fn reload_on_hangup(config_path: &Path, registry: &TopologyRegistry) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGHUP, configuration reload disabled");
            std::future::pending::<()>().await;
            return;
        }
    };

    while hangup.recv().await.is_some() {
        info!(config = %config_path.display(), "Received SIGHUP, reloading configuration");
        match reload(config_path, registry) {
            Ok(()) => info!(topologies = ?registry.names(), "configuration reloaded"),
            Err(e) => error!(error = %format!("{:#}", e), "reload failed, keeping previous topologies"),
        }
    }
}

fn reload(config_path: &Path, registry: &TopologyRegistry) -> Result<()> {
    let config = GatewayConfig::load_from_file(config_path)?;
    registry.apply(&config)?;
    Ok(())
}
