//! sixgate-server: transparent IPv4-to-IPv6 virtual-host proxy.
//!
//! Accepts redirected IPv4 connections, identifies the intended virtual
//! host from the opening bytes (HTTP Host, TLS SNI, SMTP RCPT TO, or a
//! magic subdomain), and splices the client to an IPv6 backend. A
//! companion DNS service synthesizes records for the controlled zone and
//! selectively recurses to in-zone delegations. Connections from
//! bad-reputation sources are sampled into the abuse store instead of
//! being served.

mod abuse;
mod config;
mod dns;
mod logbatch;
mod proxy;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use abuse::{AbuseStore, ReputationClient};
use config::Config;
use dns::{DnsService, NsCache, RecursionGate, Recursor, ZoneAuthority};
use logbatch::Drainer;
use proxy::ProxyService;

/// sixgate-server — IPv4-to-IPv6 virtual-host proxy
#[derive(Parser, Debug)]
#[command(name = "sixgate-server", version, about = "IPv4-to-IPv6 virtual-host proxy")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "/etc/sixgate.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config,
        "starting sixgate-server"
    );

    let config_path = PathBuf::from(&cli.config);
    let cfg = match Config::load(Some(&config_path)) {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let store = match AbuseStore::open(&cfg.abuse_db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, path = %cfg.abuse_db_path.display(), "failed to open abuse store");
            std::process::exit(1);
        }
    };
    let _sweeper = abuse::spawn_sweeper(store.clone(), cfg.abuse_ip_expire);

    let reputation = match ReputationClient::new(
        store.clone(),
        cfg.abuse_api_key.clone(),
        cfg.abuse_ip_expire,
    ) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "failed to build reputation client");
            std::process::exit(1);
        }
    };

    let drainer = Drainer::spawn();

    // DNS: NS cache + per-eTLD+1 gate shared by every query task
    let ns_cache = Arc::new(NsCache::new(cfg.recurse_min_ttl, cfg.recurse_max_ttl));
    let gate = Arc::new(RecursionGate::new(cfg.recurse_concurrency_limit));
    let recursor = Arc::new(Recursor::new(cfg.clone(), ns_cache.clone(), gate));
    let zone = Arc::new(ZoneAuthority::new(cfg.clone()));
    let dns_service = Arc::new(DnsService::new(
        cfg.clone(),
        recursor,
        zone,
        drainer.clone(),
    ));

    // periodic NS-cache sweep; lazy expiry handles the hot path
    {
        let ns_cache = ns_cache.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(300));
            loop {
                ticker.tick().await;
                ns_cache.sweep().await;
            }
        });
    }

    let proxy_service = match ProxyService::new(cfg.clone(), store, reputation, drainer) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!(error = %e, "failed to build proxy service");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = dns_service.run() => {
            if let Err(e) = result {
                error!(error = %e, "dns service error");
                std::process::exit(1);
            }
        }
        result = proxy_service.run() => {
            if let Err(e) = result {
                error!(error = %e, "proxy error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("sixgate-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
