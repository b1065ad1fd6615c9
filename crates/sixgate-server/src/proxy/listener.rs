//! Transparent proxy listener.
//!
//! The kernel redirects inbound IPv4 traffic to a loopback pseudo-address
//! while preserving the original destination; `IP_TRANSPARENT` on the
//! listening socket is what makes the accepted socket's local address
//! report that original destination. One handler task per accepted
//! connection.

use std::net::SocketAddr;
use std::sync::Arc;

use sixgate_core::{SixgateResult, Sniffer};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::abuse::{AbuseStore, ReputationClient};
use crate::config::Config;
use crate::logbatch::Drainer;
use crate::proxy::conn;
use crate::proxy::lookup::Resolver;

/// Shared state for the connection pipeline.
pub struct ProxyService {
    pub(crate) cfg: Arc<Config>,
    pub(crate) sniffer: Sniffer,
    pub(crate) resolver: Resolver,
    pub(crate) store: Arc<AbuseStore>,
    pub(crate) reputation: Arc<ReputationClient>,
    pub(crate) drainer: Drainer,
}

impl ProxyService {
    pub fn new(
        cfg: Arc<Config>,
        store: Arc<AbuseStore>,
        reputation: Arc<ReputationClient>,
        drainer: Drainer,
    ) -> SixgateResult<Self> {
        let sniffer = Sniffer::new(&cfg.zone)?;
        let resolver = Resolver::new(cfg.clone());
        Ok(Self {
            cfg,
            sniffer,
            resolver,
            store,
            reputation,
            drainer,
        })
    }

    /// Accept loop; runs until the listener itself fails.
    pub async fn run(self: Arc<Self>) -> SixgateResult<()> {
        let listener = bind_transparent(self.cfg.proxy_listen)?;
        info!(listener = %self.cfg.proxy_listen, "proxy listening");

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "proxy accept failed");
                    continue;
                }
            };
            let svc = self.clone();
            tokio::spawn(async move {
                conn::handle(svc, stream, peer).await;
            });
        }
    }
}

/// Bind the listener with `IP_TRANSPARENT` so redirected sockets keep
/// their original destination. Binding without the capability for it
/// still works for direct (non-redirected) traffic, so a failure to set
/// the option is reported but not fatal.
fn bind_transparent(addr: SocketAddr) -> SixgateResult<TcpListener> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if let Err(e) = socket.set_ip_transparent(true) {
        warn!(error = %e, "IP_TRANSPARENT unavailable; original destinations will not be preserved");
    }
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into())?)
}
