//! DNS service listeners.
//!
//! Two services share the handlers: the selective recursive service on
//! the public IPv4 address (which also answers for the controlled zone),
//! and a zone-only service on the public IPv6 address. Both serve UDP and
//! TCP; TCP uses the standard two-byte length framing. One task per
//! datagram / per TCP connection.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use hickory_proto::op::{Message, ResponseCode};
use sixgate_core::SixgateResult;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{info, warn};

use crate::config::Config;
use crate::dns::client::Transport;
use crate::dns::recurse::{build_reply, Recursor};
use crate::dns::zone::ZoneAuthority;
use crate::logbatch::Drainer;

/// Which handlers a listener exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceMode {
    /// Zone queries answered authoritatively, everything else walked by
    /// the selective recursor.
    Selective,
    /// Only the controlled zone; anything else is REFUSED.
    ZoneOnly,
}

pub struct DnsService {
    cfg: Arc<Config>,
    recursor: Arc<Recursor>,
    zone: Arc<ZoneAuthority>,
    drainer: Drainer,
}

impl DnsService {
    pub fn new(
        cfg: Arc<Config>,
        recursor: Arc<Recursor>,
        zone: Arc<ZoneAuthority>,
        drainer: Drainer,
    ) -> Self {
        Self {
            cfg,
            recursor,
            zone,
            drainer,
        }
    }

    /// Bind and serve all four listeners until one of them fails.
    pub async fn run(self: Arc<Self>) -> SixgateResult<()> {
        let v4 = SocketAddr::new(IpAddr::V4(self.cfg.public_ipv4), 53);
        let v6 = SocketAddr::new(IpAddr::V6(self.cfg.public_ipv6), 53);

        info!(listener = %v4, "starting selective recursive DNS service");
        info!(listener = %v6, "starting zone DNS service");

        tokio::try_join!(
            self.clone().serve_udp(v4, ServiceMode::Selective),
            self.clone().serve_tcp(v4, ServiceMode::Selective),
            self.clone().serve_udp(v6, ServiceMode::ZoneOnly),
            self.clone().serve_tcp(v6, ServiceMode::ZoneOnly),
        )?;
        Ok(())
    }

    async fn serve_udp(self: Arc<Self>, addr: SocketAddr, mode: ServiceMode) -> SixgateResult<()> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let mut buf = vec![0u8; 65_535];
        loop {
            let (n, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!(listener = %addr, error = %e, "udp recv failed");
                    continue;
                }
            };
            let payload = buf[..n].to_vec();
            let service = self.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                if let Some(resp) = service.dispatch(&payload, Transport::Udp, mode).await {
                    if let Err(e) = socket.send_to(&resp, peer).await {
                        warn!(peer = %peer, error = %e, "udp send failed");
                    }
                }
            });
        }
    }

    async fn serve_tcp(self: Arc<Self>, addr: SocketAddr, mode: ServiceMode) -> SixgateResult<()> {
        let listener = TcpListener::bind(addr).await?;
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(listener = %addr, error = %e, "tcp accept failed");
                    continue;
                }
            };
            let service = self.clone();
            tokio::spawn(async move {
                if let Err(e) = service.serve_tcp_conn(stream, mode).await {
                    warn!(peer = %peer, error = %e, "dns tcp connection ended with error");
                }
            });
        }
    }

    /// Read framed queries off one TCP connection until the peer closes.
    async fn serve_tcp_conn(&self, mut stream: TcpStream, mode: ServiceMode) -> SixgateResult<()> {
        loop {
            let mut len_buf = [0u8; 2];
            match stream.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            }
            let len = u16::from_be_bytes(len_buf) as usize;
            if len == 0 {
                continue;
            }

            let mut payload = vec![0u8; len];
            stream.read_exact(&mut payload).await?;

            if let Some(resp) = self.dispatch(&payload, Transport::Tcp, mode).await {
                if resp.len() > u16::MAX as usize {
                    continue;
                }
                stream.write_all(&(resp.len() as u16).to_be_bytes()).await?;
                stream.write_all(&resp).await?;
            }
        }
    }

    /// Route one wire-format query to the zone or recurse handler and
    /// serialize the response. Unparseable input is dropped — without a
    /// header there is no id to answer under.
    async fn dispatch(&self, raw: &[u8], transport: Transport, mode: ServiceMode) -> Option<Vec<u8>> {
        let req = Message::from_vec(raw).ok()?;
        let mut log = self.drainer.batch(self.cfg.log_string_cutoff);

        let in_zone = req
            .queries()
            .first()
            .map(|q| {
                let name = q.name().to_ascii().to_ascii_lowercase();
                let name = name.trim_end_matches('.');
                name == self.cfg.zone || name.ends_with(&format!(".{}", self.cfg.zone))
            })
            .unwrap_or(false);

        let resp = if in_zone {
            log.push_dns(&req);
            let resp = self.zone.handle(&req).await;
            log.push_dns(&resp);
            resp
        } else {
            match mode {
                ServiceMode::Selective => self.recursor.handle(&req, transport, &mut log).await,
                ServiceMode::ZoneOnly => {
                    log.push_dns(&req);
                    log.push("refusing query outside the zone");
                    build_reply(&req, ResponseCode::Refused)
                }
            }
        };

        resp.to_vec().ok()
    }
}
