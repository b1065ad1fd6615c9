//! Per-connection pipeline: gate, sniff, resolve, dial, splice.
//!
//! One task per accepted socket. The client's opening bytes accumulate in
//! a fixed preview buffer until the sniffer names a vhost; the preview is
//! then replayed to whichever backend accepts the dial, and the two
//! sockets are spliced until both directions drain. Nothing here retries:
//! on any failure both sides close and the client is expected to retry at
//! its own layer.

use std::net::{IpAddr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Arc;

use sixgate_core::{mapped_source, SixgateError, SixgateResult, Sniffed, MAX_LOOKAHEAD, SMTP_PORT};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::{timeout, timeout_at, Instant};

use crate::abuse::{annoy, record_abusive_open};
use crate::logbatch::LogBatch;
use crate::proxy::listener::ProxyService;
use crate::proxy::smtp;

/// Protocols where the proxy spoke first and the backend's own greeting
/// must be consumed before the splice.
#[derive(Debug, Clone, Copy)]
pub enum Greeting {
    Smtp,
}

impl Greeting {
    async fn eat<R>(&self, r: &mut R) -> SixgateResult<()>
    where
        R: AsyncRead + Unpin,
    {
        match self {
            Greeting::Smtp => smtp::eat_greeting(r).await,
        }
    }
}

/// Result of the identification loop.
#[derive(Debug)]
struct Identified {
    /// Candidate hostnames in dialing order.
    hosts: Vec<String>,
    /// The bytes read so far; owed to the backend before anything else.
    preview: Vec<u8>,
    greeting: Option<Greeting>,
}

/// Drive one accepted connection to completion.
pub async fn handle(svc: Arc<ProxyService>, mut stream: TcpStream, peer: SocketAddr) {
    let mut log = svc.drainer.batch(svc.cfg.log_string_cutoff);

    // the transparent listener surfaces the client's original
    // destination as our local address
    let local = match stream.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            log.push(format!("no local address on accepted socket: {e}"));
            return;
        }
    };
    log.push(format!("connection {peer} -> {local}"));

    let client = match peer {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => {
            log.push(format!("dropping IPv6 client: {peer}"));
            return;
        }
    };

    let score = svc.reputation.check(peer.ip(), &mut log).await;
    log.push(format!("abuse confidence: {score}"));
    if score >= svc.cfg.abuse_confidence_threshold {
        log.push("blocking connection because of abuse score");
        record_abusive_open(
            &mut stream,
            peer,
            local,
            &svc.cfg,
            &svc.store,
            &svc.reputation,
            &mut log,
        )
        .await;
        if svc.cfg.abuse_annoy {
            annoy(&mut stream).await;
        }
        return;
    }

    let identified = match identify(&svc, &mut stream, local.port(), &mut log).await {
        Ok(identified) => identified,
        Err(e) => {
            log.push(format!("identification failed: {e}"));
            return;
        }
    };

    let backend = match dial_candidates(&svc, &identified.hosts, client, local.port(), &mut log).await
    {
        Ok(backend) => backend,
        Err(e) => {
            log.push(format!("{e}"));
            return;
        }
    };

    let (up, down) = splice(
        stream,
        backend,
        &identified.preview,
        identified.greeting,
    )
    .await;
    match up {
        Ok(n) => log.push(format!("client->backend: {n} bytes")),
        Err(e) => log.push(format!("client->backend error: {e}")),
    }
    match down {
        Ok(n) => log.push(format!("backend->client: {n} bytes")),
        Err(e) => log.push(format!("backend->client error: {e}")),
    }
}

/// Read into the preview buffer until the sniffer reaches a verdict.
///
/// On port 25 the canned SMTP greeting goes out before the first read so
/// the client volunteers its recipient. The whole loop runs under the
/// identification deadline.
async fn identify<S>(
    svc: &ProxyService,
    stream: &mut S,
    port_hint: u16,
    log: &mut LogBatch,
) -> SixgateResult<Identified>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = Instant::now() + svc.cfg.max_identify;

    let mut greeting = None;
    if port_hint == SMTP_PORT {
        smtp::stuff_greeting(stream, &svc.cfg.zone).await?;
        greeting = Some(Greeting::Smtp);
    }

    let mut preview = vec![0u8; MAX_LOOKAHEAD];
    let mut cursor = 0usize;

    while cursor < preview.len() {
        let n = timeout_at(deadline, stream.read(&mut preview[cursor..]))
            .await
            .map_err(|_| SixgateError::Timeout)??;
        if n == 0 {
            return Err(SixgateError::NoHost);
        }
        cursor += n;
        log.push(format!("attempting to identify vhost from {cursor} bytes"));

        match svc.sniffer.sniff(&preview[..cursor], port_hint) {
            Sniffed::Hosts(hosts) => {
                preview.truncate(cursor);
                return Ok(Identified {
                    hosts,
                    preview,
                    greeting,
                });
            }
            Sniffed::MailDomain(domain) => {
                log.push(format!("smtp recipient domain: {domain}"));
                let hosts = match svc.resolver.mx_ipv6_hosts(&domain).await {
                    Ok(hosts) if !hosts.is_empty() => hosts,
                    Ok(_) => {
                        log.push("no suitable MX records; falling back to AAAA");
                        vec![domain]
                    }
                    Err(e) => {
                        log.push(format!("error looking up MX records: {e}"));
                        vec![domain]
                    }
                };
                preview.truncate(cursor);
                return Ok(Identified {
                    hosts,
                    preview,
                    greeting,
                });
            }
            Sniffed::NeedMore => {}
            Sniffed::DeadEnd => return Err(SixgateError::NoHost),
        }
    }

    Err(SixgateError::NoHost)
}

/// Resolve and dial the candidates in order; first successful dial wins.
async fn dial_candidates(
    svc: &ProxyService,
    hosts: &[String],
    client: SocketAddrV4,
    port: u16,
    log: &mut LogBatch,
) -> SixgateResult<TcpStream> {
    for host in hosts {
        let ips = match svc.resolver.ipv6_lookup(host).await {
            Ok(ips) => ips,
            Err(e) => {
                log.push(format!("resolving {host}: {e}"));
                continue;
            }
        };
        for ip in ips {
            match dial_backend(svc, ip, port, client).await {
                Ok(stream) => {
                    log.push(format!("connected to {host} at [{ip}]:{port}"));
                    return Ok(stream);
                }
                Err(e) => log.push(format!("dialing {host} at [{ip}]:{port}: {e}")),
            }
        }
    }
    Err(SixgateError::Dial(
        "no candidate backend accepted the connection".into(),
    ))
}

/// Dial `backend` with a source address that encodes the client.
///
/// The socket binds `MappedPrefix + client IPv4` on the client's own
/// source port; `IP_FREEBIND` lets us bind the whole mapped prefix
/// without configuring every address on an interface.
async fn dial_backend(
    svc: &ProxyService,
    backend: std::net::Ipv6Addr,
    port: u16,
    client: SocketAddrV4,
) -> SixgateResult<TcpStream> {
    let source = mapped_source(&svc.cfg.mapped_prefix, *client.ip()).ok_or_else(|| {
        SixgateError::Other("mapped prefix does not fit the client address".into())
    })?;

    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_freebind(true)?;
    socket.bind(&SocketAddr::V6(SocketAddrV6::new(source, client.port(), 0, 0)).into())?;
    socket.set_nonblocking(true)?;

    let socket = TcpSocket::from_std_stream(socket.into());
    let stream = timeout(
        svc.cfg.max_connect,
        socket.connect(SocketAddr::new(IpAddr::V6(backend), port)),
    )
    .await
    .map_err(|_| SixgateError::Timeout)?
    .map_err(|e| SixgateError::Dial(e.to_string()))?;
    Ok(stream)
}

/// Copy both directions until each side drains, half-closing as it goes.
///
/// Client-to-backend starts by flushing the preview; backend-to-client
/// starts by eating the backend's greeting when the proxy already spoke
/// for it. Returns the byte counts (preview included) per direction.
async fn splice<C, B>(
    client: C,
    backend: B,
    preview: &[u8],
    greeting: Option<Greeting>,
) -> (SixgateResult<u64>, SixgateResult<u64>)
where
    C: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let upstream = async {
        backend_write.write_all(preview).await?;
        let copied = tokio::io::copy(&mut client_read, &mut backend_write).await?;
        backend_write.shutdown().await?;
        Ok::<u64, SixgateError>(copied + preview.len() as u64)
    };

    let downstream = async {
        if let Some(greeting) = greeting {
            greeting.eat(&mut backend_read).await?;
        }
        let copied = tokio::io::copy(&mut backend_read, &mut client_write).await?;
        client_write.shutdown().await?;
        Ok::<u64, SixgateError>(copied)
    };

    tokio::join!(upstream, downstream)
}
