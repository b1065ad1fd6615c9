//! Selective recursive resolver.
//!
//! `authority(name)` walks NS delegations downward from the public suffix
//! to find the nameserver responsible for `name`. The query handler then
//! forwards the client's original question — but only when that
//! nameserver is itself a magic subdomain of the controlled zone, i.e.
//! when the delegation points back at infrastructure we host. Everything
//! else is answered NOTAUTH: this resolver exists to reach in-zone
//! backends, not to serve the internet.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::NS;
use hickory_proto::rr::{Name, RData, RecordType};
use sixgate_core::{extract_ipv6, SixgateError, SixgateResult};
use tokio::time::{timeout_at, Instant};

use crate::config::Config;
use crate::dns::cache::{NsCache, NsKey};
use crate::dns::client::{DnsExchange, Transport};
use crate::dns::limiter::RecursionGate;
use crate::logbatch::LogBatch;

/// Build a response skeleton mirroring the request's id, opcode, and
/// question, carrying the given rcode.
pub(crate) fn build_reply(req: &Message, code: ResponseCode) -> Message {
    let mut resp = Message::new();
    resp.set_id(req.id());
    resp.set_message_type(MessageType::Response);
    resp.set_op_code(req.op_code());
    resp.set_recursion_desired(req.recursion_desired());
    resp.set_response_code(code);
    resp.add_queries(req.queries().to_vec());
    resp
}

pub struct Recursor {
    cfg: Arc<Config>,
    cache: Arc<NsCache>,
    gate: Arc<RecursionGate>,
    exchange: DnsExchange,
    /// Port delegated nameservers are dialed on. 53 outside of tests.
    ns_port: u16,
}

impl Recursor {
    pub fn new(cfg: Arc<Config>, cache: Arc<NsCache>, gate: Arc<RecursionGate>) -> Self {
        let exchange = DnsExchange::new(cfg.edns_buffer_size);
        Self {
            cfg,
            cache,
            gate,
            exchange,
            ns_port: 53,
        }
    }

    #[cfg(test)]
    fn with_ns_port(mut self, port: u16) -> Self {
        self.ns_port = port;
        self
    }

    /// Handle one inbound query on the recursive interface.
    ///
    /// Always produces a response message; resolver failures collapse to
    /// SERVFAIL, out-of-zone authorities to NOTAUTH, malformed requests
    /// to FORMERR.
    pub async fn handle(&self, req: &Message, transport: Transport, log: &mut LogBatch) -> Message {
        log.push_dns(req);
        let deadline = Instant::now() + self.cfg.max_lookup;

        // forwarding to different servers per question would be risky, so
        // only single-question query packets are accepted
        if req.op_code() != OpCode::Query || req.queries().len() != 1 {
            log.push("invalid opcode or number of questions");
            return build_reply(req, ResponseCode::FormErr);
        }

        let name = req.queries()[0].name().to_ascii();
        let resp = match self.authority(&name, deadline, log).await {
            Ok(ns_name) => match extract_ipv6(&ns_name, &self.cfg.zone) {
                Some(ip) => self.forward(req, ip, transport, deadline, log).await,
                None => {
                    log.push(format!("refusing query for zone owner: {ns_name}"));
                    let mut resp = build_reply(req, ResponseCode::NotAuth);
                    resp.set_authoritative(false);
                    resp
                }
            },
            Err(e) => {
                log.push(format!("error identifying authority: {e}"));
                build_reply(req, ResponseCode::ServFail)
            }
        };

        log.push_dns(&resp);
        resp
    }

    /// Relay the original question to the in-zone backend nameserver and
    /// return its answer unchanged.
    async fn forward(
        &self,
        req: &Message,
        ip: std::net::Ipv6Addr,
        transport: Transport,
        deadline: Instant,
        log: &mut LogBatch,
    ) -> Message {
        let server = SocketAddr::new(IpAddr::V6(ip), self.ns_port);
        match self.exchange.exchange(req, server, transport, deadline).await {
            Ok(resp) => resp,
            Err(e) => {
                log.push(format!("error while proxying request: {e}"));
                build_reply(req, ResponseCode::ServFail)
            }
        }
    }

    /// Return the hostname of the authoritative nameserver for `name`.
    ///
    /// Walks from the public suffix down. Bounded three ways: the
    /// per-eTLD+1 semaphore, the caller's deadline, and the configured
    /// recursion depth.
    pub async fn authority(
        &self,
        name: &str,
        deadline: Instant,
        log: &mut LogBatch,
    ) -> SixgateResult<String> {
        let trimmed = name.trim_matches('.').to_ascii_lowercase();
        // errors share the "" semaphore
        let etld1 = psl::domain_str(&trimmed).unwrap_or("").to_string();
        let _permit = self.gate.acquire(&etld1, deadline).await?;

        // bootstrap: ask the upstream recursive server who serves the
        // public suffix itself
        let suffix = psl::suffix_str(&trimmed)
            .ok_or(SixgateError::NoSuffixNameServer)?
            .to_string();
        let upstream = self.cfg.upstream.clone();
        let (suffix_ns, _) = self
            .lookup_ns(&format!("{suffix}."), &upstream, deadline, log)
            .await?;
        let mut responsible = suffix_ns
            .first()
            .ok_or(SixgateError::NoSuffixNameServer)?
            .clone();

        for depth in 0..self.cfg.recurse_max_depth {
            // the first hop asks the suffix servers about the eTLD+1, not
            // the full name, which keeps queries at busy TLD servers
            // cache-friendly for popular zones
            let target = if depth == 0 && !etld1.is_empty() && trimmed != etld1 {
                format!("{etld1}.")
            } else {
                format!("{trimmed}.")
            };

            let (servers, authoritative) =
                self.lookup_ns(&target, &responsible, deadline, log).await?;

            match select_next(&servers, &self.cfg.zone) {
                Some(next) => {
                    log.push(format!("switching to nameserver {next}"));
                    responsible = next.to_string();
                    if authoritative {
                        return Ok(responsible);
                    }
                }
                None if authoritative => return Ok(responsible),
                None => {
                    return Err(SixgateError::Proto(
                        "empty non-authoritative NS response".into(),
                    ))
                }
            }
        }

        Err(SixgateError::RecursionDepth)
    }

    /// Query `server` for the NS records of `name`, consulting the cache
    /// first.
    ///
    /// Recursion-desired is set only toward the configured upstream.
    /// Truncated UDP responses are retried over TCP; any rcode other than
    /// NOERROR fails the walk.
    async fn lookup_ns(
        &self,
        name: &str,
        server: &str,
        deadline: Instant,
        log: &mut LogBatch,
    ) -> SixgateResult<(Vec<String>, bool)> {
        // a magic nameserver name carries its own address; skip the
        // resolution round trip and key the cache on the literal
        let magic_ip = extract_ipv6(server, &self.cfg.zone);
        let label = match magic_ip {
            Some(ip) => format!("[{ip}]"),
            None => server.to_string(),
        };

        let key = NsKey {
            name: name.to_string(),
            server: label.clone(),
        };
        if let Some((entry, remaining)) = self.cache.get(&key).await {
            log.push(format!("{label}[cache]> {name}"));
            for ns in &entry.servers {
                log.push(format!(
                    "NS: {ns} TTL={} Authoritative={}",
                    remaining.as_secs(),
                    entry.authoritative
                ));
            }
            return Ok((entry.servers, entry.authoritative));
        }

        let addr = match magic_ip {
            Some(ip) => SocketAddr::new(IpAddr::V6(ip), self.ns_port),
            None => self.server_addr(server, deadline).await?,
        };
        let recursion_desired = server == self.cfg.upstream;

        let query = self.exchange.make_query(
            Name::from_ascii(name).map_err(|e| SixgateError::Proto(format!("bad name: {e}")))?,
            RecordType::NS,
            recursion_desired,
        );

        let mut transport = Transport::Udp;
        let resp = loop {
            log.push(format!("{label}[{transport:?}]> {name}"));
            let resp = self.exchange.exchange(&query, addr, transport, deadline).await?;
            if resp.truncated() && transport != Transport::Tcp {
                transport = Transport::Tcp;
                continue;
            }
            break resp;
        };

        if resp.response_code() != ResponseCode::NoError {
            return Err(SixgateError::BadRcode(format!("{:?}", resp.response_code())));
        }

        let (servers, min_ttl) = collect_ns(&resp, self.cfg.recurse_max_ttl);
        for ns in &servers {
            log.push(format!(
                "NS: {ns} TTL={min_ttl} Authoritative={}",
                resp.authoritative()
            ));
        }

        self.cache
            .put(key, servers.clone(), resp.authoritative(), min_ttl)
            .await;

        Ok((servers, resp.authoritative()))
    }

    /// Dial address for a non-magic nameserver: an IP literal directly,
    /// anything else through the system resolver. The configured upstream
    /// is always an IP and is dialed on its configured address.
    async fn server_addr(&self, server: &str, deadline: Instant) -> SixgateResult<SocketAddr> {
        if server == self.cfg.upstream {
            return Ok(self.cfg.upstream_addr);
        }
        let host = server.trim_end_matches('.');
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.ns_port));
        }
        let mut addrs = timeout_at(
            deadline,
            tokio::net::lookup_host((host, self.ns_port)),
        )
        .await
        .map_err(|_| SixgateError::Timeout)??;
        addrs
            .next()
            .ok_or_else(|| SixgateError::NoIpv6(server.to_string()))
    }
}

/// Pick the next hop from an NS record set: any magic in-zone name wins
/// (its address needs no further lookup), otherwise the first entry.
fn select_next<'a>(servers: &'a [String], zone: &str) -> Option<&'a String> {
    servers
        .iter()
        .find(|s| extract_ipv6(s, zone).is_some())
        .or_else(|| servers.first())
}

/// Collect NS names from a response, preferring the Authority section,
/// then Answer, then Additional, together with the minimum TTL seen in
/// the chosen section.
fn collect_ns(resp: &Message, max_ttl: u32) -> (Vec<String>, u32) {
    let mut min_ttl = max_ttl;
    for section in [resp.name_servers(), resp.answers(), resp.additionals()] {
        let mut servers = Vec::new();
        for record in section {
            if let Some(RData::NS(NS(ns))) = record.data() {
                servers.push(ns.to_ascii());
                min_ttl = min_ttl.min(record.ttl());
            }
        }
        if !servers.is_empty() {
            return (servers, min_ttl);
        }
    }
    (Vec::new(), min_ttl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::logbatch::Drainer;
    use hickory_proto::op::Query;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::Record;
    use std::net::Ipv6Addr;
    use tokio::net::UdpSocket;
    use tokio::time::Duration;

    const MAGIC_LOOPBACK: &str = "0000-0000-0000-0000-0000-0000-0000-0001.example.net.";

    fn test_config(upstream_addr: SocketAddr) -> Arc<Config> {
        let mut cfg = Config::load(None).unwrap();
        cfg.zone = "example.net".into();
        cfg.upstream = "upstream.test".into();
        cfg.upstream_addr = upstream_addr;
        cfg.max_lookup = Duration::from_secs(2);
        Arc::new(cfg)
    }

    fn recursor(cfg: Arc<Config>, ns_port: u16) -> Recursor {
        Recursor::new(
            cfg.clone(),
            Arc::new(NsCache::new(cfg.recurse_min_ttl, cfg.recurse_max_ttl)),
            Arc::new(RecursionGate::new(cfg.recurse_concurrency_limit)),
        )
        .with_ns_port(ns_port)
    }

    fn ns_answer(query: &Message, names: &[&str], authoritative: bool) -> Message {
        let mut resp = build_reply(query, ResponseCode::NoError);
        resp.set_authoritative(authoritative);
        let owner = query.queries()[0].name().clone();
        for name in names {
            resp.add_answer(Record::from_rdata(
                owner.clone(),
                300,
                RData::NS(NS(Name::from_ascii(name).unwrap())),
            ));
        }
        resp
    }

    /// UDP server answering every NS query with the scripted delegation
    /// and every A query with 192.0.2.99.
    async fn spawn_mock_ns(
        bind: &str,
        ns_names: Vec<&'static str>,
        authoritative: bool,
    ) -> SocketAddr {
        let socket = UdpSocket::bind(bind).await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                let Ok(query) = Message::from_vec(&buf[..n]) else {
                    continue;
                };
                let resp = match query.queries()[0].query_type() {
                    RecordType::A => {
                        let mut resp = build_reply(&query, ResponseCode::NoError);
                        resp.set_authoritative(true);
                        resp.add_answer(Record::from_rdata(
                            query.queries()[0].name().clone(),
                            60,
                            RData::A(A(std::net::Ipv4Addr::new(192, 0, 2, 99))),
                        ));
                        resp
                    }
                    _ => ns_answer(&query, &ns_names, authoritative),
                };
                let _ = socket.send_to(&resp.to_vec().unwrap(), peer).await;
            }
        });
        addr
    }

    fn batch() -> LogBatch {
        Drainer::spawn().batch(0.8)
    }

    #[tokio::test]
    async fn authority_follows_magic_delegation() {
        // the backend nameserver lives on [::1]; its magic name encodes ::1
        let backend = spawn_mock_ns("[::1]:0", vec![MAGIC_LOOPBACK], true).await;
        let upstream = spawn_mock_ns("127.0.0.1:0", vec![MAGIC_LOOPBACK], false).await;

        let cfg = test_config(upstream);
        let recursor = recursor(cfg, backend.port());
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut log = batch();

        let authority = recursor
            .authority("x.y.example.org.", deadline, &mut log)
            .await
            .unwrap();
        assert_eq!(authority, MAGIC_LOOPBACK);
    }

    #[tokio::test]
    async fn handle_forwards_to_in_zone_authority() {
        let backend = spawn_mock_ns("[::1]:0", vec![MAGIC_LOOPBACK], true).await;
        let upstream = spawn_mock_ns("127.0.0.1:0", vec![MAGIC_LOOPBACK], false).await;

        let cfg = test_config(upstream);
        let recursor = recursor(cfg.clone(), backend.port());

        let mut req = Message::new();
        req.set_id(4242);
        req.set_message_type(MessageType::Query);
        req.set_op_code(OpCode::Query);
        req.add_query(Query::query(
            Name::from_ascii("x.y.example.org.").unwrap(),
            RecordType::A,
        ));

        let mut log = batch();
        let resp = recursor.handle(&req, Transport::Udp, &mut log).await;
        assert_eq!(resp.id(), 4242);
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert_eq!(resp.answers().len(), 1, "answer forwarded from the backend");
    }

    #[tokio::test]
    async fn handle_refuses_out_of_zone_authority() {
        let backend = spawn_mock_ns("[::1]:0", vec!["ns.elsewhere.test."], true).await;
        let upstream = spawn_mock_ns("127.0.0.1:0", vec![MAGIC_LOOPBACK], false).await;

        let cfg = test_config(upstream);
        let recursor = recursor(cfg, backend.port());

        let mut req = Message::new();
        req.set_message_type(MessageType::Query);
        req.set_op_code(OpCode::Query);
        req.add_query(Query::query(
            Name::from_ascii("x.y.example.org.").unwrap(),
            RecordType::A,
        ));

        let mut log = batch();
        let resp = recursor.handle(&req, Transport::Udp, &mut log).await;
        assert_eq!(resp.response_code(), ResponseCode::NotAuth);
    }

    #[tokio::test]
    async fn handle_rejects_multi_question() {
        let upstream = spawn_mock_ns("127.0.0.1:0", vec![], false).await;
        let cfg = test_config(upstream);
        let recursor = recursor(cfg, 53);

        let mut req = Message::new();
        req.set_message_type(MessageType::Query);
        req.set_op_code(OpCode::Query);
        req.add_query(Query::query(Name::from_ascii("a.test.").unwrap(), RecordType::A));
        req.add_query(Query::query(Name::from_ascii("b.test.").unwrap(), RecordType::A));

        let mut log = batch();
        let resp = recursor.handle(&req, Transport::Udp, &mut log).await;
        assert_eq!(resp.response_code(), ResponseCode::FormErr);
    }

    #[tokio::test]
    async fn empty_bootstrap_fails() {
        let upstream = spawn_mock_ns("127.0.0.1:0", vec![], true).await;
        let cfg = test_config(upstream);
        let recursor = recursor(cfg, 53);

        let mut log = batch();
        let err = recursor
            .authority("x.example.org.", Instant::now() + Duration::from_secs(2), &mut log)
            .await
            .unwrap_err();
        assert!(matches!(err, SixgateError::NoSuffixNameServer));
    }

    #[test]
    fn next_server_prefers_magic_names() {
        let servers = vec![
            "ns.elsewhere.test.".to_string(),
            MAGIC_LOOPBACK.to_string(),
            "other.test.".to_string(),
        ];
        assert_eq!(
            select_next(&servers, "example.net").map(String::as_str),
            Some(MAGIC_LOOPBACK)
        );

        let plain = vec!["first.test.".to_string(), "second.test.".to_string()];
        assert_eq!(
            select_next(&plain, "example.net").map(String::as_str),
            Some("first.test.")
        );
        assert_eq!(select_next(&[], "example.net"), None);
    }

    #[test]
    fn collect_ns_prefers_authority_section() {
        let mut resp = Message::new();
        let owner = Name::from_ascii("example.org.").unwrap();
        resp.add_name_server(Record::from_rdata(
            owner.clone(),
            120,
            RData::NS(NS(Name::from_ascii("auth.ns.test.").unwrap())),
        ));
        resp.add_answer(Record::from_rdata(
            owner,
            60,
            RData::NS(NS(Name::from_ascii("answer.ns.test.").unwrap())),
        ));
        let (servers, min_ttl) = collect_ns(&resp, 86_400);
        assert_eq!(servers, vec!["auth.ns.test.".to_string()]);
        assert_eq!(min_ttl, 120);
    }

    #[tokio::test]
    async fn second_lookup_hits_cache() {
        let upstream = spawn_mock_ns("127.0.0.1:0", vec!["ns1.example.org."], false).await;
        let cfg = test_config(upstream);
        let cache = Arc::new(NsCache::new(cfg.recurse_min_ttl, cfg.recurse_max_ttl));
        let recursor = Recursor::new(
            cfg.clone(),
            cache.clone(),
            Arc::new(RecursionGate::new(4)),
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut log = batch();
        let upstream_name = cfg.upstream.clone();
        let first = recursor
            .lookup_ns("org.", &upstream_name, deadline, &mut log)
            .await
            .unwrap();
        assert_eq!(cache.len().await, 1);

        let second = recursor
            .lookup_ns("org.", &upstream_name, deadline, &mut log)
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn magic_extraction_skips_resolution() {
        // no DNS anywhere can resolve the magic label; the address must
        // come from the name itself
        let ip = extract_ipv6(MAGIC_LOOPBACK, "example.net").unwrap();
        assert_eq!(ip, Ipv6Addr::LOCALHOST);
    }
}
