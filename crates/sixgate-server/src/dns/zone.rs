//! Authoritative synthesis for the controlled zone.
//!
//! Names under the zone are answered without any zone file: a magic
//! subdomain *is* its own AAAA record, `ns1`/`ns2` and the apex point at
//! the proxy's public addresses, and other in-zone names whose embedded
//! address names a real backend may have MX/A/AAAA/TXT answers forwarded
//! from that backend.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use hickory_proto::op::{Message, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, MX, NS, SOA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use sixgate_core::extract_ipv6;
use tokio::time::Instant;

use crate::config::Config;
use crate::dns::client::{DnsExchange, Transport};
use crate::dns::recurse::build_reply;

/// Bogus but format-conforming serial; the zone content is synthesized,
/// so secondaries have nothing to transfer anyway.
const SOA_SERIAL: u32 = 2_000_010_101;
const SOA_REFRESH: i32 = 1_200;
const SOA_EXPIRE: i32 = 1_209_600;

pub struct ZoneAuthority {
    cfg: Arc<Config>,
    exchange: DnsExchange,
    /// Port backend nameservers are dialed on for passthrough. 53 outside
    /// of tests.
    ns_port: u16,
}

impl ZoneAuthority {
    pub fn new(cfg: Arc<Config>) -> Self {
        let exchange = DnsExchange::new(cfg.edns_buffer_size);
        Self {
            cfg,
            exchange,
            ns_port: 53,
        }
    }

    #[cfg(test)]
    fn with_ns_port(mut self, port: u16) -> Self {
        self.ns_port = port;
        self
    }

    /// Answer a query for a name inside the controlled zone.
    pub async fn handle(&self, req: &Message) -> Message {
        let mut resp = build_reply(req, ResponseCode::NoError);
        resp.set_authoritative(true);

        if req.op_code() != OpCode::Query {
            resp.set_response_code(ResponseCode::ServFail);
            return resp;
        }

        for q in req.queries().to_vec() {
            let qname = q.name().to_ascii();
            match extract_ipv6(&qname, &self.cfg.zone) {
                Some(ip) => {
                    // the name itself carries the backend's address
                    self.answer(&mut resp, &q, ip, false).await;
                }
                None if self.is_service_name(&qname) => {
                    self.answer(&mut resp, &q, self.cfg.public_ipv6, false).await;
                }
                None if name_eq(&qname, &self.cfg.zone) => {
                    self.answer(&mut resp, &q, self.cfg.public_ipv6, true).await;
                }
                None => {
                    resp.set_response_code(ResponseCode::NXDomain);
                }
            }
        }

        resp
    }

    /// `ns1.<zone>` / `ns2.<zone>` are the proxy itself.
    fn is_service_name(&self, qname: &str) -> bool {
        name_eq(qname, &format!("ns1.{}", self.cfg.zone))
            || name_eq(qname, &format!("ns2.{}", self.cfg.zone))
    }

    async fn answer(&self, resp: &mut Message, q: &Query, ipv6: Ipv6Addr, is_root: bool) {
        // a name pointing at some other backend may override MX, A, AAAA,
        // and TXT answers with its own
        if ipv6 != self.cfg.public_ipv6 {
            if let Some(records) = self.passthrough(ipv6, q).await {
                for r in records {
                    resp.add_answer(r);
                }
                return;
            }
        }

        let (answers, additionals) = synthesize(
            q,
            self.cfg.public_ipv4,
            ipv6,
            is_root,
            self.cfg.dns_ttl,
            &self.cfg.admin_email,
        );
        for r in answers {
            resp.add_answer(r);
        }
        for r in additionals {
            resp.add_additional(r);
        }
    }

    /// Ask the backend itself and re-own its answers under our name and
    /// TTL. Any failure, timeout, or empty answer falls back to the
    /// synthetic records.
    async fn passthrough(&self, backend: Ipv6Addr, q: &Query) -> Option<Vec<Record>> {
        if !matches!(
            q.query_type(),
            RecordType::MX | RecordType::A | RecordType::AAAA | RecordType::TXT
        ) {
            return None;
        }

        let deadline = Instant::now() + self.cfg.passthrough_timeout;
        let query = self
            .exchange
            .make_query(q.name().clone(), q.query_type(), false);
        let server = SocketAddr::new(IpAddr::V6(backend), self.ns_port);
        let resp = self
            .exchange
            .exchange(&query, server, Transport::Udp, deadline)
            .await
            .ok()?;

        let records: Vec<Record> = resp
            .answers()
            .iter()
            .filter(|r| r.record_type() == q.query_type())
            .filter_map(|r| {
                r.data()
                    .map(|data| Record::from_rdata(q.name().clone(), self.cfg.dns_ttl, data.clone()))
            })
            .collect();

        if records.is_empty() {
            None
        } else {
            Some(records)
        }
    }
}

/// Case-insensitive DNS name equality, ignoring trailing dots.
fn name_eq(a: &str, b: &str) -> bool {
    a.trim_end_matches('.')
        .eq_ignore_ascii_case(b.trim_end_matches('.'))
}

/// Synthesize the answer (and additional) records for one question.
///
/// `ipv4` is the proxy's public address, `ipv6` either the proxy's own or
/// the one embedded in the queried name. NS and SOA only exist at the
/// apex.
fn synthesize(
    q: &Query,
    ipv4: Ipv4Addr,
    ipv6: Ipv6Addr,
    is_root: bool,
    ttl: u32,
    admin_email: &str,
) -> (Vec<Record>, Vec<Record>) {
    let mut answers = Vec::new();
    let mut additionals = Vec::new();
    let owner = q.name().clone();

    match q.query_type() {
        RecordType::MX => {
            // loopback MX: mail for the name goes to the name
            answers.push(Record::from_rdata(
                owner.clone(),
                ttl,
                RData::MX(MX::new(10, owner)),
            ));
        }
        RecordType::A => {
            answers.push(Record::from_rdata(owner, ttl, RData::A(A(ipv4))));
        }
        RecordType::AAAA => {
            answers.push(Record::from_rdata(owner, ttl, RData::AAAA(AAAA(ipv6))));
        }
        RecordType::NS if is_root => {
            for label in ["ns1", "ns2"] {
                let ns_name = match Name::from_ascii(format!("{label}.{}", owner.to_ascii())) {
                    Ok(name) => name,
                    Err(_) => continue,
                };
                answers.push(Record::from_rdata(
                    owner.clone(),
                    ttl,
                    RData::NS(NS(ns_name.clone())),
                ));
                additionals.push(Record::from_rdata(ns_name.clone(), ttl, RData::A(A(ipv4))));
                additionals.push(Record::from_rdata(ns_name, ttl, RData::AAAA(AAAA(ipv6))));
            }
        }
        RecordType::SOA if is_root => {
            let mname = Name::from_ascii(format!("ns1.{}", owner.to_ascii())).ok();
            let rname = Name::from_ascii(format!("{}.", admin_email.replace('@', "."))).ok();
            if let (Some(mname), Some(rname)) = (mname, rname) {
                answers.push(Record::from_rdata(
                    owner,
                    ttl,
                    RData::SOA(SOA::new(
                        mname,
                        rname,
                        SOA_SERIAL,
                        SOA_REFRESH,
                        ttl as i32,
                        SOA_EXPIRE,
                        ttl,
                    )),
                ));
            }
        }
        _ => {}
    }

    (answers, additionals)
}
