//! Backend resolution: AAAA for everything, MX first for mail.
//!
//! Hostname-to-IPv6 goes through the system resolver (`lookup_host`);
//! only the SMTP path needs a real record-type query, which goes to the
//! configured upstream recursive server.

use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;

use hickory_proto::op::ResponseCode;
use hickory_proto::rr::{Name, RData, RecordType};
use sixgate_core::{SixgateError, SixgateResult};
use tokio::time::{timeout, Instant};

use crate::config::Config;
use crate::dns::client::{DnsExchange, Transport};

pub struct Resolver {
    cfg: Arc<Config>,
    exchange: DnsExchange,
}

impl Resolver {
    pub fn new(cfg: Arc<Config>) -> Self {
        let exchange = DnsExchange::new(cfg.edns_buffer_size);
        Self { cfg, exchange }
    }

    /// Resolve `host` to its IPv6 addresses, bounded by the lookup budget.
    ///
    /// IPv4 results are discarded; a host with none left is an error — the
    /// whole point of this proxy is that backends live on IPv6.
    pub async fn ipv6_lookup(&self, host: &str) -> SixgateResult<Vec<Ipv6Addr>> {
        let host = host.trim_end_matches('.').to_string();
        let addrs = timeout(self.cfg.max_lookup, tokio::net::lookup_host((host.as_str(), 0)))
            .await
            .map_err(|_| SixgateError::Timeout)??;

        let ips: Vec<Ipv6Addr> = addrs
            .filter_map(|addr| match addr {
                SocketAddr::V6(v6) => Some(*v6.ip()),
                SocketAddr::V4(_) => None,
            })
            .collect();

        if ips.is_empty() {
            return Err(SixgateError::NoIpv6(host));
        }
        Ok(ips)
    }

    /// Mail-server candidates for `domain`: its MX hosts in preference
    /// order, keeping only those that actually resolve to IPv6.
    pub async fn mx_ipv6_hosts(&self, domain: &str) -> SixgateResult<Vec<String>> {
        let deadline = Instant::now() + self.cfg.max_lookup;
        let name = Name::from_ascii(format!("{}.", domain.trim_end_matches('.')))
            .map_err(|e| SixgateError::Proto(format!("bad domain: {e}")))?;
        let query = self.exchange.make_query(name, RecordType::MX, true);
        let resp = self
            .exchange
            .exchange(&query, self.cfg.upstream_addr, Transport::Udp, deadline)
            .await?;
        if resp.response_code() != ResponseCode::NoError {
            return Err(SixgateError::BadRcode(format!("{:?}", resp.response_code())));
        }

        let mut hosts = Vec::new();
        for host in mx_by_preference(resp.answers()) {
            match self.ipv6_lookup(&host).await {
                Ok(_) => hosts.push(host),
                Err(_) => {} // IPv4-only or dead mail hosts are useless here
            }
        }
        Ok(hosts)
    }
}

/// Exchange hostnames from MX answers, lowest preference first.
fn mx_by_preference(answers: &[hickory_proto::rr::Record]) -> Vec<String> {
    let mut mx: Vec<(u16, String)> = answers
        .iter()
        .filter_map(|r| match r.data() {
            Some(RData::MX(mx)) => Some((mx.preference(), mx.exchange().to_ascii())),
            _ => None,
        })
        .collect();
    mx.sort_by_key(|(pref, _)| *pref);
    mx.into_iter().map(|(_, host)| host).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::MX;
    use hickory_proto::rr::Record;
    use std::time::Duration;

    fn resolver() -> Resolver {
        let mut cfg = Config::load(None).unwrap();
        cfg.max_lookup = Duration::from_secs(2);
        Resolver::new(Arc::new(cfg))
    }

    #[tokio::test]
    async fn literal_ipv6_resolves() {
        let ips = resolver().ipv6_lookup("2001:db8::7").await.unwrap();
        assert_eq!(ips, vec!["2001:db8::7".parse::<Ipv6Addr>().unwrap()]);
    }

    #[tokio::test]
    async fn literal_ipv4_has_no_ipv6() {
        let err = resolver().ipv6_lookup("127.0.0.1").await.unwrap_err();
        assert!(matches!(err, SixgateError::NoIpv6(_)));
    }

    #[test]
    fn mx_sorted_by_preference() {
        let owner = Name::from_ascii("d.test.").unwrap();
        let rec = |pref: u16, host: &str| {
            Record::from_rdata(
                owner.clone(),
                300,
                RData::MX(MX::new(pref, Name::from_ascii(host).unwrap())),
            )
        };
        let answers = vec![
            rec(20, "backup.d.test."),
            rec(5, "primary.d.test."),
            rec(10, "secondary.d.test."),
        ];
        assert_eq!(
            mx_by_preference(&answers),
            vec![
                "primary.d.test.".to_string(),
                "secondary.d.test.".to_string(),
                "backup.d.test.".to_string(),
            ]
        );
    }
}
