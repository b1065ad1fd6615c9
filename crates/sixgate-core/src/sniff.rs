//! Protocol sniffer.
//!
//! Classifies the bytes a client has sent so far and extracts the virtual
//! host it is trying to reach. Four identification rules are tried in
//! order: SMTP (RCPT TO domain, gated on the destination-port hint), HTTP
//! (Host header), TLS (SNI), and finally a raw byte search for a magic
//! subdomain of the controlled zone.
//!
//! The sniffer is synchronous and never does I/O. The SMTP rule therefore
//! reports the RCPT domain back to the caller ([`Sniffed::MailDomain`])
//! instead of resolving MX records itself.

use std::sync::LazyLock;

use regex::bytes::Regex;

use crate::error::{SixgateError, SixgateResult};
use crate::tls::{self, ClientHello};

/// Capacity of the preview buffer; identification gives up at this size.
pub const MAX_LOOKAHEAD: usize = 4096;

/// The destination-port hint that enables the SMTP rule.
pub const SMTP_PORT: u16 = 25;

static HTTP_REQUEST_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[A-Z]{2,15} /[!-~]* HTTP/[0-9]+\.[0-9]+\r?\n").expect("static regex")
});
static HTTP_HOST_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^HOST: ?([^:]+)(?::[0-9]+)?$").expect("static regex"));
static SMTP_HELLO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:HELO|EHLO) ").expect("static regex"));
static SMTP_RCPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\nRCPT TO: *(?:<[!-~]+@([!-~]+)>|[!-~]+@([!-~]+)) *\r?\n")
        .expect("static regex")
});

/// What the sniffer concluded from the bytes seen so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sniffed {
    /// Candidate hostnames to resolve, in order of preference.
    Hosts(Vec<String>),
    /// An SMTP RCPT domain. The caller consults MX records and falls back
    /// to the domain itself; see the connection handler.
    MailDomain(String),
    /// Not enough bytes yet; read more and try again.
    NeedMore,
    /// No rule can ever match this buffer; stop reading.
    DeadEnd,
}

/// A sniffer bound to one controlled zone.
///
/// The magic-subdomain matcher is compiled against the zone once at
/// startup, mirroring how the zone itself is fixed for the process
/// lifetime.
pub struct Sniffer {
    magic: Regex,
}

impl Sniffer {
    /// Build a sniffer for the given zone (trailing dot ignored).
    pub fn new(zone: &str) -> SixgateResult<Self> {
        let zone = zone.trim_end_matches('.');
        if zone.is_empty() {
            return Err(SixgateError::Other("empty zone".into()));
        }
        let pattern = format!(
            r"(?i)(?:[0-9a-f]{{4}}-){{7}}[0-9a-f]{{4}}\.{}",
            regex::escape(zone)
        );
        let magic = Regex::new(&pattern)
            .map_err(|e| SixgateError::Other(format!("zone pattern: {e}")))?;
        Ok(Self { magic })
    }

    /// Classify `buf`, the preview bytes accumulated so far.
    ///
    /// `port_hint` is the original destination port of the redirected
    /// connection; it gates the SMTP rule. The caller is responsible for
    /// treating [`Sniffed::NeedMore`] at [`MAX_LOOKAHEAD`] as a dead end.
    pub fn sniff(&self, buf: &[u8], port_hint: u16) -> Sniffed {
        if port_hint == SMTP_PORT && SMTP_HELLO.is_match(buf) {
            return sniff_smtp(buf);
        }

        if HTTP_REQUEST_LINE.is_match(buf) {
            return sniff_http(buf);
        }

        if buf.len() >= 3 && buf[0] == 0x16 && buf[1] == 0x03 && buf[2] <= 0x06 {
            return match tls::read_client_hello(buf) {
                ClientHello::Sni(host) => Sniffed::Hosts(vec![host]),
                ClientHello::NeedMore => Sniffed::NeedMore,
                ClientHello::NoSni | ClientHello::Invalid => Sniffed::DeadEnd,
            };
        }

        if let Some(found) = self.magic.find(buf) {
            // the match is ASCII by construction
            let host = String::from_utf8_lossy(found.as_bytes()).into_owned();
            return Sniffed::Hosts(vec![host]);
        }

        Sniffed::NeedMore
    }
}

/// SMTP: the domain part of the RCPT TO address names the vhost.
fn sniff_smtp(buf: &[u8]) -> Sniffed {
    let caps = match SMTP_RCPT.captures(buf) {
        Some(caps) => caps,
        // not at the RCPT command yet
        None => return Sniffed::NeedMore,
    };

    let domain = caps
        .get(1)
        .or_else(|| caps.get(2))
        .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
        .unwrap_or_default();
    if domain.is_empty() {
        return Sniffed::DeadEnd;
    }
    Sniffed::MailDomain(domain)
}

/// HTTP: scan header lines for `Host:`, stopping at the blank line.
///
/// Only CRLF-terminated lines are considered; the unfinished tail of the
/// buffer is left for the next read so a header split across reads is
/// neither truncated nor mistaken for the end of the block.
fn sniff_http(buf: &[u8]) -> Sniffed {
    let mut rest = buf;
    while let Some(idx) = rest.windows(2).position(|w| w == b"\r\n") {
        let line = &rest[..idx];
        rest = &rest[idx + 2..];

        // a blank line is how HTTP signals the end of headers
        if line.is_empty() {
            return Sniffed::DeadEnd;
        }
        if let Some(caps) = HTTP_HOST_HEADER.captures(line) {
            if let Some(host) = caps.get(1) {
                let host = String::from_utf8_lossy(host.as_bytes()).into_owned();
                return Sniffed::Hosts(vec![host]);
            }
        }
    }
    Sniffed::NeedMore
}
