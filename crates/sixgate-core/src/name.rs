//! Magic-subdomain name codec.
//!
//! A backend under the controlled zone is addressed by a name of the form
//! `hhhh-hhhh-hhhh-hhhh-hhhh-hhhh-hhhh-hhhh.<zone>` — eight groups of four
//! hex digits that, joined with `:`, spell the backend's IPv6 address.
//!
//! Two anchoring modes exist and are used by different call sites:
//!
//! - [`extract_ipv6`] requires the magic form to be a *complete label*
//!   directly above the zone. The zone synthesizer and the recursive
//!   resolver's next-server short-circuit use this mode.
//! - The sniffer's fallback rule searches for the pattern *embedded*
//!   anywhere in a byte buffer; that matcher lives in
//!   [`crate::sniff::Sniffer`] because it is compiled against the zone once.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;

use regex::Regex;

static MAGIC_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[0-9a-f]{4}-){7}[0-9a-f]{4}$").expect("static regex"));

/// Extract the IPv6 address embedded in a name under `zone`.
///
/// The name must end with `.zone` (trailing dots and case are ignored on
/// both sides), and the label immediately above the zone must be the
/// eight-group hex form. Deeper prefixes are allowed:
/// `mail.2001-0db8-…-0001.example.net` extracts the same address as the
/// bare magic name.
///
/// Returns `None` for names outside the zone, malformed labels, and
/// addresses that decode to an IPv4-mapped form (those would defeat the
/// v4-to-v6 mapping the proxy exists for).
pub fn extract_ipv6(name: &str, zone: &str) -> Option<Ipv6Addr> {
    let name = name.trim_end_matches('.').to_ascii_lowercase();
    let zone = zone.trim_end_matches('.').to_ascii_lowercase();

    let suffix = format!(".{zone}");
    let stem = name.strip_suffix(&suffix)?;

    let label = stem.rsplit('.').next()?;
    if !MAGIC_LABEL.is_match(label) {
        return None;
    }

    let ip: Ipv6Addr = label.replace('-', ":").parse().ok()?;
    if ip.to_ipv4_mapped().is_some() {
        return None;
    }
    Some(ip)
}

/// Render an IPv6 address as the magic label for `zone`.
///
/// Inverse of [`extract_ipv6`]; used when synthesizing in-zone nameserver
/// names and in tests.
pub fn to_magic_name(ip: Ipv6Addr, zone: &str) -> String {
    let groups = ip
        .segments()
        .iter()
        .map(|s| format!("{s:04x}"))
        .collect::<Vec<_>>()
        .join("-");
    format!("{}.{}", groups, zone.trim_end_matches('.'))
}

/// Build the outbound source address that encodes a client's IPv4 identity.
///
/// The configured `/96` prefix is concatenated textually with the dotted
/// quad, so a prefix of `64:ff9b:1::` and a client of `192.0.2.7` yields
/// `64:ff9b:1::192.0.2.7`. Operators recover the client by reading the low
/// 32 bits of the backend's peer address.
pub fn mapped_source(prefix: &str, client: Ipv4Addr) -> Option<Ipv6Addr> {
    format!("{prefix}{client}").parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZONE: &str = "example.net";

    #[test]
    fn extracts_plain_magic_name() {
        let ip = extract_ipv6("2001-0db8-0000-0000-0000-0000-0000-0001.example.net", ZONE);
        assert_eq!(ip, Some("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn extracts_with_trailing_dot_and_mixed_case() {
        let ip = extract_ipv6("2001-0DB8-0000-0000-0000-0000-0000-0001.Example.NET.", ZONE);
        assert_eq!(ip, Some("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn extracts_below_deeper_prefix() {
        let ip = extract_ipv6(
            "mail.2001-0db8-0000-0000-0000-0000-0000-0002.example.net",
            ZONE,
        );
        assert_eq!(ip, Some("2001:db8::2".parse().unwrap()));
    }

    #[test]
    fn rejects_foreign_zone() {
        assert_eq!(
            extract_ipv6("2001-0db8-0000-0000-0000-0000-0000-0001.example.org", ZONE),
            None
        );
    }

    #[test]
    fn rejects_short_and_malformed_labels() {
        assert_eq!(extract_ipv6("2001-0db8.example.net", ZONE), None);
        assert_eq!(extract_ipv6("example.net", ZONE), None);
        assert_eq!(
            extract_ipv6("2001-0db8-0000-0000-0000-0000-0000-zzzz.example.net", ZONE),
            None
        );
    }

    #[test]
    fn rejects_ipv4_mapped() {
        // ::ffff:192.0.2.1 spelled out in eight groups
        assert_eq!(
            extract_ipv6("0000-0000-0000-0000-0000-ffff-c000-0201.example.net", ZONE),
            None
        );
    }

    #[test]
    fn magic_name_round_trips() {
        let ip: Ipv6Addr = "2001:db8:fe:9::1234".parse().unwrap();
        let name = to_magic_name(ip, ZONE);
        assert_eq!(extract_ipv6(&name, ZONE), Some(ip));
    }

    #[test]
    fn mapped_source_encodes_client() {
        let src = mapped_source("64:ff9b:1::", Ipv4Addr::new(192, 0, 2, 7)).unwrap();
        assert_eq!(src, "64:ff9b:1::c000:207".parse::<Ipv6Addr>().unwrap());
        let seg = src.segments();
        assert_eq!(seg[6], 0xc000);
        assert_eq!(seg[7], 0x0207);
    }

    #[test]
    fn mapped_source_rejects_bad_prefix() {
        assert_eq!(mapped_source("not-a-prefix", Ipv4Addr::new(1, 2, 3, 4)), None);
    }
}
