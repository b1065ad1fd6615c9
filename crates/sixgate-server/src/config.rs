//! Server configuration: TOML file + CLI overrides.
//!
//! Loaded once at startup, validated, and passed around as an immutable
//! `Arc<Config>`. The raw serde section structs mirror the TOML layout;
//! [`Config`] is the resolved form with typed addresses and `Duration`
//! accessors.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use sixgate_core::{mapped_source, SixgateError, SixgateResult};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub dns: DnsSection,
    #[serde(default)]
    pub recurse: RecurseSection,
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub abuse: AbuseSection,
    #[serde(default)]
    pub ui: UiSection,
    #[serde(default)]
    pub log: LogSection,
}

/// `[dns]` section: the controlled zone and the authoritative answers we
/// synthesize for it.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsSection {
    #[serde(default = "default_zone")]
    pub zone: String,
    #[serde(default = "default_admin_email")]
    pub admin_email: String,
    #[serde(default = "default_dns_ttl")]
    pub ttl: u32,
    #[serde(default = "default_public_ipv4")]
    pub public_ipv4: String,
    #[serde(default = "default_public_ipv6")]
    pub public_ipv6: String,
    /// Budget for forwarding MX/A/AAAA/TXT questions to a backend.
    #[serde(default = "default_passthrough_timeout_ms")]
    pub passthrough_timeout_ms: u64,
}

impl Default for DnsSection {
    fn default() -> Self {
        Self {
            zone: default_zone(),
            admin_email: default_admin_email(),
            ttl: default_dns_ttl(),
            public_ipv4: default_public_ipv4(),
            public_ipv6: default_public_ipv6(),
            passthrough_timeout_ms: default_passthrough_timeout_ms(),
        }
    }
}

/// `[recurse]` section: the selective recursive resolver.
#[derive(Debug, Clone, Deserialize)]
pub struct RecurseSection {
    /// The only server we ever send recursion-desired queries to.
    #[serde(default = "default_upstream")]
    pub upstream: String,
    #[serde(default = "default_edns_buffer_size")]
    pub edns_buffer_size: u16,
    #[serde(default = "default_recurse_min_ttl")]
    pub min_ttl: u32,
    #[serde(default = "default_recurse_max_ttl")]
    pub max_ttl: u32,
    /// Concurrent resolutions admitted per eTLD+1.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// Downstream NS queries allowed per `authority()` walk.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_max_lookup_ms")]
    pub max_lookup_ms: u64,
}

impl Default for RecurseSection {
    fn default() -> Self {
        Self {
            upstream: default_upstream(),
            edns_buffer_size: default_edns_buffer_size(),
            min_ttl: default_recurse_min_ttl(),
            max_ttl: default_recurse_max_ttl(),
            concurrency_limit: default_concurrency_limit(),
            max_depth: default_max_depth(),
            max_lookup_ms: default_max_lookup_ms(),
        }
    }
}

/// `[proxy]` section: the transparent listener and splice engine.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxySection {
    /// Loopback pseudo-address the kernel redirects inbound IPv4 to.
    #[serde(default = "default_proxy_listen")]
    pub listen: String,
    /// `/96` prefix under which outbound source addresses encode the
    /// client's IPv4.
    #[serde(default = "default_mapped_prefix")]
    pub mapped_prefix: String,
    #[serde(default = "default_max_connect_ms")]
    pub max_connect_ms: u64,
    #[serde(default = "default_max_identify_ms")]
    pub max_identify_ms: u64,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            listen: default_proxy_listen(),
            mapped_prefix: default_mapped_prefix(),
            max_connect_ms: default_max_connect_ms(),
            max_identify_ms: default_max_identify_ms(),
        }
    }
}

/// `[abuse]` section: reputation gating and pattern recording.
#[derive(Debug, Clone, Deserialize)]
pub struct AbuseSection {
    /// API key for the external reputation service. Empty disables
    /// nothing; calls simply fail and the cache records the fail-open
    /// sentinel.
    #[serde(default)]
    pub api_key: String,
    /// Connections from IPs scoring at or above this are blocked.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: i64,
    #[serde(default = "default_record_length")]
    pub record_length: usize,
    #[serde(default = "default_record_time_ms")]
    pub record_time_ms: u64,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_ip_expire_secs")]
    pub ip_expire_secs: u64,
    #[serde(default = "default_pattern_expire_secs")]
    pub pattern_expire_secs: u64,
    /// Cap on unconfirmed patterns attributed to a single source IP.
    #[serde(default = "default_patterns_per_ip")]
    pub patterns_per_ip: i64,
    /// Observation count at which a pattern's raw bytes are kept.
    #[serde(default = "default_save_pattern_after")]
    pub save_pattern_after: i64,
    /// Feed blocked clients a slow byte drip instead of closing at once.
    #[serde(default)]
    pub annoy: bool,
}

impl Default for AbuseSection {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            confidence_threshold: default_confidence_threshold(),
            record_length: default_record_length(),
            record_time_ms: default_record_time_ms(),
            db_path: default_db_path(),
            ip_expire_secs: default_ip_expire_secs(),
            pattern_expire_secs: default_pattern_expire_secs(),
            patterns_per_ip: default_patterns_per_ip(),
            save_pattern_after: default_save_pattern_after(),
            annoy: false,
        }
    }
}

/// `[ui]` section: basic-auth credentials consumed by the external
/// pattern-review UI. The daemon itself only stores them.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct UiSection {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

/// `[log]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct LogSection {
    /// Printable-byte ratio above which recorded bytes are logged as an
    /// escaped string rather than base64.
    #[serde(default = "default_string_cutoff")]
    pub string_cutoff: f32,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            string_cutoff: default_string_cutoff(),
        }
    }
}

fn default_zone() -> String {
    "example.net".into()
}
fn default_admin_email() -> String {
    "hostmaster@example.net".into()
}
fn default_dns_ttl() -> u32 {
    300
}
fn default_public_ipv4() -> String {
    "192.0.2.1".into()
}
fn default_public_ipv6() -> String {
    "2001:db8::1".into()
}
fn default_passthrough_timeout_ms() -> u64 {
    2_000
}
fn default_upstream() -> String {
    "9.9.9.9".into()
}
fn default_edns_buffer_size() -> u16 {
    1232
}
fn default_recurse_min_ttl() -> u32 {
    60
}
fn default_recurse_max_ttl() -> u32 {
    86_400
}
fn default_concurrency_limit() -> usize {
    10
}
fn default_max_depth() -> usize {
    16
}
fn default_max_lookup_ms() -> u64 {
    10_000
}
fn default_proxy_listen() -> String {
    "127.0.0.1:8484".into()
}
fn default_mapped_prefix() -> String {
    "64:ff9b:1::".into()
}
fn default_max_connect_ms() -> u64 {
    10_000
}
fn default_max_identify_ms() -> u64 {
    10_000
}
fn default_confidence_threshold() -> i64 {
    50
}
fn default_record_length() -> usize {
    1024
}
fn default_record_time_ms() -> u64 {
    1_000
}
fn default_db_path() -> String {
    "/var/lib/sixgate/abuse.sqlite".into()
}
fn default_ip_expire_secs() -> u64 {
    86_400
}
fn default_pattern_expire_secs() -> u64 {
    604_800
}
fn default_patterns_per_ip() -> i64 {
    8
}
fn default_save_pattern_after() -> i64 {
    3
}
fn default_string_cutoff() -> f32 {
    0.8
}

/// Resolved configuration: addresses parsed, durations typed, zone
/// normalized to lowercase without a trailing dot.
#[derive(Debug, Clone)]
pub struct Config {
    pub zone: String,
    pub admin_email: String,
    pub dns_ttl: u32,
    pub public_ipv4: Ipv4Addr,
    pub public_ipv6: Ipv6Addr,
    pub passthrough_timeout: Duration,

    /// Upstream recursive resolver, kept both as the configured string
    /// (the recursion-desired comparison key) and as a dial address.
    pub upstream: String,
    pub upstream_addr: SocketAddr,
    pub edns_buffer_size: u16,
    pub recurse_min_ttl: u32,
    pub recurse_max_ttl: u32,
    pub recurse_concurrency_limit: usize,
    pub recurse_max_depth: usize,
    pub max_lookup: Duration,

    pub proxy_listen: SocketAddr,
    pub mapped_prefix: String,
    pub max_connect: Duration,
    pub max_identify: Duration,

    pub abuse_api_key: String,
    pub abuse_confidence_threshold: i64,
    pub abuse_record_length: usize,
    pub abuse_record_time: Duration,
    pub abuse_db_path: PathBuf,
    pub abuse_ip_expire: Duration,
    pub abuse_pattern_expire: Duration,
    pub abuse_patterns_per_ip: i64,
    pub abuse_save_pattern_after: i64,
    pub abuse_annoy: bool,

    pub ui_user: String,
    pub ui_password: String,

    pub log_string_cutoff: f32,
}

impl Config {
    /// Load and validate configuration from a TOML file.
    ///
    /// A missing file yields the built-in defaults; a present-but-invalid
    /// file is an error. Address fields and the mapped prefix are parsed
    /// here so the rest of the process never revalidates them.
    pub fn load(path: Option<&Path>) -> SixgateResult<Self> {
        let file = match path {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(path)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| SixgateError::Other(format!("config parse error: {e}")))?
            }
            Some(path) => {
                info!(path = %path.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file)
    }

    fn resolve(file: ConfigFile) -> SixgateResult<Self> {
        let zone = file.dns.zone.trim_end_matches('.').to_ascii_lowercase();
        if zone.is_empty() {
            return Err(SixgateError::Other("dns.zone must not be empty".into()));
        }

        let public_ipv4: Ipv4Addr = file
            .dns
            .public_ipv4
            .parse()
            .map_err(|_| SixgateError::Other("dns.public_ipv4 is not an IPv4 address".into()))?;
        let public_ipv6: Ipv6Addr = file
            .dns
            .public_ipv6
            .parse()
            .map_err(|_| SixgateError::Other("dns.public_ipv6 is not an IPv6 address".into()))?;

        let upstream_ip: IpAddr = file
            .recurse
            .upstream
            .parse()
            .map_err(|_| SixgateError::Other("recurse.upstream is not an IP address".into()))?;

        let proxy_listen: SocketAddr = file
            .proxy
            .listen
            .parse()
            .map_err(|_| SixgateError::Other("proxy.listen is not host:port".into()))?;

        // reject a prefix that cannot carry a dotted quad
        if mapped_source(&file.proxy.mapped_prefix, Ipv4Addr::new(1, 2, 3, 4)).is_none() {
            return Err(SixgateError::Other(
                "proxy.mapped_prefix does not form valid IPv6 addresses".into(),
            ));
        }

        if file.recurse.min_ttl > file.recurse.max_ttl {
            return Err(SixgateError::Other(
                "recurse.min_ttl exceeds recurse.max_ttl".into(),
            ));
        }
        if file.recurse.concurrency_limit == 0 {
            return Err(SixgateError::Other(
                "recurse.concurrency_limit must be at least 1".into(),
            ));
        }

        Ok(Self {
            zone,
            admin_email: file.dns.admin_email,
            dns_ttl: file.dns.ttl,
            public_ipv4,
            public_ipv6,
            passthrough_timeout: Duration::from_millis(file.dns.passthrough_timeout_ms),
            upstream: file.recurse.upstream,
            upstream_addr: SocketAddr::new(upstream_ip, 53),
            edns_buffer_size: file.recurse.edns_buffer_size,
            recurse_min_ttl: file.recurse.min_ttl,
            recurse_max_ttl: file.recurse.max_ttl,
            recurse_concurrency_limit: file.recurse.concurrency_limit,
            recurse_max_depth: file.recurse.max_depth,
            max_lookup: Duration::from_millis(file.recurse.max_lookup_ms),
            proxy_listen,
            mapped_prefix: file.proxy.mapped_prefix,
            max_connect: Duration::from_millis(file.proxy.max_connect_ms),
            max_identify: Duration::from_millis(file.proxy.max_identify_ms),
            abuse_api_key: file.abuse.api_key,
            abuse_confidence_threshold: file.abuse.confidence_threshold,
            abuse_record_length: file.abuse.record_length,
            abuse_record_time: Duration::from_millis(file.abuse.record_time_ms),
            abuse_db_path: PathBuf::from(file.abuse.db_path),
            abuse_ip_expire: Duration::from_secs(file.abuse.ip_expire_secs),
            abuse_pattern_expire: Duration::from_secs(file.abuse.pattern_expire_secs),
            abuse_patterns_per_ip: file.abuse.patterns_per_ip,
            abuse_save_pattern_after: file.abuse.save_pattern_after,
            abuse_annoy: file.abuse.annoy,
            ui_user: file.ui.user,
            ui_password: file.ui.password,
            log_string_cutoff: file.log.string_cutoff,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve() {
        let cfg = Config::resolve(ConfigFile::default()).unwrap();
        assert_eq!(cfg.zone, "example.net");
        assert_eq!(cfg.upstream_addr.port(), 53);
        assert_eq!(cfg.max_lookup, Duration::from_secs(10));
        assert!(!cfg.abuse_annoy);
    }

    #[test]
    fn zone_is_normalized() {
        let mut file = ConfigFile::default();
        file.dns.zone = "Example.ORG.".into();
        let cfg = Config::resolve(file).unwrap();
        assert_eq!(cfg.zone, "example.org");
    }

    #[test]
    fn rejects_bad_mapped_prefix() {
        let mut file = ConfigFile::default();
        file.proxy.mapped_prefix = "not-a-prefix".into();
        assert!(Config::resolve(file).is_err());
    }

    #[test]
    fn rejects_inverted_ttl_bounds() {
        let mut file = ConfigFile::default();
        file.recurse.min_ttl = 7200;
        file.recurse.max_ttl = 60;
        assert!(Config::resolve(file).is_err());
    }

    #[test]
    fn parses_section_toml() {
        let raw = r#"
            [dns]
            zone = "vhosts.example"
            public_ipv4 = "198.51.100.4"
            public_ipv6 = "2001:db8:4::4"

            [recurse]
            upstream = "2606:4700:4700::1111"
            concurrency_limit = 3

            [abuse]
            confidence_threshold = 25
            annoy = true
        "#;
        let file: ConfigFile = toml::from_str(raw).unwrap();
        let cfg = Config::resolve(file).unwrap();
        assert_eq!(cfg.zone, "vhosts.example");
        assert_eq!(cfg.recurse_concurrency_limit, 3);
        assert_eq!(cfg.abuse_confidence_threshold, 25);
        assert!(cfg.upstream_addr.is_ipv6());
        assert!(cfg.abuse_annoy);
    }
}
