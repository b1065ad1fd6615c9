use thiserror::Error;

/// Errors produced across the sixgate pipelines.
///
/// The connection pipeline closes both sides and logs on any of these; the
/// DNS pipeline collapses resolver errors to SERVFAIL and policy rejections
/// to NOTAUTH; the abuse pipeline logs and swallows. Those mappings live at
/// the call sites, not here.
#[derive(Debug, Error)]
pub enum SixgateError {
    #[error("a hostname could not be identified")]
    NoHost,

    #[error("no IPv6 address for host: {0}")]
    NoIpv6(String),

    #[error("backend dial failed: {0}")]
    Dial(String),

    #[error("eTLD+1 is already at its query concurrency limit")]
    ConcurrencyLimit,

    #[error("exceeded maximum recursion depth")]
    RecursionDepth,

    #[error("could not find a public-suffix nameserver")]
    NoSuffixNameServer,

    #[error("unexpected DNS rcode: {0}")]
    BadRcode(String),

    #[error("protocol error: {0}")]
    Proto(String),

    #[error("database error: {0}")]
    Db(String),

    #[error("reputation service error: {0}")]
    Reputation(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type SixgateResult<T> = Result<T, SixgateError>;
