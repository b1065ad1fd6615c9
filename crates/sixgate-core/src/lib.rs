//! sixgate-core: Shared protocol logic for the sixgate reverse proxy.
//!
//! Provides the error type, the protocol sniffer that classifies a
//! connection's opening bytes, the TLS ClientHello/SNI reader, and the
//! magic-subdomain name codec. Everything here is pure and I/O-free so the
//! server crate can exercise it under deadlines of its own choosing.

pub mod error;
pub mod name;
pub mod sniff;
pub mod tls;

// Re-export commonly used items at crate root.
pub use error::{SixgateError, SixgateResult};
pub use name::{extract_ipv6, mapped_source};
pub use sniff::{Sniffed, Sniffer, MAX_LOOKAHEAD, SMTP_PORT};
pub use tls::{read_client_hello, ClientHello};
