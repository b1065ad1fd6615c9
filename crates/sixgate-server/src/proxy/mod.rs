//! Proxy subsystem — the transparent listener and splice engine.
//!
//! Four cooperating submodules:
//!
//! - **[`listener`]** — binds the transparent loopback pseudo-address and
//!   spawns one handler task per accepted connection.
//! - **[`conn`]** — the per-connection pipeline: IPv6-client reject,
//!   reputation gate (with the abuse-recording path for blocked peers),
//!   the identification loop over the preview buffer, backend dialing
//!   with the mapped-prefix source bind, and the bidirectional splice.
//! - **[`smtp`]** — the canned greeting the proxy stuffs toward mail
//!   clients, and the eater that consumes the backend's own greeting.
//! - **[`lookup`]** — AAAA resolution for backends and MX-first
//!   candidate selection for mail domains.

pub mod conn;
pub mod listener;
pub mod lookup;
pub mod smtp;

pub use listener::ProxyService;
