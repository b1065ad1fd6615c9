//! DNS subsystem — zone synthesis and selective recursion.
//!
//! Five cooperating submodules:
//!
//! - **[`client`]** — one-shot query exchange over UDP (EDNS-sized
//!   buffers) or TCP (length-prefixed framing), bounded by a deadline.
//! - **[`cache`]** — the NS response cache, keyed by (name, server) with
//!   clamped TTLs and lazy expiry.
//! - **[`limiter`]** — the per-eTLD+1 counting-semaphore table bounding
//!   concurrent recursive walks.
//! - **[`recurse`]** — `authority()` and the selective query handler:
//!   walk the delegation chain, forward only when the authority is an
//!   in-zone magic name, NOTAUTH otherwise.
//! - **[`zone`]** — authoritative answers for the controlled zone
//!   (magic-name synthesis, apex records, backend passthrough).
//! - **[`server`]** — the UDP/TCP listeners tying the handlers to the
//!   public addresses.

pub mod cache;
pub mod client;
pub mod limiter;
pub mod recurse;
pub mod server;
pub mod zone;

pub use cache::NsCache;
pub use limiter::RecursionGate;
pub use recurse::Recursor;
pub use server::DnsService;
pub use zone::ZoneAuthority;
