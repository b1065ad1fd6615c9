//! Abuse pipeline — reputation gating, pattern recording, reporting.
//!
//! Three cooperating submodules:
//!
//! - **[`store`]** — the embedded SQL store: the reputation-score cache
//!   and the pattern records with their upsert/confirm lifecycle, plus
//!   the operator interface the external review UI calls.
//! - **[`reputation`]** — the HTTP client for the external reputation
//!   service, layered over the store's cache. Checks fail open; reports
//!   are suppressed by the [`store::REPORTED_BY_US`] sentinel.
//! - **[`workflow`]** — the per-connection recording path for blocked
//!   clients, the optional annoy drip, and the background sweeper.

pub mod reputation;
pub mod store;
pub mod workflow;

pub use reputation::ReputationClient;
pub use store::AbuseStore;
pub use workflow::{annoy, record_abusive_open, spawn_sweeper};
