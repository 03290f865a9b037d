//! bencher-proxy sits between a fleet of proof-of-capacity miners and one
//! or two upstream pools or wallets. It keeps an always-current view of
//! each upstream's mining round, admits or rejects incoming nonce
//! submissions per source address and account, forwards the survivors, and
//! always answers miners with a syntactically valid body.

pub mod admission;
pub mod api;
pub mod cache;
pub mod capacity;
pub mod chain;
pub mod config;
pub mod error;
pub mod refresher;
pub mod tracing;
pub mod types;
pub mod upstream;

/// Crate version, reported in upstream product headers.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
