//! Miner-facing and stats HTTP listeners.
//!
//! Both listeners are axum routers sharing one `AppState`. The miner-facing
//! router dispatches every path through a single handler keyed on the
//! `requestType` form field, which is how Burst-family mining software
//! expects the endpoint to behave. Request throttling sits in front of both
//! routers, keyed by path.

pub mod miner;
pub mod ratelimit;
pub mod stats;

use std::sync::Arc;

use axum::{middleware, Router};

use crate::admission::Engine;
use crate::capacity::ClientRegistry;
use crate::chain::ChainState;
use crate::upstream::Transport;
use ratelimit::RateLimiter;

/// State shared by all handlers on both listeners.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub chains: Arc<ChainState>,
    pub clients: Arc<ClientRegistry>,

    /// Streaming upstream to notify on capacity changes, when one exists.
    pub push: Option<Arc<Transport>>,

    pub limiter: Arc<RateLimiter>,
}

/// Miner-facing router: one dispatching handler on every path.
pub fn miner_routes(state: AppState) -> Router {
    Router::new()
        .fallback(miner::handle)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            ratelimit::throttle,
        ))
        .with_state(state)
}

/// Stats router: a plain-text miner table on every path.
pub fn stats_routes(state: AppState) -> Router {
    Router::new()
        .fallback(stats::handle)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            ratelimit::throttle,
        ))
        .with_state(state)
}
