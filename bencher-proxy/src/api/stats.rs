//! The stats listener: a plain-text dump of the known-miner table.

use axum::extract::State;

use super::AppState;

pub async fn handle(State(state): State<AppState>) -> String {
    format!("Bencher Stats\n\n{}", state.clients.render_stats())
}
