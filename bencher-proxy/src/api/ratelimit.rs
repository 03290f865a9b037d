//! Per-path request throttling for both listeners.

use std::sync::Mutex;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;

use super::AppState;

/// Token bucket per request path: `rate` tokens per second with `burst`
/// capacity. Shared by both listeners, so equal paths share a budget.
pub struct RateLimiter {
    buckets: DashMap<String, Mutex<Bucket>>,
    rate: f64,
    burst: f64,
}

struct Bucket {
    tokens: f64,
    refreshed: Instant,
}

impl RateLimiter {
    pub fn new(rate: u32, burst: u32) -> Self {
        Self {
            buckets: DashMap::new(),
            rate: f64::from(rate),
            burst: f64::from(burst.max(1)),
        }
    }

    pub fn allow(&self, path: &str) -> bool {
        self.allow_at(path, Instant::now())
    }

    fn allow_at(&self, path: &str, now: Instant) -> bool {
        let bucket = self.buckets.entry(path.to_string()).or_insert_with(|| {
            Mutex::new(Bucket {
                tokens: self.burst,
                refreshed: now,
            })
        });
        let mut bucket = bucket.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed = now.saturating_duration_since(bucket.refreshed).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.refreshed = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Axum middleware rejecting over-budget requests with 429.
pub async fn throttle(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if state.limiter.allow(request.uri().path()) {
        next.run(request).await
    } else {
        StatusCode::TOO_MANY_REQUESTS.into_response()
    }
}
