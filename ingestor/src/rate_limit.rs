use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::warn;

/// Number of tracked addresses above which expired windows are pruned.
const PRUNE_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    started: Instant,
}

/// Fixed-window request counter per client address.
#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    max_requests: u32,
    window: Duration,
    requests: RwLock<HashMap<IpAddr, Window>>,
}

impl RateLimiter {
    pub fn new(enabled: bool, max_requests: u32, window: Duration) -> Self {
        Self {
            enabled,
            max_requests,
            window,
            requests: RwLock::new(HashMap::new()),
        }
    }

    pub fn per_minute(enabled: bool, max_requests: u32) -> Self {
        Self::new(enabled, max_requests, Duration::from_secs(60))
    }

    pub fn disabled() -> Self {
        Self::new(false, 0, Duration::from_secs(60))
    }

    /// Counts one request from `ip`; on excess returns the seconds until the window resets.
    pub async fn check(&self, ip: IpAddr) -> Result<(), u64> {
        if !self.enabled {
            return Ok(());
        }

        let now = Instant::now();
        let mut requests = self.requests.write().await;

        if requests.len() > PRUNE_THRESHOLD {
            let window = self.window;
            requests.retain(|_, w| now.duration_since(w.started) < window);
        }

        let entry = requests.entry(ip).or_insert(Window {
            count: 0,
            started: now,
        });

        if now.duration_since(entry.started) >= self.window {
            entry.count = 0;
            entry.started = now;
        }

        entry.count += 1;

        if entry.count > self.max_requests {
            let remaining = self
                .window
                .checked_sub(now.duration_since(entry.started))
                .map(|d| d.as_secs())
                .unwrap_or(0);
            Err(remaining)
        } else {
            Ok(())
        }
    }
}

/// Rejects requests with 429 once a client exceeds its window.
///
/// Requests without connection info (e.g. in-process tests) pass through.
pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let Some(ip) = ip else {
        return next.run(request).await;
    };

    match limiter.check(ip).await {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            warn!("Rate limit exceeded for {} on {}", ip, request.uri().path());
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after.to_string())],
                Json(serde_json::json!({
                    "error": "Too many requests",
                    "retry_after": retry_after
                })),
            )
                .into_response()
        }
    }
}
