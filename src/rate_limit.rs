use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};

use crate::{config::RateLimitConfig, error::ApiError, state::AppState};

/// Per-source-IP sliding-window limiter shared across all endpoints.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    hits: RwLock<HashMap<IpAddr, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(cfg: &RateLimitConfig) -> Self {
        Self {
            max_requests: cfg.max_requests,
            window: Duration::from_secs(cfg.window_secs),
            hits: RwLock::new(HashMap::new()),
        }
    }

    pub fn allow(&self, ip: IpAddr) -> bool {
        self.allow_at(ip, Instant::now())
    }

    fn allow_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut hits = match self.hits.write() {
            Ok(guard) => guard,
            // A poisoned lock only means another request panicked mid-insert;
            // the window data is still usable.
            Err(poisoned) => poisoned.into_inner(),
        };
        let window = self.window;
        let entry = hits.entry(ip).or_default();
        entry.retain(|t| now.duration_since(*t) < window);
        if entry.len() >= self.max_requests {
            return false;
        }
        entry.push(now);
        true
    }
}

pub async fn limit(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

    if !state.limiter.allow(ip) {
        return Err(ApiError::RateLimited);
    }
    Ok(next.run(req).await)
}
