//! Request middleware: per-client rate limiting and the access log. Both skip
//! the transfer routes.

use super::ServerState;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

pub const HEADER_RATE_LIMIT: &str = "ratelimit-limit";
pub const HEADER_RATE_REMAINING: &str = "ratelimit-remaining";
pub const HEADER_RATE_RESET: &str = "ratelimit-reset";

pub const RATE_LIMITED_MESSAGE: &str = "Too many requests, please try again later.";

/// Tracked clients above which expired windows are pruned
const PRUNE_THRESHOLD: usize = 10_000;

/// Download and upload requests are neither limited nor logged
pub fn is_transfer_path(path: &str) -> bool {
    path.starts_with("/download") || path.starts_with("/upload")
}

#[derive(Debug, Clone, Copy)]
struct ClientWindow {
    started: Instant,
    count: u32,
}

/// Outcome of one request against its client's window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the client's window resets
    pub reset_after: Duration,
}

impl RateDecision {
    fn reset_secs(&self) -> u64 {
        // Round up so a client waiting this long is always admitted
        let secs = self.reset_after.as_secs();
        if self.reset_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }
}

/// Fixed-window request counter per client address. A limit of 0 admits
/// every request.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    clients: Mutex<HashMap<IpAddr, ClientWindow>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_requests > 0 && !self.window.is_zero()
    }

    pub fn check(&self, client: IpAddr, now: Instant) -> RateDecision {
        if !self.is_enabled() {
            return RateDecision {
                allowed: true,
                limit: 0,
                remaining: 0,
                reset_after: Duration::ZERO,
            };
        }

        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if clients.len() >= PRUNE_THRESHOLD {
            let window = self.window;
            clients.retain(|_, entry| now.saturating_duration_since(entry.started) < window);
        }

        let entry = clients.entry(client).or_insert(ClientWindow {
            started: now,
            count: 0,
        });
        if now.saturating_duration_since(entry.started) >= self.window {
            *entry = ClientWindow {
                started: now,
                count: 0,
            };
        }

        let allowed = entry.count < self.max_requests;
        if allowed {
            entry.count += 1;
        }
        RateDecision {
            allowed,
            limit: self.max_requests,
            remaining: self.max_requests - entry.count,
            reset_after: (entry.started + self.window).saturating_duration_since(now),
        }
    }
}

fn client_ip(request: &Request) -> IpAddr {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

fn insert_rate_headers(response: &mut Response, decision: &RateDecision) {
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static(HEADER_RATE_LIMIT),
        HeaderValue::from(decision.limit),
    );
    headers.insert(
        HeaderName::from_static(HEADER_RATE_REMAINING),
        HeaderValue::from(decision.remaining),
    );
    headers.insert(
        HeaderName::from_static(HEADER_RATE_RESET),
        HeaderValue::from(decision.reset_secs()),
    );
}

pub async fn rate_limit(
    State(state): State<ServerState>,
    request: Request,
    next: Next,
) -> Response {
    if is_transfer_path(request.uri().path()) || !state.limiter.is_enabled() {
        return next.run(request).await;
    }

    let decision = state.limiter.check(client_ip(&request), Instant::now());
    if !decision.allowed {
        state.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
        let mut response = (StatusCode::TOO_MANY_REQUESTS, RATE_LIMITED_MESSAGE).into_response();
        insert_rate_headers(&mut response, &decision);
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(decision.reset_secs()));
        return response;
    }

    let mut response = next.run(request).await;
    insert_rate_headers(&mut response, &decision);
    response
}

pub async fn access_log(
    State(state): State<ServerState>,
    request: Request,
    next: Next,
) -> Response {
    if !state.config.access_log || is_transfer_path(request.uri().path()) {
        return next.run(request).await;
    }

    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let client = client_ip(&request);
    let started = Instant::now();

    let response = next.run(request).await;

    state
        .logger
        .child("access")
        .info(&format!("{} {}", method, path))
        .field("status", response.status().as_u16())
        .field("duration_ms", started.elapsed().as_secs_f64() * 1000.0)
        .field("client", client.to_string())
        .log()
        .await;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_transfer_paths_are_exempt() {
        assert!(is_transfer_path("/download"));
        assert!(is_transfer_path("/upload"));
        assert!(!is_transfer_path("/ping"));
        assert!(!is_transfer_path("/fastping"));
        assert!(!is_transfer_path("/status"));
    }

    #[test]
    fn test_limit_per_client_window() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 3);
        let start = Instant::now();

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.check(ip(1), start);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }
        let refused = limiter.check(ip(1), start + Duration::from_secs(10));
        assert!(!refused.allowed);
        assert_eq!(refused.remaining, 0);
        assert_eq!(refused.reset_after, Duration::from_secs(50));
        assert_eq!(refused.reset_secs(), 50);

        // Other clients have their own window
        assert!(limiter.check(ip(2), start).allowed);
    }

    #[test]
    fn test_window_resets() {
        let limiter = RateLimiter::new(Duration::from_secs(1), 1);
        let start = Instant::now();
        assert!(limiter.check(ip(1), start).allowed);
        assert!(!limiter.check(ip(1), start + Duration::from_millis(500)).allowed);
        assert!(limiter.check(ip(1), start + Duration::from_secs(1)).allowed);
    }

    #[test]
    fn test_zero_limit_disables() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 0);
        assert!(!limiter.is_enabled());
        let start = Instant::now();
        for _ in 0..1000 {
            assert!(limiter.check(ip(1), start).allowed);
        }
    }

    #[test]
    fn test_reset_secs_rounds_up() {
        let decision = RateDecision {
            allowed: false,
            limit: 1,
            remaining: 0,
            reset_after: Duration::from_millis(1200),
        };
        assert_eq!(decision.reset_secs(), 2);
    }
}
