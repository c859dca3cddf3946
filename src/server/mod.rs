//! Server primitives: GENERATOR, SINK and ECHO over HTTP and the duplex socket
//!
//! ```no_run
//! use speedtest_engine::models::ServerConfig;
//! use speedtest_engine::server::SpeedTestServer;
//!
//! # async fn run() -> speedtest_engine::Result<()> {
//! let server = SpeedTestServer::bind(ServerConfig::default()).await?;
//! println!("listening on {}", server.local_addr());
//! server.serve_with_shutdown(async {
//!     let _ = tokio::signal::ctrl_c().await;
//! })
//! .await
//! # }
//! ```

pub mod duplex;
pub mod generator;
pub mod handlers;
pub mod middleware;

use crate::error::{AppError, ErrorContext, Result};
use crate::logging::Logger;
use crate::models::ServerConfig;
use axum::extract::DefaultBodyLimit;
use axum::http::header::{CACHE_CONTROL, EXPIRES, PRAGMA};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use self::middleware::RateLimiter;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;

pub const NO_CACHE: &str = "no-store, no-cache, must-revalidate, proxy-revalidate";

/// Wall clock in milliseconds since the epoch
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Request and byte counters, readable through `/status`
#[derive(Debug, Default)]
pub struct ServerStats {
    pub ping_requests: AtomicU64,
    pub download_requests: AtomicU64,
    pub upload_requests: AtomicU64,
    pub socket_sessions: AtomicU64,
    pub active_sockets: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub aborted_downloads: AtomicU64,
    pub aborted_uploads: AtomicU64,
    pub rate_limited: AtomicU64,
    pub errors: AtomicU64,
}

impl ServerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            ping_requests: read(&self.ping_requests),
            download_requests: read(&self.download_requests),
            upload_requests: read(&self.upload_requests),
            socket_sessions: read(&self.socket_sessions),
            active_sockets: read(&self.active_sockets),
            bytes_sent: read(&self.bytes_sent),
            bytes_received: read(&self.bytes_received),
            aborted_downloads: read(&self.aborted_downloads),
            aborted_uploads: read(&self.aborted_uploads),
            rate_limited: read(&self.rate_limited),
            errors: read(&self.errors),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub ping_requests: u64,
    pub download_requests: u64,
    pub upload_requests: u64,
    pub socket_sessions: u64,
    pub active_sockets: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub aborted_downloads: u64,
    pub aborted_uploads: u64,
    pub rate_limited: u64,
    pub errors: u64,
}

/// Shared by every handler and socket session
#[derive(Debug, Clone)]
pub struct ServerState {
    pub config: Arc<ServerConfig>,
    pub stats: Arc<ServerStats>,
    pub limiter: Arc<RateLimiter>,
    pub logger: Logger,
    /// Source of every generated payload
    pub pattern: Bytes,
    started: Instant,
}

impl ServerState {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            config: Arc::new(config.clone()),
            stats: Arc::new(ServerStats::default()),
            limiter: Arc::new(RateLimiter::new(
                config.rate_limit_window(),
                config.rate_limit_max_requests,
            )),
            logger: Logger::for_server(config),
            pattern: generator::random_pattern(),
            started: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

/// Every route behind the rate limiter, access log, no-cache headers and
/// CORS. Rejected requests still carry the outer headers.
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/ping", get(handlers::ping).head(handlers::ping_head))
        .route("/fastping", get(handlers::fast_ping))
        .route("/download", get(handlers::download))
        .route("/upload", post(handlers::upload))
        .route("/health", get(handlers::health))
        .route("/status", get(handlers::status))
        .route("/ws", get(duplex::upgrade))
        .layer(DefaultBodyLimit::disable())
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::rate_limit))
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::access_log))
        .layer(SetResponseHeaderLayer::overriding(
            CACHE_CONTROL,
            HeaderValue::from_static(NO_CACHE),
        ))
        .layer(SetResponseHeaderLayer::overriding(PRAGMA, HeaderValue::from_static("no-cache")))
        .layer(SetResponseHeaderLayer::overriding(EXPIRES, HeaderValue::from_static("0")))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("surrogate-control"),
            HeaderValue::from_static("no-store"),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bound listener plus its routes
pub struct SpeedTestServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: ServerState,
}

impl SpeedTestServer {
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let addr = config.bind_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| AppError::server(format!("Cannot bind {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            state: ServerState::new(&config),
        })
    }

    /// Actual address, useful when binding port 0
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> &ServerState {
        &self.state
    }

    /// Serve until the process is stopped
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Serve until `signal` resolves, then drain in-flight requests
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let logger = self.state.logger.clone();
        logger
            .info("Speed test server listening")
            .field("addr", self.local_addr.to_string())
            .field("max_download_bytes", self.state.config.max_download_bytes)
            .field("max_duplex_download_bytes", self.state.config.max_duplex_download_bytes)
            .field("rate_limit_max_requests", self.state.config.rate_limit_max_requests)
            .field("rate_limit_window_ms", self.state.config.rate_limit_window_ms)
            .log()
            .await;

        let app = router(self.state).into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(self.listener, app)
            .with_graceful_shutdown(signal)
            .await
            .context("Server stopped")?;

        logger.info("Speed test server stopped").log().await;
        Ok(())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    status: &'static str,
    category: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Validation(_) | AppError::Parse(_) | AppError::Protocol(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            status: "error",
            category: self.category(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_snapshot() {
        let stats = ServerStats::default();
        stats.ping_requests.fetch_add(3, Ordering::Relaxed);
        stats.bytes_sent.fetch_add(1024, Ordering::Relaxed);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.ping_requests, 3);
        assert_eq!(snapshot.bytes_sent, 1024);

        let value = serde_json::to_value(snapshot).unwrap();
        assert_eq!(value["pingRequests"], 3);
        assert_eq!(value["abortedDownloads"], 0);
    }

    #[test]
    fn test_error_status_codes() {
        let response = AppError::validation("bad size").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let response = AppError::io("disk").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_address() {
        let config = ServerConfig {
            bind: "not-an-address".to_string(),
            ..ServerConfig::default()
        };
        assert!(SpeedTestServer::bind(config).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let config = ServerConfig {
            bind: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        };
        let server = SpeedTestServer::bind(config).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.state().pattern.len(), generator::PATTERN_BYTES);
    }
}
