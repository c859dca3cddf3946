//! HTTP handlers for ECHO, GENERATOR and SINK plus health reporting

use super::generator::{self, DownloadTracker};
use super::{unix_millis, ServerState, StatsSnapshot};
use crate::error::{AppError, Result};
use crate::stats::{self, round_to};
use crate::transport::protocol::{
    EchoResponse, UploadReceipt, HEADER_DOWNLOAD_SIZE, HEADER_DOWNLOAD_START, HEADER_SERVER_TIMESTAMP,
};
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::time::Instant;

#[derive(Debug, Deserialize)]
pub struct PingQuery {
    /// Client clock in milliseconds since the epoch
    pub timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub bytes: Option<u64>,
}

pub async fn ping(State(state): State<ServerState>, Query(query): Query<PingQuery>) -> Json<EchoResponse> {
    let received = Instant::now();
    state.stats.ping_requests.fetch_add(1, Ordering::Relaxed);

    let server_timestamp = unix_millis();
    // Processing time is only meaningful when the client asked for it
    let server_processing_time = query
        .timestamp
        .map(|_| received.elapsed().as_secs_f64() * 1000.0);

    Json(EchoResponse {
        status: "ok".to_string(),
        message: "pong".to_string(),
        server_timestamp,
        request_timestamp: query.timestamp,
        server_processing_time,
    })
}

/// Minimal probe: status line and one timestamp header
pub async fn ping_head(State(state): State<ServerState>) -> impl IntoResponse {
    state.stats.ping_requests.fetch_add(1, Ordering::Relaxed);
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static(HEADER_SERVER_TIMESTAMP), HeaderValue::from(unix_millis()));
    (StatusCode::OK, headers)
}

/// Cheapest probe with a body: plain `pong` and the timestamp header
pub async fn fast_ping(State(state): State<ServerState>) -> impl IntoResponse {
    state.stats.ping_requests.fetch_add(1, Ordering::Relaxed);
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static(HEADER_SERVER_TIMESTAMP), HeaderValue::from(unix_millis()));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    (StatusCode::OK, headers, "pong")
}

/// Streams `min(bytes, cap)` random bytes with chunked transfer encoding
pub async fn download(State(state): State<ServerState>, Query(query): Query<DownloadQuery>) -> Response {
    state.stats.download_requests.fetch_add(1, Ordering::Relaxed);
    let total = generator::clamp_request(query.bytes, state.config.max_download_bytes);
    let chunk = generator::chunk_size_for(total);

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_static("attachment; filename=\"speedtest.bin\""),
    );
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(HeaderName::from_static(HEADER_DOWNLOAD_SIZE), HeaderValue::from(total));
    headers.insert(HeaderName::from_static(HEADER_DOWNLOAD_START), HeaderValue::from(unix_millis()));

    let tracker = DownloadTracker::new(state.clone(), total);
    let body = Body::from_stream(generator::payload_stream(state.pattern.clone(), chunk, tracker));
    (headers, body).into_response()
}

/// Counts body bytes as they arrive; nothing is buffered
pub async fn upload(State(state): State<ServerState>, body: Body) -> Result<Json<UploadReceipt>> {
    state.stats.upload_requests.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();
    let mut last_byte = started;
    let mut total: u64 = 0;

    let mut frames = body.into_data_stream();
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(data) => {
                total += data.len() as u64;
                last_byte = Instant::now();
                state.stats.bytes_received.fetch_add(data.len() as u64, Ordering::Relaxed);
            }
            Err(error) => {
                state.stats.aborted_uploads.fetch_add(1, Ordering::Relaxed);
                state
                    .logger
                    .debug("Upload aborted by client")
                    .field("bytes_received", total)
                    .field("error", error.to_string())
                    .log()
                    .await;
                return Err(AppError::transport(format!("Upload interrupted: {}", error)));
            }
        }
    }

    let elapsed = last_byte.duration_since(started);
    let secs = elapsed.as_secs_f64();
    let megabytes_per_sec = if secs > 0.0 {
        total as f64 / (1024.0 * 1024.0) / secs
    } else {
        0.0
    };

    Ok(Json(UploadReceipt {
        status: "success".to_string(),
        received_at: unix_millis(),
        byte_length: total,
        duration: round_to(secs * 1000.0, 3),
        throughput_megabytes_per_sec: round_to(megabytes_per_sec, 2),
        throughput_mbps: round_to(stats::mbps(total, elapsed), 2),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub timestamp: i64,
    pub uptime_seconds: f64,
}

pub async fn health(State(state): State<ServerState>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok",
        timestamp: unix_millis(),
        uptime_seconds: round_to(state.uptime_secs(), 1),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: i64,
    pub uptime_seconds: f64,
    pub max_download_bytes: u64,
    pub max_duplex_download_bytes: u64,
    pub metrics: StatsSnapshot,
}

pub async fn status(State(state): State<ServerState>) -> Json<StatusReport> {
    Json(StatusReport {
        status: "ok",
        version: crate::VERSION,
        timestamp: unix_millis(),
        uptime_seconds: round_to(state.uptime_secs(), 1),
        max_download_bytes: state.config.max_download_bytes,
        max_duplex_download_bytes: state.config.max_duplex_download_bytes,
        metrics: state.stats.snapshot(),
    })
}
