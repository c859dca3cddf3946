//! Request/response binding over HTTP

use super::protocol::{EchoResponse, UploadReceipt, HEADER_DOWNLOAD_SIZE};
use super::{DownloadChunk, DownloadStream, LatencyProbe, Transport, UploadAck};
use crate::defaults;
use crate::error::{AppError, Result};
use crate::models::TestConfig;
use crate::types::TransportKind;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Client, Url};
use std::time::Duration;
use tokio::time::Instant;

/// Length of the status line every HTTP/1.1 response starts with
const STATUS_LINE_BYTES: u64 = "HTTP/1.1 200 OK\r\n".len() as u64;

/// Streaming binding: one request per probe, download or upload chunk
pub struct StreamingTransport {
    base: Url,
    endpoint: String,
    client: Client,
}

impl StreamingTransport {
    pub fn new(server: &str, config: &TestConfig) -> Result<Self> {
        let mut base = Url::parse(server)
            .map_err(|e| AppError::config(format!("Invalid server URL '{}': {}", server, e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .connect_timeout(config.request_timeout())
            .pool_max_idle_per_host(defaults::MAX_PARALLEL_CONNECTIONS * 2)
            .user_agent(format!("{}/{}", crate::PKG_NAME, crate::VERSION))
            .build()
            .map_err(|e| AppError::transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base,
            endpoint: server.to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path)?)
    }
}

/// Approximate size of the response head as it crossed the wire
fn header_block_len(headers: &HeaderMap) -> u64 {
    let fields: u64 = headers
        .iter()
        .map(|(name, value)| (name.as_str().len() + value.as_bytes().len() + 4) as u64)
        .sum();
    STATUS_LINE_BYTES + fields + 2
}

fn declared_size(headers: &HeaderMap, content_length: Option<u64>) -> Option<u64> {
    headers
        .get(HEADER_DOWNLOAD_SIZE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
        .or(content_length)
}

#[async_trait]
impl Transport for StreamingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Streaming
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn max_parallel_streams(&self) -> usize {
        usize::MAX
    }

    async fn probe_latency(&self, timeout: Duration) -> Result<LatencyProbe> {
        let url = self.url("ping")?;
        let started = Instant::now();
        let sent_at = chrono::Utc::now().timestamp_millis();

        let response = self
            .client
            .get(url)
            .query(&[("timestamp", sent_at)])
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;
        let echo: EchoResponse = response.json().await?;
        let rtt = started.elapsed();

        Ok(LatencyProbe {
            rtt,
            server_processing: echo
                .server_processing_time
                .filter(|ms| ms.is_finite() && *ms >= 0.0)
                .map(|ms| Duration::from_secs_f64(ms / 1000.0)),
        })
    }

    async fn probe_packet(&self, timeout: Duration) -> Result<()> {
        let url = self.url("ping")?;
        self.client
            .head(url)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn stream_down(&self, bytes: u64) -> Result<DownloadStream> {
        let url = self.url("download")?;
        let response = self
            .client
            .get(url)
            .query(&[("bytes", bytes)])
            .send()
            .await?
            .error_for_status()?;

        let declared = declared_size(response.headers(), response.content_length());
        let preamble = header_block_len(response.headers());
        let chunks = response
            .bytes_stream()
            .map(|item| {
                item.map(|data| DownloadChunk::payload(data.len(), Instant::now()))
                    .map_err(AppError::from)
            })
            .boxed();

        Ok(DownloadStream::new(declared, preamble, chunks))
    }

    async fn stream_up(&self, payload: Bytes) -> Result<UploadAck> {
        let url = self.url("upload")?;
        let sent = payload.len() as u64;
        let started_at = Instant::now();

        let receipt: UploadReceipt = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(UploadAck {
            bytes: if receipt.byte_length > 0 { receipt.byte_length } else { sent },
            started_at,
            acked_at: Instant::now(),
        })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
