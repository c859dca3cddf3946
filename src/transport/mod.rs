//! Transport bindings
//!
//! Every measurement phase talks to the server through [`Transport`]. Two
//! bindings implement it: [`StreamingTransport`] issues independent HTTP
//! requests per operation and [`DuplexTransport`] multiplexes every operation
//! over one persistent socket.

pub mod duplex;
pub mod protocol;
pub mod streaming;


pub use duplex::DuplexTransport;
pub use streaming::StreamingTransport;

use crate::error::Result;
use crate::logging::Logger;
use crate::models::TestConfig;
use crate::types::TransportKind;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Outcome of one latency probe
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyProbe {
    pub rtt: Duration,
    /// Processing delay reported by the server, when it reports one
    pub server_processing: Option<Duration>,
}

impl LatencyProbe {
    /// Round trip minus server processing time, floored at zero
    pub fn network_latency_ms(&self) -> f64 {
        let rtt = self.rtt.as_secs_f64() * 1000.0;
        let processing = self
            .server_processing
            .map(|d| d.as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        (rtt - processing).max(0.0)
    }
}

/// A piece of a download as it arrived off the wire
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadChunk {
    /// Payload bytes carried by this chunk
    pub payload: usize,
    /// Non-payload bytes observed with it (control frames, headers)
    pub framing: usize,
    pub received_at: Instant,
}

impl DownloadChunk {
    pub fn payload(len: usize, received_at: Instant) -> Self {
        Self {
            payload: len,
            framing: 0,
            received_at,
        }
    }

    pub fn framing(len: usize, received_at: Instant) -> Self {
        Self {
            payload: 0,
            framing: len,
            received_at,
        }
    }
}

/// Server acknowledgement of one uploaded chunk
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UploadAck {
    pub bytes: u64,
    pub started_at: Instant,
    pub acked_at: Instant,
}

impl UploadAck {
    pub fn elapsed(&self) -> Duration {
        self.acked_at.saturating_duration_since(self.started_at)
    }
}

/// One download response: the declared payload size plus a stream of chunks.
/// Tracks observed bytes so completed responses can feed overhead estimation.
pub struct DownloadStream {
    declared_bytes: Option<u64>,
    observed_bytes: u64,
    payload_bytes: u64,
    chunks: BoxStream<'static, Result<DownloadChunk>>,
    finished: bool,
    completed: bool,
}

impl DownloadStream {
    pub fn new(
        declared_bytes: Option<u64>,
        preamble_bytes: u64,
        chunks: BoxStream<'static, Result<DownloadChunk>>,
    ) -> Self {
        Self {
            declared_bytes,
            observed_bytes: preamble_bytes,
            payload_bytes: 0,
            chunks,
            finished: false,
            completed: false,
        }
    }

    /// Next chunk; `None` once the response has ended. An error ends the stream.
    pub async fn next_chunk(&mut self) -> Option<Result<DownloadChunk>> {
        if self.finished {
            return None;
        }

        match self.chunks.next().await {
            Some(Ok(chunk)) => {
                self.payload_bytes += chunk.payload as u64;
                self.observed_bytes += (chunk.payload + chunk.framing) as u64;
                Some(Ok(chunk))
            }
            Some(Err(error)) => {
                self.finished = true;
                Some(Err(error))
            }
            None => {
                self.finished = true;
                self.completed = true;
                None
            }
        }
    }

    pub fn declared_bytes(&self) -> Option<u64> {
        self.declared_bytes
    }

    pub fn payload_bytes(&self) -> u64 {
        self.payload_bytes
    }

    pub fn observed_bytes(&self) -> u64 {
        self.observed_bytes
    }

    /// `(declared, observed)` once the response ran to completion
    pub fn overhead_observation(&self) -> Option<(u64, u64)> {
        match self.declared_bytes {
            Some(declared) if self.completed && declared > 0 => {
                Some((declared, self.observed_bytes))
            }
            _ => None,
        }
    }
}

/// Capability set every binding provides
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Server the binding talks to
    fn endpoint(&self) -> &str;

    /// Concurrent streams the binding can carry
    fn max_parallel_streams(&self) -> usize;

    async fn probe_latency(&self, timeout: Duration) -> Result<LatencyProbe>;

    /// Lightweight reachability probe used for packet loss
    async fn probe_packet(&self, timeout: Duration) -> Result<()> {
        self.probe_latency(timeout).await.map(|_| ())
    }

    async fn stream_down(&self, bytes: u64) -> Result<DownloadStream>;

    async fn stream_up(&self, payload: Bytes) -> Result<UploadAck>;

    async fn close(&self) -> Result<()>;
}

/// Open the binding selected by the configuration against `server`
pub async fn connect(
    config: &TestConfig,
    server: &str,
    logger: &Logger,
) -> Result<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = match config.transport {
        TransportKind::Streaming => Arc::new(StreamingTransport::new(server, config)?),
        TransportKind::Duplex => {
            let url = duplex::socket_url(server, &config.duplex_path)?;
            Arc::new(DuplexTransport::connect(&url, config, logger.child("duplex")).await?)
        }
    };

    logger
        .info(&format!("Connected {} transport", transport.kind()))
        .field("server", server)
        .log()
        .await;

    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;

    #[test]
    fn test_network_latency_subtracts_processing() {
        let probe = LatencyProbe {
            rtt: Duration::from_millis(25),
            server_processing: Some(Duration::from_millis(5)),
        };
        assert_eq!(probe.network_latency_ms(), 20.0);

        let probe = LatencyProbe {
            rtt: Duration::from_millis(2),
            server_processing: Some(Duration::from_millis(5)),
        };
        assert_eq!(probe.network_latency_ms(), 0.0);

        let probe = LatencyProbe {
            rtt: Duration::from_millis(7),
            server_processing: None,
        };
        assert_eq!(probe.network_latency_ms(), 7.0);
    }

    #[tokio::test]
    async fn test_download_stream_accounting() {
        let now = Instant::now();
        let chunks = futures::stream::iter(vec![
            Ok(DownloadChunk::payload(600, now)),
            Ok(DownloadChunk::framing(20, now)),
            Ok(DownloadChunk::payload(400, now)),
        ])
        .boxed();
        let mut stream = DownloadStream::new(Some(1000), 80, chunks);

        assert!(stream.overhead_observation().is_none());
        while let Some(chunk) = stream.next_chunk().await {
            chunk.unwrap();
        }
        assert_eq!(stream.payload_bytes(), 1000);
        assert_eq!(stream.observed_bytes(), 1100);
        assert_eq!(stream.overhead_observation(), Some((1000, 1100)));
        assert!(stream.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn test_download_stream_error_is_not_complete() {
        let now = Instant::now();
        let chunks = futures::stream::iter(vec![
            Ok(DownloadChunk::payload(100, now)),
            Err(AppError::transport("reset")),
            Ok(DownloadChunk::payload(100, now)),
        ])
        .boxed();
        let mut stream = DownloadStream::new(Some(1000), 0, chunks);

        assert!(stream.next_chunk().await.unwrap().is_ok());
        assert!(stream.next_chunk().await.unwrap().is_err());
        assert!(stream.next_chunk().await.is_none());
        assert_eq!(stream.payload_bytes(), 100);
        assert!(stream.overhead_observation().is_none());
    }
}
