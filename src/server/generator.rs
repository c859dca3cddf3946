//! GENERATOR: pseudo-random download payloads
//!
//! One random pattern is generated when the server starts and every response
//! is sliced from it. Bodies are pulled by the HTTP layer, so a slow reader
//! stops polling the stream instead of growing a buffer.

use super::ServerState;
use bytes::Bytes;
use futures::stream::{self, Stream};
use rand::RngCore;
use std::convert::Infallible;
use std::sync::atomic::Ordering;
use std::time::Instant;

pub const SMALL_CHUNK_BYTES: usize = 1024 * 1024;
pub const MEDIUM_CHUNK_BYTES: usize = 2 * 1024 * 1024;
pub const LARGE_CHUNK_BYTES: usize = 4 * 1024 * 1024;

/// Size of the shared random pattern; no chunk is ever larger
pub const PATTERN_BYTES: usize = LARGE_CHUNK_BYTES;

/// Requested size when the client does not name one
pub const DEFAULT_REQUEST_BYTES: u64 = 1024 * 1024;

pub fn random_pattern() -> Bytes {
    let mut data = vec![0u8; PATTERN_BYTES];
    rand::rng().fill_bytes(&mut data);
    Bytes::from(data)
}

/// Larger requests get larger chunks
pub fn chunk_size_for(total: u64) -> usize {
    const MIB: u64 = 1024 * 1024;
    if total > 50 * MIB {
        LARGE_CHUNK_BYTES
    } else if total > 10 * MIB {
        MEDIUM_CHUNK_BYTES
    } else {
        SMALL_CHUNK_BYTES
    }
}

/// Server-side cap on a requested size
pub fn clamp_request(requested: Option<u64>, max: u64) -> u64 {
    requested.unwrap_or(DEFAULT_REQUEST_BYTES).min(max)
}

/// Accounting for one streaming response. Dropping it before the last chunk
/// was handed out means the client went away mid-stream.
pub struct DownloadTracker {
    state: ServerState,
    total: u64,
    sent: u64,
    started: Instant,
    finished: bool,
}

impl DownloadTracker {
    pub fn new(state: ServerState, total: u64) -> Self {
        Self {
            state,
            total,
            sent: 0,
            started: Instant::now(),
            finished: false,
        }
    }

    fn record(&mut self, bytes: usize) {
        self.sent += bytes as u64;
        self.state.stats.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

impl Drop for DownloadTracker {
    fn drop(&mut self) {
        if !self.finished {
            self.state.stats.aborted_downloads.fetch_add(1, Ordering::Relaxed);
        }

        let logger = self.state.logger.clone();
        let (total, sent, finished) = (self.total, self.sent, self.finished);
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let message = if finished { "Download complete" } else { "Download aborted by client" };
                logger
                    .debug(message)
                    .field("bytes_sent", sent)
                    .field("bytes_requested", total)
                    .field("duration_ms", elapsed_ms.round())
                    .log()
                    .await;
            });
        }
    }
}

/// Exactly `tracker.total` bytes in chunks of `chunk` bytes
pub fn payload_stream(
    pattern: Bytes,
    chunk: usize,
    tracker: DownloadTracker,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let chunk = chunk.clamp(1, pattern.len().max(1));
    stream::unfold(tracker, move |mut tracker| {
        let pattern = pattern.clone();
        async move {
            let remaining = tracker.total - tracker.sent;
            if remaining == 0 {
                tracker.finished = true;
                return None;
            }
            let len = remaining.min(chunk as u64) as usize;
            tracker.record(len);
            Some((Ok(pattern.slice(..len)), tracker))
        }
    })
}
