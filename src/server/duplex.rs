//! Duplex socket sessions: JSON control messages plus binary data frames

use super::{unix_millis, ServerState};
use crate::transport::protocol::{
    ClientMessage, ServerMessage, DUPLEX_CHUNK_BYTES, DUPLEX_PROGRESS_INTERVAL_BYTES,
};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream, StreamExt};
use futures::{FutureExt, SinkExt};
use std::sync::atomic::Ordering;
use std::time::Instant;
use uuid::Uuid;

/// Largest binary frame a client may ask for
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

type Outbound = SplitSink<WebSocket, Message>;

pub async fn upgrade(State(state): State<ServerState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_session(state, socket))
}

/// Framed download in flight
#[derive(Debug)]
struct FramedDownload {
    total: u64,
    sent: u64,
    frame: usize,
    next_progress: u64,
    started: Instant,
}

impl FramedDownload {
    fn remaining(&self) -> u64 {
        self.total - self.sent
    }

    fn duration_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }
}

/// Upload bytes since the last acknowledgement and since `upload_start`
#[derive(Debug, Default)]
struct UploadTally {
    pending: u64,
    total: u64,
}

/// Per-socket protocol state
struct Session {
    state: ServerState,
    client_id: String,
    download: Option<FramedDownload>,
    upload: Option<UploadTally>,
}

async fn run_session(state: ServerState, socket: WebSocket) {
    let (mut outbound, mut inbound) = socket.split();
    let mut session = Session {
        client_id: Uuid::new_v4().to_string(),
        state,
        download: None,
        upload: None,
    };
    session.state.stats.socket_sessions.fetch_add(1, Ordering::Relaxed);
    session.state.stats.active_sockets.fetch_add(1, Ordering::Relaxed);
    session
        .state
        .logger
        .debug("Duplex client connected")
        .field("client_id", &session.client_id)
        .log()
        .await;

    let greeting = ServerMessage::Connected {
        client_id: session.client_id.clone(),
        timestamp: unix_millis(),
    };
    if send_message(&mut outbound, &greeting).await.is_ok() {
        session.serve(&mut outbound, &mut inbound).await;
    }

    if let Some(download) = session.download.take() {
        session.state.stats.aborted_downloads.fetch_add(1, Ordering::Relaxed);
        session
            .state
            .logger
            .debug("Duplex download aborted by client")
            .field("client_id", &session.client_id)
            .field("bytes_sent", download.sent)
            .log()
            .await;
    }
    session.state.stats.active_sockets.fetch_sub(1, Ordering::Relaxed);
    session
        .state
        .logger
        .debug("Duplex client disconnected")
        .field("client_id", &session.client_id)
        .log()
        .await;
}

impl Session {
    /// Control messages are checked between data frames so a cancel or ping
    /// is answered while a download is pumping. Frames are never cancelled
    /// half-sent.
    async fn serve(&mut self, outbound: &mut Outbound, inbound: &mut SplitStream<WebSocket>) {
        loop {
            let frame = if self.download.is_some() {
                match inbound.next().now_or_never() {
                    Some(frame) => frame,
                    None => {
                        if self.pump(outbound).await.is_err() {
                            return;
                        }
                        continue;
                    }
                }
            } else {
                inbound.next().await
            };

            let message = match frame {
                Some(Ok(message)) => message,
                Some(Err(_)) | None => return,
            };
            let keep_open = match message {
                Message::Text(text) => self.on_text(outbound, text.as_str()).await,
                Message::Binary(data) => {
                    self.on_binary(&data);
                    true
                }
                Message::Close(_) => false,
                _ => true,
            };
            if !keep_open {
                return;
            }
        }
    }

    /// Send the next data frame of the active download
    async fn pump(&mut self, outbound: &mut Outbound) -> Result<(), axum::Error> {
        let Some(download) = self.download.as_mut() else {
            return Ok(());
        };

        if download.remaining() > 0 {
            let len = download.remaining().min(download.frame as u64) as usize;
            outbound.send(Message::Binary(self.state.pattern.slice(..len))).await?;
            download.sent += len as u64;
            self.state.stats.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
        }

        let done = download.remaining() == 0;
        if download.sent >= download.next_progress || done {
            download.next_progress = download.sent + DUPLEX_PROGRESS_INTERVAL_BYTES;
            let progress = ServerMessage::DownloadProgress {
                bytes_transferred: download.sent,
                total_bytes: download.total,
            };
            send_message(outbound, &progress).await?;
        }

        if done {
            let complete = ServerMessage::DownloadComplete {
                total_bytes: download.sent,
                duration: download.duration_ms(),
            };
            self.download = None;
            send_message(outbound, &complete).await?;
        }
        Ok(())
    }

    fn on_binary(&mut self, data: &Bytes) {
        self.state
            .stats
            .bytes_received
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        if let Some(upload) = self.upload.as_mut() {
            upload.pending += data.len() as u64;
            upload.total += data.len() as u64;
        }
    }

    /// Returns false when the socket should close
    async fn on_text(&mut self, outbound: &mut Outbound, text: &str) -> bool {
        let replies = match ClientMessage::parse(text) {
            Ok(message) => self.handle(message),
            Err(error) => {
                self.state.stats.errors.fetch_add(1, Ordering::Relaxed);
                self.state
                    .logger
                    .debug("Malformed duplex message")
                    .field("client_id", &self.client_id)
                    .error_info(&error)
                    .log()
                    .await;
                vec![ServerMessage::Error {
                    message: error.to_string(),
                }]
            }
        };

        for reply in &replies {
            if send_message(outbound, reply).await.is_err() {
                return false;
            }
        }
        true
    }

    fn handle(&mut self, message: ClientMessage) -> Vec<ServerMessage> {
        match message {
            ClientMessage::Ping { timestamp, id } => {
                let received = Instant::now();
                let server_timestamp = unix_millis();
                vec![ServerMessage::Pong {
                    client_timestamp: timestamp,
                    server_timestamp,
                    server_processing_time: Some(received.elapsed().as_secs_f64() * 1000.0),
                    id,
                }]
            }
            ClientMessage::DownloadStart { size, chunk_size } => {
                if self.download.is_some() {
                    return vec![ServerMessage::Error {
                        message: "A download is already in progress".to_string(),
                    }];
                }
                self.state.stats.download_requests.fetch_add(1, Ordering::Relaxed);
                let total = size.min(self.state.config.max_duplex_download_bytes);
                let frame = match chunk_size {
                    0 => DUPLEX_CHUNK_BYTES,
                    n => n.min(MAX_FRAME_BYTES),
                };
                self.download = Some(FramedDownload {
                    total,
                    sent: 0,
                    frame,
                    next_progress: DUPLEX_PROGRESS_INTERVAL_BYTES,
                    started: Instant::now(),
                });
                vec![ServerMessage::DownloadStarted {
                    total_bytes: total,
                    chunk_size: frame,
                }]
            }
            ClientMessage::DownloadCancel => match self.download.take() {
                Some(download) => vec![ServerMessage::DownloadComplete {
                    total_bytes: download.sent,
                    duration: download.duration_ms(),
                }],
                None => Vec::new(),
            },
            ClientMessage::UploadStart => {
                self.state.stats.upload_requests.fetch_add(1, Ordering::Relaxed);
                self.upload = Some(UploadTally::default());
                vec![ServerMessage::UploadReady]
            }
            ClientMessage::UploadData { byte_length, id } => match self.upload.as_mut() {
                Some(upload) => {
                    // Frames carry the bytes; the declared length covers a
                    // client that sent the marker without frames
                    let received = if upload.pending > 0 { upload.pending } else { byte_length };
                    if upload.pending == 0 {
                        upload.total += byte_length;
                    }
                    upload.pending = 0;
                    vec![ServerMessage::UploadAck {
                        bytes_received: received,
                        total_bytes_received: upload.total,
                        id,
                    }]
                }
                None => vec![ServerMessage::Error {
                    message: "upload_data before upload_start".to_string(),
                }],
            },
            ClientMessage::TestComplete => {
                self.download = None;
                self.upload = None;
                vec![ServerMessage::TestCompleteAck]
            }
        }
    }
}

async fn send_message(outbound: &mut Outbound, message: &ServerMessage) -> Result<(), axum::Error> {
    let json = serde_json::to_string(message).map_err(axum::Error::new)?;
    outbound.send(Message::Text(json.into())).await
}
