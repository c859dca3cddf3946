//! Persistent socket binding
//!
//! All operations share one socket. A reader task demultiplexes incoming
//! traffic: pongs go to the waiting probe by id, binary frames and download
//! notifications go to the active download, acknowledgements go to the active
//! control operation. A writer task drains outgoing frames so probes can be
//! sent while a download is streaming.

use super::protocol::{ws_frame_header_len, ClientMessage, ServerMessage, DUPLEX_CHUNK_BYTES};
use super::{DownloadChunk, DownloadStream, LatencyProbe, Transport, UploadAck};
use crate::error::{AppError, Result};
use crate::logging::Logger;
use crate::models::TestConfig;
use crate::types::TransportKind;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_ACK_TIMEOUT: Duration = Duration::from_secs(1);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Derive the socket URL from an HTTP server base URL
pub fn socket_url(server: &str, path: &str) -> Result<String> {
    let mut url = Url::parse(server)
        .map_err(|e| AppError::config(format!("Invalid server URL '{}': {}", server, e)))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(AppError::config(format!(
                "Cannot derive a duplex URL from scheme '{}'",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| AppError::config(format!("Cannot switch '{}' to {}", server, scheme)))?;
    url.set_path(path);
    Ok(url.to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct PongReply {
    received_at: Instant,
    server_processing: Option<Duration>,
}

#[derive(Debug)]
enum DownloadEvent {
    Started(u64),
    /// Payload length and frame header length
    Data(usize, usize, Instant),
    Framing(usize, Instant),
    Complete,
    Failed(String),
}

#[derive(Default)]
struct Router {
    pongs: BTreeMap<u64, oneshot::Sender<PongReply>>,
    download: Option<mpsc::UnboundedSender<DownloadEvent>>,
    control: Option<mpsc::UnboundedSender<ServerMessage>>,
    closed: bool,
}

impl Router {
    /// Route one control message. Returns a note worth logging, if any.
    fn route(&mut self, message: ServerMessage, frame_len: usize, at: Instant) -> Option<String> {
        match message {
            ServerMessage::Connected { client_id, .. } => Some(format!("session {}", client_id)),
            ServerMessage::Pong {
                server_processing_time,
                id,
                ..
            } => {
                let waiter = match id {
                    Some(id) => self.pongs.remove(&id),
                    None => self.pongs.pop_first().map(|(_, tx)| tx),
                };
                let reply = PongReply {
                    received_at: at,
                    server_processing: server_processing_time
                        .filter(|ms| ms.is_finite() && *ms >= 0.0)
                        .map(|ms| Duration::from_secs_f64(ms / 1000.0)),
                };
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(reply);
                        None
                    }
                    None => Some("pong for a probe that already timed out".to_string()),
                }
            }
            ServerMessage::DownloadStarted { total_bytes, .. } => {
                self.send_download(DownloadEvent::Started(total_bytes));
                None
            }
            ServerMessage::DownloadProgress { .. } => {
                self.send_download(DownloadEvent::Framing(frame_len, at));
                None
            }
            ServerMessage::DownloadComplete { .. } => {
                if let Some(tx) = self.download.take() {
                    let _ = tx.send(DownloadEvent::Framing(frame_len, at));
                    let _ = tx.send(DownloadEvent::Complete);
                }
                None
            }
            ServerMessage::Error { message } => {
                if let Some(tx) = self.download.take() {
                    let _ = tx.send(DownloadEvent::Failed(message));
                    None
                } else if let Some(tx) = &self.control {
                    let _ = tx.send(ServerMessage::Error { message });
                    None
                } else {
                    Some(format!("server error: {}", message))
                }
            }
            other => {
                if let Some(tx) = &self.control {
                    let _ = tx.send(other);
                }
                None
            }
        }
    }

    fn send_download(&self, event: DownloadEvent) {
        if let Some(tx) = &self.download {
            let _ = tx.send(event);
        }
    }

    /// Drop every waiter so pending operations observe the disconnect
    fn close(&mut self) {
        self.closed = true;
        self.pongs.clear();
        self.download = None;
        self.control = None;
    }
}

/// Control route of one exchange; released when dropped, including when the
/// exchange future is cancelled by a caller's timeout
struct ControlSlot<'a> {
    router: &'a Mutex<Router>,
}

impl<'a> ControlSlot<'a> {
    fn open(router: &'a Mutex<Router>) -> Result<(Self, mpsc::UnboundedReceiver<ServerMessage>)> {
        let mut guard = lock(router);
        if guard.closed {
            return Err(AppError::transport("duplex connection closed"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        guard.control = Some(tx);
        Ok((Self { router }, rx))
    }
}

impl Drop for ControlSlot<'_> {
    fn drop(&mut self) {
        lock(self.router).control = None;
    }
}

/// Byte count of the `upload_ack` answering chunk `id`. Acks for other
/// chunks are stale; an ack without an id is accepted.
fn upload_ack_for(message: ServerMessage, id: u64) -> Option<u64> {
    match message {
        ServerMessage::UploadAck {
            bytes_received,
            id: ack_id,
            ..
        } if ack_id.map_or(true, |ack_id| ack_id == id) => Some(bytes_received),
        _ => None,
    }
}

/// Sends `download_cancel` if a download stream is dropped before it completed
struct CancelOnDrop {
    outbound: mpsc::UnboundedSender<Message>,
    done: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Ok(json) = ClientMessage::DownloadCancel.to_json() {
            let _ = self.outbound.send(Message::Text(json.into()));
        }
    }
}

/// Duplex binding over one WebSocket connection
pub struct DuplexTransport {
    endpoint: String,
    outbound: mpsc::UnboundedSender<Message>,
    router: Arc<Mutex<Router>>,
    /// Serialises download setup and upload exchanges
    ops: tokio::sync::Mutex<()>,
    next_probe_id: AtomicU64,
    next_upload_id: AtomicU64,
    upload_open: AtomicBool,
    request_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    logger: Logger,
}

impl DuplexTransport {
    pub async fn connect(url: &str, config: &TestConfig, logger: Logger) -> Result<Self> {
        let (socket, _response) = timeout(config.request_timeout(), connect_async(url))
            .await
            .map_err(|_| AppError::timeout(format!("Connecting to {} timed out", url)))??;
        let (ws_tx, ws_rx) = socket.split();

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let router = Arc::new(Mutex::new(Router::default()));

        let writer = tokio::spawn(write_loop(ws_tx, outbound_rx));
        let reader = tokio::spawn(read_loop(ws_rx, router.clone(), logger.clone()));

        logger
            .debug("Duplex socket open")
            .field("url", url)
            .log()
            .await;

        Ok(Self {
            endpoint: url.to_string(),
            outbound,
            router,
            ops: tokio::sync::Mutex::new(()),
            next_probe_id: AtomicU64::new(1),
            next_upload_id: AtomicU64::new(1),
            upload_open: AtomicBool::new(false),
            request_timeout: config.request_timeout(),
            tasks: Mutex::new(vec![writer, reader]),
            logger,
        })
    }

    fn send(&self, message: ClientMessage) -> Result<()> {
        let json = message.to_json()?;
        self.outbound
            .send(Message::Text(json.into()))
            .map_err(|_| AppError::transport("duplex connection closed"))
    }

    fn send_binary(&self, data: Bytes) -> Result<()> {
        self.outbound
            .send(Message::Binary(data))
            .map_err(|_| AppError::transport("duplex connection closed"))
    }

    async fn expect_control<F, T>(
        &self,
        rx: &mut mpsc::UnboundedReceiver<ServerMessage>,
        wait: Duration,
        expected: &str,
        mut accept: F,
    ) -> Result<T>
    where
        F: FnMut(ServerMessage) -> Option<T>,
    {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, rx.recv()).await {
                Err(_) => return Err(AppError::timeout(format!("no {} from server", expected))),
                Ok(None) => return Err(AppError::transport("duplex connection closed")),
                Ok(Some(ServerMessage::Error { message })) => {
                    return Err(AppError::protocol(message))
                }
                Ok(Some(message)) => {
                    if let Some(value) = accept(message) {
                        return Ok(value);
                    }
                }
            }
        }
    }

    /// Install a download route once the previous download has drained
    async fn claim_download(&self) -> Result<mpsc::UnboundedReceiver<DownloadEvent>> {
        let deadline = Instant::now() + self.request_timeout;
        loop {
            {
                let mut router = lock(&self.router);
                if router.closed {
                    return Err(AppError::transport("duplex connection closed"));
                }
                if router.download.is_none() {
                    let (tx, rx) = mpsc::unbounded_channel();
                    router.download = Some(tx);
                    return Ok(rx);
                }
            }
            if Instant::now() >= deadline {
                return Err(AppError::timeout("previous duplex download did not drain"));
            }
            sleep(DRAIN_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl Transport for DuplexTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Duplex
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn max_parallel_streams(&self) -> usize {
        1
    }

    async fn probe_latency(&self, wait: Duration) -> Result<LatencyProbe> {
        let id = self.next_probe_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut router = lock(&self.router);
            if router.closed {
                return Err(AppError::transport("duplex connection closed"));
            }
            router.pongs.insert(id, tx);
        }

        let started = Instant::now();
        self.send(ClientMessage::Ping {
            timestamp: chrono::Utc::now().timestamp_millis(),
            id: Some(id),
        })?;

        match timeout(wait, rx).await {
            Ok(Ok(reply)) => Ok(LatencyProbe {
                rtt: reply.received_at.saturating_duration_since(started),
                server_processing: reply.server_processing,
            }),
            Ok(Err(_)) => Err(AppError::transport("duplex connection closed awaiting pong")),
            Err(_) => {
                lock(&self.router).pongs.remove(&id);
                Err(AppError::timeout("pong not received"))
            }
        }
    }

    async fn stream_down(&self, bytes: u64) -> Result<DownloadStream> {
        let _op = self.ops.lock().await;
        let mut rx = self.claim_download().await?;

        if let Err(error) = self.send(ClientMessage::DownloadStart {
            size: bytes,
            chunk_size: DUPLEX_CHUNK_BYTES,
        }) {
            lock(&self.router).download = None;
            return Err(error);
        }

        // From here on an early drop must tell the server to stop
        let mut guard = CancelOnDrop {
            outbound: self.outbound.clone(),
            done: false,
        };

        let total = match timeout(self.request_timeout, rx.recv()).await {
            Ok(Some(DownloadEvent::Started(total))) => total,
            Ok(Some(DownloadEvent::Failed(message))) => {
                guard.done = true;
                return Err(AppError::protocol(message));
            }
            Ok(Some(other)) => {
                return Err(AppError::protocol(format!(
                    "expected download_started, got {:?}",
                    other
                )))
            }
            Ok(None) => {
                guard.done = true;
                return Err(AppError::transport("duplex connection closed"));
            }
            Err(_) => return Err(AppError::timeout("no download_started from server")),
        };

        let chunks = futures::stream::unfold((rx, guard), |(mut rx, mut guard)| async move {
            if guard.done {
                return None;
            }
            let item = match rx.recv().await {
                Some(DownloadEvent::Data(len, header, at)) => Ok(DownloadChunk {
                    payload: len,
                    framing: header,
                    received_at: at,
                }),
                Some(DownloadEvent::Framing(len, at)) => Ok(DownloadChunk::framing(len, at)),
                Some(DownloadEvent::Complete) => {
                    guard.done = true;
                    return None;
                }
                Some(DownloadEvent::Failed(message)) => {
                    guard.done = true;
                    Err(AppError::protocol(message))
                }
                Some(DownloadEvent::Started(_)) => {
                    Err(AppError::protocol("duplicate download_started"))
                }
                None => {
                    guard.done = true;
                    Err(AppError::transport("duplex connection closed mid-download"))
                }
            };
            Some((item, (rx, guard)))
        })
        .boxed();

        Ok(DownloadStream::new(Some(total), 0, chunks))
    }

    async fn stream_up(&self, payload: Bytes) -> Result<UploadAck> {
        let _op = self.ops.lock().await;
        let (_slot, mut rx) = ControlSlot::open(&self.router)?;

        if !self.upload_open.load(Ordering::Acquire) {
            self.send(ClientMessage::UploadStart)?;
            self.expect_control(&mut rx, self.request_timeout, "upload_ready", |m| {
                matches!(m, ServerMessage::UploadReady).then_some(())
            })
            .await?;
            self.upload_open.store(true, Ordering::Release);
        }

        let id = self.next_upload_id.fetch_add(1, Ordering::Relaxed);
        let started_at = Instant::now();
        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + DUPLEX_CHUNK_BYTES).min(payload.len());
            self.send_binary(payload.slice(offset..end))?;
            offset = end;
        }
        self.send(ClientMessage::UploadData {
            byte_length: payload.len() as u64,
            id: Some(id),
        })?;

        let bytes = self
            .expect_control(&mut rx, self.request_timeout, "upload_ack", |m| upload_ack_for(m, id))
            .await?;

        Ok(UploadAck {
            bytes: if bytes > 0 { bytes } else { payload.len() as u64 },
            started_at,
            acked_at: Instant::now(),
        })
    }

    async fn close(&self) -> Result<()> {
        if lock(&self.router).closed {
            return Ok(());
        }

        if let Ok((_slot, mut rx)) = ControlSlot::open(&self.router) {
            if self.send(ClientMessage::TestComplete).is_ok() {
                let acked = self
                    .expect_control(&mut rx, CLOSE_ACK_TIMEOUT, "test_complete_ack", |m| {
                        matches!(m, ServerMessage::TestCompleteAck).then_some(())
                    })
                    .await;
                if let Err(error) = acked {
                    self.logger
                        .debug("Server did not acknowledge test completion")
                        .error_info(&error)
                        .log()
                        .await;
                }
            }
        }

        self.upload_open.store(false, Ordering::Release);
        let _ = self.outbound.send(Message::Close(None));
        lock(&self.router).close();
        Ok(())
    }
}

impl Drop for DuplexTransport {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

async fn write_loop(
    mut ws_tx: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if ws_tx.send(message).await.is_err() || closing {
            break;
        }
    }
    let _ = ws_tx.close().await;
}

async fn read_loop(mut ws_rx: SplitStream<WsStream>, router: Arc<Mutex<Router>>, logger: Logger) {
    while let Some(frame) = ws_rx.next().await {
        let at = Instant::now();
        let frame = match frame {
            Ok(frame) => frame,
            Err(error) => {
                let error = AppError::from(error);
                logger.debug("Duplex socket read failed").error_info(&error).log().await;
                break;
            }
        };

        let note = match frame {
            Message::Binary(data) => {
                let header = ws_frame_header_len(data.len());
                lock(&router).send_download(DownloadEvent::Data(data.len(), header, at));
                None
            }
            Message::Text(text) => match ServerMessage::parse(text.as_str()) {
                Ok(message) => {
                    let frame_len = text.len() + ws_frame_header_len(text.len());
                    lock(&router).route(message, frame_len, at)
                }
                Err(error) => Some(error.to_string()),
            },
            Message::Close(_) => break,
            _ => None,
        };

        if let Some(note) = note {
            logger.debug(&format!("Duplex: {}", note)).log().await;
        }
    }

    lock(&router).close();
}
