//! Upstream dialogue-service WebSocket client.
//!
//! One client owns one socket to the dialogue service for the lifetime of a
//! session. Connecting runs the documented handshake (start-connection,
//! wait for connection-started, start-session, wait for session-started);
//! afterwards the read loop parses incoming binary frames with the codec and
//! forwards them on an event queue consumed by the owning relay task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::core::protocol::{self, Frame};

use super::messages::{
    StartSessionBody, EVENT_AUDIO_TASK, EVENT_CHAT_TEXT_QUERY, EVENT_CONNECTION_STARTED,
    EVENT_FINISH_CONNECTION, EVENT_FINISH_SESSION, EVENT_SAY_HELLO, EVENT_SESSION_STARTED,
    EVENT_START_CONNECTION, EVENT_START_SESSION,
};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Queue capacity for parsed upstream events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Errors produced while talking to the dialogue service.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("invalid connection header value")]
    InvalidHeader,

    #[error("timed out waiting for upstream event {0}")]
    HandshakeTimeout(u32),

    #[error("upstream closed during handshake")]
    ClosedDuringHandshake,

    #[error("not connected")]
    NotConnected,

    #[error("websocket error: {0}")]
    WebSocket(String),
}

pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// Connection parameters for the dialogue service.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    /// WebSocket URL of the dialogue endpoint.
    pub base_url: String,
    pub app_id: String,
    pub access_key: String,
    pub resource_id: String,
    pub app_key: String,
    /// How long to wait for each handshake event (50, 150).
    pub handshake_timeout: Duration,
}

impl UpstreamSettings {
    pub fn from_config(config: &crate::config::ServerConfig) -> Self {
        Self {
            base_url: config.upstream_base_url.clone(),
            app_id: config.app_id.clone(),
            access_key: config.access_key.clone(),
            resource_id: config.resource_id.clone(),
            app_key: config.app_key.clone(),
            handshake_timeout: config.handshake_timeout,
        }
    }
}

/// One observable signal from the upstream connection.
#[derive(Debug)]
pub enum UpstreamEvent {
    /// A parsed frame.
    Frame(Frame),
    /// The socket closed (code, reason).
    Closed { code: u16, reason: String },
    /// A failure while reading or writing.
    Error(String),
}

/// A registered one-shot wait for a specific incoming event code.
struct EventWaiter {
    event: u32,
    tx: oneshot::Sender<Frame>,
}

struct Inner {
    settings: UpstreamSettings,
    session_id: String,
    start_body: StartSessionBody,
    writer: Mutex<Option<WsSink>>,
    events_tx: Mutex<mpsc::Sender<UpstreamEvent>>,
    waiter: Mutex<Option<EventWaiter>>,
    started: AtomicBool,
    closed: AtomicBool,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the upstream connection of one session. Cheap to clone; all
/// state lives behind the shared inner.
#[derive(Clone)]
pub struct UpstreamClient {
    inner: Arc<Inner>,
}

impl UpstreamClient {
    /// Open the socket and run the full connect protocol. Returns the client
    /// and the receiving end of its event queue.
    pub async fn connect(
        settings: UpstreamSettings,
        session_id: String,
        start_body: StartSessionBody,
    ) -> UpstreamResult<(Self, mpsc::Receiver<UpstreamEvent>)> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let client = UpstreamClient {
            inner: Arc::new(Inner {
                settings,
                session_id,
                start_body,
                writer: Mutex::new(None),
                events_tx: Mutex::new(events_tx),
                waiter: Mutex::new(None),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                read_task: Mutex::new(None),
            }),
        };
        if let Err(e) = client.establish().await {
            // Tear down the half-open socket so a failed handshake does not
            // leak the read task.
            client.close().await;
            return Err(e);
        }
        Ok((client, events_rx))
    }

    /// Whether the session-start exchange has completed.
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Replace the event sink, detaching any previous subscriber. Used when a
    /// new browser socket displaces the old one mid-session.
    pub async fn subscribe(&self) -> mpsc::Receiver<UpstreamEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        *self.inner.events_tx.lock().await = tx;
        rx
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    /// Forward one chunk of input audio (event 200, gzip'd raw payload).
    /// Empty input is a no-op.
    pub async fn send_audio_chunk(&self, audio: Bytes) -> UpstreamResult<()> {
        if audio.is_empty() {
            return Ok(());
        }
        let frame = Frame::client_audio(
            EVENT_AUDIO_TASK,
            Some(self.inner.session_id.clone()),
            audio,
        );
        self.send_frame(&frame).await
    }

    /// Mark end-of-input-audio with a tail frame carrying a zeroed payload.
    pub async fn send_audio_commit(&self) -> UpstreamResult<()> {
        let frame = Frame::client_audio_tail(
            Some(self.inner.session_id.clone()),
            Bytes::from(vec![0u8; 320]),
        );
        self.send_frame(&frame).await
    }

    /// Inject a text query into the dialogue (event 501).
    pub async fn send_chat_text(&self, content: &str) -> UpstreamResult<()> {
        let frame = Frame::client_event(
            EVENT_CHAT_TEXT_QUERY,
            Some(self.inner.session_id.clone()),
            json!({ "content": content }),
        );
        self.send_frame(&frame).await
    }

    /// Ask the bot to greet the user (event 300).
    pub async fn send_hello(&self, content: &str) -> UpstreamResult<()> {
        let frame = Frame::client_event(
            EVENT_SAY_HELLO,
            Some(self.inner.session_id.clone()),
            json!({ "content": content }),
        );
        self.send_frame(&frame).await
    }

    /// Interrupt the dialogue: finish the current session, then run the
    /// start-session exchange again on the same connection.
    pub async fn restart_session(&self) -> UpstreamResult<()> {
        self.inner.started.store(false, Ordering::SeqCst);

        let finish = Frame::client_event(
            EVENT_FINISH_SESSION,
            Some(self.inner.session_id.clone()),
            json!({}),
        );
        self.send_frame(&finish).await?;
        self.start_session().await
    }

    /// Orderly teardown: best-effort finish-session and finish-connection,
    /// then close the socket. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.started.store(false, Ordering::SeqCst);

        let finish_session = Frame::client_event(
            EVENT_FINISH_SESSION,
            Some(self.inner.session_id.clone()),
            json!({}),
        );
        let finish_connection = Frame::client_event(EVENT_FINISH_CONNECTION, None, json!({}));

        let mut writer = self.inner.writer.lock().await;
        if let Some(sink) = writer.as_mut() {
            let _ = sink
                .send(Message::Binary(protocol::encode(&finish_session)))
                .await;
            let _ = sink
                .send(Message::Binary(protocol::encode(&finish_connection)))
                .await;
            let _ = sink.send(Message::Close(None)).await;
        }
        *writer = None;
        drop(writer);

        if let Some(task) = self.inner.read_task.lock().await.take() {
            task.abort();
        }
        tracing::debug!(session_id = %self.inner.session_id, "upstream connection closed");
    }

    // -------------------------------------------------------------------------
    // Connect protocol
    // -------------------------------------------------------------------------

    /// Dial the socket, spawn the read loop and run the handshake.
    async fn establish(&self) -> UpstreamResult<()> {
        let inner = &self.inner;

        let mut request = inner
            .settings
            .base_url
            .clone()
            .into_client_request()
            .map_err(|e| UpstreamError::ConnectionFailed(e.to_string()))?;

        let headers = request.headers_mut();
        let pairs = [
            ("x-api-app-id", inner.settings.app_id.as_str()),
            ("x-api-access-key", inner.settings.access_key.as_str()),
            ("x-api-resource-id", inner.settings.resource_id.as_str()),
            ("x-api-app-key", inner.settings.app_key.as_str()),
        ];
        for (name, value) in pairs {
            headers.insert(
                http::HeaderName::from_static(name),
                http::HeaderValue::from_str(value).map_err(|_| UpstreamError::InvalidHeader)?,
            );
        }
        let connect_id = uuid::Uuid::new_v4().to_string();
        headers.insert(
            http::HeaderName::from_static("x-api-connect-id"),
            http::HeaderValue::from_str(&connect_id).map_err(|_| UpstreamError::InvalidHeader)?,
        );

        let (ws_stream, _response) = connect_async(request)
            .await
            .map_err(|e| UpstreamError::ConnectionFailed(e.to_string()))?;

        tracing::info!(
            session_id = %inner.session_id,
            connect_id = %connect_id,
            "connected to dialogue service"
        );

        // Stop any previous read loop before installing the new socket so its
        // exit cleanup cannot clear the fresh writer.
        if let Some(old) = inner.read_task.lock().await.take() {
            old.abort();
            let _ = old.await;
        }

        let (sink, stream) = ws_stream.split();
        *inner.writer.lock().await = Some(sink);
        *inner.read_task.lock().await = Some(tokio::spawn(read_loop(inner.clone(), stream)));

        // start-connection -> wait for connection-started
        let rx = self.register_waiter(EVENT_CONNECTION_STARTED).await;
        let start = Frame::client_event(EVENT_START_CONNECTION, None, json!({}));
        self.send_frame_raw(&start).await?;
        self.await_waiter(rx, EVENT_CONNECTION_STARTED).await?;

        self.start_session().await
    }

    /// start-session -> wait for session-started.
    async fn start_session(&self) -> UpstreamResult<()> {
        let body = serde_json::to_value(&self.inner.start_body).unwrap_or_else(|_| json!({}));
        let rx = self.register_waiter(EVENT_SESSION_STARTED).await;
        let frame = Frame::client_event(
            EVENT_START_SESSION,
            Some(self.inner.session_id.clone()),
            body,
        );
        self.send_frame_raw(&frame).await?;
        self.await_waiter(rx, EVENT_SESSION_STARTED).await?;
        self.inner.started.store(true, Ordering::SeqCst);
        tracing::info!(session_id = %self.inner.session_id, "upstream session started");
        Ok(())
    }

    async fn register_waiter(&self, event: u32) -> oneshot::Receiver<Frame> {
        let (tx, rx) = oneshot::channel();
        *self.inner.waiter.lock().await = Some(EventWaiter { event, tx });
        rx
    }

    async fn await_waiter(
        &self,
        rx: oneshot::Receiver<Frame>,
        event: u32,
    ) -> UpstreamResult<Frame> {
        match tokio::time::timeout(self.inner.settings.handshake_timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            // The read loop dropped the waiter: the socket went away.
            Ok(Err(_)) => Err(UpstreamError::ClosedDuringHandshake),
            Err(_) => {
                self.inner.waiter.lock().await.take();
                Err(UpstreamError::HandshakeTimeout(event))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Writing
    // -------------------------------------------------------------------------

    /// Write one frame, re-dialing once if the socket is not open.
    async fn send_frame(&self, frame: &Frame) -> UpstreamResult<()> {
        if self.inner.writer.lock().await.is_none() {
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(UpstreamError::NotConnected);
            }
            tracing::warn!(
                session_id = %self.inner.session_id,
                "send requested while disconnected, reconnecting"
            );
            self.establish().await?;
        }
        self.send_frame_raw(frame).await
    }

    async fn send_frame_raw(&self, frame: &Frame) -> UpstreamResult<()> {
        let mut writer = self.inner.writer.lock().await;
        let sink = writer.as_mut().ok_or(UpstreamError::NotConnected)?;
        sink.send(Message::Binary(protocol::encode(frame)))
            .await
            .map_err(|e| UpstreamError::WebSocket(e.to_string()))
    }
}

// =============================================================================
// Read loop
// =============================================================================

async fn read_loop(inner: Arc<Inner>, mut stream: WsStream) {
    let mut signaled = false;

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Binary(data)) => match protocol::decode(&data) {
                Some(frame) => dispatch_frame(&inner, frame).await,
                None => {
                    tracing::debug!("skipping undecodable upstream frame ({} bytes)", data.len());
                }
            },
            Ok(Message::Text(text)) => {
                tracing::debug!("ignoring unexpected upstream text frame ({} bytes)", text.len());
            }
            Ok(Message::Close(close)) => {
                let (code, reason) = close
                    .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                    .unwrap_or((1005, String::new()));
                emit(&inner, UpstreamEvent::Closed { code, reason }).await;
                signaled = true;
                break;
            }
            Ok(_) => {}
            Err(e) => {
                emit(&inner, UpstreamEvent::Error(e.to_string())).await;
                signaled = true;
                break;
            }
        }
    }

    if !signaled {
        emit(
            &inner,
            UpstreamEvent::Closed {
                code: 1006,
                reason: String::new(),
            },
        )
        .await;
    }

    inner.started.store(false, Ordering::SeqCst);
    // The socket is gone: clearing the writer marks the client "not open" so
    // the next send may transparently re-dial once.
    *inner.writer.lock().await = None;
    // Dropping a pending waiter fails the handshake wait promptly.
    inner.waiter.lock().await.take();
}

async fn dispatch_frame(inner: &Arc<Inner>, frame: Frame) {
    let fulfilled = {
        let mut waiter = inner.waiter.lock().await;
        match waiter.take() {
            Some(w) if frame.event == Some(w.event) => {
                let _ = w.tx.send(frame.clone());
                true
            }
            other => {
                *waiter = other;
                false
            }
        }
    };
    if fulfilled {
        tracing::debug!(event = ?frame.event, "handshake event received");
    }
    emit(inner, UpstreamEvent::Frame(frame)).await;
}

async fn emit(inner: &Arc<Inner>, event: UpstreamEvent) {
    let tx = inner.events_tx.lock().await.clone();
    if tx.send(event).await.is_err() {
        tracing::debug!("upstream event dropped, no active subscriber");
    }
}
