//! Test doubles and harness helpers shared by the integration tests.
//!
//! `MockUpstream` stands in for the realtime dialogue service: it accepts
//! WebSocket connections, parses the client's binary frames and answers the
//! connect handshake, recording everything of interest for assertions.

#![allow(dead_code)]

use std::io::Read;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flate2::read::GzDecoder;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use voicebridge_gateway::core::protocol::{encode, Frame};
use voicebridge_gateway::routes;
use voicebridge_gateway::{AppState, ServerConfig};

/// How the mock dialogue service behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    /// Answer the handshake and echo test stimuli.
    Normal,
    /// Accept the socket but never answer anything.
    Unresponsive,
}

/// A recorded client frame, decompressed where applicable.
#[derive(Debug, Clone)]
pub struct RecordedChunk {
    pub bytes: Vec<u8>,
    pub tail: bool,
}

pub struct MockUpstream {
    pub url: String,
    /// Input-audio payloads in arrival order, gunzipped.
    pub audio_chunks: Arc<Mutex<Vec<RecordedChunk>>>,
    /// How many start-session handshakes completed.
    pub session_starts: Arc<AtomicU32>,
}

impl MockUpstream {
    pub async fn spawn(behavior: MockBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        let audio_chunks = Arc::new(Mutex::new(Vec::new()));
        let session_starts = Arc::new(AtomicU32::new(0));

        let chunks = audio_chunks.clone();
        let starts = session_starts.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(handle_connection(
                    stream,
                    behavior,
                    chunks.clone(),
                    starts.clone(),
                ));
            }
        });

        Self {
            url: format!("ws://{addr}"),
            audio_chunks,
            session_starts,
        }
    }

    /// Block until the mock has recorded `count` audio chunks.
    pub async fn wait_for_chunks(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if self.audio_chunks.lock().await.len() >= count {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {count} audio chunks"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    behavior: MockBehavior,
    chunks: Arc<Mutex<Vec<RecordedChunk>>>,
    starts: Arc<AtomicU32>,
) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };

    if behavior == MockBehavior::Unresponsive {
        while ws.next().await.is_some() {}
        return;
    }

    while let Some(Ok(msg)) = ws.next().await {
        let Message::Binary(data) = msg else { continue };
        let Some(frame) = parse_client_frame(&data) else {
            continue;
        };

        // Audio-only requests: record the (decompressed) payload.
        if frame.msg_type == 0x2 {
            let bytes = if frame.gzip {
                gunzip(&frame.payload).unwrap_or(frame.payload.clone())
            } else {
                frame.payload.clone()
            };
            chunks.lock().await.push(RecordedChunk {
                bytes,
                tail: frame.tail,
            });
            continue;
        }

        let session = frame.session.clone().unwrap_or_default();
        match frame.event {
            Some(1) => {
                send_frame(&mut ws, &server_event(50, "", json!({}))).await;
            }
            Some(100) => {
                let count = starts.fetch_add(1, Ordering::SeqCst) + 1;
                send_frame(&mut ws, &server_event(150, &session, json!({"dialog_id": "mock"})))
                    .await;
                // A re-handshake means an interruption: start the "new turn"
                // immediately so ordering can be asserted.
                if count >= 2 {
                    send_frame(&mut ws, &Frame::server_audio(352, &session, tts_pcm().into()))
                        .await;
                }
            }
            Some(300) => {
                // Greeting: one audio chunk plus one assistant text event.
                send_frame(&mut ws, &Frame::server_audio(352, &session, tts_pcm().into())).await;
                send_frame(
                    &mut ws,
                    &server_event(550, &session, json!({"content": "hello there"})),
                )
                .await;
            }
            Some(501) => {
                send_frame(
                    &mut ws,
                    &server_event(550, &session, json!({"content": "echo"})),
                )
                .await;
            }
            _ => {}
        }
    }
}

fn server_event(event: u32, session: &str, body: serde_json::Value) -> Frame {
    Frame::server_event(event, session, body)
}

/// 20 ms of a recognizable non-zero pattern.
pub fn tts_pcm() -> Vec<u8> {
    (0..960u16).flat_map(|v| v.to_le_bytes()).collect()
}

async fn send_frame(
    ws: &mut tokio_tungstenite::WebSocketStream<TcpStream>,
    frame: &Frame,
) {
    let _ = ws.send(Message::Binary(encode(frame))).await;
}

// =============================================================================
// Client frame parsing
// =============================================================================

/// Minimal view of a client frame sufficient for the mock.
#[derive(Debug, Clone)]
pub struct ClientFrame {
    pub msg_type: u8,
    pub flags: u8,
    pub event: Option<u32>,
    pub session: Option<String>,
    pub payload: Vec<u8>,
    pub gzip: bool,
    pub tail: bool,
}

/// Parse a frame in the client->server field order. Events 1 and 2 carry no
/// session id; everything else does.
pub fn parse_client_frame(data: &[u8]) -> Option<ClientFrame> {
    if data.len() < 4 {
        return None;
    }
    let msg_type = data[1] >> 4;
    let flags = data[1] & 0x0F;
    let gzip = data[2] & 0x0F == 0x1;
    let tail = flags & 0b0010 != 0;
    let mut pos = 4usize;

    let event = if flags & 0b0100 != 0 {
        let e = u32_be(data, pos)?;
        pos += 4;
        Some(e)
    } else {
        None
    };

    let has_session = !matches!(event, Some(1) | Some(2));
    let session = if has_session {
        let len = u32_be(data, pos)? as usize;
        pos += 4;
        let raw = data.get(pos..pos + len)?;
        pos += len;
        Some(String::from_utf8_lossy(raw).into_owned())
    } else {
        None
    };

    let payload_len = u32_be(data, pos)? as usize;
    pos += 4;
    let payload = data.get(pos..pos + payload_len)?.to_vec();

    Some(ClientFrame {
        msg_type,
        flags,
        event,
        session,
        payload,
        gzip,
        tail,
    })
}

fn u32_be(data: &[u8], pos: usize) -> Option<u32> {
    let b = data.get(pos..pos + 4)?;
    Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

pub fn gunzip(data: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).ok()?;
    Some(out)
}

// =============================================================================
// Gateway harness
// =============================================================================

/// Config pointed at a mock upstream, with a scratch journal directory and a
/// test-friendly handshake timeout.
pub fn test_config(upstream_url: &str) -> ServerConfig {
    ServerConfig {
        upstream_base_url: upstream_url.to_string(),
        history_dir: std::env::temp_dir().join(format!("voicebridge-e2e-{}", uuid::Uuid::new_v4())),
        handshake_timeout: Duration::from_millis(500),
        ..ServerConfig::default()
    }
}

/// Serve the full application router on an ephemeral port.
pub async fn spawn_gateway(config: ServerConfig) -> (String, Arc<AppState>) {
    let state = Arc::new(AppState::new(config));
    let app = routes::app(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind gateway");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}
