//! Browser WebSocket relay.
//!
//! Binds one browser socket to one upstream client and translates between
//! the two protocols. Each browser socket gets a dedicated task running a
//! single `select!` loop over browser frames, parsed upstream events and
//! control commands; that loop is the session's serialization lane, so no
//! other code mutates the session while it runs.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use base64::prelude::*;
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::protocol::{Frame, MessageType, Payload};
use crate::core::upstream::messages::{StartSessionBody, EVENT_SESSION_INTERRUPTED};
use crate::core::upstream::{UpstreamClient, UpstreamEvent, UpstreamSettings};
use crate::journal::Role;
use crate::sessions::{
    ControlCommand, InterruptSource, SessionConfig, SessionHandle, SessionState,
};
use crate::state::AppState;

use super::messages::{ClientMessage, RelayRoute, ServerMessage};

/// Outbound channel capacity towards the browser.
const OUTBOUND_CHANNEL_CAPACITY: usize = 1024;

/// Size of each silent tail chunk sent on commit (100 ms at 16 kHz PCM16).
pub const COMMIT_CHUNK_BYTES: usize = 3200;

/// Close codes used by the relay.
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_MISSING_SESSION: u16 = 1008;
const CLOSE_UPSTREAM_FAILED: u16 = 1011;
const CLOSE_DISPLACED: u16 = 4001;

/// Payload keys the text-extraction rule looks at, in order.
const TEXT_KEYS: [&str; 7] = [
    "content",
    "text",
    "sentence",
    "result",
    "display_text",
    "answer",
    "output_text",
];

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

/// Why the relay loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseTrigger {
    ClientStop,
    BrowserClosed,
    UpstreamClosed,
    UpstreamError,
}

/// How the relay loop exits: into the orderly close path, or displaced by a
/// newer browser socket (which must leave the upstream untouched).
#[derive(Debug)]
enum LoopExit {
    Trigger(CloseTrigger),
    Displaced,
}

/// `GET /ws?sessionId=...` - WebSocket attach point for the browser.
pub async fn relay_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_relay_socket(socket, state, query.session_id))
}

async fn handle_relay_socket(socket: WebSocket, state: Arc<AppState>, session_id: Option<String>) {
    let Some(session_id) = session_id else {
        close_socket(socket, CLOSE_MISSING_SESSION, "missing sessionId").await;
        return;
    };

    let (session, created) = state
        .registry
        .get_or_create(&session_id, SessionConfig::default());
    if created {
        // The id was minted out-of-band; give its journal the same opening
        // entry the HTTP mint writes.
        journal(
            &state,
            &session_id,
            "session_opened",
            json!({ "source": "ws", "config": session.config() }),
        );
    }

    let (mut displace_rx, mut control_rx) = session.attach_browser().await;

    let (socket_tx, mut socket_rx) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<RelayRoute>(OUTBOUND_CHANNEL_CAPACITY);
    let sender_task = tokio::spawn(run_sender(socket_tx, out_rx));

    // Bring the upstream up unless a displaced predecessor already did.
    session.set_state(SessionState::UpstreamConnecting).await;
    let (upstream, mut events_rx) = match session.upstream().await {
        Some(existing) => {
            let events_rx = existing.subscribe().await;
            (existing, events_rx)
        }
        None => {
            let settings = UpstreamSettings::from_config(&state.config);
            let body = StartSessionBody::from_config(&state.config, session.config());
            match UpstreamClient::connect(settings, session_id.clone(), body).await {
                Ok((upstream, events_rx)) => {
                    journal(&state, &session_id, "upstream_connected", json!({}));
                    session.set_upstream(upstream.clone()).await;
                    (upstream, events_rx)
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "upstream connect failed");
                    journal(&state, &session_id, "error", json!({ "message": e.to_string() }));
                    let _ = out_tx
                        .send(RelayRoute::Message(ServerMessage::error(
                            "upstream_connect_failed",
                        )))
                        .await;
                    let _ = out_tx
                        .send(RelayRoute::Close {
                            code: CLOSE_UPSTREAM_FAILED,
                            reason: "upstream connect failed",
                        })
                        .await;
                    let _ = sender_task.await;
                    if session.close_once() {
                        state.registry.remove(&session_id);
                        journal(&state, &session_id, "session_closed", json!({}));
                    }
                    session.set_state(SessionState::Closed).await;
                    return;
                }
            }
        }
    };

    send_message(
        &out_tx,
        ServerMessage::Ready {
            session_id: session_id.clone(),
            output_audio_format: state.config.output_audio_format.clone(),
        },
    )
    .await;
    session.set_state(SessionState::Ready).await;
    info!(session_id = %session_id, "browser session ready");

    let exit = loop {
        select! {
            msg = socket_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Some(trigger) = handle_client_text(
                        text.as_str(),
                        &state,
                        &session,
                        &upstream,
                        &out_tx,
                    )
                    .await
                    {
                        break LoopExit::Trigger(trigger);
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    break LoopExit::Trigger(CloseTrigger::BrowserClosed);
                }
                Some(Ok(Message::Binary(_))) => {
                    send_message(&out_tx, ServerMessage::error("invalid_message")).await;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session_id = %session.id(), error = %e, "browser socket error");
                    break LoopExit::Trigger(CloseTrigger::BrowserClosed);
                }
            },

            event = events_rx.recv() => match event {
                Some(UpstreamEvent::Frame(frame)) => {
                    handle_upstream_frame(frame, &state, &session, &out_tx).await;
                }
                Some(UpstreamEvent::Closed { code, reason }) => {
                    send_message(&out_tx, ServerMessage::Closed { code, reason }).await;
                    break LoopExit::Trigger(CloseTrigger::UpstreamClosed);
                }
                Some(UpstreamEvent::Error(message)) => {
                    warn!(session_id = %session.id(), error = %message, "upstream transport error");
                    journal(&state, session.id(), "error", json!({ "message": message.clone() }));
                    send_message(
                        &out_tx,
                        ServerMessage::Error {
                            error: "upstream_error".into(),
                            code: None,
                            message: Some(message),
                            payload: None,
                        },
                    )
                    .await;
                    break LoopExit::Trigger(CloseTrigger::UpstreamError);
                }
                None => break LoopExit::Trigger(CloseTrigger::UpstreamClosed),
            },

            cmd = control_rx.recv() => match cmd {
                Some(ControlCommand::Interrupt { source }) => {
                    if let Some(trigger) =
                        perform_interrupt(source, &state, &session, &upstream, &out_tx).await
                    {
                        break LoopExit::Trigger(trigger);
                    }
                }
                // The control sender only goes away when a newer attach
                // replaced it.
                None => break LoopExit::Displaced,
            },

            _ = &mut displace_rx => break LoopExit::Displaced,
        }
    };

    match exit {
        LoopExit::Displaced => {
            // A newer socket took over this session: close without touching
            // the upstream or the registry record.
            info!(session_id = %session.id(), "browser socket displaced");
            let _ = out_tx
                .send(RelayRoute::Close { code: CLOSE_DISPLACED, reason: "replaced" })
                .await;
            let _ = sender_task.await;
        }
        LoopExit::Trigger(trigger) => {
            debug!(session_id = %session.id(), ?trigger, "relay loop ended");
            orderly_close(&state, &session, &out_tx).await;
            let _ = sender_task.await;
        }
    }
}

// =============================================================================
// Outbound path
// =============================================================================

async fn run_sender(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<RelayRoute>) {
    while let Some(route) = rx.recv().await {
        match route {
            RelayRoute::Message(message) => {
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize outgoing message");
                        continue;
                    }
                };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            RelayRoute::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

async fn send_message(out_tx: &mpsc::Sender<RelayRoute>, message: ServerMessage) {
    if out_tx.send(RelayRoute::Message(message)).await.is_err() {
        debug!("browser sender task gone, dropping message");
    }
}

async fn close_socket(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

// =============================================================================
// Browser -> upstream
// =============================================================================

async fn handle_client_text(
    text: &str,
    state: &Arc<AppState>,
    session: &Arc<SessionHandle>,
    upstream: &UpstreamClient,
    out_tx: &mpsc::Sender<RelayRoute>,
) -> Option<CloseTrigger> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => {
            send_message(out_tx, ServerMessage::error("invalid_json")).await;
            return None;
        }
    };
    let message: ClientMessage = match serde_json::from_value(value) {
        Ok(message) => message,
        Err(_) => {
            send_message(out_tx, ServerMessage::error("invalid_message")).await;
            return None;
        }
    };

    match message {
        ClientMessage::Start { hello } => {
            journal(state, session.id(), "client_started", json!({}));
            if let Some(hello) = hello {
                if let Err(e) = upstream.send_hello(&hello).await {
                    return fail_upstream_write(state, session, out_tx, e).await;
                }
            }
            None
        }

        ClientMessage::AudioAppend { audio } => {
            let pcm = match BASE64_STANDARD.decode(audio.as_bytes()) {
                Ok(pcm) => pcm,
                Err(_) => {
                    send_message(out_tx, ServerMessage::error("invalid_audio")).await;
                    return None;
                }
            };
            journal(
                state,
                session.id(),
                "input_audio_chunk",
                json!({ "bytes": pcm.len() }),
            );
            if let Err(e) = upstream.send_audio_chunk(Bytes::from(pcm)).await {
                return fail_upstream_write(state, session, out_tx, e).await;
            }
            None
        }

        ClientMessage::AudioCommit => {
            // Trailing silence tells the upstream the utterance is over.
            for _ in 0..state.config.commit_tail_chunks {
                let silence = Bytes::from(vec![0u8; COMMIT_CHUNK_BYTES]);
                if let Err(e) = upstream.send_audio_chunk(silence).await {
                    return fail_upstream_write(state, session, out_tx, e).await;
                }
            }
            journal(state, session.id(), "input_audio_committed", json!({}));
            None
        }

        ClientMessage::ChatText { content } => {
            if let Err(e) = upstream.send_chat_text(&content).await {
                return fail_upstream_write(state, session, out_tx, e).await;
            }
            journal(state, session.id(), "input_text", json!({ "content": content }));
            None
        }

        ClientMessage::Interrupt => {
            perform_interrupt(InterruptSource::Client, state, session, upstream, out_tx).await
        }

        ClientMessage::Stop => Some(CloseTrigger::ClientStop),
    }
}

async fn fail_upstream_write(
    state: &Arc<AppState>,
    session: &Arc<SessionHandle>,
    out_tx: &mpsc::Sender<RelayRoute>,
    error: crate::core::upstream::UpstreamError,
) -> Option<CloseTrigger> {
    warn!(session_id = %session.id(), error = %error, "upstream write failed");
    journal(
        state,
        session.id(),
        "error",
        json!({ "message": error.to_string() }),
    );
    send_message(
        out_tx,
        ServerMessage::Error {
            error: "upstream_error".into(),
            code: None,
            message: Some(error.to_string()),
            payload: None,
        },
    )
    .await;
    Some(CloseTrigger::UpstreamError)
}

/// Preempt the response in progress. Pending audio chunks are not flushed
/// first: the finish-session frame goes out immediately and any audio that
/// follows lands in the new session.
async fn perform_interrupt(
    source: InterruptSource,
    state: &Arc<AppState>,
    session: &Arc<SessionHandle>,
    upstream: &UpstreamClient,
    out_tx: &mpsc::Sender<RelayRoute>,
) -> Option<CloseTrigger> {
    session.set_state(SessionState::Interrupting).await;
    journal(
        state,
        session.id(),
        "session_interrupted",
        json!({ "source": source.journal_tag() }),
    );
    send_message(
        out_tx,
        ServerMessage::Event {
            event: Some(EVENT_SESSION_INTERRUPTED),
            payload: json!({ "source": source.event_tag() }),
        },
    )
    .await;

    match upstream.restart_session().await {
        Ok(()) => {
            session.set_state(SessionState::Ready).await;
            None
        }
        Err(e) => fail_upstream_write(state, session, out_tx, e).await,
    }
}

// =============================================================================
// Upstream -> browser
// =============================================================================

async fn handle_upstream_frame(
    frame: Frame,
    state: &Arc<AppState>,
    session: &Arc<SessionHandle>,
    out_tx: &mpsc::Sender<RelayRoute>,
) {
    match (frame.message_type, &frame.payload) {
        (MessageType::ServerAck, Payload::Binary(audio)) => {
            journal(
                state,
                session.id(),
                "assistant_audio_chunk",
                json!({ "bytes": audio.len(), "event": frame.event }),
            );
            send_message(
                out_tx,
                ServerMessage::TtsAudio {
                    audio: BASE64_STANDARD.encode(audio),
                    event: frame.event,
                },
            )
            .await;
        }

        (MessageType::ServerErrorResponse, payload) => {
            let payload_value = payload_to_value(payload);
            let mapped = map_upstream_error(&payload.display_text(), frame.error_code);
            journal(
                state,
                session.id(),
                "error",
                json!({ "code": frame.error_code, "payload": payload_value }),
            );
            send_message(
                out_tx,
                ServerMessage::Error {
                    error: "upstream_server_error".into(),
                    code: frame.error_code,
                    message: Some(mapped),
                    payload: Some(payload_value),
                },
            )
            .await;
        }

        (_, payload) => {
            let payload_value = payload_to_value(payload);
            send_message(
                out_tx,
                ServerMessage::Event {
                    event: frame.event,
                    payload: payload_value.clone(),
                },
            )
            .await;
            if let Some(text) = extract_text(&payload_value) {
                send_message(
                    out_tx,
                    ServerMessage::Text {
                        role: infer_role(frame.event, &payload_value),
                        text,
                    },
                )
                .await;
            }
        }
    }
}

fn payload_to_value(payload: &Payload) -> serde_json::Value {
    match payload {
        Payload::Json(value) => value.clone(),
        Payload::Text(text) => serde_json::Value::String(text.clone()),
        Payload::Binary(bytes) => serde_json::Value::String(BASE64_STANDARD.encode(bytes)),
    }
}

/// The first non-empty string under any of the known text keys, trimmed.
fn extract_text(payload: &serde_json::Value) -> Option<String> {
    let object = payload.as_object()?;
    TEXT_KEYS.iter().find_map(|key| {
        object
            .get(*key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

/// Who a textual frame speaks for.
fn infer_role(event: Option<u32>, payload: &serde_json::Value) -> Role {
    match event {
        Some(550 | 559 | 350 | 351 | 352 | 359) => Role::Assistant,
        Some(451 | 459) => Role::User,
        Some(code) if code >= 450 => Role::System,
        _ => {
            if payload.get("tts_type").is_some() {
                return Role::Assistant;
            }
            let tag = payload
                .get("from")
                .or_else(|| payload.get("role"))
                .and_then(|v| v.as_str());
            match tag {
                Some("user") => Role::User,
                Some("system") => Role::System,
                _ => Role::Assistant,
            }
        }
    }
}

/// Map a raw upstream error string onto what the browser should show.
fn map_upstream_error(raw: &str, code: Option<u32>) -> String {
    if raw.contains("session number limit exceeded") {
        return "The assistant is at its concurrent conversation limit. \
                Please try again in a moment."
            .to_string();
    }
    if raw.contains("DialogAudioIdleTimeoutError") || raw.contains("AudioASRIdleTimeoutError") {
        return "No speech detected for a while, so the conversation went idle. \
                Press the button and talk to continue."
            .to_string();
    }
    match code {
        Some(code) => format!("Upstream error {code}: {raw}"),
        None => raw.to_string(),
    }
}

// =============================================================================
// Close path
// =============================================================================

/// Orderly close, idempotent: close the browser socket, tear down the
/// upstream, remove the record, journal `session_closed`. Only the first
/// trigger does the work.
async fn orderly_close(
    state: &Arc<AppState>,
    session: &Arc<SessionHandle>,
    out_tx: &mpsc::Sender<RelayRoute>,
) {
    let _ = out_tx
        .send(RelayRoute::Close {
            code: CLOSE_NORMAL,
            reason: "session closed",
        })
        .await;

    if !session.close_once() {
        return;
    }
    session.set_state(SessionState::Closed).await;
    if let Some(upstream) = session.upstream().await {
        upstream.close().await;
    }
    state.registry.remove(session.id());
    journal(state, session.id(), "session_closed", json!({}));
    info!(session_id = %session.id(), "session closed");
}

/// Journal writes must never abort the relay; failures degrade to a log line.
fn journal(state: &AppState, session_id: &str, event_type: &str, payload: serde_json::Value) {
    if let Err(e) = state.journal.append(session_id, event_type, payload) {
        warn!(session_id, event_type, error = %e, "journal append failed");
    }
}

// =============================================================================
// Tests
// =============================================================================
