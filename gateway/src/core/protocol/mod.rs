//! Binary frame codec for the upstream dialogue-service envelope.
//!
//! The wire format is a 4-byte fixed header followed by variable fields
//! selected by header bits:
//!
//! ```text
//! byte 0: [version:4][header size in 4-byte units:4]
//! byte 1: [message type:4][type-specific flags:4]
//! byte 2: [serialization:4][compression:4]
//! byte 3: reserved (zero)
//! ```
//!
//! Client frames carry an optional event code, an optional session id and a
//! length-prefixed payload. Server frames additionally carry an optional
//! sequence and, for error responses, a 4-byte error code.
//!
//! The codec is purely functional: it performs no I/O and never panics on
//! malformed input. [`decode`] returns `None` for anything it cannot make
//! sense of so a read loop can skip the frame and keep going.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

/// Protocol version in the high nibble of byte 0. Always 1.
pub const PROTOCOL_VERSION: u8 = 0x1;

/// Header size in 4-byte units. Always 1 for frames we produce.
pub const DEFAULT_HEADER_SIZE: u8 = 1;

// =============================================================================
// Header enums
// =============================================================================

/// Message type nibble (byte 1, high).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Client request with a JSON body (handshake, text, session control).
    ClientFullRequest,
    /// Client request whose payload is raw audio.
    ClientAudioOnlyRequest,
    /// Server response with a JSON body.
    ServerFullResponse,
    /// Server acknowledgement; carries synthesized audio when binary.
    ServerAck,
    /// Server error report with a numeric code.
    ServerErrorResponse,
}

impl MessageType {
    pub fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0x1 => Some(Self::ClientFullRequest),
            0x2 => Some(Self::ClientAudioOnlyRequest),
            0x9 => Some(Self::ServerFullResponse),
            0xB => Some(Self::ServerAck),
            0xF => Some(Self::ServerErrorResponse),
            _ => None,
        }
    }

    pub fn as_nibble(self) -> u8 {
        match self {
            Self::ClientFullRequest => 0x1,
            Self::ClientAudioOnlyRequest => 0x2,
            Self::ServerFullResponse => 0x9,
            Self::ServerAck => 0xB,
            Self::ServerErrorResponse => 0xF,
        }
    }

}

/// Type-specific flag bits (byte 1, low nibble). A bitfield, not an enum:
/// a frame may carry several at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(pub u8);

impl Flags {
    /// Positive sequence number present.
    pub const SEQUENCE: Flags = Flags(0b0001);
    /// Negative sequence; doubles as the audio "tail" marker on
    /// client-audio-only requests.
    pub const TAIL: Flags = Flags(0b0010);
    /// Event code present.
    pub const EVENT: Flags = Flags(0b0100);

    pub const NONE: Flags = Flags(0);

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: Flags) -> Flags {
        Flags(self.0 | other.0)
    }
}

/// Serialization nibble (byte 2, high).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Serialization {
    /// Raw bytes.
    #[default]
    None,
    /// JSON-encoded body.
    Json,
}

impl Serialization {
    pub fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0x0 => Some(Self::None),
            0x1 => Some(Self::Json),
            _ => None,
        }
    }

    pub fn as_nibble(self) -> u8 {
        match self {
            Self::None => 0x0,
            Self::Json => 0x1,
        }
    }
}

/// Compression nibble (byte 2, low).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

impl Compression {
    pub fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0x0 => Some(Self::None),
            0x1 => Some(Self::Gzip),
            _ => None,
        }
    }

    pub fn as_nibble(self) -> u8 {
        match self {
            Self::None => 0x0,
            Self::Gzip => 0x1,
        }
    }
}

// =============================================================================
// Frame
// =============================================================================

/// Decoded payload of a frame. The upstream mixes JSON bodies, raw audio and
/// plain text; the variant is narrowed exactly once at the codec boundary so
/// downstream rules never guess at structure they do not have.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(serde_json::Value),
    Binary(Bytes),
    Text(String),
}

impl Payload {
    /// The JSON value, when this payload is one.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Best-effort human-readable rendering, used for error mapping.
    pub fn display_text(&self) -> String {
        match self {
            Payload::Text(s) => s.clone(),
            Payload::Json(v) => match v.get("error").and_then(|e| e.as_str()) {
                Some(s) => s.to_string(),
                None => v.to_string(),
            },
            Payload::Binary(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }
}

/// One unit of the upstream envelope, in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub version: u8,
    pub header_size: u8,
    pub message_type: MessageType,
    pub flags: Flags,
    pub serialization: Serialization,
    pub compression: Compression,
    pub event: Option<u32>,
    pub sequence: Option<i32>,
    pub session_id: Option<String>,
    pub error_code: Option<u32>,
    pub payload: Payload,
}

impl Frame {
    /// A client-full-request frame carrying a JSON body and an event code.
    pub fn client_event(event: u32, session_id: Option<String>, body: serde_json::Value) -> Self {
        Frame {
            version: PROTOCOL_VERSION,
            header_size: DEFAULT_HEADER_SIZE,
            message_type: MessageType::ClientFullRequest,
            flags: Flags::EVENT,
            serialization: Serialization::Json,
            compression: Compression::None,
            event: Some(event),
            sequence: None,
            session_id,
            error_code: None,
            payload: Payload::Json(body),
        }
    }

    /// A gzip'd client-audio-only frame for one chunk of input audio.
    pub fn client_audio(event: u32, session_id: Option<String>, audio: Bytes) -> Self {
        Frame {
            version: PROTOCOL_VERSION,
            header_size: DEFAULT_HEADER_SIZE,
            message_type: MessageType::ClientAudioOnlyRequest,
            flags: Flags::EVENT,
            serialization: Serialization::None,
            compression: Compression::Gzip,
            event: Some(event),
            sequence: None,
            session_id,
            error_code: None,
            payload: Payload::Binary(audio),
        }
    }

    /// The end-of-input-audio marker: tail flag set, no event, zeroed payload.
    pub fn client_audio_tail(session_id: Option<String>, payload: Bytes) -> Self {
        Frame {
            version: PROTOCOL_VERSION,
            header_size: DEFAULT_HEADER_SIZE,
            message_type: MessageType::ClientAudioOnlyRequest,
            flags: Flags::TAIL,
            serialization: Serialization::None,
            compression: Compression::None,
            event: None,
            sequence: None,
            session_id,
            error_code: None,
            payload: Payload::Binary(payload),
        }
    }

    /// A server-full-response frame (used by tests and mock services).
    pub fn server_event(event: u32, session_id: &str, body: serde_json::Value) -> Self {
        Frame {
            version: PROTOCOL_VERSION,
            header_size: DEFAULT_HEADER_SIZE,
            message_type: MessageType::ServerFullResponse,
            flags: Flags::EVENT,
            serialization: Serialization::Json,
            compression: Compression::None,
            event: Some(event),
            sequence: None,
            session_id: Some(session_id.to_string()),
            error_code: None,
            payload: Payload::Json(body),
        }
    }

    /// A server-ack frame carrying raw synthesized audio.
    pub fn server_audio(event: u32, session_id: &str, audio: Bytes) -> Self {
        Frame {
            version: PROTOCOL_VERSION,
            header_size: DEFAULT_HEADER_SIZE,
            message_type: MessageType::ServerAck,
            flags: Flags::EVENT,
            serialization: Serialization::None,
            compression: Compression::None,
            event: Some(event),
            sequence: None,
            session_id: Some(session_id.to_string()),
            error_code: None,
            payload: Payload::Binary(audio),
        }
    }

    /// A server-error-response frame.
    pub fn server_error(code: u32, body: serde_json::Value) -> Self {
        Frame {
            version: PROTOCOL_VERSION,
            header_size: DEFAULT_HEADER_SIZE,
            message_type: MessageType::ServerErrorResponse,
            flags: Flags::NONE,
            serialization: Serialization::Json,
            compression: Compression::None,
            event: None,
            sequence: None,
            session_id: None,
            error_code: Some(code),
            payload: Payload::Json(body),
        }
    }
}

// =============================================================================
// Encoding
// =============================================================================

fn gzip_bytes(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::fast());
    if encoder.write_all(data).is_err() {
        return data.to_vec();
    }
    encoder.finish().unwrap_or_else(|_| data.to_vec())
}

fn gunzip_bytes(data: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).ok()?;
    Some(out)
}

fn payload_bytes(frame: &Frame) -> Vec<u8> {
    let raw = match &frame.payload {
        Payload::Json(v) => serde_json::to_vec(v).unwrap_or_default(),
        Payload::Text(s) => s.as_bytes().to_vec(),
        Payload::Binary(b) => b.to_vec(),
    };
    match frame.compression {
        Compression::Gzip => gzip_bytes(&raw),
        Compression::None => raw,
    }
}

/// Encode a frame into its wire form.
///
/// Client frames follow the documented field order: header, event code (when
/// the event flag is set), length-prefixed session id (when given), payload
/// length, payload. Server frames (produced here only for tests and mock
/// services) follow the server field order that [`decode`] expects.
pub fn encode(frame: &Frame) -> Bytes {
    let payload = payload_bytes(frame);
    let mut out = Vec::with_capacity(16 + payload.len());

    out.push((frame.version << 4) | (frame.header_size & 0x0F));
    out.push((frame.message_type.as_nibble() << 4) | (frame.flags.0 & 0x0F));
    out.push((frame.serialization.as_nibble() << 4) | (frame.compression.as_nibble() & 0x0F));
    out.push(0);

    match frame.message_type {
        MessageType::ServerErrorResponse => {
            out.extend_from_slice(&frame.error_code.unwrap_or(0).to_be_bytes());
            out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            out.extend_from_slice(&payload);
        }
        MessageType::ServerFullResponse | MessageType::ServerAck => {
            if frame.flags.contains(Flags::TAIL) {
                out.extend_from_slice(&frame.sequence.unwrap_or(0).to_be_bytes());
            }
            if frame.flags.contains(Flags::EVENT) {
                out.extend_from_slice(&frame.event.unwrap_or(0).to_be_bytes());
            }
            let session = frame.session_id.as_deref().unwrap_or("");
            out.extend_from_slice(&(session.len() as i32).to_be_bytes());
            out.extend_from_slice(session.as_bytes());
            out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            out.extend_from_slice(&payload);
        }
        MessageType::ClientFullRequest | MessageType::ClientAudioOnlyRequest => {
            if frame.flags.contains(Flags::EVENT) {
                out.extend_from_slice(&frame.event.unwrap_or(0).to_be_bytes());
            }
            if let Some(session) = frame.session_id.as_deref() {
                out.extend_from_slice(&(session.len() as i32).to_be_bytes());
                out.extend_from_slice(session.as_bytes());
            }
            out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            out.extend_from_slice(&payload);
        }
    }

    Bytes::from(out)
}

// =============================================================================
// Decoding
// =============================================================================

/// Bounds-checked cursor over the raw frame bytes.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        if end > self.data.len() {
            return None;
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Some(slice)
    }

    fn u32_be(&mut self) -> Option<u32> {
        let b = self.take(4)?;
        Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32_be(&mut self) -> Option<i32> {
        let b = self.take(4)?;
        Some(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

fn decode_payload(raw: &[u8], serialization: Serialization, compression: Compression) -> Payload {
    let bytes = match compression {
        // Gunzip failure surfaces the raw bytes rather than failing the frame.
        Compression::Gzip => gunzip_bytes(raw).unwrap_or_else(|| raw.to_vec()),
        Compression::None => raw.to_vec(),
    };
    match serialization {
        Serialization::Json => match serde_json::from_slice::<serde_json::Value>(&bytes) {
            Ok(value) => Payload::Json(value),
            // JSON parse failure surfaces the text; invalid UTF-8 the bytes.
            Err(_) => match String::from_utf8(bytes) {
                Ok(text) => Payload::Text(text),
                Err(e) => Payload::Binary(Bytes::from(e.into_bytes())),
            },
        },
        Serialization::None => Payload::Binary(Bytes::from(bytes)),
    }
}

/// Decode one server frame from its wire form.
///
/// Returns `None` for truncated input, unknown header nibbles and message
/// types the gateway does not consume (including client frames), so a read
/// loop can skip bad frames without special-casing.
pub fn decode(data: &[u8]) -> Option<Frame> {
    if data.len() < 4 {
        return None;
    }

    let version = data[0] >> 4;
    let header_size = data[0] & 0x0F;
    let message_type = MessageType::from_nibble(data[1] >> 4)?;
    let flags = Flags(data[1] & 0x0F);
    let serialization = Serialization::from_nibble(data[2] >> 4)?;
    let compression = Compression::from_nibble(data[2] & 0x0F)?;

    // A declared header size other than 1 is honored: variable fields start
    // after the declared header length.
    let header_len = 4usize * usize::from(header_size.max(1));
    let mut cursor = Cursor::new(data);
    cursor.take(header_len)?;

    match message_type {
        MessageType::ServerFullResponse | MessageType::ServerAck => {
            let sequence = if flags.contains(Flags::TAIL) {
                Some(cursor.i32_be()?)
            } else {
                None
            };
            let event = if flags.contains(Flags::EVENT) {
                Some(cursor.u32_be()?)
            } else {
                None
            };
            let session_len = cursor.i32_be()?;
            let session_id = if session_len > 0 {
                let raw = cursor.take(session_len as usize)?;
                Some(String::from_utf8_lossy(raw).into_owned())
            } else {
                None
            };
            let payload_len = cursor.u32_be()? as usize;
            let raw = cursor.take(payload_len)?;
            Some(Frame {
                version,
                header_size,
                message_type,
                flags,
                serialization,
                compression,
                event,
                sequence,
                session_id,
                error_code: None,
                payload: decode_payload(raw, serialization, compression),
            })
        }
        MessageType::ServerErrorResponse => {
            let error_code = cursor.u32_be()?;
            let payload_len = cursor.u32_be()? as usize;
            let raw = cursor.take(payload_len)?;
            Some(Frame {
                version,
                header_size,
                message_type,
                flags,
                serialization,
                compression,
                event: None,
                sequence: None,
                session_id: None,
                error_code: Some(error_code),
                payload: decode_payload(raw, serialization, compression),
            })
        }
        // Client-bound message types are not ours to consume.
        MessageType::ClientFullRequest | MessageType::ClientAudioOnlyRequest => None,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_header_nibbles() {
        assert_eq!(MessageType::from_nibble(0x1), Some(MessageType::ClientFullRequest));
        assert_eq!(MessageType::from_nibble(0xB), Some(MessageType::ServerAck));
        assert_eq!(MessageType::from_nibble(0x7), None);
        assert_eq!(Serialization::from_nibble(0x1), Some(Serialization::Json));
        assert_eq!(Serialization::from_nibble(0x9), None);
        assert_eq!(Compression::from_nibble(0x1), Some(Compression::Gzip));
        assert_eq!(Compression::from_nibble(0x3), None);
    }

    #[test]
    fn test_flags_bitfield() {
        let flags = Flags::EVENT.with(Flags::TAIL);
        assert!(flags.contains(Flags::EVENT));
        assert!(flags.contains(Flags::TAIL));
        assert!(!flags.contains(Flags::SEQUENCE));
    }

    #[test]
    fn test_client_event_wire_layout() {
        let frame = Frame::client_event(1, None, json!({}));
        let bytes = encode(&frame);

        // header: version 1 + size 1, full-request + event flag, JSON + none
        assert_eq!(&bytes[..4], &[0x11, 0x14, 0x10, 0x00]);
        // event code 1
        assert_eq!(&bytes[4..8], &1u32.to_be_bytes());
        // no session id: payload length follows directly
        assert_eq!(&bytes[8..12], &2u32.to_be_bytes());
        assert_eq!(&bytes[12..], b"{}");
    }

    #[test]
    fn test_client_event_with_session_id() {
        let frame = Frame::client_event(100, Some("abc".into()), json!({"k": 1}));
        let bytes = encode(&frame);

        assert_eq!(&bytes[4..8], &100u32.to_be_bytes());
        assert_eq!(&bytes[8..12], &3i32.to_be_bytes());
        assert_eq!(&bytes[12..15], b"abc");
    }

    #[test]
    fn test_client_audio_gzip_round() {
        let pcm = Bytes::from(vec![7u8; 640]);
        let frame = Frame::client_audio(200, Some("s".into()), pcm.clone());
        let bytes = encode(&frame);

        // audio-only type nibble with event flag
        assert_eq!(bytes[1], 0x24);
        // serialization none, compression gzip
        assert_eq!(bytes[2], 0x01);

        // payload after event(4) + session len(4) + session(1) + payload len(4)
        let payload = &bytes[17..];
        assert_eq!(gunzip_bytes(payload).unwrap(), pcm.to_vec());
    }

    #[test]
    fn test_audio_tail_layout() {
        let frame = Frame::client_audio_tail(Some("s".into()), Bytes::from(vec![0u8; 320]));
        let bytes = encode(&frame);

        // tail flag, no event flag
        assert_eq!(bytes[1], 0x22);
        // no event field: session length is first
        assert_eq!(&bytes[4..8], &1i32.to_be_bytes());
        assert_eq!(bytes[8], b's');
        assert_eq!(&bytes[9..13], &320u32.to_be_bytes());
        assert_eq!(bytes.len(), 13 + 320);
    }

    #[test]
    fn test_server_event_round_trip() {
        let frame = Frame::server_event(150, "sess-1", json!({"dialog_id": "d1"}));
        let decoded = decode(&encode(&frame)).expect("decodes");

        assert_eq!(decoded.message_type, MessageType::ServerFullResponse);
        assert_eq!(decoded.flags, Flags::EVENT);
        assert_eq!(decoded.event, Some(150));
        assert_eq!(decoded.session_id.as_deref(), Some("sess-1"));
        assert_eq!(decoded.payload, Payload::Json(json!({"dialog_id": "d1"})));
    }

    #[test]
    fn test_server_audio_round_trip() {
        let audio = Bytes::from((0u16..480).flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>());
        let frame = Frame::server_audio(352, "sess-1", audio.clone());
        let decoded = decode(&encode(&frame)).expect("decodes");

        assert_eq!(decoded.message_type, MessageType::ServerAck);
        assert_eq!(decoded.event, Some(352));
        assert_eq!(decoded.payload, Payload::Binary(audio));
    }

    #[test]
    fn test_server_error_round_trip() {
        let frame = Frame::server_error(45000002, json!({"error": "quota"}));
        let decoded = decode(&encode(&frame)).expect("decodes");

        assert_eq!(decoded.message_type, MessageType::ServerErrorResponse);
        assert_eq!(decoded.error_code, Some(45000002));
        assert_eq!(decoded.payload, Payload::Json(json!({"error": "quota"})));
    }

    #[test]
    fn test_server_sequence_round_trip() {
        let mut frame = Frame::server_event(550, "s", json!({"content": "hi"}));
        frame.flags = Flags::EVENT.with(Flags::TAIL);
        frame.sequence = Some(-3);
        let decoded = decode(&encode(&frame)).expect("decodes");

        assert_eq!(decoded.sequence, Some(-3));
        assert_eq!(decoded.event, Some(550));
    }

    #[test]
    fn test_gzip_json_round_trip() {
        let mut frame = Frame::server_event(559, "s", json!({"content": "весь текст"}));
        frame.compression = Compression::Gzip;
        let decoded = decode(&encode(&frame)).expect("decodes");

        assert_eq!(decoded.payload, Payload::Json(json!({"content": "весь текст"})));
    }

    #[test]
    fn test_zero_length_session_id() {
        let mut frame = Frame::server_event(50, "", json!({}));
        frame.session_id = None;
        let decoded = decode(&encode(&frame)).expect("decodes");
        assert_eq!(decoded.session_id, None);
    }

    #[test]
    fn test_client_frames_are_discarded() {
        let frame = Frame::client_event(1, None, json!({}));
        assert!(decode(&encode(&frame)).is_none());
    }

    #[test]
    fn test_bad_gzip_surfaces_raw_bytes() {
        // Gzip bit set but payload is not gzip'd.
        let data: Vec<u8> = vec![
            0x11, 0xB4, 0x01, 0x00, // header: ack, event flag, raw + gzip
            0, 0, 0, 99, // event
            0, 0, 0, 0, // session len
            0, 0, 0, 3, // payload len
            1, 2, 3,
        ];
        let decoded = decode(&data).expect("decodes");
        assert_eq!(decoded.payload, Payload::Binary(Bytes::from(vec![1, 2, 3])));
    }

    #[test]
    fn test_bad_json_surfaces_text() {
        let data: Vec<u8> = vec![
            0x11, 0x94, 0x10, 0x00, // full-response, event flag, JSON + none
            0, 0, 0, 50, // event
            0, 0, 0, 0, // session len
            0, 0, 0, 5, // payload len
            b'h', b'e', b'l', b'l', b'o',
        ];
        let decoded = decode(&data).expect("decodes");
        assert_eq!(decoded.payload, Payload::Text("hello".into()));
    }

    #[test]
    fn test_oversized_header_is_honored() {
        // header size 2: variable fields start at byte 8
        let mut data = vec![0x12, 0x94, 0x10, 0x00, 0xAA, 0xBB, 0xCC, 0xDD];
        data.extend_from_slice(&50u32.to_be_bytes());
        data.extend_from_slice(&0i32.to_be_bytes());
        data.extend_from_slice(&2u32.to_be_bytes());
        data.extend_from_slice(b"{}");
        let decoded = decode(&data).expect("decodes");
        assert_eq!(decoded.event, Some(50));
        assert_eq!(decoded.payload, Payload::Json(serde_json::json!({})));
    }

    #[test]
    fn test_truncated_inputs_return_none() {
        let frame = Frame::server_event(150, "session", json!({"k": "v"}));
        let bytes = encode(&frame);
        for cut in 0..bytes.len() {
            assert!(decode(&bytes[..cut]).is_none(), "cut at {cut} should not decode");
        }
    }

    // Deterministic LCG byte fuzz: decode must never panic on arbitrary input.
    #[test]
    fn test_random_bytes_never_panic() {
        let mut seed: u64 = 0x5EED;
        let mut next = || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as u8
        };
        for len in 0..512usize {
            let data: Vec<u8> = (0..len).map(|_| next()).collect();
            let _ = decode(&data);
        }
    }
}
