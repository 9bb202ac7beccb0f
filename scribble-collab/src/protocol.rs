//! Binary protocol for stroke and presence synchronization.
//!
//! Wire format (bincode-encoded, one WebSocket binary frame per message):
//! ```text
//! ┌──────────┬────────────┬──────────┐
//! │ msg_type │ session_id │ payload  │
//! │ 1 byte   │ 16 bytes   │ variable │
//! └──────────┴────────────┴──────────┘
//! ```
//!
//! `session_id` is authoritative only on server→client frames: the server
//! stamps every relayed message with the originating session and ignores
//! whatever a client puts there.
//!
//! | Event          | Direction            | Payload                      |
//! |----------------|----------------------|------------------------------|
//! | `Welcome`      | server→client        | [`Welcome`]                  |
//! | `Init`         | server→client        | LZ4(`Vec<Stroke>`)           |
//! | `RequestFull`  | client→server        | empty                        |
//! | `Stroke`       | client→server        | [`StrokeSubmit`]             |
//! | `Stroke`       | server→others        | [`Stroke`]                   |
//! | `StrokeAck`    | server→submitter     | [`StrokeAck`]                |
//! | `Cursor`       | client→server→others | [`CursorSample`]             |
//! | `CursorRemove` | client→server→others | empty                        |
//! | `Undo`         | client→server        | [`UndoRequest`]              |

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::stroke::{Stroke, StrokePayload, UndoScope, Vec2};

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Server tells a new connection which session id it was assigned
    Welcome = 1,
    /// Full ordered snapshot of the stroke log
    Init = 2,
    /// Client asks for a fresh `Init`
    RequestFull = 3,
    /// Stroke submission (client→server) or committed stroke (server→client)
    Stroke = 4,
    /// Acknowledgement of a stroke submission
    StrokeAck = 5,
    /// Live pointer sample
    Cursor = 6,
    /// Pointer released or session gone
    CursorRemove = 7,
    /// Undo request
    Undo = 8,
    /// Heartbeat ping
    Ping = 9,
    /// Heartbeat pong
    Pong = 10,
}

/// Session parameters handed to a new connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Welcome {
    /// How long a client keeps showing a silent remote pointer
    pub presence_ttl_ms: u64,
    /// Scope applied to undo requests that do not name one
    pub undo_scope: UndoScope,
}

impl Default for Welcome {
    fn default() -> Self {
        Self {
            presence_ttl_ms: crate::presence::DEFAULT_PRESENCE_TTL.as_millis() as u64,
            undo_scope: UndoScope::Global,
        }
    }
}

/// Brush attributes shown next to a remote pointer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Brush {
    pub color: String,
    pub size: f32,
    pub is_eraser: bool,
}

impl Default for Brush {
    fn default() -> Self {
        Self {
            color: crate::stroke::DEFAULT_COLOR.to_string(),
            size: crate::stroke::DEFAULT_STROKE_WIDTH,
            is_eraser: false,
        }
    }
}

/// One live pointer sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CursorSample {
    pub position: Vec2,
    pub brush: Brush,
}

/// Stroke submission with a client-chosen correlation token.
///
/// The token is echoed verbatim in the matching [`StrokeAck`], so several
/// submissions from one session can be in flight at once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrokeSubmit {
    pub token: u64,
    pub stroke: StrokePayload,
}

/// Result of a stroke submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AckOutcome {
    Committed { id: u64 },
    Rejected { reason: String },
}

/// Acknowledgement sent only to the submitter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrokeAck {
    pub token: u64,
    pub outcome: AckOutcome,
}

impl StrokeAck {
    pub fn committed(token: u64, id: u64) -> Self {
        Self {
            token,
            outcome: AckOutcome::Committed { id },
        }
    }

    pub fn rejected(token: u64, reason: impl Into<String>) -> Self {
        Self {
            token,
            outcome: AckOutcome::Rejected {
                reason: reason.into(),
            },
        }
    }

    /// Assigned id, if the stroke was committed.
    pub fn id(&self) -> Option<u64> {
        match self.outcome {
            AckOutcome::Committed { id } => Some(id),
            AckOutcome::Rejected { .. } => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.id().is_some()
    }
}

/// Undo request. Absent fields fall back to the server's configured scope
/// and to the requesting session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UndoRequest {
    pub scope: Option<UndoScope>,
    pub author_id: Option<Uuid>,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub session_id: Uuid,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn empty(msg_type: MessageType, session_id: Uuid) -> Self {
        Self {
            msg_type,
            session_id,
            payload: Vec::new(),
        }
    }

    fn with_payload<T: Serialize>(
        msg_type: MessageType,
        session_id: Uuid,
        value: &T,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type,
            session_id,
            payload: encode_value(value)?,
        })
    }

    /// Assigned session id and session parameters for a new connection.
    pub fn welcome(session_id: Uuid, welcome: &Welcome) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Welcome, session_id, welcome)
    }

    /// Full snapshot. The payload is LZ4-compressed since it carries the
    /// whole log (up to `max_capacity` strokes).
    pub fn init(strokes: &[Stroke]) -> Result<Self, ProtocolError> {
        let raw = encode_value(&strokes)?;
        Ok(Self {
            msg_type: MessageType::Init,
            session_id: Uuid::nil(),
            payload: lz4_flex::compress_prepend_size(&raw),
        })
    }

    pub fn request_full() -> Self {
        Self::empty(MessageType::RequestFull, Uuid::nil())
    }

    /// Client→server stroke submission.
    pub fn submit_stroke(submit: &StrokeSubmit) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Stroke, Uuid::nil(), submit)
    }

    /// Server→client committed stroke, tagged with its author.
    pub fn committed_stroke(stroke: &Stroke) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Stroke, stroke.author_id, stroke)
    }

    pub fn stroke_ack(ack: &StrokeAck) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::StrokeAck, Uuid::nil(), ack)
    }

    pub fn cursor(session_id: Uuid, sample: &CursorSample) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Cursor, session_id, sample)
    }

    pub fn cursor_remove(session_id: Uuid) -> Self {
        Self::empty(MessageType::CursorRemove, session_id)
    }

    pub fn undo(request: &UndoRequest) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Undo, Uuid::nil(), request)
    }

    pub fn ping(session_id: Uuid) -> Self {
        Self::empty(MessageType::Ping, session_id)
    }

    pub fn pong(session_id: Uuid) -> Self {
        Self::empty(MessageType::Pong, session_id)
    }

    /// Return a copy stamped with the originating session.
    pub fn from_session(mut self, session_id: Uuid) -> Self {
        self.session_id = session_id;
        self
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_value(self)
    }

    /// Deserialize from binary wire format.
    ///
    /// Frames with an unknown `msg_type` fail here and are dropped by callers.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_value(bytes)
    }

    fn expect_type(&self, expected: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType);
        }
        Ok(())
    }

    pub fn welcome_info(&self) -> Result<Welcome, ProtocolError> {
        self.expect_type(MessageType::Welcome)?;
        decode_value(&self.payload)
    }

    /// Parse an `Init` snapshot.
    pub fn snapshot(&self) -> Result<Vec<Stroke>, ProtocolError> {
        self.expect_type(MessageType::Init)?;
        let raw = lz4_flex::decompress_size_prepended(&self.payload)
            .map_err(|e| ProtocolError::CompressionError(e.to_string()))?;
        decode_value(&raw)
    }

    /// Parse a client→server stroke submission.
    pub fn submission(&self) -> Result<StrokeSubmit, ProtocolError> {
        self.expect_type(MessageType::Stroke)?;
        decode_value(&self.payload)
    }

    /// Parse a server→client committed stroke.
    pub fn stroke(&self) -> Result<Stroke, ProtocolError> {
        self.expect_type(MessageType::Stroke)?;
        decode_value(&self.payload)
    }

    pub fn ack(&self) -> Result<StrokeAck, ProtocolError> {
        self.expect_type(MessageType::StrokeAck)?;
        decode_value(&self.payload)
    }

    pub fn cursor_sample(&self) -> Result<CursorSample, ProtocolError> {
        self.expect_type(MessageType::Cursor)?;
        decode_value(&self.payload)
    }

    pub fn undo_request(&self) -> Result<UndoRequest, ProtocolError> {
        self.expect_type(MessageType::Undo)?;
        decode_value(&self.payload)
    }
}

fn encode_value<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
    #[error("Invalid message type")]
    InvalidMessageType,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}
