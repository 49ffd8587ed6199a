//! Room-scoped wire protocol for whole-document synchronization.
//!
//! Every frame on the channel is a bincode-encoded [`Frame`]:
//! ```text
//! client ──► server   Hello { client_id }            (once, after upgrade)
//! client ──► server   Emit { seq, ClientEvent }      (seq = Some(n) ⇒ ack wanted)
//! server ──► client   Ack { seq, Option<Ack> }
//! server ──► client   Event(RoomEvent)               (room fan-out, echoes included)
//! either             Ping / Pong
//! ```
//!
//! The protocol is whole-document replacement: `TextUpdatePayload::content`
//! always carries the full current text, never a patch.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::ProtocolError;

/// Random identity generated once per process, used to recognise echoes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID (for testing).
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// The unit durably saved once an update is acknowledged.
///
/// `drawings` and `formatting` are opaque serialized blobs owned by the
/// canvas and rich-text layers; the engine only carries them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistSnapshot {
    pub text: String,
    pub drawings: String,
    pub formatting: String,
    pub timestamp: u64,
}

impl PersistSnapshot {
    /// Snapshot holding only text, used when no provider is installed.
    pub fn text_only(text: impl Into<String>, timestamp: u64) -> Self {
        Self {
            text: text.into(),
            timestamp,
            ..Self::default()
        }
    }
}

/// A caret position broadcast by one editor. Superseded by the next one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorSnapshot {
    pub client_id: ClientId,
    pub username: String,
    /// Characters preceding the caret inside the editable root.
    pub offset: u64,
    /// Pixel position relative to the editable root.
    pub x: f32,
    pub y: f32,
    pub timestamp: u64,
}

/// Full-document content flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextUpdatePayload {
    pub content: String,
    pub client_id: ClientId,
    pub timestamp: u64,
    pub document_id: String,
    pub user_id: String,
    pub user_email: String,
    pub title: String,
    pub tags: Vec<String>,
    pub persist_snapshot: PersistSnapshot,
    pub cursor: Option<CursorSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TitleUpdatePayload {
    pub title: String,
    pub client_id: ClientId,
    pub timestamp: u64,
}

/// Server-held room state, delivered on join.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomState {
    pub events: Vec<String>,
    pub text: String,
    pub formatting: String,
}

/// Acknowledgment object. A missing ack counts as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

/// Client → server events. The room id comes first, as on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientEvent {
    JoinRoom { room_id: String },
    LeaveRoom { room_id: String },
    TextUpdate { room_id: String, payload: TextUpdatePayload },
    TextUpdateWithCursor { room_id: String, payload: TextUpdatePayload },
    TitleUpdate { room_id: String, payload: TitleUpdatePayload },
    CursorPosition { room_id: String, cursor: CursorSnapshot },
}

impl ClientEvent {
    /// Transport-level event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join-room",
            Self::LeaveRoom { .. } => "leave-room",
            Self::TextUpdate { .. } => "text-update",
            Self::TextUpdateWithCursor { .. } => "text-update-with-cursor",
            Self::TitleUpdate { .. } => "title-update",
            Self::CursorPosition { .. } => "cursor-position",
        }
    }

    pub fn room_id(&self) -> &str {
        match self {
            Self::JoinRoom { room_id }
            | Self::LeaveRoom { room_id }
            | Self::TextUpdate { room_id, .. }
            | Self::TextUpdateWithCursor { room_id, .. }
            | Self::TitleUpdate { room_id, .. }
            | Self::CursorPosition { room_id, .. } => room_id,
        }
    }
}

/// Server → client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerEvent {
    RoomState(RoomState),
    TextUpdate(TextUpdatePayload),
    TextUpdateWithCursor(TextUpdatePayload),
    TitleUpdate(TitleUpdatePayload),
    CursorPosition(CursorSnapshot),
    UserJoined(ClientId),
    UserLeft(ClientId),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RoomState(_) => "room-state",
            Self::TextUpdate(_) => "text-update",
            Self::TextUpdateWithCursor(_) => "text-update-with-cursor",
            Self::TitleUpdate(_) => "title-update",
            Self::CursorPosition(_) => "cursor-position",
            Self::UserJoined(_) => "user-joined",
            Self::UserLeft(_) => "user-left",
        }
    }

    /// The identity that produced this event, if it carries one.
    pub fn origin(&self) -> Option<ClientId> {
        match self {
            Self::TextUpdate(p) | Self::TextUpdateWithCursor(p) => Some(p.client_id),
            Self::TitleUpdate(p) => Some(p.client_id),
            Self::CursorPosition(c) => Some(c.client_id),
            Self::UserJoined(id) | Self::UserLeft(id) => Some(*id),
            Self::RoomState(_) => None,
        }
    }
}

/// A server event tagged with the room it was fanned out in. One channel
/// carries every room the process has joined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomEvent {
    pub room_id: String,
    pub event: ServerEvent,
}

impl RoomEvent {
    pub fn new(room_id: impl Into<String>, event: ServerEvent) -> Self {
        Self {
            room_id: room_id.into(),
            event,
        }
    }
}

/// Top-level channel frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Hello { client_id: ClientId },
    Emit { seq: Option<u64>, event: ClientEvent },
    Ack { seq: u64, ack: Option<Ack> },
    Event(RoomEvent),
    Ping,
    Pong,
}

impl Frame {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}
