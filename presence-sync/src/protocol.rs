//! Wire protocol for presence, cursor and chat frames.
//!
//! Every frame is a JSON object carrying a `type` discriminant and a
//! `payload` whose shape is fixed per type:
//! ```text
//! ┌──────────────────┬────────────────────────────────────────────────┐
//! │ type             │ payload                                        │
//! ├──────────────────┼────────────────────────────────────────────────┤
//! │ join             │ clientId, userId, displayName, color           │
//! │ leave            │ clientId                                       │
//! │ presence-update  │ clientId, userId, displayName, color,          │
//! │                  │ activeDocumentId?                              │
//! │ cursor           │ clientId, documentId, position, selection?, seq│
//! │ chat             │ id, authorClientId, text, sentAt               │
//! │ snapshot         │ collaborators[], serverTime                    │
//! └──────────────────┴────────────────────────────────────────────────┘
//! ```
//!
//! [`Frame::decode`] is the only way bytes become frames. It fails closed:
//! an unknown type, a payload with missing or mistyped fields, or an empty
//! identifier rejects the whole frame.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Opaque identifier of one connection (one tab, one session instance).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier for a new session instance.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Line/column position inside a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// Selection range in the same coordinate space as [`Position`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: Position,
    pub head: Position,
}

impl Selection {
    pub fn new(anchor: Position, head: Position) -> Self {
        Self { anchor, head }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.head
    }
}

/// Last known pointer of one collaborator.
///
/// `seq` is the sender's own per-client counter; a higher value is always
/// the newer state regardless of arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorState {
    pub document_id: String,
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
    pub seq: u64,
}

/// Identity metadata announced on join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaboratorInfo {
    pub client_id: ClientId,
    pub user_id: String,
    pub display_name: String,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeavePayload {
    pub client_id: ClientId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub client_id: ClientId,
    pub user_id: String,
    pub display_name: String,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_document_id: Option<String>,
}

impl PresenceUpdate {
    pub fn from_info(info: &CollaboratorInfo, active_document_id: Option<String>) -> Self {
        Self {
            client_id: info.client_id.clone(),
            user_id: info.user_id.clone(),
            display_name: info.display_name.clone(),
            color: info.color.clone(),
            active_document_id,
        }
    }

    pub fn info(&self) -> CollaboratorInfo {
        CollaboratorInfo {
            client_id: self.client_id.clone(),
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            color: self.color.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorFrame {
    pub client_id: ClientId,
    pub document_id: String,
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
    pub seq: u64,
}

impl CursorFrame {
    pub fn new(client_id: ClientId, cursor: &CursorState) -> Self {
        Self {
            client_id,
            document_id: cursor.document_id.clone(),
            position: cursor.position,
            selection: cursor.selection,
            seq: cursor.seq,
        }
    }

    pub fn cursor_state(&self) -> CursorState {
        CursorState {
            document_id: self.document_id.clone(),
            position: self.position,
            selection: self.selection,
            seq: self.seq,
        }
    }
}

/// One ephemeral chat message.
///
/// Ordered by `(sent_at, id)`; `sent_at` is milliseconds since the Unix
/// epoch as stamped by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub author_client_id: ClientId,
    pub text: String,
    pub sent_at: u64,
}

impl ChatMessage {
    /// Total ordering key shared by every client.
    pub fn order_key(&self) -> (u64, &str) {
        (self.sent_at, self.id.as_str())
    }
}

/// One collaborator as listed in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub client_id: ClientId,
    pub user_id: String,
    pub display_name: String,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorState>,
}

impl SnapshotEntry {
    pub fn info(&self) -> CollaboratorInfo {
        CollaboratorInfo {
            client_id: self.client_id.clone(),
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            color: self.color.clone(),
        }
    }
}

/// Authoritative session state sent by the server on (re)join.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub collaborators: Vec<SnapshotEntry>,
    pub server_time: u64,
}

impl SessionSnapshot {
    /// Check the whole snapshot before any of it is applied.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::with_capacity(self.collaborators.len());
        for entry in &self.collaborators {
            validate_info(&entry.info())?;
            if let Some(cursor) = &entry.cursor {
                if cursor.document_id.is_empty() {
                    return Err(format!("empty documentId for {}", entry.client_id));
                }
            }
            if !seen.insert(&entry.client_id) {
                return Err(format!("duplicate clientId {}", entry.client_id));
            }
        }
        Ok(())
    }
}

/// Discriminant of a [`Frame`], as it appears in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Join,
    Leave,
    PresenceUpdate,
    Cursor,
    Chat,
    Snapshot,
}

impl FrameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Join => "join",
            FrameKind::Leave => "leave",
            FrameKind::PresenceUpdate => "presence-update",
            FrameKind::Cursor => "cursor",
            FrameKind::Chat => "chat",
            FrameKind::Snapshot => "snapshot",
        }
    }

    fn parse(tag: &str) -> Option<Self> {
        match tag {
            "join" => Some(FrameKind::Join),
            "leave" => Some(FrameKind::Leave),
            "presence-update" => Some(FrameKind::PresenceUpdate),
            "cursor" => Some(FrameKind::Cursor),
            "chat" => Some(FrameKind::Chat),
            "snapshot" => Some(FrameKind::Snapshot),
            _ => None,
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Frame {
    Join(CollaboratorInfo),
    Leave(LeavePayload),
    PresenceUpdate(PresenceUpdate),
    Cursor(CursorFrame),
    Chat(ChatMessage),
    Snapshot(SessionSnapshot),
}

/// Untyped envelope used to report precise decode failures.
#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    frame_type: String,
    payload: serde_json::Value,
}

impl Frame {
    pub fn join(info: CollaboratorInfo) -> Self {
        Frame::Join(info)
    }

    pub fn leave(client_id: ClientId) -> Self {
        Frame::Leave(LeavePayload { client_id })
    }

    pub fn presence_update(info: &CollaboratorInfo, active_document_id: Option<String>) -> Self {
        Frame::PresenceUpdate(PresenceUpdate::from_info(info, active_document_id))
    }

    pub fn cursor(client_id: ClientId, cursor: &CursorState) -> Self {
        Frame::Cursor(CursorFrame::new(client_id, cursor))
    }

    pub fn chat(message: ChatMessage) -> Self {
        Frame::Chat(message)
    }

    pub fn snapshot(snapshot: SessionSnapshot) -> Self {
        Frame::Snapshot(snapshot)
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Join(_) => FrameKind::Join,
            Frame::Leave(_) => FrameKind::Leave,
            Frame::PresenceUpdate(_) => FrameKind::PresenceUpdate,
            Frame::Cursor(_) => FrameKind::Cursor,
            Frame::Chat(_) => FrameKind::Chat,
            Frame::Snapshot(_) => FrameKind::Snapshot,
        }
    }

    /// Client that produced this frame, if the frame has one.
    pub fn origin(&self) -> Option<&ClientId> {
        match self {
            Frame::Join(info) => Some(&info.client_id),
            Frame::Leave(p) => Some(&p.client_id),
            Frame::PresenceUpdate(p) => Some(&p.client_id),
            Frame::Cursor(c) => Some(&c.client_id),
            Frame::Chat(m) => Some(&m.author_client_id),
            Frame::Snapshot(_) => None,
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse and validate wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let raw: RawFrame = serde_json::from_slice(bytes).map_err(DecodeError::Malformed)?;
        let kind = FrameKind::parse(&raw.frame_type)
            .ok_or_else(|| DecodeError::UnknownType(raw.frame_type.clone()))?;

        let invalid = |source| DecodeError::InvalidPayload { kind, source };
        let frame = match kind {
            FrameKind::Join => Frame::Join(serde_json::from_value(raw.payload).map_err(invalid)?),
            FrameKind::Leave => Frame::Leave(serde_json::from_value(raw.payload).map_err(invalid)?),
            FrameKind::PresenceUpdate => {
                Frame::PresenceUpdate(serde_json::from_value(raw.payload).map_err(invalid)?)
            }
            FrameKind::Cursor => Frame::Cursor(serde_json::from_value(raw.payload).map_err(invalid)?),
            FrameKind::Chat => Frame::Chat(serde_json::from_value(raw.payload).map_err(invalid)?),
            FrameKind::Snapshot => {
                Frame::Snapshot(serde_json::from_value(raw.payload).map_err(invalid)?)
            }
        };

        frame
            .validate()
            .map_err(|reason| DecodeError::Rejected { kind, reason })?;
        Ok(frame)
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Frame::Join(info) => validate_info(info),
            Frame::Leave(p) => non_empty("clientId", p.client_id.as_str()),
            Frame::PresenceUpdate(p) => validate_info(&p.info()),
            Frame::Cursor(c) => {
                non_empty("clientId", c.client_id.as_str())?;
                non_empty("documentId", &c.document_id)
            }
            Frame::Chat(m) => {
                non_empty("id", &m.id)?;
                non_empty("authorClientId", m.author_client_id.as_str())
            }
            Frame::Snapshot(s) => s.validate(),
        }
    }
}

fn validate_info(info: &CollaboratorInfo) -> Result<(), String> {
    non_empty("clientId", info.client_id.as_str())?;
    non_empty("userId", &info.user_id)
}

fn non_empty(field: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        Err(format!("{field} must not be empty"))
    } else {
        Ok(())
    }
}

/// Why an inbound frame was dropped.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("unknown frame type `{0}`")]
    UnknownType(String),
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: FrameKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("rejected {kind} frame: {reason}")]
    Rejected { kind: FrameKind, reason: String },
}

impl DecodeError {
    /// Frame type the bytes claimed to be, when it was recognised.
    pub fn kind(&self) -> Option<FrameKind> {
        match self {
            DecodeError::InvalidPayload { kind, .. } | DecodeError::Rejected { kind, .. } => {
                Some(*kind)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
#[error("failed to encode frame: {0}")]
pub struct EncodeError(#[from] serde_json::Error);
