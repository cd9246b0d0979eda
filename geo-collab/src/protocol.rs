//! JSON wire protocol for room collaboration.
//!
//! Wire format, one envelope per WebSocket text frame:
//! ```text
//! {
//!   "type":      "feature_update",
//!   "roomId":    "R1",
//!   "userId":    "alice",
//!   "changeId":  "…",            // only on *_create / *_update / *_delete
//!   "timestamp": 1718000000000,
//!   "payload":   { … }           // shape fixed per type
//! }
//! ```
//!
//! Decoding validates the whole envelope once: the `type` tag selects a
//! [`Payload`] variant whose shape is checked here, so consumers match on
//! a closed enum and never re-inspect raw JSON.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::model::{Annotation, Feature, LatLng, SessionInfo, Version};

/// Envelope type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Join,
    Leave,
    Heartbeat,
    Cursor,
    FeatureCreate,
    FeatureUpdate,
    FeatureDelete,
    AnnotationCreate,
    AnnotationUpdate,
    AnnotationDelete,
    PresenceJoined,
    PresenceLeft,
    Sync,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Join => "join",
            MessageType::Leave => "leave",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Cursor => "cursor",
            MessageType::FeatureCreate => "feature_create",
            MessageType::FeatureUpdate => "feature_update",
            MessageType::FeatureDelete => "feature_delete",
            MessageType::AnnotationCreate => "annotation_create",
            MessageType::AnnotationUpdate => "annotation_update",
            MessageType::AnnotationDelete => "annotation_delete",
            MessageType::PresenceJoined => "presence_joined",
            MessageType::PresenceLeft => "presence_left",
            MessageType::Sync => "sync",
            MessageType::Error => "error",
        }
    }

    /// Parse a wire tag. Hyphenated spellings (`presence-joined`) are accepted.
    pub fn parse(tag: &str) -> Option<Self> {
        let normalized = tag.replace('-', "_");
        let kind = match normalized.as_str() {
            "join" => MessageType::Join,
            "leave" => MessageType::Leave,
            "heartbeat" => MessageType::Heartbeat,
            "cursor" => MessageType::Cursor,
            "feature_create" => MessageType::FeatureCreate,
            "feature_update" => MessageType::FeatureUpdate,
            "feature_delete" => MessageType::FeatureDelete,
            "annotation_create" => MessageType::AnnotationCreate,
            "annotation_update" => MessageType::AnnotationUpdate,
            "annotation_delete" => MessageType::AnnotationDelete,
            "presence_joined" => MessageType::PresenceJoined,
            "presence_left" => MessageType::PresenceLeft,
            "sync" => MessageType::Sync,
            "error" => MessageType::Error,
            _ => return None,
        };
        Some(kind)
    }

    /// Change-producing types carry a `changeId`.
    pub fn is_change(&self) -> bool {
        matches!(
            self,
            MessageType::FeatureCreate
                | MessageType::FeatureUpdate
                | MessageType::FeatureDelete
                | MessageType::AnnotationCreate
                | MessageType::AnnotationUpdate
                | MessageType::AnnotationDelete
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a session is doing, reported alongside its cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    #[default]
    Viewing,
    Drawing,
    Editing,
    Measuring,
    Annotating,
}

/// Cursor/activity update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPayload {
    pub session_id: String,
    /// `None` when the pointer left the map surface.
    #[serde(default)]
    pub position: Option<LatLng>,
    #[serde(default)]
    pub activity: Activity,
}

/// Delete of a feature or annotation. The writer is the envelope's `userId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletePayload {
    pub id: String,
    pub updated_at: u64,
}

/// Full room state sent to a session when it joins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    pub features: BTreeMap<String, Feature>,
    pub annotations: BTreeMap<String, Annotation>,
    /// Tombstones, so deletes made while a session was away converge too.
    #[serde(default)]
    pub deleted_features: BTreeMap<String, Version>,
    #[serde(default)]
    pub deleted_annotations: BTreeMap<String, Version>,
    /// Current room members, including the joiner.
    #[serde(default)]
    pub members: Vec<SessionInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceLeftPayload {
    pub session_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Room is at its member cap; the session stays connected but unjoined.
    Capacity,
    /// A room-scoped message arrived from a session that is not in that room.
    NotJoined,
    Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// Typed payload, one variant per [`MessageType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Join(SessionInfo),
    Leave,
    Heartbeat,
    Cursor(CursorPayload),
    FeatureCreate(Feature),
    FeatureUpdate(Feature),
    FeatureDelete(DeletePayload),
    AnnotationCreate(Annotation),
    AnnotationUpdate(Annotation),
    AnnotationDelete(DeletePayload),
    PresenceJoined(SessionInfo),
    PresenceLeft(PresenceLeftPayload),
    Sync(SyncPayload),
    Error(ErrorPayload),
}

impl Payload {
    pub fn kind(&self) -> MessageType {
        match self {
            Payload::Join(_) => MessageType::Join,
            Payload::Leave => MessageType::Leave,
            Payload::Heartbeat => MessageType::Heartbeat,
            Payload::Cursor(_) => MessageType::Cursor,
            Payload::FeatureCreate(_) => MessageType::FeatureCreate,
            Payload::FeatureUpdate(_) => MessageType::FeatureUpdate,
            Payload::FeatureDelete(_) => MessageType::FeatureDelete,
            Payload::AnnotationCreate(_) => MessageType::AnnotationCreate,
            Payload::AnnotationUpdate(_) => MessageType::AnnotationUpdate,
            Payload::AnnotationDelete(_) => MessageType::AnnotationDelete,
            Payload::PresenceJoined(_) => MessageType::PresenceJoined,
            Payload::PresenceLeft(_) => MessageType::PresenceLeft,
            Payload::Sync(_) => MessageType::Sync,
            Payload::Error(_) => MessageType::Error,
        }
    }

    fn from_wire(kind: MessageType, value: Value) -> Result<Self, ProtocolError> {
        let payload = match kind {
            MessageType::Join => Payload::Join(parse(kind, value)?),
            MessageType::Leave => Payload::Leave,
            MessageType::Heartbeat => Payload::Heartbeat,
            MessageType::Cursor => {
                let cursor: CursorPayload = parse(kind, value)?;
                if cursor.position.is_some_and(|p| !p.is_valid()) {
                    return Err(invalid(kind, "cursor position out of range"));
                }
                Payload::Cursor(cursor)
            }
            MessageType::FeatureCreate | MessageType::FeatureUpdate => {
                let feature: Feature = parse(kind, value)?;
                feature.validate().map_err(|reason| invalid(kind, reason))?;
                if kind == MessageType::FeatureCreate {
                    Payload::FeatureCreate(feature)
                } else {
                    Payload::FeatureUpdate(feature)
                }
            }
            MessageType::AnnotationCreate | MessageType::AnnotationUpdate => {
                let annotation: Annotation = parse(kind, value)?;
                annotation.validate().map_err(|reason| invalid(kind, reason))?;
                if kind == MessageType::AnnotationCreate {
                    Payload::AnnotationCreate(annotation)
                } else {
                    Payload::AnnotationUpdate(annotation)
                }
            }
            MessageType::FeatureDelete | MessageType::AnnotationDelete => {
                let delete: DeletePayload = parse(kind, value)?;
                if delete.id.is_empty() {
                    return Err(invalid(kind, "id is empty"));
                }
                if kind == MessageType::FeatureDelete {
                    Payload::FeatureDelete(delete)
                } else {
                    Payload::AnnotationDelete(delete)
                }
            }
            MessageType::PresenceJoined => Payload::PresenceJoined(parse(kind, value)?),
            MessageType::PresenceLeft => Payload::PresenceLeft(parse(kind, value)?),
            MessageType::Sync => Payload::Sync(parse(kind, value)?),
            MessageType::Error => Payload::Error(parse(kind, value)?),
        };
        Ok(payload)
    }

    fn to_wire(&self) -> Result<Value, ProtocolError> {
        let value = match self {
            Payload::Leave | Payload::Heartbeat => Ok(Value::Object(Default::default())),
            Payload::Join(info) | Payload::PresenceJoined(info) => serde_json::to_value(info),
            Payload::Cursor(cursor) => serde_json::to_value(cursor),
            Payload::FeatureCreate(f) | Payload::FeatureUpdate(f) => serde_json::to_value(f),
            Payload::AnnotationCreate(a) | Payload::AnnotationUpdate(a) => serde_json::to_value(a),
            Payload::FeatureDelete(d) | Payload::AnnotationDelete(d) => serde_json::to_value(d),
            Payload::PresenceLeft(left) => serde_json::to_value(left),
            Payload::Sync(sync) => serde_json::to_value(sync),
            Payload::Error(err) => serde_json::to_value(err),
        };
        value.map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

fn parse<T: DeserializeOwned>(kind: MessageType, value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|e| invalid(kind, e.to_string()))
}

fn invalid(kind: MessageType, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidPayload {
        kind,
        reason: reason.into(),
    }
}

/// Raw JSON shape; every field optional so missing ones are reported by name.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    room_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    change_id: Option<String>,
    #[serde(default)]
    timestamp: Option<u64>,
    #[serde(default)]
    payload: Option<Value>,
}

/// Top-level protocol message. Immutable once sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub room_id: String,
    pub user_id: String,
    /// Epoch millis at the sender.
    pub timestamp: u64,
    /// Present only on change-producing types; used for echo suppression.
    pub change_id: Option<String>,
    pub payload: Payload,
}

/// User id stamped on envelopes the server originates.
pub const SERVER_USER_ID: &str = "server";

impl Envelope {
    pub fn new(room_id: impl Into<String>, user_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            room_id: room_id.into(),
            user_id: user_id.into(),
            timestamp: now_millis(),
            change_id: None,
            payload,
        }
    }

    /// Create a change envelope carrying its echo-suppression id.
    pub fn change(
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        change_id: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            change_id: Some(change_id.into()),
            ..Self::new(room_id, user_id, payload)
        }
    }

    pub fn join(room_id: impl Into<String>, session: &SessionInfo) -> Self {
        Self::new(room_id, session.user_id.clone(), Payload::Join(session.clone()))
    }

    pub fn leave(room_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::new(room_id, user_id, Payload::Leave)
    }

    pub fn heartbeat(room_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::new(room_id, user_id, Payload::Heartbeat)
    }

    pub fn cursor(
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        cursor: CursorPayload,
    ) -> Self {
        Self::new(room_id, user_id, Payload::Cursor(cursor))
    }

    pub fn presence_joined(room_id: impl Into<String>, session: &SessionInfo) -> Self {
        Self::new(room_id, session.user_id.clone(), Payload::PresenceJoined(session.clone()))
    }

    pub fn presence_left(room_id: impl Into<String>, session: &SessionInfo) -> Self {
        Self::new(
            room_id,
            session.user_id.clone(),
            Payload::PresenceLeft(PresenceLeftPayload {
                session_id: session.session_id.clone(),
            }),
        )
    }

    pub fn sync(room_id: impl Into<String>, state: SyncPayload) -> Self {
        Self::new(room_id, SERVER_USER_ID, Payload::Sync(state))
    }

    pub fn error(room_id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(
            room_id,
            SERVER_USER_ID,
            Payload::Error(ErrorPayload {
                code,
                message: message.into(),
            }),
        )
    }

    pub fn kind(&self) -> MessageType {
        self.payload.kind()
    }

    pub fn is_change(&self) -> bool {
        self.kind().is_change()
    }

    /// Id of the feature or annotation a change targets.
    pub fn entity_id(&self) -> Option<&str> {
        match &self.payload {
            Payload::FeatureCreate(f) | Payload::FeatureUpdate(f) => Some(&f.id),
            Payload::AnnotationCreate(a) | Payload::AnnotationUpdate(a) => Some(&a.id),
            Payload::FeatureDelete(d) | Payload::AnnotationDelete(d) => Some(&d.id),
            _ => None,
        }
    }

    /// Serialize to one JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let wire = WireEnvelope {
            kind: Some(self.kind().as_str().to_string()),
            room_id: Some(self.room_id.clone()),
            user_id: Some(self.user_id.clone()),
            change_id: self.change_id.clone(),
            timestamp: Some(self.timestamp),
            payload: Some(self.payload.to_wire()?),
        };
        serde_json::to_string(&wire).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse and validate one JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let wire: WireEnvelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let tag = wire.kind.ok_or(ProtocolError::MissingField("type"))?;
        let kind = MessageType::parse(&tag).ok_or(ProtocolError::UnknownType(tag))?;
        let room_id = wire.room_id.ok_or(ProtocolError::MissingField("roomId"))?;
        let user_id = wire.user_id.ok_or(ProtocolError::MissingField("userId"))?;
        let timestamp = wire.timestamp.ok_or(ProtocolError::MissingField("timestamp"))?;

        let change_id = wire.change_id.filter(|id| !id.is_empty());
        if kind.is_change() && change_id.is_none() {
            return Err(ProtocolError::MissingField("changeId"));
        }

        let payload = Payload::from_wire(kind, wire.payload.unwrap_or(Value::Null))?;

        Ok(Self {
            room_id,
            user_id,
            timestamp,
            change_id,
            payload,
        })
    }
}

/// Build the echo-suppression id for a local change.
///
/// The originating session is part of the id so two sessions writing the
/// same entity at the same logical time never collide.
pub fn change_id(session_id: &str, action: MessageType, entity_id: &str, timestamp: u64) -> String {
    format!("{session_id}:{action}:{entity_id}:{timestamp}")
}

/// Wall-clock epoch millis for envelope timestamps.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Protocol errors. Receivers log and discard the offending envelope.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: MessageType, reason: String },
    #[error("serialization error: {0}")]
    Serialization(String),
}
