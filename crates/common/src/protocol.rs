// Wire message types for the slicesync.v1 protocol.
//
// Every frame on the socket is one JSON-encoded `SyncMessage`. The payload
// is a closed tagged union: the `type` field selects the variant and `data`
// carries its typed body. Unknown `type` values fail to decode and are
// ignored by the dispatch layer, never treated as errors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::types::{
    Annotation, CursorPoint, ItemOp, Measurement, SessionSettings, SyncParticipant, SyncSession,
    ViewportState,
};

/// One frame of the slicesync.v1 protocol.
///
/// Immutable once sent; `id` is unique per message and is what an `ack`
/// refers back to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: SyncPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl SyncMessage {
    pub fn new(
        session_id: Uuid,
        user_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        payload: SyncPayload,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            user_id: user_id.into(),
            timestamp,
            payload,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn requires_ack(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.requires_ack)
    }

    /// Encode to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Decode a JSON text frame. Unknown message or action tags decode to
    /// `ProtocolError::Decode`; callers drop such frames.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(ProtocolError::Decode)
    }
}

/// Typed payload per message type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum SyncPayload {
    /// A participant moved the camera in one viewer mode.
    ViewportSync(ViewportSyncData),
    /// A participant's pointer moved.
    CursorPosition(CursorPositionData),
    /// An annotation was added, replaced, or removed.
    Annotation(AnnotationData),
    /// A measurement was added, replaced, or removed.
    Measurement(MeasurementData),
    /// Session lifecycle or generic state traffic; see [`StateUpdateAction`].
    StateUpdate(StateUpdateData),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViewportSyncData {
    pub mode: String,
    pub viewport: ViewportState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CursorPositionData {
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    pub position: CursorPoint,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnnotationData {
    pub mode: String,
    pub op: ItemOp,
    pub annotation: Annotation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeasurementData {
    pub mode: String,
    pub op: ItemOp,
    pub measurement: Measurement,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateUpdateData {
    #[serde(flatten)]
    pub action: StateUpdateAction,
}

/// Nested discriminator inside `state-update` messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum StateUpdateAction {
    /// Host announces a freshly created session.
    SessionCreated { session: SyncSession },
    /// A prospective participant asks to join.
    JoinRequest { display_name: String },
    /// Host's answer to a join request, addressed to the requester by
    /// `user_id`. `session` is present iff accepted.
    JoinResponse {
        user_id: String,
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<SyncSession>,
    },
    /// Host broadcast after accepting a participant.
    ParticipantJoined { participant: SyncParticipant },
    /// A participant announced departure.
    ParticipantLeft { user_id: String },
    /// Host changed the session settings.
    SettingsUpdated { settings: SessionSettings },
    /// Acknowledgment of an earlier message tagged `requires_ack`.
    Ack { message_id: Uuid },
    /// Generic path-based state change outside the typed channels.
    StateChanged { path: String, value: Value, source: String },
}

/// Optional envelope metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MessageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub priority: Priority,
    pub requires_ack: bool,
}

impl Default for MessageMetadata {
    fn default() -> Self {
        Self { source: None, priority: Priority::Medium, requires_ack: false }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    Low,
    Medium,
    High,
}
