// Core domain types shared between the engine and the wire protocol.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Camera/display parameters for one viewer mode.
///
/// `zoom` is kept strictly positive by the store; `rotation` is in degrees
/// and unbounded. `brightness`/`contrast` are percentages (100 = neutral).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ViewportState {
    pub zoom: f64,
    pub pan: Pan,
    pub rotation: f64,
    pub window_level: WindowLevel,
    pub brightness: f64,
    pub contrast: f64,
}

impl Default for ViewportState {
    fn default() -> Self {
        Self {
            zoom: 1.0,
            pan: Pan::default(),
            rotation: 0.0,
            window_level: WindowLevel::default(),
            brightness: 100.0,
            contrast: 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Pan {
    pub x: f64,
    pub y: f64,
}

/// DICOM-style window/level (center + width) for grayscale mapping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WindowLevel {
    pub center: f64,
    pub width: f64,
}

impl Default for WindowLevel {
    fn default() -> Self {
        Self { center: 128.0, width: 256.0 }
    }
}

/// A pointer position shared with other participants.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CursorPoint {
    /// Image-space coordinates.
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slice_index: Option<u32>,
}

/// A freehand or text annotation on a slice.
///
/// The drawing payload stays an opaque JSON value: its shape belongs to the
/// rendering layer, not to the sync core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Annotation {
    pub id: String,
    /// Annotation kind, e.g. "arrow", "freehand", "text".
    pub kind: String,
    #[serde(default)]
    pub slice_index: u32,
    #[serde(default)]
    pub data: Value,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// A length/area/angle measurement on a slice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Measurement {
    pub id: String,
    /// Measurement kind, e.g. "length", "angle", "roi".
    pub kind: String,
    #[serde(default)]
    pub slice_index: u32,
    pub value: f64,
    pub unit: String,
    #[serde(default)]
    pub data: Value,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Whether a synced list item was added, replaced, or removed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ItemOp {
    Add,
    Update,
    Remove,
}

// ── Sessions ────────────────────────────────────────────────────────

/// Strategy used to arbitrate concurrent edits to the same item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    HostWins,
    Timestamp,
    Merge,
}

/// Per-session sync settings, controlled by the host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionSettings {
    pub sync_viewport: bool,
    pub sync_annotations: bool,
    pub sync_measurements: bool,
    pub sync_cursor: bool,
    pub conflict_resolution: ConflictStrategy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            sync_viewport: true,
            sync_annotations: true,
            sync_measurements: true,
            sync_cursor: true,
            conflict_resolution: ConflictStrategy::Timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ParticipantRole {
    Host,
    Participant,
    Observer,
}

/// What a participant is allowed to do. Advisory: the engine stores and
/// exposes these, enforcement happens at the application layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Permissions {
    pub can_edit: bool,
    pub can_annotate: bool,
    pub can_measure: bool,
    pub can_control_viewport: bool,
}

impl Default for Permissions {
    fn default() -> Self {
        Self::for_role(ParticipantRole::Participant)
    }
}

impl Permissions {
    pub fn for_role(role: ParticipantRole) -> Self {
        match role {
            ParticipantRole::Host => Self {
                can_edit: true,
                can_annotate: true,
                can_measure: true,
                can_control_viewport: true,
            },
            ParticipantRole::Participant => Self {
                can_edit: true,
                can_annotate: true,
                can_measure: true,
                can_control_viewport: false,
            },
            ParticipantRole::Observer => Self {
                can_edit: false,
                can_annotate: false,
                can_measure: false,
                can_control_viewport: false,
            },
        }
    }
}

/// A member of a collaborative session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncParticipant {
    pub id: String,
    pub name: String,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub permissions: Permissions,
}

impl SyncParticipant {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        role: ParticipantRole,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role,
            joined_at: now,
            last_seen: now,
            permissions: Permissions::for_role(role),
        }
    }
}

/// A collaborative viewing session. Exactly one participant holds the
/// `Host` role for the session's lifetime; there is no host migration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncSession {
    pub id: Uuid,
    pub host_id: String,
    pub participants: BTreeMap<String, SyncParticipant>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub settings: SessionSettings,
}

impl SyncSession {
    /// Build a fresh session with `host` as its only participant.
    pub fn new(host: SyncParticipant, settings: SessionSettings, now: DateTime<Utc>) -> Self {
        let host_id = host.id.clone();
        let mut participants = BTreeMap::new();
        participants.insert(host_id.clone(), host);
        Self {
            id: Uuid::new_v4(),
            host_id,
            participants,
            created_at: now,
            last_activity: now,
            settings,
        }
    }

    pub fn participant(&self, user_id: &str) -> Option<&SyncParticipant> {
        self.participants.get(user_id)
    }

    pub fn is_host(&self, user_id: &str) -> bool {
        self.host_id == user_id
    }
}
